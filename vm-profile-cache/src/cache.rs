//! JitProfileCache 上下文
//!
//! 每个 VM 进程一个实例，由宿主显式持有并把各类事件转发进来：
//!
//! | 事件 | 记录模式 | 回放模式 |
//! |------|----------|----------|
//! | 类加载 | - | 解析链槽位和方法 |
//! | 类初始化 | 分配初始化序号 | 刷新链 |
//! | 方法调用 | 记录 profile | - |
//! | 启动完成 | 启动延迟 flush | 预编译 |
//! | safepoint | - | 去优化一批 |
//! | 类卸载 | - | 清理死亡的类和方法 |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::chain::{ClassChain, LoadOutcome};
use crate::config::{CacheMode, ProfileCacheConfig, VmFlags};
use crate::deopt::{DeoptOutcome, DeoptPolicy, DeoptimizationDriver};
use crate::error::{ProfileCacheError, Result};
use crate::format::LogHeader;
use crate::pattern::ExcludeList;
use crate::precompile::{BarrierMethod, PrecompilationDriver, PrecompileStats};
use crate::preloader::{PreloadSummary, Preloader};
use crate::reader::ProfileLogReader;
use crate::recorder::ProfileRecorder;
use crate::report;
use crate::runtime::{ClassDescriptor, MethodEvent, VmRuntime};
use crate::state::ChainState;

enum Backend {
    Disabled { reason: String },
    Record {
        recorder: Arc<ProfileRecorder>,
        flush_thread: Mutex<Option<JoinHandle<()>>>,
    },
    Replay {
        chain: ClassChain,
        summary: PreloadSummary,
        header: LogHeader,
    },
}

/// JitProfileCache
pub struct JitProfileCache {
    config: ProfileCacheConfig,
    backend: Backend,
    barrier: BarrierMethod,
    deopt_policy: DeoptPolicy,
    deopt_signal: AtomicBool,
    last_precompile: Mutex<Option<PrecompileStats>>,
}

impl JitProfileCache {
    /// 校验配置并初始化
    ///
    /// 配置错误直接返回（VM 应终止启动）；回放文件无法使用时只告警，本次运行禁用缓存。
    pub fn new(
        config: ProfileCacheConfig,
        flags: &VmFlags,
        runtime: Arc<dyn VmRuntime>,
    ) -> Result<Self> {
        config.validate(flags)?;
        let excludes = config.exclude_list();

        let backend = match config.effective_mode() {
            CacheMode::Disabled => Backend::Disabled {
                reason: "JitProfileCache is disabled".to_string(),
            },
            CacheMode::Record => {
                log::info!(
                    "[JitProfileCache] recording profile to {}",
                    config.profile_path.display()
                );
                Backend::Record {
                    recorder: Arc::new(ProfileRecorder::new(
                        config.profile_path.clone(),
                        config.app_id,
                        excludes,
                    )),
                    flush_thread: Mutex::new(None),
                }
            }
            CacheMode::Replay => Self::load_replay(&config, &excludes, runtime),
        };

        Ok(Self {
            barrier: BarrierMethod::new(
                config.barrier_class.clone(),
                config.barrier_method.clone(),
                config.barrier_signature.clone(),
            ),
            deopt_policy: DeoptPolicy::from_config(&config),
            config,
            backend,
            deopt_signal: AtomicBool::new(false),
            last_precompile: Mutex::new(None),
        })
    }

    fn load_replay(
        config: &ProfileCacheConfig,
        excludes: &ExcludeList,
        runtime: Arc<dyn VmRuntime>,
    ) -> Backend {
        match ProfileLogReader::parse_file(&config.profile_path, config.app_id) {
            Ok(profile) => {
                let (chain, summary) = Preloader::new(excludes).build(&profile, runtime);
                Backend::Replay {
                    chain,
                    summary,
                    header: profile.header,
                }
            }
            Err(e) => {
                log::warn!(
                    "[JitProfileCache] {} not usable, cache disabled for this run: {}",
                    config.profile_path.display(),
                    e
                );
                Backend::Disabled {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn config(&self) -> &ProfileCacheConfig {
        &self.config
    }

    /// 实际运行的模式，回放文件被拒绝时为 Disabled
    pub fn mode(&self) -> CacheMode {
        match self.backend {
            Backend::Disabled { .. } => CacheMode::Disabled,
            Backend::Record { .. } => CacheMode::Record,
            Backend::Replay { .. } => CacheMode::Replay,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode() != CacheMode::Disabled
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        match &self.backend {
            Backend::Disabled { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn chain(&self) -> Option<&ClassChain> {
        match &self.backend {
            Backend::Replay { chain, .. } => Some(chain),
            _ => None,
        }
    }

    pub fn preload_summary(&self) -> Option<PreloadSummary> {
        match &self.backend {
            Backend::Replay { summary, .. } => Some(*summary),
            _ => None,
        }
    }

    pub fn recorder(&self) -> Option<&Arc<ProfileRecorder>> {
        match &self.backend {
            Backend::Record { recorder, .. } => Some(recorder),
            _ => None,
        }
    }

    pub fn last_precompile(&self) -> Option<PrecompileStats> {
        self.last_precompile.lock().clone()
    }

    // ---- VM 事件 ----

    pub fn on_class_loaded(&self, class: &ClassDescriptor) -> Option<LoadOutcome> {
        self.chain().map(|chain| chain.mark_loaded_class(class))
    }

    pub fn on_class_initialized(&self, class: &ClassDescriptor) {
        match &self.backend {
            Backend::Record { recorder, .. } => {
                recorder.on_class_initialized(class);
            }
            Backend::Replay { chain, .. } => chain.refresh(),
            Backend::Disabled { .. } => {}
        }
    }

    pub fn on_method_invoked(&self, event: &MethodEvent) {
        if let Some(recorder) = self.recorder() {
            recorder.on_method_invoked(event);
        }
    }

    /// 启动完成
    pub fn on_vm_booted(&self) -> Result<()> {
        match &self.backend {
            Backend::Record {
                recorder,
                flush_thread,
            } => {
                let mut slot = flush_thread.lock();
                if slot.is_none() {
                    *slot = Some(recorder.spawn_delayed_flush(self.config.flush_delay())?);
                }
                Ok(())
            }
            Backend::Replay { .. } if self.config.precompile_on_boot => {
                self.precompile().map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// 立即 flush 记录（VM 退出前）
    pub fn flush_now(&self) -> Result<Option<LogHeader>> {
        match self.recorder() {
            Some(recorder) => recorder.flush(),
            None => Ok(None),
        }
    }

    /// 运行一次预编译
    pub fn precompile(&self) -> Result<PrecompileStats> {
        let Some(chain) = self.chain() else {
            return Err(ProfileCacheError::InvalidState(ChainState::NotInited));
        };
        let stats = PrecompilationDriver::new(chain, &self.barrier).run()?;
        *self.last_precompile.lock() = Some(stats.clone());
        Ok(stats)
    }

    /// safepoint 回调
    pub fn on_safepoint(&self) -> Option<DeoptOutcome> {
        let chain = self.chain()?;
        let signaled = self.deopt_signal.load(Ordering::Acquire);
        Some(DeoptimizationDriver::new(chain, self.deopt_policy).run(signaled))
    }

    /// GC 类卸载阶段回调
    pub fn on_class_unloading(&self) {
        if let Some(chain) = self.chain() {
            chain.on_class_unloading();
        }
    }

    // ---- 管理命令 ----

    fn replay_disabled_message(&self) -> String {
        match &self.backend {
            Backend::Disabled { reason } => format!("JitProfileCache replay is not active: {}", reason),
            _ => "JitProfileCache replay is not enabled".to_string(),
        }
    }

    /// 通知可以开始预编译
    pub fn notify_precompilation(&self) -> String {
        let Some(chain) = self.chain() else {
            return self.replay_disabled_message();
        };
        let state = chain.state();
        if state != ChainState::Inited {
            return format!("precompilation not started: chain state is {}", state);
        }
        match self.precompile() {
            Ok(stats) => format!(
                "precompilation finished: {} methods submitted, {} slots skipped",
                stats.submitted, stats.slots_skipped
            ),
            Err(e) => format!("precompilation failed: {}", e),
        }
    }

    /// 上一次预编译是否已完成
    pub fn check_precompilation_done(&self) -> String {
        let Some(chain) = self.chain() else {
            return self.replay_disabled_message();
        };
        match chain.state() {
            ChainState::NotInited | ChainState::Inited => {
                "precompilation has not started".to_string()
            }
            ChainState::PrePrecompile | ChainState::Compiling => {
                "precompilation is in progress".to_string()
            }
            ChainState::Error => "last precompilation failed".to_string(),
            state => format!("last precompilation finished (state {})", state),
        }
    }

    /// 通知开始去优化预编译的方法
    pub fn notify_deoptimization(&self) -> String {
        let Some(chain) = self.chain() else {
            return self.replay_disabled_message();
        };
        match chain.state() {
            ChainState::Done | ChainState::PreDeoptimize | ChainState::Deoptimizing => {
                if self.deopt_signal.swap(true, Ordering::AcqRel) {
                    "deoptimization already requested".to_string()
                } else {
                    "deoptimization requested, it runs at the next safepoint".to_string()
                }
            }
            ChainState::Deoptimized => "precompiled methods are already deoptimized".to_string(),
            state => format!("deoptimization not possible in chain state {}", state),
        }
    }

    /// 统计信息
    pub fn print_statistics(&self) -> String {
        match &self.backend {
            Backend::Replay { chain, header, .. } => {
                let mut out = report::format_header(header);
                out.push_str(&report::format_chain_statistics(&chain.statistics()));
                if let Some(stats) = self.last_precompile() {
                    out.push_str(&report::format_precompile_stats(&stats));
                }
                out
            }
            Backend::Record { recorder, .. } => format!(
                "JitProfileCache recording to {}: {} classes, {} methods{}\n",
                recorder.path().display(),
                recorder.class_count(),
                recorder.method_count(),
                if recorder.is_flushed() { " (flushed)" } else { "" }
            ),
            Backend::Disabled { reason } => format!("{}\n", reason),
        }
    }
}
