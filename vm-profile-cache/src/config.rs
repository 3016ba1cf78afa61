//! JitProfileCache 配置
//!
//! 支持从 TOML 加载，启动时通过 [`ProfileCacheConfig::validate`] 做致命检查。
//!
//! ```toml
//! mode = "replay"
//! profile_path = "jit_profile.log"
//! app_id = 7
//! deopt_trigger = "timed"
//! deopt_after_secs = 600
//! exclude_classes = "com/foo/Gen*;sun.reflect.*"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pattern::ExcludeList;

/// 每批去优化的方法数上限
pub const MAX_DEOPT_BATCH_SIZE: u32 = 10_000;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Disabled,
    /// 训练运行：记录类初始化顺序和热点方法
    Record,
    /// 回放运行：读取日志并预编译
    Replay,
}

/// 去优化触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeoptTrigger {
    /// 只在收到外部通知后触发
    #[default]
    Explicit,
    /// 链创建后超过 `deopt_after_secs` 自动触发（外部通知同样有效）
    Timed,
}

/// 与缓存配置交叉校验的 VM 全局开关
#[derive(Debug, Clone, Copy, Default)]
pub struct VmFlags {
    /// 纯解释执行
    pub interpreter_only: bool,
    /// 是否允许类卸载
    pub class_unloading: bool,
}

/// JitProfileCache 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileCacheConfig {
    pub mode: CacheMode,
    /// 记录开关（来自 VM 命令行，与 `replay` 互斥）
    pub record: bool,
    /// 回放开关
    pub replay: bool,
    /// 日志文件路径：回放时读取，记录时写入
    pub profile_path: PathBuf,
    /// 期望的 app id，0 表示接受任意
    pub app_id: u32,
    /// 记录模式下延迟多久落盘
    pub flush_delay_secs: u64,
    /// VM 启动完成后是否自动预编译；否则等待外部通知
    pub precompile_on_boot: bool,
    pub deopt_trigger: DeoptTrigger,
    /// 定时触发的延迟（自链创建起）
    pub deopt_after_secs: u64,
    /// 两批去优化之间的最小间隔
    pub deopt_min_interval_ms: u64,
    /// 每批最多处理的方法数
    pub deopt_batch_size: u32,
    /// 排除的类名模式，逗号或分号分隔
    pub exclude_classes: String,
    /// 预编译结束标记方法所在的类
    pub barrier_class: String,
    pub barrier_method: String,
    pub barrier_signature: String,
}

impl Default for ProfileCacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Disabled,
            record: false,
            replay: false,
            profile_path: PathBuf::from("jit_profile.log"),
            app_id: 0,
            flush_delay_secs: 600,
            precompile_on_boot: true,
            deopt_trigger: DeoptTrigger::Explicit,
            deopt_after_secs: 3600,
            deopt_min_interval_ms: 1000,
            deopt_batch_size: 100,
            exclude_classes: String::new(),
            barrier_class: "vm/profile/WarmUpBarrier".to_string(),
            barrier_method: "dummy".to_string(),
            barrier_signature: "()V".to_string(),
        }
    }
}

impl ProfileCacheConfig {
    /// 从 TOML 字符串加载
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            toml::from_str(toml).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))?;
        config.normalize_mode();
        Ok(config)
    }

    /// 从 TOML 文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Parse(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// `mode` 和 `record`/`replay` 两种写法合并成一种
    fn normalize_mode(&mut self) {
        match self.mode {
            CacheMode::Record => self.record = true,
            CacheMode::Replay => self.replay = true,
            CacheMode::Disabled => {
                if self.record && !self.replay {
                    self.mode = CacheMode::Record;
                } else if self.replay && !self.record {
                    self.mode = CacheMode::Replay;
                }
            }
        }
    }

    /// 实际生效的模式
    pub fn effective_mode(&self) -> CacheMode {
        let mut normalized = self.clone();
        normalized.normalize_mode();
        if normalized.record && normalized.replay {
            CacheMode::Disabled
        } else {
            normalized.mode
        }
    }

    pub fn is_recording(&self) -> bool {
        self.effective_mode() == CacheMode::Record
    }

    pub fn is_replaying(&self) -> bool {
        self.effective_mode() == CacheMode::Replay
    }

    /// 启动时校验，失败时 VM 应终止启动
    pub fn validate(&self, flags: &VmFlags) -> Result<(), ConfigError> {
        let mut normalized = self.clone();
        normalized.normalize_mode();

        if normalized.record && normalized.replay {
            return Err(ConfigError::ConflictingModes);
        }
        if normalized.mode == CacheMode::Disabled {
            return Ok(());
        }
        if flags.interpreter_only {
            return Err(ConfigError::InterpreterOnly);
        }

        if self.deopt_batch_size == 0 || self.deopt_batch_size > MAX_DEOPT_BATCH_SIZE {
            return Err(ConfigError::OutOfRange {
                name: "deopt_batch_size",
                value: self.deopt_batch_size as u64,
                min: 1,
                max: MAX_DEOPT_BATCH_SIZE as u64,
            });
        }

        match normalized.mode {
            CacheMode::Record => {
                if flags.class_unloading {
                    return Err(ConfigError::ClassUnloadingEnabled);
                }
            }
            CacheMode::Replay => {
                if !self.profile_path.is_file() {
                    return Err(ConfigError::MissingProfile(
                        self.profile_path.display().to_string(),
                    ));
                }
            }
            CacheMode::Disabled => {}
        }
        Ok(())
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_secs(self.flush_delay_secs)
    }

    pub fn deopt_after(&self) -> Duration {
        Duration::from_secs(self.deopt_after_secs)
    }

    pub fn deopt_min_interval(&self) -> Duration {
        Duration::from_millis(self.deopt_min_interval_ms)
    }

    pub fn exclude_list(&self) -> ExcludeList {
        ExcludeList::parse(&self.exclude_classes)
    }
}
