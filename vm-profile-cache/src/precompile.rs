//! 预编译驱动
//!
//! 启动完成后按链顺序走一遍：未加载的槽位跳过，已加载的槽位强制初始化，
//! 已初始化的槽位把方法提交给优化编译器。每处理完一个槽位刷新一次链，
//! 当前下标超过 `inited_index` 时整个遍历提前结束（单次遍历，不重试）。
//! 遍历结束后同步编译标记方法，其编译 id 作为之后去优化的分界线。

use crate::chain::{ClassChain, EntryState};
use crate::error::{ProfileCacheError, Result};
use crate::runtime::{
    ClassId, ClassStatus, CompLevel, CompiledCode, MethodId, INVOCATION_ENTRY_BCI,
};
use crate::state::{ChainState, Transition};

/// 预编译结束标记方法
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierMethod {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

impl BarrierMethod {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            signature: signature.into(),
        }
    }
}

/// 一次预编译的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecompileStats {
    pub slots_visited: usize,
    pub slots_skipped: usize,
    pub classes_initialized: usize,
    /// 被编译队列接受的方法
    pub submitted: usize,
    /// 提交后被队列拒绝
    pub rejected: usize,
    /// 提交时出错
    pub failed: usize,
    pub already_compiled: usize,
    pub not_compilable: usize,
    pub holder_not_initialized: usize,
    /// 遍历提前结束的槽位
    pub stopped_at: Option<usize>,
    pub barrier: Option<CompiledCode>,
}

/// 待提交的物理方法
struct Candidate {
    hold: usize,
    variant: usize,
    method: MethodId,
    class: ClassId,
}

/// 槽位处理结果
enum SlotAction {
    Next,
    Compile(Vec<usize>),
}

/// 预编译驱动
pub struct PrecompilationDriver<'a> {
    chain: &'a ClassChain,
    barrier: &'a BarrierMethod,
}

impl<'a> PrecompilationDriver<'a> {
    pub fn new(chain: &'a ClassChain, barrier: &'a BarrierMethod) -> Self {
        Self { chain, barrier }
    }

    /// 执行一次预编译
    ///
    /// 链必须处于 Inited；类初始化失败会中止遍历并把链置为 Error，已提交的编译不回滚。
    pub fn run(&self) -> Result<PrecompileStats> {
        match self.chain.try_transition(ChainState::PrePrecompile) {
            Transition::Advanced => {}
            Transition::AlreadyThere => {
                log::warn!("[JitProfileCache] precompilation already started by another thread");
                return Err(ProfileCacheError::InvalidState(ChainState::PrePrecompile));
            }
            Transition::Rejected { current } => {
                return Err(ProfileCacheError::InvalidState(current));
            }
        }
        if !self.chain.try_transition(ChainState::Compiling).reached() {
            return Err(ProfileCacheError::InvalidState(self.chain.state()));
        }

        log::info!(
            "[JitProfileCache] precompilation started, {} slots",
            self.chain.len()
        );
        let mut stats = PrecompileStats::default();

        let len = self.chain.len();
        for slot in 0..len {
            stats.slots_visited += 1;
            let action = match self.handle_slot(slot, &mut stats) {
                Ok(action) => action,
                Err(e) => {
                    self.chain.transition_to_error();
                    return Err(e);
                }
            };

            self.chain.refresh();
            if slot as isize > self.chain.inited_index() {
                log::info!(
                    "[JitProfileCache] slot {} not initialized yet, precompilation stops here",
                    slot
                );
                stats.stopped_at = Some(slot);
                break;
            }

            if let SlotAction::Compile(holds) = action {
                self.compile_holds(&holds, &mut stats);
            }
        }

        match self.compile_barrier() {
            Ok(code) => stats.barrier = Some(code),
            Err(e) => {
                log::error!("[JitProfileCache] precompilation barrier failed: {}", e);
                self.chain.transition_to_error();
                return Err(e);
            }
        }

        self.chain.try_transition(ChainState::Done);
        log::info!(
            "[JitProfileCache] precompilation done: {} submitted, {} failed, {} slots skipped",
            stats.submitted,
            stats.failed,
            stats.slots_skipped
        );
        Ok(stats)
    }

    /// 按槽位状态分派；已加载的槽位逐个初始化其类直到槽位变为 Initialized
    fn handle_slot(&self, slot: usize, stats: &mut PrecompileStats) -> Result<SlotAction> {
        let runtime = self.chain.runtime();
        let mut attempted: Vec<ClassId> = Vec::new();
        loop {
            let mut inner = self.chain.lock();
            let state = inner.entry(slot).state;
            match state {
                EntryState::NotLoaded => {
                    inner.mark_skipped(slot);
                    stats.slots_skipped += 1;
                    log::debug!(
                        "[JitProfileCache] slot {} {} never loaded, skipped",
                        slot,
                        inner.entry(slot).class_name
                    );
                    return Ok(SlotAction::Next);
                }
                EntryState::Skipped => return Ok(SlotAction::Next),
                EntryState::Initialized => {
                    let entry = inner.entry(slot);
                    if entry
                        .resolved_classes
                        .iter()
                        .any(|rc| runtime.is_redefined(rc.class))
                    {
                        log::debug!(
                            "[JitProfileCache] slot {} {} redefined, methods not precompiled",
                            slot,
                            entry.class_name
                        );
                        return Ok(SlotAction::Next);
                    }
                    return Ok(SlotAction::Compile(entry.methods.clone()));
                }
                EntryState::Loaded => {
                    let entry = inner.entry(slot);
                    let class_name = entry.class_name.clone();
                    let pending = entry
                        .resolved_classes
                        .iter()
                        .map(|rc| rc.class)
                        .find(|&c| {
                            runtime.class_status(c) != ClassStatus::Initialized
                                && !attempted.contains(&c)
                        });
                    drop(inner);

                    let Some(class) = pending else {
                        // 类都已在遍历之外完成初始化时，刷新后按新状态重新分派
                        self.chain.refresh();
                        if self.chain.entry_state(slot) == Some(EntryState::Loaded) {
                            return Ok(SlotAction::Next);
                        }
                        continue;
                    };
                    attempted.push(class);
                    // 可能阻塞等待其他线程完成初始化
                    runtime
                        .initialize(class)
                        .map_err(|e| ProfileCacheError::ClassInit {
                            class: class_name.clone(),
                            message: e.exception,
                        })?;
                    stats.classes_initialized += 1;
                    log::trace!("[JitProfileCache] initialized {} ({})", class_name, class);
                    self.chain.refresh();
                }
            }
        }
    }

    fn compile_holds(&self, holds: &[usize], stats: &mut PrecompileStats) {
        let runtime = self.chain.runtime();
        let candidates: Vec<Candidate> = {
            let inner = self.chain.lock();
            holds
                .iter()
                .flat_map(|&hold| {
                    inner
                        .registry()
                        .method(hold)
                        .variants
                        .iter()
                        .enumerate()
                        .filter(|(_, v)| !v.precompiled)
                        .filter_map(move |(variant, v)| {
                            v.method.map(|method| Candidate {
                                hold,
                                variant,
                                method,
                                class: v.class,
                            })
                        })
                })
                .collect()
        };

        for c in candidates {
            if runtime.compiled_code(c.method).is_some() {
                stats.already_compiled += 1;
                continue;
            }
            if runtime.class_status(c.class) != ClassStatus::Initialized {
                stats.holder_not_initialized += 1;
                continue;
            }
            if !runtime.can_be_compiled(c.method, CompLevel::FullOptimization) {
                stats.not_compilable += 1;
                continue;
            }
            match runtime.commit_compilation(
                c.method,
                INVOCATION_ENTRY_BCI,
                CompLevel::FullOptimization,
            ) {
                Ok(true) => {
                    stats.submitted += 1;
                    let mut inner = self.chain.lock();
                    inner.registry.method_mut(c.hold).variants[c.variant].precompiled = true;
                    log::debug!("[JitProfileCache] submitted {}", c.method);
                }
                Ok(false) => {
                    stats.rejected += 1;
                    log::debug!("[JitProfileCache] compile queue rejected {}", c.method);
                }
                Err(e) => {
                    stats.failed += 1;
                    log::warn!("[JitProfileCache] failed to submit {}: {}", c.method, e);
                }
            }
        }
    }

    fn compile_barrier(&self) -> Result<CompiledCode> {
        let runtime = self.chain.runtime();
        let b = self.barrier;
        let class = runtime
            .resolve_or_fail(&b.class_name)
            .ok_or_else(|| ProfileCacheError::Barrier(format!("cannot resolve {}", b.class_name)))?;
        runtime.initialize(class).map_err(|e| {
            ProfileCacheError::Barrier(format!("cannot initialize {}: {}", b.class_name, e))
        })?;
        let method = runtime
            .find_method(class, &b.method_name, &b.signature)
            .ok_or_else(|| {
                ProfileCacheError::Barrier(format!(
                    "{}.{}{} not found",
                    b.class_name, b.method_name, b.signature
                ))
            })?;
        let code = runtime
            .compile_sync(method, CompLevel::FullOptimization)
            .ok_or_else(|| ProfileCacheError::Barrier(format!("cannot compile {}", method)))?;
        self.chain.lock().barrier = Some(method);
        log::info!(
            "[JitProfileCache] barrier {}.{} compiled with id {}",
            b.class_name,
            b.method_name,
            code.compile_id
        );
        Ok(code)
    }
}
