//! 去优化驱动
//!
//! 只在 safepoint 调用。每次最多处理 `batch_size` 个方法持有者，从最后一个有方法的槽位
//! 反向遍历，游标跨调用保存；游标耗尽后链转到 Deoptimized 并释放所有保活句柄。
//! 编译 id 大于标记方法的编译产物是预编译之后独立编译出来的，不去优化。

use std::fmt;
use std::time::{Duration, Instant};

use crate::chain::{ChainInner, ClassChain, DeoptCursor};
use crate::config::{DeoptTrigger, ProfileCacheConfig};
use crate::runtime::VmRuntime;
use crate::state::ChainState;

/// 去优化策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptPolicy {
    pub trigger: DeoptTrigger,
    /// 定时触发：链创建后多久开始
    pub deopt_after: Duration,
    /// 两批之间的最小间隔
    pub min_interval: Duration,
    pub batch_size: usize,
}

impl DeoptPolicy {
    pub fn from_config(config: &ProfileCacheConfig) -> Self {
        Self {
            trigger: config.deopt_trigger,
            deopt_after: config.deopt_after(),
            min_interval: config.deopt_min_interval(),
            batch_size: config.deopt_batch_size as usize,
        }
    }
}

/// 本次没有执行去优化的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptSkip {
    NotAtSafepoint,
    /// 预编译尚未完成
    NotReady(ChainState),
    /// 已经结束（Deoptimized 或 Error）
    Finished(ChainState),
    NotTriggered,
    TooSoon,
    NoBarrier,
    BarrierNotCompiled,
    ChainTooShort,
    NestedOperation,
}

impl fmt::Display for DeoptSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeoptSkip::NotAtSafepoint => f.write_str("not at a safepoint"),
            DeoptSkip::NotReady(state) => write!(f, "precompilation not finished (state {})", state),
            DeoptSkip::Finished(state) => write!(f, "nothing left to deoptimize (state {})", state),
            DeoptSkip::NotTriggered => f.write_str("deoptimization not triggered yet"),
            DeoptSkip::TooSoon => f.write_str("minimum interval since last batch not elapsed"),
            DeoptSkip::NoBarrier => f.write_str("barrier method missing"),
            DeoptSkip::BarrierNotCompiled => f.write_str("barrier method not compiled"),
            DeoptSkip::ChainTooShort => f.write_str("chain has fewer than two slots"),
            DeoptSkip::NestedOperation => f.write_str("another VM operation in progress"),
        }
    }
}

/// 一批去优化的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeoptBatch {
    /// 访问过的方法持有者
    pub processed: usize,
    pub deopted: usize,
    pub skipped_dead: usize,
    pub skipped_already: usize,
    /// 编译 id 晚于标记方法
    pub skipped_newer: usize,
    /// 本批之后整个链已去优化完毕
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptOutcome {
    Skipped(DeoptSkip),
    Batch(DeoptBatch),
}

/// 去优化驱动
pub struct DeoptimizationDriver<'a> {
    chain: &'a ClassChain,
    policy: DeoptPolicy,
}

impl<'a> DeoptimizationDriver<'a> {
    pub fn new(chain: &'a ClassChain, policy: DeoptPolicy) -> Self {
        Self { chain, policy }
    }

    /// 在 safepoint 内执行一批
    ///
    /// `signaled` 表示收到了显式的去优化通知。
    pub fn run(&self, signaled: bool) -> DeoptOutcome {
        match self.try_run(signaled) {
            Ok(batch) => DeoptOutcome::Batch(batch),
            Err(skip) => {
                log::trace!("[JitProfileCache] deoptimization skipped: {}", skip);
                DeoptOutcome::Skipped(skip)
            }
        }
    }

    fn try_run(&self, signaled: bool) -> Result<DeoptBatch, DeoptSkip> {
        let chain = self.chain;
        let runtime = chain.runtime();
        if !runtime.is_at_safepoint() {
            return Err(DeoptSkip::NotAtSafepoint);
        }

        let state = chain.state();
        match state {
            ChainState::Deoptimized | ChainState::Error => return Err(DeoptSkip::Finished(state)),
            ChainState::Done | ChainState::PreDeoptimize | ChainState::Deoptimizing => {}
            _ => return Err(DeoptSkip::NotReady(state)),
        }

        let timed_out = self.policy.trigger == DeoptTrigger::Timed
            && chain.created_at().elapsed() >= self.policy.deopt_after;
        if !signaled && !timed_out {
            return Err(DeoptSkip::NotTriggered);
        }

        let mut inner = chain.lock();
        if inner
            .last_deopt_batch
            .is_some_and(|last| last.elapsed() < self.policy.min_interval)
        {
            return Err(DeoptSkip::TooSoon);
        }
        let barrier = inner.barrier.ok_or(DeoptSkip::NoBarrier)?;
        let barrier_code = runtime
            .compiled_code(barrier)
            .ok_or(DeoptSkip::BarrierNotCompiled)?;
        if inner.len() < 2 {
            return Err(DeoptSkip::ChainTooShort);
        }
        if runtime.nested_operation_in_progress() {
            return Err(DeoptSkip::NestedOperation);
        }

        if state == ChainState::Done {
            chain.try_transition(ChainState::PreDeoptimize);
        }
        if chain.state() == ChainState::PreDeoptimize
            && chain.try_transition(ChainState::Deoptimizing).reached()
        {
            inner.deopt_cursor = Self::previous_cursor(&inner, inner.len());
            log::info!(
                "[JitProfileCache] deoptimization started, barrier compile id {}",
                barrier_code.compile_id
            );
        }
        if chain.state() != ChainState::Deoptimizing {
            return Err(DeoptSkip::Finished(chain.state()));
        }

        let mut batch = self.deopt_batch(&mut inner, runtime, barrier_code.compile_id);
        inner.last_deopt_batch = Some(Instant::now());

        if inner.deopt_cursor.is_none() {
            chain.try_transition(ChainState::Deoptimized);
            let released = inner.release_keep_alive_handles(runtime);
            batch.finished = true;
            log::info!(
                "[JitProfileCache] deoptimization finished, {} keep-alive handles released",
                released
            );
        }
        Ok(batch)
    }

    /// `before` 之前最后一个有方法的槽位
    fn previous_cursor(inner: &ChainInner, before: usize) -> Option<DeoptCursor> {
        (0..before)
            .rev()
            .find(|&slot| !inner.entry(slot).methods.is_empty())
            .map(|slot| DeoptCursor {
                slot,
                remaining: inner.entry(slot).methods.len(),
            })
    }

    fn deopt_batch(
        &self,
        inner: &mut ChainInner,
        runtime: &dyn VmRuntime,
        barrier_id: u32,
    ) -> DeoptBatch {
        let mut batch = DeoptBatch::default();
        while batch.processed < self.policy.batch_size {
            let Some(mut cursor) = inner.deopt_cursor else {
                break;
            };
            if cursor.remaining == 0 {
                inner.deopt_cursor = Self::previous_cursor(inner, cursor.slot);
                continue;
            }
            cursor.remaining -= 1;
            inner.deopt_cursor = Some(cursor);
            let hold = inner.entry(cursor.slot).methods[cursor.remaining];
            batch.processed += 1;

            for variant in inner.registry.method_mut(hold).variants.iter_mut() {
                if variant.is_deopted {
                    batch.skipped_already += 1;
                    continue;
                }
                // 类卸载可能早于去优化完成，死亡的方法不能再交给 VM
                let Some(method) = variant.method.filter(|&m| runtime.is_method_alive(m)) else {
                    batch.skipped_dead += 1;
                    variant.method = None;
                    continue;
                };
                if let Some(code) = runtime.compiled_code(method) {
                    if code.compile_id > barrier_id {
                        batch.skipped_newer += 1;
                        log::trace!(
                            "[JitProfileCache] {} compiled after barrier (id {}), kept",
                            method,
                            code.compile_id
                        );
                        continue;
                    }
                }
                if runtime.mark_for_deoptimization(method) {
                    batch.deopted += 1;
                    log::debug!("[JitProfileCache] marked {} for deoptimization", method);
                }
                variant.is_deopted = true;
            }
        }

        // 游标停在某个槽位开头时顺带前移，使最后一批能直接结束
        if let Some(cursor) = inner.deopt_cursor {
            if cursor.remaining == 0 {
                inner.deopt_cursor = Self::previous_cursor(inner, cursor.slot);
            }
        }

        if batch.deopted > 0 {
            runtime.deoptimize_all();
        }
        batch
    }
}
