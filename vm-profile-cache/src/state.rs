//! 类解析链的全局状态机
//!
//! ```text
//! NotInited → Inited → PrePrecompile → Compiling → Done
//!                                             Done → PreDeoptimize → Deoptimizing → Deoptimized
//! 任意非 Deoptimized 状态 → Error（单向）
//! ```
//!
//! 前进一步只允许从紧邻的前驱状态出发，用 CAS 保证并发推进时恰好一个线程成功。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// 链状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ChainState {
    NotInited = 0,
    Inited = 1,
    PrePrecompile = 2,
    Compiling = 3,
    Done = 4,
    PreDeoptimize = 5,
    Deoptimizing = 6,
    Deoptimized = 7,
    Error = 8,
}

impl ChainState {
    const ALL: [ChainState; 9] = [
        ChainState::NotInited,
        ChainState::Inited,
        ChainState::PrePrecompile,
        ChainState::Compiling,
        ChainState::Done,
        ChainState::PreDeoptimize,
        ChainState::Deoptimizing,
        ChainState::Deoptimized,
        ChainState::Error,
    ];

    fn from_u8(value: u8) -> ChainState {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(ChainState::Error)
    }

    /// 转移表中唯一允许的前驱
    pub fn predecessor(self) -> Option<ChainState> {
        match self {
            ChainState::NotInited | ChainState::Error => None,
            ChainState::Inited => Some(ChainState::NotInited),
            ChainState::PrePrecompile => Some(ChainState::Inited),
            ChainState::Compiling => Some(ChainState::PrePrecompile),
            ChainState::Done => Some(ChainState::Compiling),
            ChainState::PreDeoptimize => Some(ChainState::Done),
            ChainState::Deoptimizing => Some(ChainState::PreDeoptimize),
            ChainState::Deoptimized => Some(ChainState::Deoptimizing),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChainState::NotInited => "not_inited",
            ChainState::Inited => "inited",
            ChainState::PrePrecompile => "pre_precompile",
            ChainState::Compiling => "compiling",
            ChainState::Done => "done",
            ChainState::PreDeoptimize => "pre_deoptimize",
            ChainState::Deoptimizing => "deoptimizing",
            ChainState::Deoptimized => "deoptimized",
            ChainState::Error => "error",
        }
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态转移结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 本次调用完成了转移
    Advanced,
    /// 已经处于目标状态，无副作用
    AlreadyThere,
    /// 当前状态不是目标的前驱（或 CAS 竞争失败）
    Rejected { current: ChainState },
}

impl Transition {
    /// 转移后是否处于目标状态
    pub fn reached(self) -> bool {
        matches!(self, Transition::Advanced | Transition::AlreadyThere)
    }
}

/// 原子状态，并记录每个状态首次进入的时间
pub struct AtomicChainState {
    state: AtomicU8,
    entered_at: Mutex<[Option<Instant>; 9]>,
}

impl AtomicChainState {
    pub fn new() -> Self {
        let mut entered_at = [None; 9];
        entered_at[ChainState::NotInited as usize] = Some(Instant::now());
        Self {
            state: AtomicU8::new(ChainState::NotInited as u8),
            entered_at: Mutex::new(entered_at),
        }
    }

    pub fn get(&self) -> ChainState {
        ChainState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 尝试前进到 `target`
    pub fn try_transition(&self, target: ChainState) -> Transition {
        if target == ChainState::Error {
            return self.transition_to_error();
        }
        let Some(from) = target.predecessor() else {
            let current = self.get();
            return if current == target {
                Transition::AlreadyThere
            } else {
                Transition::Rejected { current }
            };
        };

        match self.state.compare_exchange(
            from as u8,
            target as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.mark_entered(target);
                log::debug!("[JitProfileCache] chain state {} -> {}", from, target);
                Transition::Advanced
            }
            Err(actual) => {
                let current = ChainState::from_u8(actual);
                if current == target {
                    Transition::AlreadyThere
                } else {
                    log::warn!(
                        "[JitProfileCache] cannot move chain state to {}: current state is {}",
                        target,
                        current
                    );
                    Transition::Rejected { current }
                }
            }
        }
    }

    /// 进入 Error，除 Deoptimized 外任何状态都允许
    pub fn transition_to_error(&self) -> Transition {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = ChainState::from_u8(current);
            match state {
                ChainState::Error => return Transition::AlreadyThere,
                ChainState::Deoptimized => return Transition::Rejected { current: state },
                _ => {}
            }
            match self.state.compare_exchange_weak(
                current,
                ChainState::Error as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.mark_entered(ChainState::Error);
                    log::warn!("[JitProfileCache] chain state {} -> error", state);
                    return Transition::Advanced;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn mark_entered(&self, state: ChainState) {
        let mut entered = self.entered_at.lock();
        if entered[state as usize].is_none() {
            entered[state as usize] = Some(Instant::now());
        }
    }

    /// 首次进入某状态的时间
    pub fn entered_at(&self, state: ChainState) -> Option<Instant> {
        self.entered_at.lock()[state as usize]
    }
}

impl Default for AtomicChainState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomicChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicChainState")
            .field("state", &self.get())
            .finish()
    }
}
