//! 类解析链
//!
//! 链按记录时的类初始化顺序排列，每个槽位跟踪本次运行中与之对应的类：
//!
//! ```text
//! slot:    0        1         2          3
//! state:  Init  →  Init  →  Loaded  →  NotLoaded ...
//!                   ^         ^
//!              inited_index  loaded_index
//! ```
//!
//! `loaded_index` / `inited_index` 是最长的“已加载”/“已初始化”前缀的末尾（-1 表示空），
//! 用于限制预编译的遍历范围。所有结构性修改都在同一把锁下完成。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::format::ClassRecord;
use crate::holder::{HolderRegistry, ResolveOutcome};
use crate::runtime::{
    identity_hash, ClassDescriptor, ClassId, ClassIdentity, ClassStatus, KeepAliveHandle,
    MethodId, VmRuntime,
};
use crate::state::{AtomicChainState, ChainState, Transition};

/// 槽位状态
///
/// 只会单调前进：NotLoaded → Loaded → Initialized，或 NotLoaded → Skipped。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    NotLoaded,
    Skipped,
    Loaded,
    Initialized,
}

impl EntryState {
    /// 是否可以算入 loaded 前缀
    fn is_settled(self) -> bool {
        !matches!(self, EntryState::NotLoaded)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryState::NotLoaded => "not_loaded",
            EntryState::Skipped => "skipped",
            EntryState::Loaded => "loaded",
            EntryState::Initialized => "initialized",
        };
        f.write_str(s)
    }
}

/// 槽位上已解析的类及其加载器保活句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClass {
    pub class: ClassId,
    pub keep_alive: Option<KeepAliveHandle>,
}

/// 链中的一个槽位
#[derive(Debug, Clone)]
pub struct ClassChainEntry {
    pub class_name: String,
    pub loader_name: String,
    pub source_path: String,
    pub state: EntryState,
    pub resolved_classes: Vec<ResolvedClass>,
    /// 首次调用发生在本槽位期间的方法（[`HolderRegistry`] 下标）
    pub methods: Vec<usize>,
}

impl ClassChainEntry {
    fn new(record: &ClassRecord) -> Self {
        Self {
            class_name: record.name.clone(),
            loader_name: record.loader_name.clone(),
            source_path: record.source_path.clone(),
            state: EntryState::NotLoaded,
            resolved_classes: Vec::new(),
            methods: Vec::new(),
        }
    }

    fn matches(&self, identity: &ClassIdentity) -> bool {
        self.class_name == identity.name
            && self.loader_name == identity.loader_name
            && self.source_path == identity.source_path
    }

    /// 仅在 NotLoaded 时生效
    fn mark_skipped(&mut self) -> bool {
        if self.state == EntryState::NotLoaded {
            self.state = EntryState::Skipped;
            true
        } else {
            false
        }
    }
}

/// 去优化游标：下一个要访问的是 `entries[slot].methods[remaining - 1]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeoptCursor {
    pub slot: usize,
    pub remaining: usize,
}

/// 锁保护的链内容
#[derive(Debug)]
pub struct ChainInner {
    pub(crate) entries: Vec<ClassChainEntry>,
    pub(crate) registry: HolderRegistry,
    /// 匹配到记录类体但不在类表中的类（例如只被调用过方法的接口）
    pub(crate) unslotted: Vec<ResolvedClass>,
    by_identity: HashMap<u32, SmallVec<[usize; 1]>>,
    pub(crate) loaded_index: isize,
    pub(crate) inited_index: isize,
    pub(crate) deopt_cursor: Option<DeoptCursor>,
    pub(crate) last_deopt_batch: Option<Instant>,
    /// 预编译结束标记方法
    pub(crate) barrier: Option<MethodId>,
}

impl ChainInner {
    fn new(classes: &[ClassRecord]) -> Self {
        let mut by_identity: HashMap<u32, SmallVec<[usize; 1]>> = HashMap::new();
        for (slot, class) in classes.iter().enumerate() {
            let hash = identity_hash(&class.name, &class.loader_name, &class.source_path);
            by_identity.entry(hash).or_default().push(slot);
        }
        Self {
            entries: classes.iter().map(ClassChainEntry::new).collect(),
            registry: HolderRegistry::new(),
            unslotted: Vec::new(),
            by_identity,
            loaded_index: -1,
            inited_index: -1,
            deopt_cursor: None,
            last_deopt_batch: None,
            barrier: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, slot: usize) -> &ClassChainEntry {
        &self.entries[slot]
    }

    pub fn registry(&self) -> &HolderRegistry {
        &self.registry
    }

    pub fn barrier(&self) -> Option<MethodId> {
        self.barrier
    }

    /// 不属于任何槽位的已解析类
    pub fn unslotted_classes(&self) -> &[ResolvedClass] {
        &self.unslotted
    }

    /// 按身份查找槽位，同一身份有多个槽位时优先尚未加载的
    pub fn find_slot(&self, identity: &ClassIdentity) -> Option<usize> {
        let candidates = self.by_identity.get(&identity.identity_hash())?;
        let mut matching = candidates
            .iter()
            .copied()
            .filter(|&slot| self.entries[slot].matches(identity));
        let first = matching.next()?;
        if self.entries[first].state == EntryState::NotLoaded {
            return Some(first);
        }
        Some(
            matching
                .find(|&slot| self.entries[slot].state == EntryState::NotLoaded)
                .unwrap_or(first),
        )
    }

    /// 把槽位标记为跳过；已加载或已跳过时无操作
    pub(crate) fn mark_skipped(&mut self, slot: usize) -> bool {
        self.entries[slot].mark_skipped()
    }

    /// 刷新：提升已全部初始化的槽位，并推进两个高水位
    ///
    /// 从 `inited_index + 1` 开始向前扫描，遇到第一个 NotLoaded 停止。
    pub(crate) fn refresh(&mut self, runtime: &dyn VmRuntime) {
        let mut inited_run = true;
        let mut slot = (self.inited_index + 1) as usize;
        while slot < self.entries.len() {
            let entry = &mut self.entries[slot];
            if entry.state == EntryState::Loaded
                && !entry.resolved_classes.is_empty()
                && entry
                    .resolved_classes
                    .iter()
                    .all(|rc| runtime.class_status(rc.class) == ClassStatus::Initialized)
            {
                entry.state = EntryState::Initialized;
                log::trace!(
                    "[JitProfileCache] slot {} {} initialized",
                    slot,
                    entry.class_name
                );
            }

            let state = entry.state;
            if !state.is_settled() {
                break;
            }
            if state == EntryState::Loaded {
                inited_run = false;
            } else if inited_run {
                self.inited_index = slot as isize;
            }
            if slot as isize > self.loaded_index {
                self.loaded_index = slot as isize;
            }
            slot += 1;
        }
        debug_assert!(self.loaded_index >= self.inited_index);
    }

    /// 释放所有保活句柄
    pub(crate) fn release_keep_alive_handles(&mut self, runtime: &dyn VmRuntime) -> usize {
        let mut released = 0;
        let slotted = self.entries.iter_mut().flat_map(|e| e.resolved_classes.iter_mut());
        for rc in slotted.chain(self.unslotted.iter_mut()) {
            if let Some(handle) = rc.keep_alive.take() {
                runtime.release_keep_alive(handle);
                released += 1;
            }
        }
        released
    }
}

/// 类加载回调的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// 链未就绪或已结束
    Ignored,
    /// 该类体不在 profile 中
    NotProfiled,
    /// 该类体已经完整解析过
    Duplicate,
    Resolved {
        slot: Option<usize>,
        outcome: ResolveOutcome,
    },
}

/// 链统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainStatistics {
    pub state: Option<ChainState>,
    pub length: usize,
    pub loaded_index: isize,
    pub inited_index: isize,
    pub not_loaded: usize,
    pub skipped: usize,
    pub loaded: usize,
    pub initialized: usize,
    pub class_holders: usize,
    pub unslotted_classes: usize,
    pub method_holds: usize,
    pub resolved_methods: usize,
    pub precompiled_methods: usize,
    pub deopted_methods: usize,
}

/// 类解析链
pub struct ClassChain {
    state: AtomicChainState,
    inner: Mutex<ChainInner>,
    created_at: Instant,
    runtime: Arc<dyn VmRuntime>,
}

impl ClassChain {
    /// 按类表建链，状态为 NotInited，方法由预加载器填入
    pub fn new(classes: &[ClassRecord], runtime: Arc<dyn VmRuntime>) -> Self {
        Self {
            state: AtomicChainState::new(),
            inner: Mutex::new(ChainInner::new(classes)),
            created_at: Instant::now(),
            runtime,
        }
    }

    pub fn state(&self) -> ChainState {
        self.state.get()
    }

    pub fn try_transition(&self, target: ChainState) -> Transition {
        self.state.try_transition(target)
    }

    /// 进入 Error 并释放所有保活句柄，调用方不能持有链锁
    pub fn transition_to_error(&self) -> Transition {
        let transition = self.state.transition_to_error();
        if transition == Transition::Advanced {
            let released = self.inner.lock().release_keep_alive_handles(self.runtime.as_ref());
            log::debug!(
                "[JitProfileCache] chain failed, {} keep-alive handles released",
                released
            );
        }
        transition
    }

    pub fn state_entered_at(&self, state: ChainState) -> Option<Instant> {
        self.state.entered_at(state)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn runtime(&self) -> &dyn VmRuntime {
        self.runtime.as_ref()
    }

    /// 获取链锁
    pub fn lock(&self) -> MutexGuard<'_, ChainInner> {
        self.inner.lock()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn loaded_index(&self) -> isize {
        self.inner.lock().loaded_index
    }

    pub fn inited_index(&self) -> isize {
        self.inner.lock().inited_index
    }

    pub fn entry_state(&self, slot: usize) -> Option<EntryState> {
        self.inner.lock().entries.get(slot).map(|e| e.state)
    }

    /// 类加载回调
    pub fn mark_loaded_class(&self, class: &ClassDescriptor) -> LoadOutcome {
        let identity = &class.identity;
        let runtime = self.runtime.as_ref();
        let mut inner = self.inner.lock();
        // 去优化结束和进入 Error 都在持锁时释放句柄，状态必须在锁内检查
        match self.state() {
            ChainState::NotInited | ChainState::Deoptimized | ChainState::Error => {
                return LoadOutcome::Ignored;
            }
            _ => {}
        }

        let Some(holder) = inner.registry.find_holder(identity) else {
            log::trace!(
                "[JitProfileCache] {} (size {}, crc32 {:#x}) not in profile",
                identity.name,
                identity.byte_size,
                identity.crc32
            );
            return LoadOutcome::NotProfiled;
        };

        if inner.registry.holder(holder).resolved {
            if !runtime.is_resolving_superclass() {
                log::warn!(
                    "[JitProfileCache] duplicate load of {} ({}) from loader {}",
                    identity.name,
                    class.id,
                    identity.loader_name
                );
            }
            return LoadOutcome::Duplicate;
        }

        let outcome = inner.registry.resolve_class(holder, class);

        let slot = inner.find_slot(identity);
        let attached = match slot {
            Some(slot) if inner.entries[slot].state != EntryState::Skipped => {
                let entry = &mut inner.entries[slot];
                if !entry.resolved_classes.iter().any(|rc| rc.class == class.id) {
                    entry.resolved_classes.push(ResolvedClass {
                        class: class.id,
                        keep_alive: Some(runtime.acquire_keep_alive(class.id)),
                    });
                    if entry.state == EntryState::NotLoaded {
                        entry.state = EntryState::Loaded;
                    }
                }
                true
            }
            _ => false,
        };
        // 方法已经解析，类必须和槽位上的类一样保活到去优化结束
        if !attached && !inner.unslotted.iter().any(|rc| rc.class == class.id) {
            inner.unslotted.push(ResolvedClass {
                class: class.id,
                keep_alive: Some(runtime.acquire_keep_alive(class.id)),
            });
        }
        if slot.is_some() {
            inner.refresh(runtime);
        }

        log::debug!(
            "[JitProfileCache] resolved {} methods of {} (slot {:?}, {} cloned)",
            outcome.resolved,
            identity.name,
            slot,
            outcome.cloned
        );
        LoadOutcome::Resolved { slot, outcome }
    }

    /// 运行一次刷新
    pub fn refresh(&self) {
        let mut inner = self.inner.lock();
        inner.refresh(self.runtime.as_ref());
    }

    /// 把槽位标记为跳过
    pub fn mark_skipped(&self, slot: usize) -> bool {
        let mut inner = self.inner.lock();
        if slot >= inner.len() {
            return false;
        }
        let changed = inner.mark_skipped(slot);
        inner.refresh(self.runtime.as_ref());
        changed
    }

    /// 类卸载阶段的回调（safepoint）
    ///
    /// 只在链结束（Deoptimized 或 Error）后生效：丢弃加载器已死亡的类，
    /// 清空已死亡且未去优化的方法引用。
    pub fn on_class_unloading(&self) -> usize {
        let runtime = self.runtime.as_ref();
        if !runtime.is_at_safepoint() {
            log::warn!("[JitProfileCache] class unloading callback outside safepoint ignored");
            return 0;
        }
        if !matches!(self.state(), ChainState::Deoptimized | ChainState::Error) {
            return 0;
        }

        let mut inner = self.inner.lock();
        let mut dropped = 0;
        let mut prune = |classes: &mut Vec<ResolvedClass>| {
            classes.retain_mut(|rc| {
                if runtime.is_class_alive(rc.class) {
                    return true;
                }
                if let Some(handle) = rc.keep_alive.take() {
                    runtime.release_keep_alive(handle);
                }
                dropped += 1;
                false
            });
        };
        let inner = &mut *inner;
        for entry in &mut inner.entries {
            prune(&mut entry.resolved_classes);
        }
        prune(&mut inner.unslotted);
        for hold in inner.registry.methods_mut() {
            for variant in hold.variants.iter_mut() {
                if let Some(method) = variant.method {
                    if !variant.is_deopted && !runtime.is_method_alive(method) {
                        variant.method = None;
                    }
                }
            }
        }
        if dropped > 0 {
            log::debug!("[JitProfileCache] dropped {} unloaded classes", dropped);
        }
        dropped
    }

    /// 统计信息
    pub fn statistics(&self) -> ChainStatistics {
        let inner = self.inner.lock();
        let mut stats = ChainStatistics {
            state: Some(self.state()),
            length: inner.len(),
            loaded_index: inner.loaded_index,
            inited_index: inner.inited_index,
            class_holders: inner.registry.holder_count(),
            unslotted_classes: inner.unslotted.len(),
            method_holds: inner.registry.method_count(),
            ..Default::default()
        };
        for entry in &inner.entries {
            match entry.state {
                EntryState::NotLoaded => stats.not_loaded += 1,
                EntryState::Skipped => stats.skipped += 1,
                EntryState::Loaded => stats.loaded += 1,
                EntryState::Initialized => stats.initialized += 1,
            }
        }
        for hold in inner.registry.methods() {
            stats.resolved_methods += hold.live_variants().count();
            stats.precompiled_methods += hold.variants.iter().filter(|v| v.precompiled).count();
            stats.deopted_methods += hold.variants.iter().filter(|v| v.is_deopted).count();
        }
        stats
    }
}

impl fmt::Debug for ClassChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassChain")
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
