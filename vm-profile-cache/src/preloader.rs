//! 回放启动：把解析好的日志装入类解析链

use std::sync::Arc;

use crate::chain::ClassChain;
use crate::format::{CompilationKind, UNKNOWN_INIT_ORDER};
use crate::pattern::ExcludeList;
use crate::reader::ParsedProfile;
use crate::runtime::VmRuntime;
use crate::state::ChainState;

/// 装载统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadSummary {
    pub classes: usize,
    pub methods: usize,
    /// 解析阶段已跳过的损坏记录
    pub corrupted_records: usize,
    pub excluded_slots: usize,
    pub excluded_methods: usize,
    pub duplicate_methods: usize,
    pub out_of_range_methods: usize,
    pub osr_records: usize,
}

/// 链预加载器
pub struct Preloader<'a> {
    excludes: &'a ExcludeList,
}

impl<'a> Preloader<'a> {
    pub fn new(excludes: &'a ExcludeList) -> Self {
        Self { excludes }
    }

    /// 记录中的首次调用序号映射到链槽位
    ///
    /// -1 表示记录时还没有类完成初始化，按字面映射到最后一个槽位。
    fn slot_for(order: i32, len: usize) -> Option<usize> {
        if order == UNKNOWN_INIT_ORDER {
            return len.checked_sub(1);
        }
        usize::try_from(order).ok().filter(|&slot| slot < len)
    }

    /// 建链并转到 Inited
    pub fn build(
        &self,
        profile: &ParsedProfile,
        runtime: Arc<dyn VmRuntime>,
    ) -> (ClassChain, PreloadSummary) {
        let chain = ClassChain::new(&profile.classes, runtime);
        let mut summary = PreloadSummary {
            classes: profile.classes.len(),
            corrupted_records: profile.skipped_records,
            ..Default::default()
        };

        {
            let mut inner = chain.lock();
            let len = inner.len();

            if !self.excludes.is_empty() {
                for (slot, class) in profile.classes.iter().enumerate() {
                    if self.excludes.matches(&class.name) && inner.mark_skipped(slot) {
                        summary.excluded_slots += 1;
                    }
                }
            }

            for record in &profile.methods {
                if record.kind == CompilationKind::Osr {
                    summary.osr_records += 1;
                    continue;
                }
                if self.excludes.matches(&record.class_name) {
                    summary.excluded_methods += 1;
                    continue;
                }
                let Some(slot) = Self::slot_for(record.first_invoke_init_order, len) else {
                    log::warn!(
                        "[JitProfileCache] {}.{}{} has init order {} outside chain of {}",
                        record.class_name,
                        record.method_name,
                        record.signature,
                        record.first_invoke_init_order,
                        len
                    );
                    summary.out_of_range_methods += 1;
                    continue;
                };
                match inner.registry.add_method(record, slot) {
                    Some(id) => {
                        inner.entries[slot].methods.push(id);
                        summary.methods += 1;
                    }
                    None => {
                        log::debug!(
                            "[JitProfileCache] duplicate record {}.{}{} ignored",
                            record.class_name,
                            record.method_name,
                            record.signature
                        );
                        summary.duplicate_methods += 1;
                    }
                }
            }
        }

        chain.try_transition(ChainState::Inited);
        log::info!(
            "[JitProfileCache] chain built: {} classes, {} methods ({} excluded slots, {} dropped records)",
            summary.classes,
            summary.methods,
            summary.excluded_slots,
            summary.corrupted_records
                + summary.excluded_methods
                + summary.duplicate_methods
                + summary.out_of_range_methods
                + summary.osr_records
        );
        (chain, summary)
    }
}
