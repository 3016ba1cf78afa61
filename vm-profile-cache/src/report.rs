//! 文本报告

use std::fmt::Write;

use crate::chain::ChainStatistics;
use crate::format::LogHeader;
use crate::precompile::PrecompileStats;
use crate::reader::ParsedProfile;

/// 头部摘要
pub fn format_header(header: &LogHeader) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== JitProfileCache log ===");
    let _ = writeln!(out, "version:        {}", header.version);
    let _ = writeln!(out, "magic:          {:#010x}", header.magic);
    let _ = writeln!(out, "file size:      {}", header.file_size);
    let _ = writeln!(out, "crc32:          {:#010x}", header.crc32);
    let _ = writeln!(out, "app id:         {}", header.app_id);
    let _ = writeln!(out, "max symbol len: {}", header.max_symbol_len);
    let _ = writeln!(out, "records:        {}", header.record_count);
    let _ = writeln!(out, "timestamp:      {}", header.timestamp);
    out
}

/// 完整日志内容
pub fn format_profile(profile: &ParsedProfile) -> String {
    let mut out = format_header(&profile.header);

    let _ = writeln!(out, "\n--- classes ({}) ---", profile.classes.len());
    for (order, class) in profile.classes.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>6}  {}  loader={}  source={}",
            order, class.name, class.loader_name, class.source_path
        );
    }

    let _ = writeln!(out, "\n--- methods ({}) ---", profile.methods.len());
    for m in &profile.methods {
        let _ = writeln!(
            out,
            "{:>6}  {}.{}{}  init_order={} size={} hash={:#010x} bci={}",
            m.order,
            m.class_name,
            m.method_name,
            m.signature,
            m.first_invoke_init_order,
            m.bytecode_size,
            m.bytecode_hash,
            m.bci
        );
        let _ = writeln!(
            out,
            "        class size={} crc32={:#010x}  invocations={} throwouts={} invocation_counter={} backedge_counter={}",
            m.class_size,
            m.class_crc32,
            m.counters.interpreter_invocation_count,
            m.counters.interpreter_throwout_count,
            m.counters.invocation_counter,
            m.counters.backedge_counter
        );
    }
    if profile.skipped_records > 0 {
        let _ = writeln!(out, "\n{} corrupted records skipped", profile.skipped_records);
    }
    out
}

pub fn format_chain_statistics(stats: &ChainStatistics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== JitProfileCache chain ===");
    if let Some(state) = stats.state {
        let _ = writeln!(out, "state:          {}", state);
    }
    let _ = writeln!(out, "length:         {}", stats.length);
    let _ = writeln!(out, "loaded index:   {}", stats.loaded_index);
    let _ = writeln!(out, "inited index:   {}", stats.inited_index);
    let _ = writeln!(
        out,
        "slots:          {} not loaded, {} skipped, {} loaded, {} initialized",
        stats.not_loaded, stats.skipped, stats.loaded, stats.initialized
    );
    let _ = writeln!(
        out,
        "holders:        {} classes, {} methods, {} classes outside the chain",
        stats.class_holders, stats.method_holds, stats.unslotted_classes
    );
    let _ = writeln!(
        out,
        "methods:        {} resolved, {} precompiled, {} deoptimized",
        stats.resolved_methods, stats.precompiled_methods, stats.deopted_methods
    );
    out
}

pub fn format_precompile_stats(stats: &PrecompileStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== last precompilation ===");
    let _ = writeln!(
        out,
        "slots:          {} visited, {} skipped, {} classes initialized",
        stats.slots_visited, stats.slots_skipped, stats.classes_initialized
    );
    let _ = writeln!(
        out,
        "submissions:    {} accepted, {} rejected, {} failed",
        stats.submitted, stats.rejected, stats.failed
    );
    let _ = writeln!(
        out,
        "not submitted:  {} already compiled, {} not compilable, {} holder not initialized",
        stats.already_compiled, stats.not_compilable, stats.holder_not_initialized
    );
    if let Some(slot) = stats.stopped_at {
        let _ = writeln!(out, "stopped at slot {}", slot);
    }
    if let Some(barrier) = stats.barrier {
        let _ = writeln!(out, "barrier compile id: {}", barrier.compile_id);
    }
    out
}
