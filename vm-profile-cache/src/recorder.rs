//! 记录模式
//!
//! 类初始化事件按顺序编号追加到类表，方法首次调用时拍下 profile 快照。
//! 触发 flush 后记录关闭，之后的事件全部忽略。
//! 任一符号超过日志允许的最大长度的类或方法不记录。

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::format::{
    ClassRecord, CompilationKind, LogHeader, MethodRecord, ProfileLogWriter,
    MAX_SYMBOL_LENGTH_CEILING, UNKNOWN_INIT_ORDER,
};
use crate::pattern::ExcludeList;
use crate::runtime::{ClassDescriptor, ClassId, MethodEvent, MethodId};

fn has_oversized_symbol(symbols: &[&str]) -> bool {
    symbols
        .iter()
        .any(|s| s.len() > MAX_SYMBOL_LENGTH_CEILING as usize)
}

#[derive(Debug, Default)]
struct ClassTable {
    records: Vec<ClassRecord>,
    orders: HashMap<ClassId, u32>,
}

#[derive(Debug, Default)]
struct MethodTable {
    index: HashMap<MethodId, usize>,
    records: Vec<MethodRecord>,
}

/// profile 记录器
#[derive(Debug)]
pub struct ProfileRecorder {
    path: PathBuf,
    app_id: u32,
    excludes: ExcludeList,
    classes: Mutex<ClassTable>,
    methods: Mutex<MethodTable>,
    flushed: AtomicBool,
}

impl ProfileRecorder {
    pub fn new(path: impl Into<PathBuf>, app_id: u32, excludes: ExcludeList) -> Self {
        Self {
            path: path.into(),
            app_id,
            excludes,
            classes: Mutex::new(ClassTable::default()),
            methods: Mutex::new(MethodTable::default()),
            flushed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }

    pub fn class_count(&self) -> usize {
        self.classes.lock().records.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.lock().records.len()
    }

    /// 类初始化事件，返回分配的初始化序号
    ///
    /// 匿名类不编号；同一个类重复通知返回已有序号。
    pub fn on_class_initialized(&self, class: &ClassDescriptor) -> Option<u32> {
        if self.is_flushed() || class.anonymous || class.identity.name.is_empty() {
            return None;
        }
        let identity = &class.identity;
        if has_oversized_symbol(&[
            identity.name.as_str(),
            identity.loader_name.as_str(),
            identity.source_path.as_str(),
        ]) {
            log::warn!(
                "[JitProfileCache] {} has a symbol longer than {} bytes, not recorded",
                class.id,
                MAX_SYMBOL_LENGTH_CEILING
            );
            return None;
        }
        let mut table = self.classes.lock();
        if let Some(&order) = table.orders.get(&class.id) {
            return Some(order);
        }
        let order = table.records.len() as u32;
        table.records.push(ClassRecord {
            name: class.identity.name.clone(),
            loader_name: class.identity.loader_name.clone(),
            source_path: class.identity.source_path.clone(),
        });
        table.orders.insert(class.id, order);
        Some(order)
    }

    /// 类的初始化序号
    pub fn init_order(&self, class: ClassId) -> Option<u32> {
        self.classes.lock().orders.get(&class).copied()
    }

    /// 最后一个完成初始化的类序号
    fn last_init_order(&self) -> i32 {
        let table = self.classes.lock();
        match table.records.len() {
            0 => UNKNOWN_INIT_ORDER,
            n => (n - 1) as i32,
        }
    }

    /// 方法调用事件，新记录一条时返回 `true`
    pub fn on_method_invoked(&self, event: &MethodEvent) -> bool {
        if self.is_flushed() || event.is_osr() {
            return false;
        }
        if self.excludes.matches(&event.holder.name) {
            return false;
        }
        let holder = &event.holder;
        if has_oversized_symbol(&[
            event.method.name.as_str(),
            event.method.signature.as_str(),
            holder.name.as_str(),
            holder.loader_name.as_str(),
            holder.source_path.as_str(),
        ]) {
            log::warn!(
                "[JitProfileCache] {} has a symbol longer than {} bytes, not recorded",
                event.method.id,
                MAX_SYMBOL_LENGTH_CEILING
            );
            return false;
        }
        if self.methods.lock().index.contains_key(&event.method.id) {
            return false;
        }

        let first_invoke_init_order = self.last_init_order();
        let mut table = self.methods.lock();
        // 释放锁期间可能被其他线程记录
        if table.index.contains_key(&event.method.id) || self.is_flushed() {
            return false;
        }
        let order = table.records.len();
        table.records.push(MethodRecord {
            order: order as u32,
            kind: CompilationKind::Method,
            method_name: event.method.name.clone(),
            signature: event.method.signature.clone(),
            first_invoke_init_order,
            bytecode_size: event.method.bytecode_size,
            bytecode_hash: event.method.bytecode_hash,
            bci: event.bci,
            class_name: holder.name.clone(),
            class_loader: holder.loader_name.clone(),
            class_path: holder.source_path.clone(),
            class_size: holder.byte_size,
            class_crc32: holder.crc32,
            class_hash: holder.identity_hash(),
            counters: event.counters,
        });
        table.index.insert(event.method.id, order);
        log::trace!(
            "[JitProfileCache] recorded {}.{}{} at init order {}",
            holder.name,
            event.method.name,
            event.method.signature,
            first_invoke_init_order
        );
        true
    }

    /// 写入任意可定位的输出，关闭记录
    pub fn flush_to<W: Write + Seek>(&self, writer: W) -> io::Result<(W, LogHeader)> {
        self.flushed.store(true, Ordering::Release);
        let classes = self.classes.lock();
        let methods = self.methods.lock();

        let mut out = ProfileLogWriter::new(writer, self.app_id)?;
        out.write_classes(&classes.records)?;
        for record in &methods.records {
            out.write_method(record)?;
        }
        out.finish()
    }

    /// 写入配置的文件；已经 flush 过时返回 `None`
    pub fn flush(&self) -> Result<Option<LogHeader>> {
        if self.flushed.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        let file = File::create(&self.path)?;
        let (writer, header) = self.flush_to(BufWriter::new(file))?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        log::info!(
            "[JitProfileCache] profile flushed to {}: {} classes, {} methods, {} bytes",
            self.path.display(),
            self.class_count(),
            header.record_count,
            header.file_size
        );
        Ok(Some(header))
    }

    /// 启动一次性的延迟 flush 线程
    pub fn spawn_delayed_flush(self: &Arc<Self>, delay: Duration) -> io::Result<JoinHandle<()>> {
        let recorder = Arc::clone(self);
        std::thread::Builder::new()
            .name("jit-profile-flush".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                if let Err(e) = recorder.flush() {
                    log::error!(
                        "[JitProfileCache] failed to write {}: {}",
                        recorder.path.display(),
                        e
                    );
                }
            })
    }
}
