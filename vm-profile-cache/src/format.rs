//! JitProfileCache 日志二进制格式
//!
//! ```text
//! +--------------------------- 36 字节头部 ---------------------------+
//! | version:u32 | magic:u32 | file_size:u32 | crc32:u32 | app_id:u32  |
//! | max_symbol_len:u32 | record_count:u32 | timestamp:u64             |
//! +-------------------------------------------------------------------+
//! | 类段:   [size:u32][class_count:u32]{name\0 loader\0 path\0}*       |
//! | 方法记录: [size:u32][magic:u32][order:u32][kind:u8]                 |
//! |          name\0 signature\0 [first_init:i32][bc_size:u32]          |
//! |          [bc_hash:u32][bci:i32] class\0 loader\0 path\0            |
//! |          [class_size:u32][class_crc32:u32][class_hash:u32]         |
//! |          [counters: 4 x u32]                                       |
//! +-------------------------------------------------------------------+
//! ```
//!
//! 所有整数为小端序。段长度包含自身的 4 字节前缀。`crc32` 覆盖头部之后的全部字节。
//! 写入采用两遍：先写占位头部和正文，最后回到开头补写大小、校验和、最大符号长度。

use std::io::{self, Seek, SeekFrom, Write};

use flate2::CrcWriter;

use crate::error::ParseError;
use crate::runtime::ProfileCounters;

/// 日志魔数 ("JPC\x01")
pub const PROFILE_MAGIC: u32 = 0x4A50_4301;

/// 日志版本，必须与当前 VM 完全一致
pub const PROFILE_VERSION: u32 = 1;

/// 方法记录魔数
pub const METHOD_RECORD_MAGIC: u32 = 0x4D52_4543;

/// 固定头部长度
pub const HEADER_SIZE: usize = 36;

/// 头部声明的最大符号长度的硬上限
pub const MAX_SYMBOL_LENGTH_CEILING: u32 = u16::MAX as u32;

/// 记录文件中 first_invoke_init_order 的哨兵值
pub const UNKNOWN_INIT_ORDER: i32 = -1;

/// 日志头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub version: u32,
    pub magic: u32,
    /// 文件总大小（含头部）
    pub file_size: u32,
    /// 正文 CRC32
    pub crc32: u32,
    pub app_id: u32,
    /// 正文中最长字符串的字节数
    pub max_symbol_len: u32,
    /// 方法记录条数
    pub record_count: u32,
    /// 记录时间（Unix 秒）
    pub timestamp: u64,
}

impl LogHeader {
    /// 创建占位头部，大小和校验和在写完正文后回填
    pub fn new(app_id: u32) -> Self {
        Self {
            version: PROFILE_VERSION,
            magic: PROFILE_MAGIC,
            file_size: 0,
            crc32: 0,
            app_id,
            max_symbol_len: 0,
            record_count: 0,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    /// 序列化头部
    pub fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.magic.to_le_bytes())?;
        writer.write_all(&self.file_size.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&self.app_id.to_le_bytes())?;
        writer.write_all(&self.max_symbol_len.to_le_bytes())?;
        writer.write_all(&self.record_count.to_le_bytes())?;
        writer.write_all(&self.timestamp.to_le_bytes())?;
        Ok(())
    }

    /// 从文件开头的 36 字节解码，不做任何校验
    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ParseError::TooShort {
                len: bytes.len(),
                needed: HEADER_SIZE,
            });
        }
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[28..36]);

        Ok(Self {
            version: u32_at(0),
            magic: u32_at(4),
            file_size: u32_at(8),
            crc32: u32_at(12),
            app_id: u32_at(16),
            max_symbol_len: u32_at(20),
            record_count: u32_at(24),
            timestamp: u64::from_le_bytes(ts),
        })
    }
}

/// 编译类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationKind {
    /// 整方法编译
    Method = 0,
    /// 栈上替换
    Osr = 1,
}

impl TryFrom<u8> for CompilationKind {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompilationKind::Method),
            1 => Ok(CompilationKind::Osr),
            other => Err(ParseError::UnknownCompilationKind(other)),
        }
    }
}

/// 类表条目，下标即记录时的初始化顺序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRecord {
    pub name: String,
    pub loader_name: String,
    pub source_path: String,
}

/// 方法记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRecord {
    /// 在记录文件中的序号
    pub order: u32,
    pub kind: CompilationKind,
    pub method_name: String,
    pub signature: String,
    /// 首次调用时最后一个完成初始化的类序号，未知为 -1
    pub first_invoke_init_order: i32,
    pub bytecode_size: u32,
    pub bytecode_hash: u32,
    pub bci: i32,
    pub class_name: String,
    pub class_loader: String,
    pub class_path: String,
    pub class_size: u32,
    pub class_crc32: u32,
    pub class_hash: u32,
    pub counters: ProfileCounters,
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

impl MethodRecord {
    /// 编码为不含长度前缀的记录体
    fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&METHOD_RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.order.to_le_bytes());
        buf.push(self.kind as u8);
        put_cstr(&mut buf, &self.method_name);
        put_cstr(&mut buf, &self.signature);
        buf.extend_from_slice(&self.first_invoke_init_order.to_le_bytes());
        buf.extend_from_slice(&self.bytecode_size.to_le_bytes());
        buf.extend_from_slice(&self.bytecode_hash.to_le_bytes());
        buf.extend_from_slice(&self.bci.to_le_bytes());
        put_cstr(&mut buf, &self.class_name);
        put_cstr(&mut buf, &self.class_loader);
        put_cstr(&mut buf, &self.class_path);
        buf.extend_from_slice(&self.class_size.to_le_bytes());
        buf.extend_from_slice(&self.class_crc32.to_le_bytes());
        buf.extend_from_slice(&self.class_hash.to_le_bytes());
        buf.extend_from_slice(&self.counters.interpreter_invocation_count.to_le_bytes());
        buf.extend_from_slice(&self.counters.interpreter_throwout_count.to_le_bytes());
        buf.extend_from_slice(&self.counters.invocation_counter.to_le_bytes());
        buf.extend_from_slice(&self.counters.backedge_counter.to_le_bytes());
        buf
    }

    fn longest_symbol(&self) -> usize {
        [
            &self.method_name,
            &self.signature,
            &self.class_name,
            &self.class_loader,
            &self.class_path,
        ]
        .iter()
        .map(|s| s.len())
        .max()
        .unwrap_or(0)
    }
}

/// 两遍式日志写入器
///
/// 正文经 [`CrcWriter`] 写出，`finish` 时回到起始位置补写头部。
pub struct ProfileLogWriter<W: Write + Seek> {
    inner: CrcWriter<W>,
    header: LogHeader,
    start: u64,
    body_len: u64,
    classes_written: bool,
}

impl<W: Write + Seek> ProfileLogWriter<W> {
    /// 写入占位头部
    pub fn new(mut writer: W, app_id: u32) -> io::Result<Self> {
        let start = writer.stream_position()?;
        let header = LogHeader::new(app_id);
        header.serialize(&mut writer)?;
        Ok(Self {
            inner: CrcWriter::new(writer),
            header,
            start,
            body_len: 0,
            classes_written: false,
        })
    }

    fn note_symbol(&mut self, len: usize) {
        self.header.max_symbol_len = self.header.max_symbol_len.max(len as u32);
    }

    fn write_section(&mut self, body: &[u8]) -> io::Result<()> {
        let size = u32::try_from(body.len() + 4)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "section too large"))?;
        self.inner.write_all(&size.to_le_bytes())?;
        self.inner.write_all(body)?;
        self.body_len += size as u64;
        Ok(())
    }

    /// 写类段，必须在任何方法记录之前调用且只能调用一次
    pub fn write_classes(&mut self, classes: &[ClassRecord]) -> io::Result<()> {
        if self.classes_written {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "class section already written",
            ));
        }
        let mut body = Vec::with_capacity(classes.len() * 48 + 4);
        body.extend_from_slice(&(classes.len() as u32).to_le_bytes());
        for class in classes {
            put_cstr(&mut body, &class.name);
            put_cstr(&mut body, &class.loader_name);
            put_cstr(&mut body, &class.source_path);
            let longest = class
                .name
                .len()
                .max(class.loader_name.len())
                .max(class.source_path.len());
            self.note_symbol(longest);
        }
        self.write_section(&body)?;
        self.classes_written = true;
        Ok(())
    }

    /// 追加一条方法记录
    pub fn write_method(&mut self, record: &MethodRecord) -> io::Result<()> {
        if !self.classes_written {
            self.write_classes(&[])?;
        }
        self.note_symbol(record.longest_symbol());
        let body = record.encode_body();
        self.write_section(&body)?;
        self.header.record_count += 1;
        Ok(())
    }

    /// 回填头部并返回底层写入器
    pub fn finish(mut self) -> io::Result<(W, LogHeader)> {
        if !self.classes_written {
            self.write_classes(&[])?;
        }
        self.inner.flush()?;
        let total = HEADER_SIZE as u64 + self.body_len;
        self.header.file_size = u32::try_from(total)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "profile log too large"))?;
        self.header.crc32 = self.inner.crc().sum();

        let header = self.header;
        let mut writer = self.inner.into_inner();
        writer.seek(SeekFrom::Start(self.start))?;
        header.serialize(&mut writer)?;
        writer.seek(SeekFrom::Start(self.start + total))?;
        writer.flush()?;
        Ok((writer, header))
    }
}

/// 计算正文 CRC32
pub fn body_crc32(body: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(body);
    crc.sum()
}
