//! JitProfileCache 日志解析
//!
//! 头部和类段出错时整个文件被拒绝；单条方法记录出错时游标被钳到该记录声明的末尾，
//! 记录被跳过，继续解析下一条。

use std::path::Path;

use crate::error::{ParseError, ProfileCacheError};
use crate::format::{
    body_crc32, ClassRecord, CompilationKind, LogHeader, MethodRecord, HEADER_SIZE,
    MAX_SYMBOL_LENGTH_CEILING, METHOD_RECORD_MAGIC, PROFILE_MAGIC, PROFILE_VERSION,
};
use crate::runtime::ProfileCounters;

/// 解析结果
#[derive(Debug, Clone)]
pub struct ParsedProfile {
    pub header: LogHeader,
    /// 按记录时初始化顺序排列
    pub classes: Vec<ClassRecord>,
    pub methods: Vec<MethodRecord>,
    /// 因损坏被跳过的方法记录数
    pub skipped_records: usize,
}

/// 校验头部
///
/// `expected_app_id` 为 0 时不检查 app id。
pub fn validate_header(bytes: &[u8], expected_app_id: u32) -> Result<LogHeader, ParseError> {
    let header = LogHeader::decode(bytes)?;
    if header.magic != PROFILE_MAGIC {
        return Err(ParseError::BadMagic { found: header.magic });
    }
    if header.version != PROFILE_VERSION {
        return Err(ParseError::VersionMismatch {
            expected: PROFILE_VERSION,
            found: header.version,
        });
    }
    if header.file_size as usize != bytes.len() {
        return Err(ParseError::FileSizeMismatch {
            declared: header.file_size,
            actual: bytes.len(),
        });
    }
    if header.max_symbol_len > MAX_SYMBOL_LENGTH_CEILING {
        return Err(ParseError::SymbolLengthTooLarge {
            declared: header.max_symbol_len,
            ceiling: MAX_SYMBOL_LENGTH_CEILING,
        });
    }
    let computed = body_crc32(&bytes[HEADER_SIZE..]);
    if computed != header.crc32 {
        return Err(ParseError::CrcMismatch {
            declared: header.crc32,
            computed,
        });
    }
    if expected_app_id != 0 && header.app_id != expected_app_id {
        return Err(ParseError::AppIdMismatch {
            expected: expected_app_id,
            found: header.app_id,
        });
    }
    Ok(header)
}

/// 有界日志读取器
pub struct ProfileLogReader<'a> {
    data: &'a [u8],
    pos: usize,
    /// 当前段的声明末尾
    limit: usize,
    max_symbol_len: usize,
    /// 字符串读取缓冲，容量按头部声明的最大符号长度分配
    scratch: Vec<u8>,
}

impl<'a> ProfileLogReader<'a> {
    fn new(data: &'a [u8], max_symbol_len: u32) -> Self {
        Self {
            data,
            pos: HEADER_SIZE,
            limit: data.len(),
            max_symbol_len: max_symbol_len as usize,
            scratch: Vec::with_capacity(max_symbol_len as usize + 1),
        }
    }

    /// 解析整个文件
    pub fn parse(bytes: &'a [u8], expected_app_id: u32) -> Result<ParsedProfile, ParseError> {
        let header = validate_header(bytes, expected_app_id)?;
        let mut reader = Self::new(bytes, header.max_symbol_len);

        let classes = reader.section("class section", |r| r.read_class_table())?;

        let mut methods = Vec::new();
        let mut skipped_records = 0;
        while reader.pos < bytes.len() {
            let start = reader.pos;
            if bytes.len() - start < 4 {
                log::warn!(
                    "[JitProfileCache] trailing {} bytes after last record ignored",
                    bytes.len() - start
                );
                skipped_records += 1;
                break;
            }
            match reader.section("method record", |r| r.read_method_record()) {
                Ok(record) => methods.push(record),
                Err(e) => {
                    log::warn!("[JitProfileCache] skip corrupted method record at {}: {}", start, e);
                    skipped_records += 1;
                }
            }
        }

        if methods.len() + skipped_records != header.record_count as usize {
            log::warn!(
                "[JitProfileCache] header declares {} records, found {} (+{} skipped)",
                header.record_count,
                methods.len(),
                skipped_records
            );
        }

        Ok(ParsedProfile {
            header,
            classes,
            methods,
            skipped_records,
        })
    }

    /// 读取文件并解析
    pub fn parse_file<P: AsRef<Path>>(
        path: P,
        expected_app_id: u32,
    ) -> Result<ParsedProfile, ProfileCacheError> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(ProfileLogReader::parse(&bytes, expected_app_id)?)
    }

    /// 解析一个带长度前缀的段
    ///
    /// 无论成功与否，返回时游标都位于段的声明末尾。
    fn section<T>(
        &mut self,
        what: &'static str,
        parse: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        let start = self.pos;
        self.limit = self.data.len();
        let size = self.read_u32(what)? as usize;
        let declared_end = match start.checked_add(size) {
            Some(end) if size >= 4 && end <= self.data.len() => end,
            _ => {
                // 长度本身越界，之后的内容无法再定位
                self.pos = self.data.len();
                return Err(ParseError::Truncated { what, offset: start });
            }
        };

        self.limit = declared_end;
        let result = parse(self).and_then(|value| {
            if self.pos != declared_end {
                Err(ParseError::SectionSizeMismatch {
                    what,
                    declared_end,
                    parsed_end: self.pos,
                })
            } else {
                Ok(value)
            }
        });
        self.pos = declared_end;
        self.limit = self.data.len();
        result
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
        if self.pos + n > self.limit {
            return Err(ParseError::Truncated {
                what,
                offset: self.pos,
            });
        }
        let data: &'a [u8] = self.data;
        let bytes = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, ParseError> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, ParseError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&mut self, what: &'static str) -> Result<i32, ParseError> {
        Ok(self.read_u32(what)? as i32)
    }

    /// 读取以 NUL 结尾的字符串，长度不超过头部声明的最大符号长度
    fn read_cstr(&mut self, allow_empty: bool) -> Result<String, ParseError> {
        let start = self.pos;
        let window_end = self.limit.min(start + self.max_symbol_len + 1);
        let nul = self.data[start..window_end]
            .iter()
            .position(|&b| b == 0)
            .ok_or(ParseError::IllegalString {
                offset: start,
                reason: "missing terminator or longer than max symbol length",
            })?;
        if nul == 0 && !allow_empty {
            return Err(ParseError::IllegalString {
                offset: start,
                reason: "empty name",
            });
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(&self.data[start..start + nul]);
        self.pos = start + nul + 1;
        std::str::from_utf8(&self.scratch)
            .map(str::to_string)
            .map_err(|_| ParseError::IllegalString {
                offset: start,
                reason: "invalid UTF-8",
            })
    }

    fn read_class_table(&mut self) -> Result<Vec<ClassRecord>, ParseError> {
        let count = self.read_u32("class count")? as usize;
        // 每个类至少 3 字节，防止恶意计数导致超大分配
        let mut classes = Vec::with_capacity(count.min((self.limit - self.pos) / 3));
        for _ in 0..count {
            let name = self.read_cstr(false)?;
            let loader_name = self.read_cstr(true)?;
            let source_path = self.read_cstr(true)?;
            classes.push(ClassRecord {
                name,
                loader_name,
                source_path,
            });
        }
        Ok(classes)
    }

    fn read_method_record(&mut self) -> Result<MethodRecord, ParseError> {
        let magic_offset = self.pos;
        let magic = self.read_u32("record magic")?;
        if magic != METHOD_RECORD_MAGIC {
            return Err(ParseError::BadRecordMagic {
                found: magic,
                offset: magic_offset,
            });
        }
        let order = self.read_u32("record order")?;
        let kind = CompilationKind::try_from(self.read_u8("compilation kind")?)?;
        let method_name = self.read_cstr(false)?;
        let signature = self.read_cstr(false)?;
        let first_invoke_init_order = self.read_i32("first invoke init order")?;
        let bytecode_size = self.read_u32("bytecode size")?;
        let bytecode_hash = self.read_u32("bytecode hash")?;
        let bci = self.read_i32("bci")?;
        let class_name = self.read_cstr(false)?;
        let class_loader = self.read_cstr(true)?;
        let class_path = self.read_cstr(true)?;
        let class_size = self.read_u32("class size")?;
        let class_crc32 = self.read_u32("class crc32")?;
        let class_hash = self.read_u32("class hash")?;
        let counters = ProfileCounters {
            interpreter_invocation_count: self.read_u32("counters")?,
            interpreter_throwout_count: self.read_u32("counters")?,
            invocation_counter: self.read_u32("counters")?,
            backedge_counter: self.read_u32("counters")?,
        };

        Ok(MethodRecord {
            order,
            kind,
            method_name,
            signature,
            first_invoke_init_order,
            bytecode_size,
            bytecode_hash,
            bci,
            class_name,
            class_loader,
            class_path,
            class_size,
            class_crc32,
            class_hash,
            counters,
        })
    }
}
