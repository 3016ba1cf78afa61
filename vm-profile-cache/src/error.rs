//! JitProfileCache 错误类型
//!
//! 错误分三层：
//! - [`ParseError`]: 日志文件损坏或版本不匹配
//! - [`ConfigError`]: 启动时的致命配置错误
//! - [`ProfileCacheError`]: 对外统一错误类型

use thiserror::Error;

/// 日志文件解析错误
///
/// 头部和类表上的错误会导致整个文件被拒绝；单条方法记录上的错误只跳过该记录。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// 文件比固定头部还短
    #[error("profile log too short: {len} bytes, header needs {needed}")]
    TooShort { len: usize, needed: usize },

    /// 魔数不匹配
    #[error("bad magic number: {found:#x}")]
    BadMagic { found: u32 },

    /// 版本号不一致（不做前后兼容）
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// 头部声明的文件大小与实际长度不一致
    #[error("file size mismatch: header declares {declared}, actual {actual}")]
    FileSizeMismatch { declared: u32, actual: usize },

    /// 文件体 CRC32 校验失败
    #[error("crc32 mismatch: header {declared:#010x}, computed {computed:#010x}")]
    CrcMismatch { declared: u32, computed: u32 },

    /// app id 与当前配置不一致
    #[error("app id mismatch: expected {expected}, found {found}")]
    AppIdMismatch { expected: u32, found: u32 },

    /// 头部声明的最大符号长度超过硬上限
    #[error("max symbol length {declared} exceeds ceiling {ceiling}")]
    SymbolLengthTooLarge { declared: u32, ceiling: u32 },

    /// 段或记录在声明的末尾之前就读完了
    #[error("truncated {what} at offset {offset}")]
    Truncated { what: &'static str, offset: usize },

    /// 非法字符串（超长、缺少结束符、非 UTF-8 或空名字）
    #[error("illegal string at offset {offset}: {reason}")]
    IllegalString { offset: usize, reason: &'static str },

    /// 段长度与实际解析位置不一致
    #[error("{what} size mismatch: declared end {declared_end}, parsed to {parsed_end}")]
    SectionSizeMismatch {
        what: &'static str,
        declared_end: usize,
        parsed_end: usize,
    },

    /// 方法记录魔数错误
    #[error("bad record magic {found:#x} at offset {offset}")]
    BadRecordMagic { found: u32, offset: usize },

    /// 未知的编译类型字节
    #[error("unknown compilation kind {0}")]
    UnknownCompilationKind(u8),
}

/// 启动时的致命配置错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// 同时启用记录和回放
    #[error("recording and replay cannot be enabled at the same time")]
    ConflictingModes,

    /// 回放模式下缺少日志文件
    #[error("profile log file not found: {0}")]
    MissingProfile(String),

    /// 数值配置越界
    #[error("invalid value for {name}: {value} (allowed {min}..={max})")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    /// 记录模式与类卸载不兼容
    #[error("recording requires class unloading to be disabled")]
    ClassUnloadingEnabled,

    /// 纯解释执行模式下无法使用
    #[error("JitProfileCache cannot be used in interpreter-only mode")]
    InterpreterOnly,

    /// 配置文件解析失败
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// JitProfileCache 统一错误类型
#[derive(Error, Debug)]
pub enum ProfileCacheError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("profile log rejected: {0}")]
    Parse(#[from] ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 预编译过程中类初始化抛出异常
    #[error("class initialization failed for {class}: {message}")]
    ClassInit { class: String, message: String },

    /// 预编译结束标记方法不可用
    #[error("barrier method unavailable: {0}")]
    Barrier(String),

    /// 当前链状态不允许该操作
    #[error("operation not allowed in chain state {0}")]
    InvalidState(crate::state::ChainState),
}

pub type Result<T> = std::result::Result<T, ProfileCacheError>;
