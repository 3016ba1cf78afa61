//! # vm-profile-cache - JIT profile 预编译缓存
//!
//! 上一次运行记录下热点方法和类初始化顺序，写成二进制日志；下一次运行回放日志，
//! 在解释器自然预热之前就把这些方法提交给优化编译器，稳态编译追上之后再把它们去优化。
//!
//! ## 架构
//!
//! ```text
//! 记录:  class init / method invoke -> ProfileRecorder -> ProfileLogWriter -> 文件
//! 回放:  文件 -> ProfileLogReader -> Preloader -> ClassChain + HolderRegistry
//!            类加载回调 -> mark_loaded_class
//!            启动完成   -> PrecompilationDriver
//!            safepoint  -> DeoptimizationDriver
//! ```
//!
//! ## 主要组件
//!
//! - [`JitProfileCache`]: 进程级上下文，接收 VM 事件，提供管理命令
//! - [`ClassChain`]: 按记录的初始化顺序排列的类解析链
//! - [`HolderRegistry`]: 记录的类体和方法 profile
//! - [`PrecompilationDriver`] / [`DeoptimizationDriver`]: 预编译和去优化
//! - [`ProfileRecorder`]: 记录模式
//! - [`VmRuntime`]: 宿主 VM 能力接口，缓存只持有句柄，不持有 VM 对象
//!
//! ## 示例
//!
//! ```rust,ignore
//! use vm_profile_cache::{JitProfileCache, ProfileCacheConfig, VmFlags};
//!
//! let config = ProfileCacheConfig::from_file("profile_cache.toml")?;
//! let cache = JitProfileCache::new(config, &VmFlags::default(), runtime)?;
//! cache.on_class_loaded(&class);
//! cache.on_vm_booted()?;
//! ```

pub mod cache;
pub mod chain;
pub mod config;
pub mod deopt;
pub mod error;
pub mod format;
pub mod holder;
pub mod pattern;
pub mod precompile;
pub mod preloader;
pub mod reader;
pub mod recorder;
pub mod report;
pub mod runtime;
pub mod state;

pub use cache::JitProfileCache;
pub use chain::{ChainStatistics, ClassChain, ClassChainEntry, EntryState, LoadOutcome};
pub use config::{CacheMode, DeoptTrigger, ProfileCacheConfig, VmFlags};
pub use deopt::{DeoptBatch, DeoptOutcome, DeoptPolicy, DeoptSkip, DeoptimizationDriver};
pub use error::{ConfigError, ParseError, ProfileCacheError, Result};
pub use format::{ClassRecord, LogHeader, MethodRecord, ProfileLogWriter};
pub use holder::{ClassHolder, HolderRegistry, MethodHold, ResolvedMethod};
pub use pattern::ExcludeList;
pub use precompile::{BarrierMethod, PrecompilationDriver, PrecompileStats};
pub use preloader::{PreloadSummary, Preloader};
pub use reader::{ParsedProfile, ProfileLogReader};
pub use recorder::ProfileRecorder;
pub use runtime::{
    ClassDescriptor, ClassId, ClassIdentity, ClassStatus, CompLevel, CompiledCode,
    KeepAliveHandle, MethodDescriptor, MethodEvent, MethodId, ProfileCounters, VmRuntime,
};
pub use state::{ChainState, Transition};
