//! 宿主虚拟机协作接口
//!
//! JitProfileCache 不拥有类、方法或编译产物，这些对象的生命周期由宿主 VM 的
//! 类加载器和 GC 决定。这里用不透明句柄 + 查询接口代替裸指针：
//! 缓存只保存 [`ClassId`] / [`MethodId`]，每次使用前通过 [`VmRuntime`] 询问存活性和状态。

use std::fmt;

use thiserror::Error;

/// 类句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u64);

/// 方法句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

/// 类加载器保活句柄
///
/// 首次解析时获取，卸载或去优化完成时显式释放。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeepAliveHandle(pub u64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// 方法入口 bci（整方法编译，非 OSR）
pub const INVOCATION_ENTRY_BCI: i32 = -1;

/// 编译层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompLevel {
    /// 解释执行
    Interpreter = 0,
    /// 带少量 profiling 的基线编译
    Baseline = 1,
    /// 完全 profiling 的基线编译
    FullProfile = 3,
    /// 优化编译
    FullOptimization = 4,
}

/// 类的初始化状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassStatus {
    /// 已加载但尚未初始化
    Loaded,
    /// 正在被某个线程初始化
    BeingInitialized,
    /// 初始化完成
    Initialized,
    /// 初始化失败
    InitializationError,
}

/// 当前已安装的编译产物
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledCode {
    /// 全局递增的编译 id
    pub compile_id: u32,
    /// 编译层级
    pub level: CompLevel,
}

/// 解释器/编译器计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileCounters {
    pub interpreter_invocation_count: u32,
    pub interpreter_throwout_count: u32,
    pub invocation_counter: u32,
    pub backedge_counter: u32,
}

/// 类的身份信息：名字、加载器名、来源路径，以及类文件的大小和 CRC32
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassIdentity {
    pub name: String,
    pub loader_name: String,
    pub source_path: String,
    pub byte_size: u32,
    pub crc32: u32,
}

impl ClassIdentity {
    pub fn new(
        name: impl Into<String>,
        loader_name: impl Into<String>,
        source_path: impl Into<String>,
        byte_size: u32,
        crc32: u32,
    ) -> Self {
        Self {
            name: name.into(),
            loader_name: loader_name.into(),
            source_path: source_path.into(),
            byte_size,
            crc32,
        }
    }

    /// 按 name/loader/path 计算的稳定身份哈希，与记录文件中的 class hash 一致
    pub fn identity_hash(&self) -> u32 {
        identity_hash(&self.name, &self.loader_name, &self.source_path)
    }
}

/// 计算类身份哈希
///
/// 跨进程必须稳定，因此不能用 `std` 的随机化哈希。
pub fn identity_hash(name: &str, loader_name: &str, source_path: &str) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(name.as_bytes());
    crc.update(&[0]);
    crc.update(loader_name.as_bytes());
    crc.update(&[0]);
    crc.update(source_path.as_bytes());
    crc.sum()
}

/// 方法描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub id: MethodId,
    pub name: String,
    pub signature: String,
    pub bytecode_size: u32,
    pub bytecode_hash: u32,
}

/// 类加载/初始化事件携带的类描述
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub id: ClassId,
    pub identity: ClassIdentity,
    /// 匿名类/隐藏类不参与记录
    pub anonymous: bool,
    pub methods: Vec<MethodDescriptor>,
}

/// 方法调用/编译触发事件
#[derive(Debug, Clone)]
pub struct MethodEvent {
    pub method: MethodDescriptor,
    pub holder: ClassIdentity,
    pub counters: ProfileCounters,
    /// OSR 入口时为循环头 bci，整方法调用为 [`INVOCATION_ENTRY_BCI`]
    pub bci: i32,
}

impl MethodEvent {
    pub fn is_osr(&self) -> bool {
        self.bci != INVOCATION_ENTRY_BCI
    }
}

/// 类初始化器抛出的异常
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{exception}")]
pub struct InitError {
    pub exception: String,
}

/// 编译提交失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CompileError(pub String);

/// 宿主虚拟机能力
///
/// 所有方法都可能被多个线程同时调用。标注 "safepoint" 的方法只会在全局安全点内被调用。
pub trait VmRuntime: Send + Sync {
    // ---- 类加载 ----

    /// 按全限定名解析类，失败返回 `None`
    fn resolve_or_fail(&self, qualified_name: &str) -> Option<ClassId>;

    /// 执行类初始化器；可能阻塞等待其他线程完成初始化
    fn initialize(&self, class: ClassId) -> Result<(), InitError>;

    fn class_status(&self, class: ClassId) -> ClassStatus;

    /// 类是否被重定义过
    fn is_redefined(&self, class: ClassId) -> bool;

    /// 当前线程是否正在解析父类（此时重复加载属于预期行为）
    fn is_resolving_superclass(&self) -> bool;

    /// 在类中查找方法
    fn find_method(&self, class: ClassId, name: &str, signature: &str) -> Option<MethodId>;

    // ---- 存活性 ----

    /// 类的加载器是否仍然存活
    fn is_class_alive(&self, class: ClassId) -> bool;

    fn is_method_alive(&self, method: MethodId) -> bool;

    fn acquire_keep_alive(&self, class: ClassId) -> KeepAliveHandle;

    fn release_keep_alive(&self, handle: KeepAliveHandle);

    // ---- 编译 ----

    fn can_be_compiled(&self, method: MethodId, level: CompLevel) -> bool;

    /// 当前安装的编译产物
    fn compiled_code(&self, method: MethodId) -> Option<CompiledCode>;

    /// 提交编译任务，返回是否被编译队列接受
    fn commit_compilation(
        &self,
        method: MethodId,
        bci: i32,
        level: CompLevel,
    ) -> Result<bool, CompileError>;

    /// 同步编译，返回编译产物
    fn compile_sync(&self, method: MethodId, level: CompLevel) -> Option<CompiledCode>;

    /// 标记方法的编译产物和排队中的编译任务待去优化（safepoint）
    fn mark_for_deoptimization(&self, method: MethodId) -> bool;

    /// 去优化所有被标记的代码（safepoint）
    fn deoptimize_all(&self);

    // ---- 安全点 ----

    fn is_at_safepoint(&self) -> bool;

    /// 是否有冲突的嵌套 VM 操作在执行
    fn nested_operation_in_progress(&self) -> bool;
}
