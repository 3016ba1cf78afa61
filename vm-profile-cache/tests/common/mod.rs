//! 集成测试共用的内存版 VmRuntime
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use vm_profile_cache::format::CompilationKind;
use vm_profile_cache::runtime::{CompileError, InitError, INVOCATION_ENTRY_BCI};
use vm_profile_cache::{
    ClassDescriptor, ClassId, ClassIdentity, ClassRecord, ClassStatus, CompLevel, CompiledCode,
    KeepAliveHandle, MethodDescriptor, MethodId, MethodRecord, ProfileCounters,
    ProfileLogWriter, VmRuntime,
};

pub const LOADER: &str = "app";
pub const SOURCE: &str = "/opt/app/app.jar";
pub const BARRIER_CLASS: &str = "vm/profile/WarmUpBarrier";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct FakeClass {
    name: String,
    status: ClassStatus,
    alive: bool,
    redefined: bool,
    init_error: Option<String>,
    /// 初始化返回后仍处于 BeingInitialized
    stalled: bool,
}

struct FakeMethod {
    class: ClassId,
    name: String,
    signature: String,
    alive: bool,
    compiled: Option<CompiledCode>,
    compilable: bool,
    submit_error: Option<String>,
}

#[derive(Default)]
struct FakeState {
    classes: HashMap<ClassId, FakeClass>,
    by_name: HashMap<String, ClassId>,
    methods: HashMap<MethodId, FakeMethod>,
    next_class: u64,
    next_method: u64,
    next_compile_id: u32,
    next_handle: u64,
    live_handles: Vec<KeepAliveHandle>,
    released: Vec<KeepAliveHandle>,
    submitted: Vec<MethodId>,
    marked: Vec<MethodId>,
    deoptimize_all_calls: usize,
    init_calls: Vec<ClassId>,
    at_safepoint: bool,
    nested: bool,
    resolving_superclass: bool,
}

/// 内存中的宿主 VM
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        let runtime = Arc::new(Self::default());
        runtime.state.lock().at_safepoint = true;
        runtime
    }

    /// 定义一个类体，返回加载事件用的描述
    pub fn define_class_body(
        &self,
        name: &str,
        byte_size: u32,
        crc32: u32,
        methods: &[(&str, &str)],
    ) -> ClassDescriptor {
        let mut state = self.state.lock();
        state.next_class += 1;
        let id = ClassId(state.next_class);
        state.classes.insert(
            id,
            FakeClass {
                name: name.to_string(),
                status: ClassStatus::Loaded,
                alive: true,
                redefined: false,
                init_error: None,
                stalled: false,
            },
        );
        state.by_name.insert(name.to_string(), id);

        let mut descriptors = Vec::new();
        for &(method, signature) in methods {
            state.next_method += 1;
            let mid = MethodId(state.next_method);
            state.methods.insert(
                mid,
                FakeMethod {
                    class: id,
                    name: method.to_string(),
                    signature: signature.to_string(),
                    alive: true,
                    compiled: None,
                    compilable: true,
                    submit_error: None,
                },
            );
            descriptors.push(MethodDescriptor {
                id: mid,
                name: method.to_string(),
                signature: signature.to_string(),
                bytecode_size: 16,
                bytecode_hash: 0xBEEF,
            });
        }

        ClassDescriptor {
            id,
            identity: ClassIdentity::new(name, LOADER, SOURCE, byte_size, crc32),
            anonymous: false,
            methods: descriptors,
        }
    }

    pub fn define_class(&self, name: &str, methods: &[(&str, &str)]) -> ClassDescriptor {
        self.define_class_body(name, 1024, 0xC0FFEE, methods)
    }

    pub fn define_barrier(&self) -> ClassDescriptor {
        self.define_class(BARRIER_CLASS, &[("dummy", "()V")])
    }

    pub fn method_named(&self, class: &ClassDescriptor, name: &str) -> MethodId {
        class
            .methods
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.id)
            .expect("method defined")
    }

    pub fn set_status(&self, class: ClassId, status: ClassStatus) {
        self.state.lock().classes.get_mut(&class).expect("class").status = status;
    }

    pub fn fail_init(&self, class: ClassId, exception: &str) {
        self.state.lock().classes.get_mut(&class).expect("class").init_error =
            Some(exception.to_string());
    }

    pub fn stall_init(&self, class: ClassId) {
        self.state.lock().classes.get_mut(&class).expect("class").stalled = true;
    }

    pub fn set_class_alive(&self, class: ClassId, alive: bool) {
        self.state.lock().classes.get_mut(&class).expect("class").alive = alive;
    }

    pub fn set_redefined(&self, class: ClassId) {
        self.state.lock().classes.get_mut(&class).expect("class").redefined = true;
    }

    pub fn set_method_alive(&self, method: MethodId, alive: bool) {
        self.state.lock().methods.get_mut(&method).expect("method").alive = alive;
    }

    pub fn set_not_compilable(&self, method: MethodId) {
        self.state.lock().methods.get_mut(&method).expect("method").compilable = false;
    }

    pub fn fail_submission(&self, method: MethodId, message: &str) {
        self.state.lock().methods.get_mut(&method).expect("method").submit_error =
            Some(message.to_string());
    }

    /// 模拟分层编译独立地重新编译了方法
    pub fn recompile(&self, method: MethodId) -> CompiledCode {
        let mut state = self.state.lock();
        state.next_compile_id += 1;
        let code = CompiledCode {
            compile_id: state.next_compile_id,
            level: CompLevel::FullOptimization,
        };
        state.methods.get_mut(&method).expect("method").compiled = Some(code);
        code
    }

    pub fn set_safepoint(&self, at: bool) {
        self.state.lock().at_safepoint = at;
    }

    pub fn set_nested(&self, nested: bool) {
        self.state.lock().nested = nested;
    }

    pub fn set_resolving_superclass(&self, resolving: bool) {
        self.state.lock().resolving_superclass = resolving;
    }

    pub fn submitted(&self) -> Vec<MethodId> {
        self.state.lock().submitted.clone()
    }

    pub fn marked(&self) -> Vec<MethodId> {
        self.state.lock().marked.clone()
    }

    pub fn deoptimize_all_calls(&self) -> usize {
        self.state.lock().deoptimize_all_calls
    }

    pub fn init_calls(&self) -> Vec<ClassId> {
        self.state.lock().init_calls.clone()
    }

    pub fn live_handles(&self) -> usize {
        self.state.lock().live_handles.len()
    }

    pub fn released_handles(&self) -> usize {
        self.state.lock().released.len()
    }

    fn install(state: &mut FakeState, method: MethodId) -> CompiledCode {
        state.next_compile_id += 1;
        let code = CompiledCode {
            compile_id: state.next_compile_id,
            level: CompLevel::FullOptimization,
        };
        if let Some(m) = state.methods.get_mut(&method) {
            m.compiled = Some(code);
        }
        code
    }
}

impl VmRuntime for FakeRuntime {
    fn resolve_or_fail(&self, qualified_name: &str) -> Option<ClassId> {
        self.state.lock().by_name.get(qualified_name).copied()
    }

    fn initialize(&self, class: ClassId) -> Result<(), InitError> {
        let mut state = self.state.lock();
        state.init_calls.push(class);
        let c = state.classes.get_mut(&class).ok_or_else(|| InitError {
            exception: "NoClassDefFoundError".to_string(),
        })?;
        if let Some(exception) = &c.init_error {
            c.status = ClassStatus::InitializationError;
            return Err(InitError {
                exception: exception.clone(),
            });
        }
        c.status = if c.stalled {
            ClassStatus::BeingInitialized
        } else {
            ClassStatus::Initialized
        };
        Ok(())
    }

    fn class_status(&self, class: ClassId) -> ClassStatus {
        self.state
            .lock()
            .classes
            .get(&class)
            .map(|c| c.status)
            .unwrap_or(ClassStatus::Loaded)
    }

    fn is_redefined(&self, class: ClassId) -> bool {
        self.state.lock().classes.get(&class).is_some_and(|c| c.redefined)
    }

    fn is_resolving_superclass(&self) -> bool {
        self.state.lock().resolving_superclass
    }

    fn find_method(&self, class: ClassId, name: &str, signature: &str) -> Option<MethodId> {
        self.state
            .lock()
            .methods
            .iter()
            .find(|(_, m)| m.class == class && m.name == name && m.signature == signature)
            .map(|(&id, _)| id)
    }

    fn is_class_alive(&self, class: ClassId) -> bool {
        self.state.lock().classes.get(&class).is_some_and(|c| c.alive)
    }

    fn is_method_alive(&self, method: MethodId) -> bool {
        self.state.lock().methods.get(&method).is_some_and(|m| m.alive)
    }

    fn acquire_keep_alive(&self, _class: ClassId) -> KeepAliveHandle {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = KeepAliveHandle(state.next_handle);
        state.live_handles.push(handle);
        handle
    }

    fn release_keep_alive(&self, handle: KeepAliveHandle) {
        let mut state = self.state.lock();
        state.live_handles.retain(|&h| h != handle);
        state.released.push(handle);
    }

    fn can_be_compiled(&self, method: MethodId, _level: CompLevel) -> bool {
        self.state.lock().methods.get(&method).is_some_and(|m| m.compilable)
    }

    fn compiled_code(&self, method: MethodId) -> Option<CompiledCode> {
        self.state.lock().methods.get(&method).and_then(|m| m.compiled)
    }

    fn commit_compilation(
        &self,
        method: MethodId,
        bci: i32,
        _level: CompLevel,
    ) -> Result<bool, CompileError> {
        assert_eq!(bci, INVOCATION_ENTRY_BCI);
        let mut state = self.state.lock();
        let m = state
            .methods
            .get(&method)
            .ok_or_else(|| CompileError("unknown method".to_string()))?;
        if let Some(message) = &m.submit_error {
            return Err(CompileError(message.clone()));
        }
        state.submitted.push(method);
        Self::install(&mut state, method);
        Ok(true)
    }

    fn compile_sync(&self, method: MethodId, _level: CompLevel) -> Option<CompiledCode> {
        let mut state = self.state.lock();
        if !state.methods.contains_key(&method) {
            return None;
        }
        Some(Self::install(&mut state, method))
    }

    fn mark_for_deoptimization(&self, method: MethodId) -> bool {
        let mut state = self.state.lock();
        state.marked.push(method);
        match state.methods.get_mut(&method) {
            Some(m) => m.compiled.take().is_some(),
            None => false,
        }
    }

    fn deoptimize_all(&self) {
        self.state.lock().deoptimize_all_calls += 1;
    }

    fn is_at_safepoint(&self) -> bool {
        self.state.lock().at_safepoint
    }

    fn nested_operation_in_progress(&self) -> bool {
        self.state.lock().nested
    }
}

/// 类表条目
pub fn class_record(name: &str) -> ClassRecord {
    ClassRecord {
        name: name.to_string(),
        loader_name: LOADER.to_string(),
        source_path: SOURCE.to_string(),
    }
}

/// 与 [`FakeRuntime::define_class`] 定义的类体匹配的方法记录
pub fn method_record(class: &str, name: &str, signature: &str, init_order: i32) -> MethodRecord {
    method_record_in_body(class, 1024, 0xC0FFEE, name, signature, init_order)
}

pub fn method_record_in_body(
    class: &str,
    byte_size: u32,
    crc32: u32,
    name: &str,
    signature: &str,
    init_order: i32,
) -> MethodRecord {
    MethodRecord {
        order: 0,
        kind: CompilationKind::Method,
        method_name: name.to_string(),
        signature: signature.to_string(),
        first_invoke_init_order: init_order,
        bytecode_size: 16,
        bytecode_hash: 0xBEEF,
        bci: INVOCATION_ENTRY_BCI,
        class_name: class.to_string(),
        class_loader: LOADER.to_string(),
        class_path: SOURCE.to_string(),
        class_size: byte_size,
        class_crc32: crc32,
        class_hash: ClassIdentity::new(class, LOADER, SOURCE, byte_size, crc32).identity_hash(),
        counters: ProfileCounters {
            interpreter_invocation_count: 1500,
            interpreter_throwout_count: 0,
            invocation_counter: 1500,
            backedge_counter: 20,
        },
    }
}

/// 编码一个日志
pub fn encode_profile(app_id: u32, classes: &[ClassRecord], methods: &[MethodRecord]) -> Vec<u8> {
    let mut writer = ProfileLogWriter::new(Cursor::new(Vec::new()), app_id).expect("header");
    writer.write_classes(classes).expect("classes");
    for (order, method) in methods.iter().enumerate() {
        let mut record = method.clone();
        record.order = order as u32;
        writer.write_method(&record).expect("method");
    }
    let (cursor, _) = writer.finish().expect("finish");
    cursor.into_inner()
}

pub fn write_profile(
    path: &Path,
    app_id: u32,
    classes: &[ClassRecord],
    methods: &[MethodRecord],
) {
    std::fs::write(path, encode_profile(app_id, classes, methods)).expect("write profile");
}
