//! 方法持有者注册表
//!
//! - [`MethodHold`]: 一条记录下来的方法 profile，按 (name, signature) 标识
//! - [`ClassHolder`]: 一个物理类体，按 (byte_size, class_hash, crc32) 区分同名类
//! - [`HolderRegistry`]: 所有持有者的所有者，按类名索引
//!
//! 同一个逻辑方法可能对应多个物理方法（类被重新加载或重定义），
//! 这些物理方法作为 [`ResolvedMethod`] 变体挂在同一个 `MethodHold` 下，各自独立跟踪。

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::format::MethodRecord;
use crate::runtime::{ClassDescriptor, ClassId, ClassIdentity, MethodId, ProfileCounters};

/// 一个已解析的物理方法
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMethod {
    /// 卸载后被清空，持有者本身保留
    pub method: Option<MethodId>,
    pub class: ClassId,
    pub is_deopted: bool,
    /// 已由预编译提交
    pub precompiled: bool,
}

/// 记录中的方法 profile
#[derive(Debug, Clone)]
pub struct MethodHold {
    pub name: String,
    pub signature: String,
    pub bytecode_size: u32,
    pub bytecode_hash: u32,
    pub counters: ProfileCounters,
    /// 预编译时所属的链槽位
    pub slot: usize,
    /// 所属的 [`ClassHolder`] 下标
    pub holder: usize,
    pub variants: SmallVec<[ResolvedMethod; 1]>,
}

impl MethodHold {
    /// 记录一个物理方法；已存在同一方法时返回 `false`
    ///
    /// 第二个不同的物理方法会作为新变体加入。
    fn resolve(&mut self, method: MethodId, class: ClassId) -> bool {
        if self.variants.iter().any(|v| v.method == Some(method)) {
            return false;
        }
        if !self.variants.is_empty() {
            log::debug!(
                "[JitProfileCache] {}{} resolved again in {}, tracking {} variants",
                self.name,
                self.signature,
                class,
                self.variants.len() + 1
            );
        }
        self.variants.push(ResolvedMethod {
            method: Some(method),
            class,
            is_deopted: false,
            precompiled: false,
        });
        true
    }

    pub fn is_resolved(&self) -> bool {
        !self.variants.is_empty()
    }

    /// 仍然指向物理方法的变体
    pub fn live_variants(&self) -> impl Iterator<Item = &ResolvedMethod> {
        self.variants.iter().filter(|v| v.method.is_some())
    }
}

/// 一个物理类体
#[derive(Debug, Clone)]
pub struct ClassHolder {
    pub class_name: String,
    pub loader_name: String,
    pub source_path: String,
    pub byte_size: u32,
    pub crc32: u32,
    pub class_hash: u32,
    /// 该类体下的方法，下标指向 [`HolderRegistry::methods`]
    pub methods: Vec<usize>,
    /// 所有方法都至少解析过一次
    pub resolved: bool,
}

/// 一次类解析的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// 新匹配上的方法数
    pub resolved: usize,
    /// 其中作为额外变体加入的
    pub cloned: usize,
}

/// 持有者注册表
#[derive(Debug, Default)]
pub struct HolderRegistry {
    methods: Vec<MethodHold>,
    holders: Vec<ClassHolder>,
    by_name: HashMap<String, SmallVec<[usize; 1]>>,
}

impl HolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查找与已加载类对应的类体
    pub fn find_holder(&self, identity: &ClassIdentity) -> Option<usize> {
        self.find_body(
            &identity.name,
            identity.byte_size,
            identity.identity_hash(),
            identity.crc32,
        )
    }

    /// 按 (类名, byte_size, class_hash, crc32) 查找类体
    fn find_body(&self, class_name: &str, byte_size: u32, class_hash: u32, crc32: u32) -> Option<usize> {
        self.by_name.get(class_name).and_then(|ids| {
            ids.iter().copied().find(|&id| {
                let h = &self.holders[id];
                h.byte_size == byte_size && h.class_hash == class_hash && h.crc32 == crc32
            })
        })
    }

    /// 同名的所有类体
    pub fn holders_named(&self, class_name: &str) -> impl Iterator<Item = &ClassHolder> {
        self.by_name
            .get(class_name)
            .into_iter()
            .flat_map(move |ids| ids.iter().map(move |&id| &self.holders[id]))
    }

    fn holder_for(&mut self, record: &MethodRecord) -> usize {
        if let Some(id) = self.find_body(
            &record.class_name,
            record.class_size,
            record.class_hash,
            record.class_crc32,
        ) {
            return id;
        }
        let id = self.holders.len();
        self.holders.push(ClassHolder {
            class_name: record.class_name.clone(),
            loader_name: record.class_loader.clone(),
            source_path: record.class_path.clone(),
            byte_size: record.class_size,
            crc32: record.class_crc32,
            class_hash: record.class_hash,
            methods: Vec::new(),
            resolved: false,
        });
        self.by_name
            .entry(record.class_name.clone())
            .or_default()
            .push(id);
        id
    }

    /// 加入一条方法记录，返回方法下标；同一类体内重复的 (name, signature) 返回 `None`
    pub fn add_method(&mut self, record: &MethodRecord, slot: usize) -> Option<usize> {
        let holder = self.holder_for(record);
        let duplicate = self.holders[holder].methods.iter().any(|&m| {
            self.methods[m].name == record.method_name
                && self.methods[m].signature == record.signature
        });
        if duplicate {
            return None;
        }

        let id = self.methods.len();
        self.methods.push(MethodHold {
            name: record.method_name.clone(),
            signature: record.signature.clone(),
            bytecode_size: record.bytecode_size,
            bytecode_hash: record.bytecode_hash,
            counters: record.counters,
            slot,
            holder,
            variants: SmallVec::new(),
        });
        self.holders[holder].methods.push(id);
        Some(id)
    }

    /// 用一个已加载的类解析类体下的方法
    pub fn resolve_class(&mut self, holder: usize, class: &ClassDescriptor) -> ResolveOutcome {
        let mut outcome = ResolveOutcome::default();
        let method_ids = self.holders[holder].methods.clone();
        for m in &method_ids {
            let hold = &mut self.methods[*m];
            let Some(live) = class
                .methods
                .iter()
                .find(|d| d.name == hold.name && d.signature == hold.signature)
            else {
                continue;
            };
            let had_variant = hold.is_resolved();
            if hold.resolve(live.id, class.id) {
                outcome.resolved += 1;
                if had_variant {
                    outcome.cloned += 1;
                }
            }
        }
        if method_ids.iter().all(|&m| self.methods[m].is_resolved()) {
            self.holders[holder].resolved = true;
        }
        outcome
    }

    pub fn holder(&self, id: usize) -> &ClassHolder {
        &self.holders[id]
    }

    pub fn method(&self, id: usize) -> &MethodHold {
        &self.methods[id]
    }

    pub fn method_mut(&mut self, id: usize) -> &mut MethodHold {
        &mut self.methods[id]
    }

    pub fn methods(&self) -> &[MethodHold] {
        &self.methods
    }

    pub fn methods_mut(&mut self) -> &mut [MethodHold] {
        &mut self.methods
    }

    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::CompilationKind;
    use crate::runtime::{identity_hash, MethodDescriptor};

    fn record(class: &str, size: u32, crc: u32, name: &str, sig: &str) -> MethodRecord {
        MethodRecord {
            order: 0,
            kind: CompilationKind::Method,
            method_name: name.to_string(),
            signature: sig.to_string(),
            first_invoke_init_order: 0,
            bytecode_size: 4,
            bytecode_hash: 1,
            bci: -1,
            class_name: class.to_string(),
            class_loader: "app".to_string(),
            class_path: "/a.jar".to_string(),
            class_size: size,
            class_crc32: crc,
            class_hash: identity_hash(class, "app", "/a.jar"),
            counters: ProfileCounters::default(),
        }
    }

    fn foo(size: u32, crc: u32) -> ClassIdentity {
        ClassIdentity::new("com/app/Foo", "app", "/a.jar", size, crc)
    }

    fn class(id: u64, size: u32, crc: u32, methods: &[(u64, &str, &str)]) -> ClassDescriptor {
        ClassDescriptor {
            id: ClassId(id),
            identity: foo(size, crc),
            anonymous: false,
            methods: methods
                .iter()
                .map(|&(mid, name, sig)| MethodDescriptor {
                    id: MethodId(mid),
                    name: name.to_string(),
                    signature: sig.to_string(),
                    bytecode_size: 4,
                    bytecode_hash: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn test_duplicate_class_bodies_get_distinct_holders() {
        let mut registry = HolderRegistry::new();
        registry.add_method(&record("com/app/Foo", 100, 1, "bar", "()V"), 0).unwrap();
        registry.add_method(&record("com/app/Foo", 200, 2, "bar", "()V"), 0).unwrap();
        assert_eq!(registry.holder_count(), 2);
        assert_eq!(registry.holders_named("com/app/Foo").count(), 2);

        let a = registry.find_holder(&foo(100, 1)).unwrap();
        let b = registry.find_holder(&foo(200, 2)).unwrap();
        assert_ne!(a, b);
        assert!(registry.find_holder(&foo(100, 2)).is_none());
        // 同名同内容但来自其他加载器的类不是同一个类体
        let other = ClassIdentity::new("com/app/Foo", "plugin", "/a.jar", 100, 1);
        assert!(registry.find_holder(&other).is_none());

        // 两个类体各自独立解析
        let outcome = registry.resolve_class(b, &class(2, 200, 2, &[(20, "bar", "()V")]));
        assert_eq!(outcome.resolved, 1);
        assert!(registry.holder(b).resolved);
        assert!(!registry.holder(a).resolved);
    }

    #[test]
    fn test_duplicate_method_record_rejected() {
        let mut registry = HolderRegistry::new();
        assert!(registry.add_method(&record("C", 1, 1, "m", "()V"), 0).is_some());
        assert!(registry.add_method(&record("C", 1, 1, "m", "()V"), 0).is_none());
        assert!(registry.add_method(&record("C", 1, 1, "m", "(I)V"), 0).is_some());
        assert_eq!(registry.method_count(), 2);
    }

    #[test]
    fn test_partial_resolution_then_clone() {
        let mut registry = HolderRegistry::new();
        let bar = registry.add_method(&record("com/app/Foo", 100, 1, "bar", "()V"), 0).unwrap();
        registry.add_method(&record("com/app/Foo", 100, 1, "baz", "(I)I"), 0).unwrap();
        let holder = registry.find_holder(&foo(100, 1)).unwrap();

        // 第一个类只提供了 bar
        let outcome = registry.resolve_class(holder, &class(1, 100, 1, &[(10, "bar", "()V")]));
        assert_eq!(outcome, ResolveOutcome { resolved: 1, cloned: 0 });
        assert!(!registry.holder(holder).resolved);

        // 第二个同内容的类提供了两者，bar 得到第二个变体
        let outcome = registry.resolve_class(
            holder,
            &class(2, 100, 1, &[(11, "bar", "()V"), (12, "baz", "(I)I")]),
        );
        assert_eq!(outcome, ResolveOutcome { resolved: 2, cloned: 1 });
        assert!(registry.holder(holder).resolved);
        assert_eq!(registry.method(bar).variants.len(), 2);
        assert_eq!(registry.method(bar).variants[1].method, Some(MethodId(11)));
    }
}
