//! 记录 -> 文件 -> 解析，以及损坏文件的拒绝

mod common;

use std::sync::Arc;

use common::{class_record, encode_profile, init_logger, method_record, FakeRuntime};
use vm_profile_cache::format::{HEADER_SIZE, PROFILE_VERSION};
use vm_profile_cache::runtime::INVOCATION_ENTRY_BCI;
use vm_profile_cache::{
    CacheMode, ClassDescriptor, ClassIdentity, JitProfileCache, MethodEvent, ParseError,
    ProfileCacheConfig, ProfileCounters, ProfileLogReader, VmFlags, VmRuntime,
};

fn invoke(class: &ClassDescriptor, method: usize, invocations: u32) -> MethodEvent {
    MethodEvent {
        method: class.methods[method].clone(),
        holder: class.identity.clone(),
        counters: ProfileCounters {
            interpreter_invocation_count: invocations,
            interpreter_throwout_count: 1,
            invocation_counter: invocations * 2,
            backedge_counter: 7,
        },
        bci: INVOCATION_ENTRY_BCI,
    }
}

#[test]
fn test_recorded_profile_round_trips() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("record.log");
    let runtime = FakeRuntime::new();
    let dyn_runtime: Arc<dyn VmRuntime> = runtime.clone();
    let config = ProfileCacheConfig {
        mode: CacheMode::Record,
        profile_path: path.clone(),
        app_id: 77,
        ..Default::default()
    };
    let cache = JitProfileCache::new(config, &VmFlags::default(), dyn_runtime).unwrap();
    assert_eq!(cache.mode(), CacheMode::Record);

    let main = runtime.define_class("com/app/Main", &[("main", "([Ljava/lang/String;)V")]);
    let foo = runtime.define_class("com/app/Foo", &[("bar", "()V"), ("baz", "(I)I")]);
    let mut lambda = runtime.define_class("com/app/Main$$Lambda$1", &[("run", "()V")]);
    lambda.anonymous = true;

    cache.on_class_initialized(&main);
    cache.on_method_invoked(&invoke(&main, 0, 1));
    cache.on_class_initialized(&lambda);
    cache.on_class_initialized(&foo);
    cache.on_method_invoked(&invoke(&foo, 0, 1200));
    cache.on_method_invoked(&invoke(&foo, 1, 3400));
    cache.on_method_invoked(&invoke(&foo, 1, 9999));

    let header = cache.flush_now().unwrap().unwrap();
    assert_eq!(header.record_count, 3);
    assert!(cache.flush_now().unwrap().is_none());

    let profile = ProfileLogReader::parse_file(&path, 77).unwrap();
    assert_eq!(profile.header, header);
    assert_eq!(profile.skipped_records, 0);
    let names: Vec<&str> = profile.classes.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["com/app/Main", "com/app/Foo"]);

    let expected = [
        (&main, 0usize, 1u32, 0i32),
        (&foo, 0, 1200, 1),
        (&foo, 1, 3400, 1),
    ];
    assert_eq!(profile.methods.len(), expected.len());
    for (record, (class, method, invocations, init_order)) in profile.methods.iter().zip(expected) {
        let m = &class.methods[method];
        assert_eq!(record.method_name, m.name);
        assert_eq!(record.signature, m.signature);
        assert_eq!(record.bytecode_size, m.bytecode_size);
        assert_eq!(record.bytecode_hash, m.bytecode_hash);
        assert_eq!(record.class_name, class.identity.name);
        assert_eq!(record.class_size, class.identity.byte_size);
        assert_eq!(record.class_crc32, class.identity.crc32);
        assert_eq!(record.class_hash, class.identity.identity_hash());
        assert_eq!(record.first_invoke_init_order, init_order);
        assert_eq!(record.counters.interpreter_invocation_count, invocations);
        assert_eq!(record.counters.invocation_counter, invocations * 2);
        assert_eq!(record.counters.backedge_counter, 7);
    }
}

/// 写入文件并以回放模式启动
fn replay(bytes: &[u8]) -> JitProfileCache {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.log");
    std::fs::write(&path, bytes).unwrap();
    let config = ProfileCacheConfig {
        mode: CacheMode::Replay,
        profile_path: path,
        ..Default::default()
    };
    let runtime: Arc<dyn VmRuntime> = FakeRuntime::new();
    JitProfileCache::new(config, &VmFlags::default(), runtime).unwrap()
}

fn sample() -> Vec<u8> {
    encode_profile(
        0,
        &[class_record("com/app/Foo")],
        &[
            method_record("com/app/Foo", "bar", "()V", 0),
            method_record("com/app/Foo", "baz", "(I)I", 0),
        ],
    )
}

#[test]
fn test_valid_log_builds_chain() {
    let cache = replay(&sample());
    assert_eq!(cache.mode(), CacheMode::Replay);
    assert_eq!(cache.chain().unwrap().len(), 1);
}

#[test]
fn test_flipped_crc_disables_cache() {
    let mut bytes = sample();
    bytes[12] ^= 0x01;
    let cache = replay(&bytes);
    assert_eq!(cache.mode(), CacheMode::Disabled);
    assert!(cache.chain().is_none());
    assert!(cache.disabled_reason().unwrap().contains("crc32"));
}

#[test]
fn test_version_off_by_one_disables_cache() {
    let mut bytes = sample();
    bytes[0..4].copy_from_slice(&(PROFILE_VERSION + 1).to_le_bytes());
    let cache = replay(&bytes);
    assert!(cache.chain().is_none());
    assert!(matches!(
        ProfileLogReader::parse(&bytes, 0),
        Err(ParseError::VersionMismatch { .. })
    ));
}

#[test]
fn test_file_size_mismatch_never_builds_chain() {
    let mut bytes = sample();
    bytes.push(0);
    let cache = replay(&bytes);
    assert!(cache.chain().is_none());
    assert!(matches!(
        ProfileLogReader::parse(&bytes, 0),
        Err(ParseError::FileSizeMismatch { declared, actual }) if actual == declared as usize + 1
    ));
}

#[test]
fn test_app_id_gate() {
    let bytes = encode_profile(5, &[class_record("A")], &[]);
    assert!(ProfileLogReader::parse(&bytes, 0).is_ok());
    assert!(ProfileLogReader::parse(&bytes, 5).is_ok());
    assert!(matches!(
        ProfileLogReader::parse(&bytes, 6),
        Err(ParseError::AppIdMismatch { expected: 6, found: 5 })
    ));
}

#[test]
fn test_concrete_header_fields() {
    let bytes = sample();
    let profile = ProfileLogReader::parse(&bytes, 0).unwrap();
    assert_eq!(profile.header.record_count, 2);
    assert_eq!(profile.header.file_size as usize, bytes.len());
    assert!(bytes.len() > HEADER_SIZE);
    assert_eq!(profile.classes[0].name, "com/app/Foo");
    let identity = ClassIdentity::new("com/app/Foo", common::LOADER, common::SOURCE, 1024, 0xC0FFEE);
    assert_eq!(profile.methods[1].class_hash, identity.identity_hash());
}
