//! Integration tests for shutting an incarnation down

use vobjstore::{
    Behavior, FarBehavior, Handle, KindOptions, MemorySyscall, RuntimeConfig, StoreOptions,
    SyscallRecord, Value, VirtualRuntime,
};

fn setup() -> (VirtualRuntime, MemorySyscall) {
    let syscall = MemorySyscall::new();
    let rt = VirtualRuntime::new(syscall.clone(), RuntimeConfig::default()).unwrap();
    (rt, syscall)
}

#[test]
fn test_stop_abandons_exports() {
    let (rt, syscall) = setup();
    let maker = rt
        .define_kind(
            "thing",
            |_| Ok(Value::record::<&str, _>([])),
            Behavior::new(),
            KindOptions::new(),
        )
        .unwrap();

    let local = Handle::far("local", FarBehavior::new());
    let local_vref = rt.export(&local).unwrap();
    let thing = maker.make(&[]).unwrap();
    let thing_vref = rt.export(&thing).unwrap();
    drop(thing);
    rt.end_turn().unwrap();
    assert!(syscall.get(&format!("vom.{}", thing_vref)).is_some());

    syscall.take_log();
    rt.stop().unwrap();

    let actions = syscall.take_gc_actions();
    assert!(actions.contains(&SyscallRecord::AbandonExports(vec![local_vref])));
    assert!(actions.contains(&SyscallRecord::AbandonExports(vec![thing_vref.clone()])));

    // nothing references the abandoned object any more
    assert!(syscall.get(&format!("vom.es.{}", thing_vref)).is_none());
    assert!(syscall.get(&format!("vom.{}", thing_vref)).is_none());
}

#[test]
fn test_stop_deletes_virtual_collections_only() {
    let (rt, syscall) = setup();
    let scratch = rt.make_map_store("scratch", StoreOptions::new()).unwrap();
    let kept = rt
        .make_map_store("kept", StoreOptions::new().durable())
        .unwrap();
    scratch.init("a", 1).unwrap();
    kept.init("b", 2).unwrap();
    rt.end_turn().unwrap();

    rt.stop().unwrap();

    assert!(syscall.keys_with_prefix("vc.1.").is_empty());
    assert_eq!(syscall.get("vc.2.|label").as_deref(), Some("kept"));
    assert!(syscall.get("vc.2.sb").is_some());
}

#[test]
fn test_stop_with_nothing_to_release() {
    let (rt, syscall) = setup();
    rt.end_turn().unwrap();
    let before = syscall.contents();

    syscall.take_log();
    rt.stop().unwrap();
    assert!(syscall.take_gc_actions().is_empty());
    assert_eq!(syscall.contents(), before);
}

#[test]
fn test_stop_skips_exports_the_kernel_already_dropped() {
    let (rt, syscall) = setup();
    let kept = Handle::far("kept", FarBehavior::new());
    let released = Handle::far("released", FarBehavior::new());
    let kept_vref = rt.export(&kept).unwrap();
    let released_vref = rt.export(&released).unwrap();
    rt.drop_exports(&[released_vref.clone()]).unwrap();

    syscall.take_log();
    rt.stop().unwrap();

    let actions = syscall.take_gc_actions();
    assert_eq!(actions, vec![SyscallRecord::AbandonExports(vec![kept_vref])]);
    assert!(!actions.iter().any(|action| matches!(
        action,
        SyscallRecord::AbandonExports(vrefs) if vrefs.contains(&released_vref)
    )));
}
