//! Integration tests for reference counting and garbage collection

use vobjstore::{
    Behavior, FarBehavior, Handle, KindMaker, KindOptions, MemorySyscall, RuntimeConfig,
    StoreOptions, SyscallRecord, Value, VirtualRuntime,
};

fn setup() -> (VirtualRuntime, MemorySyscall) {
    let syscall = MemorySyscall::new();
    let rt = VirtualRuntime::new(syscall.clone(), RuntimeConfig::default()).unwrap();
    (rt, syscall)
}

fn define_holder(rt: &VirtualRuntime) -> KindMaker {
    rt.define_kind(
        "holder",
        |args| {
            let held = args.first().cloned().unwrap_or(Value::Null);
            Ok(Value::record([("held", held)]))
        },
        Behavior::new()
            .method("held", |ctx, _| ctx.state().get("held"))
            .method("release", |ctx, _| {
                ctx.state().set("held", Value::Null)?;
                Ok(Value::Null)
            }),
        KindOptions::new(),
    )
    .unwrap()
}

fn define_thing(rt: &VirtualRuntime) -> KindMaker {
    rt.define_kind(
        "thing",
        |_| Ok(Value::record([("name", "thing".into())])),
        Behavior::new().method("name", |ctx, _| ctx.state().get("name")),
        KindOptions::new(),
    )
    .unwrap()
}

#[test]
fn test_referenced_object_outlives_its_representative() {
    let (rt, syscall) = setup();
    let holder_maker = define_holder(&rt);
    let thing_maker = define_thing(&rt);

    let thing = thing_maker.make(&[]).unwrap();
    let thing_vref = thing.vref().unwrap();
    let holder = holder_maker.make(&[Value::Ref(thing.clone())]).unwrap();
    let holder_vref = holder.vref().unwrap();
    rt.end_turn().unwrap();

    assert_eq!(rt.ref_count(&thing_vref).unwrap(), 1);
    assert!(syscall.get(&format!("vom.{}", thing_vref)).is_some());

    drop(thing);
    let report = rt.bring_out_your_dead().unwrap();
    assert!(report.is_empty());
    assert!(syscall.get(&format!("vom.{}", thing_vref)).is_some());

    // the holder can still hand out a working representative
    let again = holder.invoke("held", &[]).unwrap();
    assert_eq!(again.as_handle().unwrap().invoke("name", &[]).unwrap(), "thing".into());
    drop(again);

    drop(holder);
    let report = rt.bring_out_your_dead().unwrap();
    assert!(report.is_empty());
    assert!(syscall.get(&format!("vom.{}", holder_vref)).is_none());
    assert!(syscall.get(&format!("vom.{}", thing_vref)).is_none());
    assert_eq!(rt.ref_count(&thing_vref).unwrap(), 0);
}

#[test]
fn test_releasing_a_reference_frees_the_target() {
    let (rt, syscall) = setup();
    let holder_maker = define_holder(&rt);
    let thing_maker = define_thing(&rt);

    let thing = thing_maker.make(&[]).unwrap();
    let thing_vref = thing.vref().unwrap();
    let holder = holder_maker.make(&[Value::Ref(thing.clone())]).unwrap();
    drop(thing);

    holder.invoke("release", &[]).unwrap();
    assert_eq!(rt.ref_count(&thing_vref).unwrap(), 0);

    rt.bring_out_your_dead().unwrap();
    assert!(syscall.get(&format!("vom.{}", thing_vref)).is_none());
    assert!(holder.vref().is_some());
}

#[test]
fn test_exported_object_is_retired_after_drop() {
    let (rt, syscall) = setup();
    let thing_maker = define_thing(&rt);

    let thing = thing_maker.make(&[]).unwrap();
    let vref = rt.export(&thing).unwrap();
    assert_eq!(syscall.get(&format!("vom.es.{}", vref)).as_deref(), Some("r"));
    drop(thing);

    assert!(rt.bring_out_your_dead().unwrap().is_empty());
    assert!(syscall.get(&format!("vom.{}", vref)).is_some());

    rt.drop_exports(&[vref.clone()]).unwrap();
    assert_eq!(syscall.get(&format!("vom.es.{}", vref)).as_deref(), Some("s"));
    syscall.take_log();

    let report = rt.bring_out_your_dead().unwrap();
    assert_eq!(report.retired_exports, vec![vref.clone()]);
    assert!(syscall.get(&format!("vom.{}", vref)).is_none());
    assert!(syscall.get(&format!("vom.es.{}", vref)).is_none());
    assert_eq!(
        syscall.take_gc_actions(),
        vec![SyscallRecord::RetireExports(vec![vref])]
    );
}

#[test]
fn test_unreferenced_import_is_dropped_and_retired() {
    let (rt, syscall) = setup();
    let presence = rt.import("o-7").unwrap();
    assert!(presence.iface().contains("o-7"));
    drop(presence);

    syscall.take_log();
    let report = rt.bring_out_your_dead().unwrap();
    assert_eq!(report.dropped_imports, vec!["o-7".to_string()]);
    assert_eq!(report.retired_imports, vec!["o-7".to_string()]);
    assert_eq!(
        syscall.take_gc_actions(),
        vec![
            SyscallRecord::DropImports(vec!["o-7".to_string()]),
            SyscallRecord::RetireImports(vec!["o-7".to_string()]),
        ]
    );
}

#[test]
fn test_stored_import_is_kept_until_removed() {
    let (rt, syscall) = setup();
    let store = rt.make_map_store("imports", StoreOptions::new()).unwrap();
    let presence = rt.import("o-5").unwrap();
    store.init("p", &presence).unwrap();
    assert_eq!(rt.ref_count("o-5").unwrap(), 1);
    drop(presence);

    assert!(rt.bring_out_your_dead().unwrap().is_empty());
    assert_eq!(syscall.get("vom.rc.o-5").as_deref(), Some("1"));

    store.delete("p").unwrap();
    let report = rt.bring_out_your_dead().unwrap();
    assert_eq!(report.dropped_imports, vec!["o-5".to_string()]);
    assert_eq!(report.retired_imports, vec!["o-5".to_string()]);
    assert!(syscall.get("vom.rc.o-5").is_none());
}

#[test]
fn test_weakly_held_import_is_dropped_but_not_retired() {
    let (rt, syscall) = setup();
    let seen = rt.make_weak_set_store("seen", StoreOptions::new()).unwrap();
    let presence = rt.import("o-9").unwrap();
    seen.add(&presence).unwrap();
    assert!(rt.is_recognizable("o-9").unwrap());
    drop(presence);

    let report = rt.bring_out_your_dead().unwrap();
    assert_eq!(report.dropped_imports, vec!["o-9".to_string()]);
    assert!(report.retired_imports.is_empty());

    // the kernel retires it, which empties the weak set entry
    rt.retire_imports(&["o-9".to_string()]).unwrap();
    assert!(!rt.is_recognizable("o-9").unwrap());
    assert!(syscall.keys_with_prefix("vom.ir.o-9|").is_empty());

    let again = rt.import("o-9").unwrap();
    assert!(!seen.has(&again).unwrap());
}

#[test]
fn test_deleted_object_leaves_weak_collections() {
    let (rt, syscall) = setup();
    let thing_maker = define_thing(&rt);
    let notes = rt.make_weak_map_store("notes", StoreOptions::new()).unwrap();

    let thing = thing_maker.make(&[]).unwrap();
    let vref = thing.vref().unwrap();
    notes.init(&thing, "remember me").unwrap();
    assert_eq!(syscall.keys_with_prefix(&format!("vom.ir.{}|", vref)).len(), 1);

    // weak keys do not keep the object alive
    drop(thing);
    rt.bring_out_your_dead().unwrap();

    assert!(syscall.get(&format!("vom.{}", vref)).is_none());
    assert!(syscall.keys_with_prefix(&format!("vom.ir.{}|", vref)).is_empty());
    assert!(syscall.keys_with_prefix("vc.1.r").is_empty());
}

#[test]
fn test_local_objects_are_held_while_stored() {
    let (rt, _syscall) = setup();
    let store = rt.make_map_store("locals", StoreOptions::new()).unwrap();
    let local = Handle::far("local", FarBehavior::new().method("ping", |_| Ok("pong".into())));

    store.init("l", &local).unwrap();
    drop(local);
    rt.bring_out_your_dead().unwrap();
    assert_eq!(rt.retention_stats().remotable_refcounts, 1);

    let fetched = store.get("l").unwrap();
    assert_eq!(
        fetched.as_handle().unwrap().invoke("ping", &[]).unwrap(),
        "pong".into()
    );
    drop(fetched);

    store.delete("l").unwrap();
    rt.bring_out_your_dead().unwrap();
    let stats = rt.retention_stats();
    assert_eq!(stats.remotable_refcounts, 0);
    assert_eq!(stats.possibly_dead, 0);
}

#[test]
fn test_unreferenced_collection_is_deleted() {
    let (rt, syscall) = setup();
    let store = rt.make_map_store("temporary", StoreOptions::new()).unwrap();
    store.init("a", 1).unwrap();
    rt.end_turn().unwrap();
    assert!(!syscall.keys_with_prefix("vc.1.").is_empty());

    drop(store);
    rt.bring_out_your_dead().unwrap();
    assert!(syscall.keys_with_prefix("vc.1.").is_empty());
}

#[test]
fn test_dead_local_key_releases_weak_map_entry() {
    let (rt, syscall) = setup();
    let thing_maker = define_thing(&rt);
    let notes = rt.make_weak_map_store("notes", StoreOptions::new()).unwrap();

    let thing = thing_maker.make(&[]).unwrap();
    let thing_vref = thing.vref().unwrap();
    let local = Handle::far("local", FarBehavior::new());
    notes.init(&local, &thing).unwrap();
    let local_vref = local.vref().unwrap();
    assert_eq!(syscall.keys_with_prefix(&format!("vom.ir.{}|", local_vref)).len(), 1);
    assert_eq!(rt.ref_count(&thing_vref).unwrap(), 1);

    drop(thing);
    drop(local);
    rt.bring_out_your_dead().unwrap();

    assert!(syscall.keys_with_prefix("vc.1.r").is_empty());
    assert!(syscall.get(&format!("vc.1.|{}", local_vref)).is_none());
    assert!(syscall.keys_with_prefix(&format!("vom.ir.{}|", local_vref)).is_empty());
    assert!(syscall.get(&format!("vom.{}", thing_vref)).is_none());
    assert!(syscall.get(&format!("vom.rc.{}", thing_vref)).is_none());
    assert!(rt.bring_out_your_dead().unwrap().is_empty());
}

#[test]
fn test_import_in_dropped_weak_set_is_retired_once() {
    let (rt, _syscall) = setup();
    let seen = rt.make_weak_set_store("seen", StoreOptions::new()).unwrap();
    let presence = rt.import("o-9").unwrap();
    seen.add(&presence).unwrap();
    drop(presence);
    drop(seen);

    let first = rt.bring_out_your_dead().unwrap();
    assert_eq!(first.dropped_imports, vec!["o-9".to_string()]);
    assert_eq!(first.retired_imports, vec!["o-9".to_string()]);
    assert!(rt.bring_out_your_dead().unwrap().is_empty());
}

#[test]
fn test_weakly_keyed_export_is_retired_once() {
    let (rt, syscall) = setup();
    let thing_maker = define_thing(&rt);
    let notes = rt.make_weak_map_store("notes", StoreOptions::new()).unwrap();

    let thing = thing_maker.make(&[]).unwrap();
    let vref = rt.export(&thing).unwrap();
    notes.init(&thing, "noted").unwrap();
    rt.drop_exports(&[vref.clone()]).unwrap();
    drop(thing);

    syscall.take_log();
    let first = rt.bring_out_your_dead().unwrap();
    let second = rt.bring_out_your_dead().unwrap();
    assert_eq!(first.retired_exports, vec![vref.clone()]);
    assert!(second.is_empty());
    assert_eq!(
        syscall.take_gc_actions(),
        vec![SyscallRecord::RetireExports(vec![vref.clone()])]
    );
    assert!(syscall.keys_with_prefix(&format!("vom.ir.{}|", vref)).is_empty());
    assert!(syscall.keys_with_prefix("vc.1.r").is_empty());
}

#[test]
fn test_in_memory_weak_map_keeps_imports_across_representatives() {
    let (rt, syscall) = setup();
    let seen = rt.make_vo_aware_weak_map();
    let presence = rt.import("o-12").unwrap();
    seen.set(&presence, "peer").unwrap();
    assert!(rt.is_recognizable("o-12").unwrap());
    assert!(syscall.keys_with_prefix("vom.ir.").is_empty());
    drop(presence);

    let again = rt.import("o-12").unwrap();
    assert_eq!(seen.get(&again).unwrap(), Some("peer".into()));
    drop(again);

    let report = rt.bring_out_your_dead().unwrap();
    assert_eq!(report.dropped_imports, vec!["o-12".to_string()]);
    assert!(report.retired_imports.is_empty());

    rt.retire_imports(&["o-12".to_string()]).unwrap();
    assert!(!rt.is_recognizable("o-12").unwrap());
    assert!(seen.is_empty());
}

#[test]
fn test_in_memory_weak_set_forgets_deleted_objects() {
    let (rt, syscall) = setup();
    let thing_maker = define_thing(&rt);
    let marks = rt.make_vo_aware_weak_set();

    let thing = thing_maker.make(&[]).unwrap();
    let vref = thing.vref().unwrap();
    marks.add(&thing).unwrap();
    assert!(rt.is_recognizable(&vref).unwrap());

    // a fresh representative is the same key
    drop(thing);
    let thing = rt.import(&vref).unwrap();
    assert!(marks.has(&thing).unwrap());
    drop(thing);

    rt.bring_out_your_dead().unwrap();
    assert!(syscall.get(&format!("vom.{}", vref)).is_none());
    assert!(marks.is_empty());
    assert!(!rt.is_recognizable(&vref).unwrap());
}

#[test]
fn test_dropping_in_memory_weak_map_lets_import_retire() {
    let (rt, _syscall) = setup();
    let seen = rt.make_vo_aware_weak_map();
    let presence = rt.import("o-13").unwrap();
    seen.set(&presence, 1).unwrap();
    assert!(seen.delete(&presence).unwrap());
    assert!(!seen.delete(&presence).unwrap());
    seen.set(&presence, 2).unwrap();
    drop(presence);
    drop(seen);

    let report = rt.bring_out_your_dead().unwrap();
    assert_eq!(report.dropped_imports, vec!["o-13".to_string()]);
    assert_eq!(report.retired_imports, vec!["o-13".to_string()]);
}
