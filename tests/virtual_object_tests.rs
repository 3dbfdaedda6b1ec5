//! Integration tests for virtual kinds, instance state and facets

use vobjstore::{
    Behavior, FarBehavior, Handle, KindOptions, MemorySyscall, Pattern, RuntimeConfig, StoreError,
    StoreOptions, Value, VirtualRuntime,
};

fn setup() -> (VirtualRuntime, MemorySyscall) {
    let syscall = MemorySyscall::new();
    let rt = VirtualRuntime::new(syscall.clone(), RuntimeConfig::default()).unwrap();
    (rt, syscall)
}

fn counter_behavior() -> Behavior {
    Behavior::new()
        .method("increment", |ctx, args| {
            let by = args.first().and_then(Value::as_i64).unwrap_or(1);
            let count = ctx.state().get("count")?.as_i64().unwrap_or(0) + by;
            ctx.state().set("count", count)?;
            Ok(count.into())
        })
        .method("read", |ctx, _| ctx.state().get("count"))
}

fn counter_init(args: &[Value]) -> vobjstore::Result<Value> {
    let start = args.first().cloned().unwrap_or(Value::Integer(0));
    Ok(Value::record([("count", start)]))
}

#[test]
fn test_state_get_and_set() {
    let (rt, _syscall) = setup();
    let maker = rt
        .define_kind("counter", counter_init, counter_behavior(), KindOptions::new())
        .unwrap();

    let counter = maker.make(&[5.into()]).unwrap();
    assert_eq!(counter.invoke("read", &[]).unwrap(), 5.into());
    assert_eq!(counter.invoke("increment", &[3.into()]).unwrap(), 8.into());
    assert_eq!(counter.invoke("increment", &[]).unwrap(), 9.into());
    assert_eq!(counter.iface(), "counter");

    let missing = counter.invoke("reset", &[]);
    assert!(matches!(missing, Err(StoreError::Method(_))));
}

#[test]
fn test_instances_have_independent_state() {
    let (rt, _syscall) = setup();
    let maker = rt
        .define_kind("counter", counter_init, counter_behavior(), KindOptions::new())
        .unwrap();

    let a = maker.make(&[]).unwrap();
    let b = maker.make(&[100.into()]).unwrap();
    a.invoke("increment", &[]).unwrap();

    assert_eq!(a.invoke("read", &[]).unwrap(), 1.into());
    assert_eq!(b.invoke("read", &[]).unwrap(), 100.into());
    assert_ne!(a.vref(), b.vref());
    assert!(maker.is_instance(&a, None).unwrap());
}

#[test]
fn test_state_is_written_at_end_of_turn() {
    let (rt, syscall) = setup();
    let maker = rt
        .define_kind("counter", counter_init, counter_behavior(), KindOptions::new())
        .unwrap();
    let counter = maker.make(&[2.into()]).unwrap();
    counter.invoke("increment", &[]).unwrap();
    rt.end_turn().unwrap();

    let vref = counter.vref().unwrap();
    let raw = syscall.get(&format!("vom.{}", vref)).unwrap();
    let stored: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(stored.get("count").is_some());
}

#[test]
fn test_state_survives_losing_the_representative() {
    let (rt, _syscall) = setup();
    let maker = rt
        .define_kind("counter", counter_init, counter_behavior(), KindOptions::new())
        .unwrap();
    let holder = rt.make_map_store("holder", StoreOptions::new()).unwrap();

    let counter = maker.make(&[7.into()]).unwrap();
    counter.invoke("increment", &[]).unwrap();
    holder.init("c", &counter).unwrap();
    drop(counter);
    rt.bring_out_your_dead().unwrap();

    // the store kept it alive, and a fresh representative sees the same state
    let again = holder.get("c").unwrap();
    let again = again.as_handle().unwrap();
    assert_eq!(again.invoke("read", &[]).unwrap(), 8.into());
}

#[test]
fn test_state_shape_is_enforced() {
    let (rt, _syscall) = setup();
    let options = KindOptions::new().state_shape([("count", Pattern::integer())]);
    let maker = rt
        .define_kind(
            "strict",
            counter_init,
            counter_behavior().method("corrupt", |ctx, _| {
                ctx.state().set("count", "many")?;
                Ok(Value::Null)
            }),
            options,
        )
        .unwrap();

    let strict = maker.make(&[]).unwrap();
    assert!(matches!(
        strict.invoke("corrupt", &[]),
        Err(StoreError::TypeMismatch(_))
    ));
    assert_eq!(strict.invoke("read", &[]).unwrap(), 0.into());

    // init must only produce shaped properties
    let extra = rt
        .define_kind(
            "extra",
            |_| Ok(Value::record([("count", 0.into()), ("other", 1.into())])),
            counter_behavior(),
            KindOptions::new().state_shape([("count", Pattern::integer())]),
        )
        .unwrap();
    assert!(matches!(extra.make(&[]), Err(StoreError::StateAccess(_))));
}

#[test]
fn test_unknown_state_property() {
    let (rt, _syscall) = setup();
    let maker = rt
        .define_kind(
            "closed",
            counter_init,
            Behavior::new().method("peek", |ctx, _| ctx.state().get("missing")),
            KindOptions::new(),
        )
        .unwrap();
    let closed = maker.make(&[]).unwrap();
    assert!(matches!(
        closed.invoke("peek", &[]),
        Err(StoreError::StateAccess(_))
    ));
}

#[test]
fn test_init_must_return_a_record() {
    let (rt, _syscall) = setup();
    let maker = rt
        .define_kind("bad", |_| Ok(Value::Integer(3)), counter_behavior(), KindOptions::new())
        .unwrap();
    assert!(matches!(maker.make(&[]), Err(StoreError::InvalidBehavior(_))));
}

#[test]
fn test_finish_runs_once_with_context() {
    let (rt, _syscall) = setup();
    let options = KindOptions::new().finish(|ctx| {
        let count = ctx.state().get("count")?.as_i64().unwrap_or(0);
        ctx.state().set("count", count + 1000)
    });
    let maker = rt
        .define_kind("finished", counter_init, counter_behavior(), options)
        .unwrap();
    let finished = maker.make(&[1.into()]).unwrap();
    assert_eq!(finished.invoke("read", &[]).unwrap(), 1001.into());
}

#[test]
fn test_invalid_behaviors_are_rejected() {
    let (rt, _syscall) = setup();

    let data_prop = Behavior::new().data("answer", 42);
    assert!(matches!(
        rt.define_kind("data", counter_init, data_prop, KindOptions::new()),
        Err(StoreError::InvalidBehavior(_))
    ));

    let mixed = counter_behavior().facet("extra", counter_behavior());
    assert!(matches!(
        rt.define_kind_multi("mixed", counter_init, mixed, KindOptions::new()),
        Err(StoreError::InvalidBehavior(_))
    ));

    // single-facet behavior handed to a multi-facet definition
    assert!(matches!(
        rt.define_kind_multi("flat", counter_init, counter_behavior(), KindOptions::new()),
        Err(StoreError::InvalidBehavior(_))
    ));
}

fn kit_behavior() -> Behavior {
    Behavior::new()
        .facet(
            "incr",
            Behavior::new().method("step", |ctx, _| {
                let count = ctx.state().get("count")?.as_i64().unwrap_or(0) + 1;
                ctx.state().set("count", count)?;
                Ok(count.into())
            }),
        )
        .facet(
            "read",
            Behavior::new().method("get", |ctx, _| ctx.state().get("count")),
        )
}

#[test]
fn test_multi_facet_kit() {
    let (rt, _syscall) = setup();
    let maker = rt
        .define_kind_multi("kit", counter_init, kit_behavior(), KindOptions::new())
        .unwrap();
    assert!(maker.is_multifaceted());
    assert!(matches!(maker.make(&[]), Err(StoreError::InvalidBehavior(_))));

    let kit = maker.make_kit(&[]).unwrap();
    assert_eq!(kit.names(), ["incr".to_string(), "read".to_string()]);

    let incr = kit.get("incr").unwrap();
    let read = kit.get("read").unwrap();
    assert!(incr.same_cohort(&read));
    assert_ne!(incr, read);

    incr.invoke("step", &[]).unwrap();
    incr.invoke("step", &[]).unwrap();
    assert_eq!(read.invoke("get", &[]).unwrap(), 2.into());

    // each facet answers only its own methods
    assert!(matches!(read.invoke("step", &[]), Err(StoreError::Method(_))));

    let vref = incr.vref().unwrap();
    assert!(vref.ends_with(":0"));
    assert!(read.vref().unwrap().ends_with(":1"));
}

#[test]
fn test_amplify_and_is_instance() {
    let (rt, _syscall) = setup();
    let maker = rt
        .define_kind_multi("kit", counter_init, kit_behavior(), KindOptions::new())
        .unwrap();
    let other = rt
        .define_kind("counter", counter_init, counter_behavior(), KindOptions::new())
        .unwrap();

    let kit = maker.make_kit(&[]).unwrap();
    let read = kit.get("read").unwrap();

    let amplified = maker.amplify(&read).unwrap();
    let incr = amplified.get("incr").unwrap();
    incr.invoke("step", &[]).unwrap();
    assert_eq!(read.invoke("get", &[]).unwrap(), 1.into());

    assert!(maker.is_instance(&read, None).unwrap());
    assert!(maker.is_instance(&read, Some("read")).unwrap());
    assert!(!maker.is_instance(&read, Some("incr")).unwrap());
    assert!(matches!(
        maker.is_instance(&read, Some("nope")),
        Err(StoreError::InvalidBehavior(_))
    ));

    let stranger = other.make(&[]).unwrap();
    assert!(!maker.is_instance(&stranger, None).unwrap());
    assert!(matches!(
        maker.amplify(&stranger),
        Err(StoreError::FacetMismatch(_))
    ));
    assert!(matches!(
        other.amplify(&stranger),
        Err(StoreError::InvalidBehavior(_))
    ));
    assert!(matches!(
        other.is_instance(&stranger, Some("read")),
        Err(StoreError::InvalidBehavior(_))
    ));
}

#[test]
fn test_facets_reach_each_other_through_context() {
    let (rt, _syscall) = setup();
    let behavior = Behavior::new()
        .facet(
            "left",
            Behavior::new().method("poke_right", |ctx, _| {
                let facets = ctx.facets().expect("multi-facet context");
                facets.get("right").expect("right facet").invoke("value", &[])
            }),
        )
        .facet(
            "right",
            Behavior::new().method("value", |_, _| Ok("from right".into())),
        );
    let maker = rt
        .define_kind_multi("pair", |_| Ok(Value::record::<&str, _>([])), behavior, KindOptions::new())
        .unwrap();
    let kit = maker.make_kit(&[]).unwrap();
    assert_eq!(
        kit.get("left").unwrap().invoke("poke_right", &[]).unwrap(),
        "from right".into()
    );
}

#[test]
fn test_self_reference_through_context() {
    let (rt, _syscall) = setup();
    let behavior = Behavior::new().method("me", |ctx, _| {
        let me = ctx.self_ref().expect("single-facet context");
        Ok(Value::Ref(me.clone()))
    });
    let maker = rt
        .define_kind("selfish", |_| Ok(Value::record::<&str, _>([])), behavior, KindOptions::new())
        .unwrap();
    let selfish = maker.make(&[]).unwrap();
    assert_eq!(selfish.invoke("me", &[]).unwrap(), Value::Ref(selfish.clone()));
}

#[test]
fn test_symbol_methods() {
    let (rt, _syscall) = setup();
    let behavior = Behavior::new().symbol_method("asyncIterator", |_, _| Ok("iter".into()));
    let maker = rt
        .define_kind("iterable", |_| Ok(Value::record::<&str, _>([])), behavior, KindOptions::new())
        .unwrap();
    let iterable = maker.make(&[]).unwrap();
    assert_eq!(iterable.invoke_symbol("asyncIterator", &[]).unwrap(), "iter".into());
    assert!(iterable.invoke("asyncIterator", &[]).is_err());
}

#[test]
fn test_labelled_instances() {
    let syscall = MemorySyscall::new();
    let rt = VirtualRuntime::new(syscall, RuntimeConfig::new().label_instances(true)).unwrap();
    let maker = rt
        .define_kind("counter", counter_init, counter_behavior(), KindOptions::new())
        .unwrap();
    let counter = maker.make(&[]).unwrap();
    let vref = counter.vref().unwrap();
    assert_eq!(counter.iface(), format!("counter#{}", vref));
}

#[test]
fn test_virtual_instances_are_not_durable() {
    let (rt, _syscall) = setup();
    let maker = rt
        .define_kind("counter", counter_init, counter_behavior(), KindOptions::new())
        .unwrap();
    let counter = maker.make(&[]).unwrap();
    let durable = rt.make_map_store("durable", StoreOptions::new().durable()).unwrap();

    assert!(!rt.can_be_durable(&Value::Ref(counter.clone())).unwrap());
    assert!(matches!(
        durable.init("c", &counter),
        Err(StoreError::NotDurable(_))
    ));
    assert!(rt.can_be_durable(&Value::from("plain data")).unwrap());
}

#[test]
fn test_instance_state_holds_references() {
    let (rt, _syscall) = setup();
    let behavior = Behavior::new()
        .method("friend", |ctx, _| ctx.state().get("friend"))
        .method("befriend", |ctx, args| {
            ctx.state().set("friend", args[0].clone())?;
            Ok(Value::Null)
        });
    let maker = rt
        .define_kind(
            "person",
            |_| Ok(Value::record([("friend", Value::Null)])),
            behavior,
            KindOptions::new(),
        )
        .unwrap();

    let alice = maker.make(&[]).unwrap();
    let bob = maker.make(&[]).unwrap();
    let bob_vref = bob.vref().unwrap();

    alice.invoke("befriend", &[Value::Ref(bob.clone())]).unwrap();
    assert_eq!(rt.ref_count(&bob_vref).unwrap(), 1);
    assert_eq!(
        alice.invoke("friend", &[]).unwrap(),
        Value::Ref(bob.clone())
    );

    let remote = Handle::far("remote", FarBehavior::new());
    alice.invoke("befriend", &[Value::Ref(remote)]).unwrap();
    assert_eq!(rt.ref_count(&bob_vref).unwrap(), 0);
}
