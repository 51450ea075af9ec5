#[cfg(test)]
use crate::descriptor::{OperationDescriptor, ParamType};
#[cfg(test)]
use crate::error::{Error, Result};
#[cfg(test)]
use crate::registry::{ResourceRegistry, ResourceType};
#[cfg(test)]
use crate::resource::{
    Clock, Commit, Context, Env, ManagedResource, NoArgs, Operations, Publish, ResourceState,
    SessionView,
};
#[cfg(test)]
use crate::operation::SessionId;
#[cfg(test)]
use serde::{Deserialize, Serialize};
#[cfg(test)]
use serde_json::{json, Value};

/// Counter that resets itself after a delay.
#[cfg(test)]
#[derive(Debug, Default, Serialize, Deserialize)]
struct Resettable {
    value: i64,
}

#[cfg(test)]
#[derive(Deserialize)]
struct AddArgs {
    delta: i64,
    #[serde(default)]
    reset_after: u64,
}

#[cfg(test)]
impl ResourceState for Resettable {
    type Timer = i64;
    type Facade = crate::ResourceHandle;
    const TYPE_ID: i32 = 99;
    const TYPE_NAME: &'static str = "resettable";

    fn create(config: &Value) -> Result<Self> {
        Ok(Self {
            value: config.get("initial").and_then(Value::as_i64).unwrap_or(0),
        })
    }

    fn operations() -> Operations<Self> {
        Operations::new()
            .command(
                OperationDescriptor::command(1, "add")
                    .arg("delta", ParamType::Integer)
                    .opt("reset_after", ParamType::Integer),
                |s: &mut Self, ctx: &mut Context<'_, i64>, args: AddArgs| {
                    s.value += args.delta;
                    if args.reset_after > 0 {
                        ctx.schedule(args.reset_after, 0);
                    }
                    ctx.publish(ctx.session(), "changed", s.value);
                    Ok(s.value)
                },
            )
            .query(
                OperationDescriptor::query(2, "get"),
                |s: &Self, _clock: Clock, _: NoArgs| Ok(s.value),
            )
    }

    fn on_timer(&mut self, _ctx: &mut Context<'_, i64>, timer: i64) {
        self.value = timer;
    }
}

#[cfg(test)]
struct AllAlive;

#[cfg(test)]
impl SessionView for AllAlive {
    fn is_alive(&self, _session: SessionId) -> bool {
        true
    }
}

#[cfg(test)]
fn apply(
    resource: &mut Box<dyn ManagedResource>,
    index: u64,
    time: u64,
    operation: i32,
    args: Value,
) -> (Result<Value>, Vec<Publish>) {
    let mut events = Vec::new();
    let mut env = Env {
        index,
        time,
        sessions: &AllAlive,
        events: &mut events,
    };
    let mut commit = Commit {
        index,
        time,
        session: 7,
        operation,
        args,
    };
    let result = resource.execute(&mut env, &mut commit);
    (result, events)
}

#[test]
fn typed_handlers_dispatch_by_operation_id() {
    let t = ResourceType::of::<Resettable>().unwrap();
    let mut r = t.create(&json!({"initial": 10})).unwrap();

    let (result, events) = apply(&mut r, 1, 0, 1, json!({"delta": 5}));
    assert_eq!(result.unwrap(), json!(15));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].session, 7);
    assert_eq!(events[0].event, "changed");

    assert_eq!(r.query(Clock::default(), 2, Value::Null).unwrap(), json!(15));
    assert!(matches!(
        apply(&mut r, 2, 0, 42, json!({})).0,
        Err(Error::UnknownOperation(_))
    ));
    assert!(matches!(
        apply(&mut r, 3, 0, 1, json!({"delta": "many"})).0,
        Err(Error::BadRequest(_))
    ));
}

#[test]
fn timers_fire_only_once_log_time_passes_deadline() {
    let t = ResourceType::of::<Resettable>().unwrap();
    let mut r = t.create(&Value::Null).unwrap();
    apply(&mut r, 1, 1_000, 1, json!({"delta": 3, "reset_after": 100})).0.unwrap();
    assert_eq!(r.next_deadline(), Some(1_100));

    let mut events = Vec::new();
    let mut env = Env {
        index: 2,
        time: 1_099,
        sessions: &AllAlive,
        events: &mut events,
    };
    assert!(!r.fire_next(&mut env));
    env.time = 1_100;
    assert!(r.fire_next(&mut env));
    assert_eq!(r.query(Clock::default(), 2, Value::Null).unwrap(), json!(0));
}

#[test]
fn snapshot_round_trip_keeps_pending_timers() {
    let t = ResourceType::of::<Resettable>().unwrap();
    let mut r = t.create(&Value::Null).unwrap();
    apply(&mut r, 1, 0, 1, json!({"delta": 4, "reset_after": 50})).0.unwrap();

    let restored = t.restore(r.snapshot().unwrap()).unwrap();
    assert_eq!(restored.next_deadline(), Some(50));
    assert_eq!(restored.query(Clock::default(), 2, Value::Null).unwrap(), json!(4));
}

#[test]
fn registry_rejects_duplicate_types() {
    let err = ResourceRegistry::new(vec![
        ResourceType::of::<Resettable>().unwrap(),
        ResourceType::of::<Resettable>().unwrap(),
    ])
    .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));

    let registry = ResourceRegistry::new(vec![ResourceType::of::<Resettable>().unwrap()]).unwrap();
    assert_eq!(registry.resolve("resettable").unwrap().id, 99);
    assert_eq!(registry.resolve("99").unwrap().name, "resettable");
    assert!(registry.resolve("nope").is_err());
}
