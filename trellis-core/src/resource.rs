//! Resource state machines and their reflection-free dispatch.
//!
//! A resource type implements [`ResourceState`] and declares its operations
//! once through an [`Operations`] table: each entry pairs an
//! [`OperationDescriptor`] with a typed handler closure. The table is turned
//! into a [`ResourceExecutor`], which the dispatcher only sees through the
//! object-safe [`ManagedResource`] trait.
//!
//! Handlers are strictly synchronous and deterministic. They never read
//! wall-clock time: [`Context::time`] is log time, and every delayed effect
//! goes through the executor's [`Scheduler`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::{OperationDescriptor, ResourceDescriptor};
use crate::error::{Error, Result};
use crate::invoker::ResourceFacade;
use crate::operation::{OperationId, OperationKind, ResourceTypeId, SessionId};
use crate::scheduler::{Scheduler, TimerId};

/// Read-only view of session liveness handed to resources during apply.
pub trait SessionView {
    fn is_alive(&self, session: SessionId) -> bool;
}

/// An event produced during apply, addressed to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publish {
    pub session: SessionId,
    pub event: String,
    pub payload: Value,
}

/// Everything a resource needs from the dispatcher for one apply step.
pub struct Env<'a> {
    pub index: u64,
    pub time: u64,
    pub sessions: &'a dyn SessionView,
    pub events: &'a mut Vec<Publish>,
}

/// Log position a query is evaluated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Clock {
    pub index: u64,
    pub time: u64,
}

/// Reusable frame describing one committed resource operation.
#[derive(Debug, Default)]
pub struct Commit {
    pub index: u64,
    pub time: u64,
    pub session: SessionId,
    pub operation: OperationId,
    pub args: Value,
}

impl Commit {
    pub fn reset(&mut self) {
        self.index = 0;
        self.time = 0;
        self.session = 0;
        self.operation = 0;
        self.args = Value::Null;
    }
}

/// Handler-side view of the apply step.
pub struct Context<'a, T> {
    index: u64,
    time: u64,
    session: SessionId,
    timers: &'a mut Scheduler<T>,
    sessions: &'a dyn SessionView,
    events: &'a mut Vec<Publish>,
}

impl<'a, T> Context<'a, T> {
    /// Log index of the entry being applied.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Log time in milliseconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Session that submitted the command; `0` for timer and session-loss callbacks.
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn schedule(&mut self, delay_ms: u64, timer: T) -> TimerId {
        self.timers.schedule(self.time.saturating_add(delay_ms), timer)
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id).is_some()
    }

    pub fn is_alive(&self, session: SessionId) -> bool {
        self.sessions.is_alive(session)
    }

    pub fn publish(&mut self, session: SessionId, event: &str, payload: impl Serialize) {
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        self.events.push(Publish {
            session,
            event: event.to_string(),
            payload,
        });
    }
}

/// A deterministic resource state machine.
pub trait ResourceState: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    /// Payload of the timers this resource schedules.
    type Timer: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Client facade handed out for instances of this type.
    type Facade: ResourceFacade;

    const TYPE_ID: ResourceTypeId;
    const TYPE_NAME: &'static str;

    fn create(config: &Value) -> Result<Self>;

    fn operations() -> Operations<Self>;

    fn on_timer(&mut self, _ctx: &mut Context<'_, Self::Timer>, _timer: Self::Timer) {}

    /// Called once when a session expires or is closed.
    fn on_session_lost(&mut self, _ctx: &mut Context<'_, Self::Timer>, _session: SessionId) {}
}

/// Argument type for operations that take no parameters.
#[derive(Debug, Default, Deserialize)]
pub struct NoArgs {}

type CommandFn<S> = Box<
    dyn Fn(&mut S, &mut Context<'_, <S as ResourceState>::Timer>, Value) -> Result<Value>
        + Send
        + Sync,
>;
type QueryFn<S> = Box<dyn Fn(&S, Clock, Value) -> Result<Value> + Send + Sync>;

enum Handler<S: ResourceState> {
    Command(CommandFn<S>),
    Query(QueryFn<S>),
}

/// Operation table of a resource type: descriptors plus typed handlers.
pub struct Operations<S: ResourceState> {
    descriptor: ResourceDescriptor,
    handlers: HashMap<OperationId, Handler<S>>,
    error: Option<Error>,
}

impl<S: ResourceState> Default for Operations<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ResourceState> Operations<S> {
    pub fn new() -> Self {
        Self {
            descriptor: ResourceDescriptor::new(S::TYPE_NAME),
            handlers: HashMap::new(),
            error: None,
        }
    }

    pub fn command<A, R, F>(self, op: OperationDescriptor, f: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&mut S, &mut Context<'_, S::Timer>, A) -> Result<R> + Send + Sync + 'static,
    {
        let name = op.name;
        let kind = op.kind;
        let handler: CommandFn<S> = Box::new(
            move |state: &mut S, ctx: &mut Context<'_, S::Timer>, args: Value| {
                let args = decode::<A>(name, args)?;
                encode(f(state, ctx, args)?)
            },
        );
        self.insert(op, kind == OperationKind::Command, Handler::Command(handler))
    }

    pub fn query<A, R, F>(self, op: OperationDescriptor, f: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&S, Clock, A) -> Result<R> + Send + Sync + 'static,
    {
        let name = op.name;
        let kind = op.kind;
        let handler: QueryFn<S> = Box::new(move |state: &S, clock: Clock, args: Value| {
            let args = decode::<A>(name, args)?;
            encode(f(state, clock, args)?)
        });
        self.insert(op, kind == OperationKind::Query, Handler::Query(handler))
    }

    fn insert(mut self, op: OperationDescriptor, kind_matches: bool, handler: Handler<S>) -> Self {
        if self.error.is_some() {
            return self;
        }
        if !kind_matches {
            self.error = Some(Error::internal(format!(
                "operation {} on {} registered with the wrong kind",
                op.name,
                S::TYPE_NAME
            )));
            return self;
        }
        let id = op.id;
        match self.descriptor.push(op) {
            Ok(()) => {
                self.handlers.insert(id, handler);
            }
            Err(e) => self.error = Some(e),
        }
        self
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// Surface the first registration error, if any.
    pub fn validate(self) -> Result<Self> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

fn decode<A: DeserializeOwned>(op: &str, args: Value) -> Result<A> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| Error::bad_request(format!("invalid arguments for '{}': {}", op, e)))
}

fn encode<R: Serialize>(result: R) -> Result<Value> {
    serde_json::to_value(result).map_err(Error::internal)
}

/// Object-safe face of a live resource instance.
pub trait ManagedResource: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Apply a committed operation.
    fn execute(&mut self, env: &mut Env<'_>, commit: &mut Commit) -> Result<Value>;

    /// Evaluate a read-only operation against the current state.
    fn query(&self, clock: Clock, operation: OperationId, args: Value) -> Result<Value>;

    fn next_deadline(&self) -> Option<u64>;

    /// Fire the earliest timer due at `env.time`. Returns `false` if none was due.
    fn fire_next(&mut self, env: &mut Env<'_>) -> bool;

    fn session_lost(&mut self, env: &mut Env<'_>, session: SessionId);

    fn snapshot(&self) -> Result<Value>;
}

/// Binds a [`ResourceState`] to its operation table and scheduler.
pub struct ResourceExecutor<S: ResourceState> {
    ops: Arc<Operations<S>>,
    state: S,
    timers: Scheduler<S::Timer>,
}

#[derive(Serialize)]
#[serde(bound = "")]
struct ExecutorStateRef<'a, S: ResourceState> {
    state: &'a S,
    timers: &'a Scheduler<S::Timer>,
}

#[derive(Deserialize)]
#[serde(bound = "")]
struct ExecutorState<S: ResourceState> {
    state: S,
    timers: Scheduler<S::Timer>,
}

impl<S: ResourceState> ResourceExecutor<S> {
    pub fn new(ops: Arc<Operations<S>>, state: S) -> Self {
        Self {
            ops,
            state,
            timers: Scheduler::new(),
        }
    }

    pub fn restore(ops: Arc<Operations<S>>, snapshot: Value) -> Result<Self> {
        let restored: ExecutorState<S> = serde_json::from_value(snapshot).map_err(|e| {
            Error::internal(format!("corrupt {} snapshot: {}", S::TYPE_NAME, e))
        })?;
        Ok(Self {
            ops,
            state: restored.state,
            timers: restored.timers,
        })
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn context<'a>(
        timers: &'a mut Scheduler<S::Timer>,
        env: &'a mut Env<'_>,
        session: SessionId,
    ) -> Context<'a, S::Timer> {
        Context {
            index: env.index,
            time: env.time,
            session,
            timers,
            sessions: env.sessions,
            events: &mut *env.events,
        }
    }
}

impl<S: ResourceState> ManagedResource for ResourceExecutor<S> {
    fn type_name(&self) -> &'static str {
        S::TYPE_NAME
    }

    fn execute(&mut self, env: &mut Env<'_>, commit: &mut Commit) -> Result<Value> {
        let args = std::mem::take(&mut commit.args);
        match self.ops.handlers.get(&commit.operation) {
            Some(Handler::Command(f)) => {
                let mut ctx = Self::context(&mut self.timers, env, commit.session);
                f(&mut self.state, &mut ctx, args)
            }
            Some(Handler::Query(f)) => f(
                &self.state,
                Clock {
                    index: env.index,
                    time: env.time,
                },
                args,
            ),
            None => Err(Error::UnknownOperation(format!(
                "{} on {}",
                commit.operation,
                S::TYPE_NAME
            ))),
        }
    }

    fn query(&self, clock: Clock, operation: OperationId, args: Value) -> Result<Value> {
        match self.ops.handlers.get(&operation) {
            Some(Handler::Query(f)) => f(&self.state, clock, args),
            Some(Handler::Command(_)) => Err(Error::bad_request(format!(
                "operation {} on {} is a command",
                operation,
                S::TYPE_NAME
            ))),
            None => Err(Error::UnknownOperation(format!(
                "{} on {}",
                operation,
                S::TYPE_NAME
            ))),
        }
    }

    fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    fn fire_next(&mut self, env: &mut Env<'_>) -> bool {
        match self.timers.pop_due(env.time) {
            Some((_, timer)) => {
                let mut ctx = Self::context(&mut self.timers, env, 0);
                self.state.on_timer(&mut ctx, timer);
                true
            }
            None => false,
        }
    }

    fn session_lost(&mut self, env: &mut Env<'_>, session: SessionId) {
        let mut ctx = Self::context(&mut self.timers, env, 0);
        self.state.on_session_lost(&mut ctx, session);
    }

    fn snapshot(&self) -> Result<Value> {
        serde_json::to_value(ExecutorStateRef::<S> {
            state: &self.state,
            timers: &self.timers,
        })
        .map_err(Error::internal)
    }
}
