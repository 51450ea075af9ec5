//! Replicated atomic value with optional TTL and change listeners.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trellis_core::descriptor::{HttpVerb, OperationDescriptor, ParamType};
use trellis_core::invoker::ResourceFacade;
use trellis_core::resource::{Clock, Context, NoArgs, Operations, ResourceState};
use trellis_core::scheduler::TimerId;
use trellis_core::value::same;
use trellis_core::{
    CompactionMode, Invoker, ResourceHandle, ResourceId, Result, SessionEvent, SessionId,
};

use crate::listeners::Listeners;
use crate::{expiry, live};

pub mod ops {
    use trellis_core::OperationId;

    pub const COMPARE_AND_SET: OperationId = -110;
    pub const GET: OperationId = -111;
    pub const GET_AND_SET: OperationId = -112;
    pub const SET: OperationId = -113;
    pub const REGISTER: OperationId = -121;
    pub const UNREGISTER: OperationId = -122;
}

/// Event name published to listeners when the value changes.
pub const CHANGE_EVENT: &str = "change";

/// Payload of a [`CHANGE_EVENT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChange {
    pub old: Value,
    pub new: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expire {
    index: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ValueState {
    value: Value,
    /// Index of the command that last wrote the value.
    index: u64,
    expire_at: Option<u64>,
    timer: Option<TimerId>,
    listeners: Listeners,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetArgs {
    pub value: Value,
    #[serde(default)]
    pub ttl: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompareAndSetArgs {
    #[serde(default)]
    pub expect: Value,
    pub update: Value,
    #[serde(default)]
    pub ttl: i64,
}

impl ValueState {
    fn current(&self, now: u64) -> Value {
        if live(self.expire_at, now) {
            self.value.clone()
        } else {
            Value::Null
        }
    }

    /// Store `value`, publishing a change event if it differs from the old one.
    fn store(&mut self, ctx: &mut Context<'_, Expire>, value: Value, ttl: i64) -> Value {
        let old = self.current(ctx.time());
        if let Some(t) = self.timer.take() {
            ctx.cancel(t);
        }

        let index = ctx.index();
        self.expire_at = expiry(ctx.time(), ttl);
        self.timer = self
            .expire_at
            .map(|_| ctx.schedule(ttl as u64, Expire { index }));
        self.index = index;
        self.value = value;

        self.changed(ctx, &old);
        old
    }

    fn changed(&self, ctx: &mut Context<'_, Expire>, old: &Value) {
        if self.listeners.is_empty() || same(old, &self.value) {
            return;
        }
        let change = ValueChange {
            old: old.clone(),
            new: self.value.clone(),
        };
        self.listeners.notify(ctx, CHANGE_EVENT, &change);
    }

    fn set(&mut self, ctx: &mut Context<'_, Expire>, args: SetArgs) -> Result<()> {
        self.store(ctx, args.value, args.ttl);
        Ok(())
    }

    fn get_and_set(&mut self, ctx: &mut Context<'_, Expire>, args: SetArgs) -> Result<Value> {
        Ok(self.store(ctx, args.value, args.ttl))
    }

    fn compare_and_set(
        &mut self,
        ctx: &mut Context<'_, Expire>,
        args: CompareAndSetArgs,
    ) -> Result<bool> {
        if !same(&self.current(ctx.time()), &args.expect) {
            return Ok(false);
        }
        self.store(ctx, args.update, args.ttl);
        Ok(true)
    }

    fn register(&mut self, ctx: &mut Context<'_, Expire>, _: NoArgs) -> Result<bool> {
        Ok(self.listeners.register(ctx.session()))
    }

    fn unregister(&mut self, ctx: &mut Context<'_, Expire>, _: NoArgs) -> Result<bool> {
        Ok(self.listeners.unregister(ctx.session()))
    }

    fn get(&self, clock: Clock, _: NoArgs) -> Result<Value> {
        Ok(self.current(clock.time))
    }
}

fn ttl_command(id: i32, name: &'static str) -> OperationDescriptor {
    OperationDescriptor::command(id, name)
        .verbs(&[HttpVerb::Post, HttpVerb::Put])
        .query_param("ttl", ParamType::Integer)
        .compaction_if_positive("ttl", CompactionMode::Expiring, CompactionMode::Quorum)
}

impl ResourceState for ValueState {
    type Timer = Expire;
    type Facade = DistributedValue;

    const TYPE_ID: i32 = 5;
    const TYPE_NAME: &'static str = "value";

    fn create(_config: &Value) -> Result<Self> {
        Ok(Self::default())
    }

    fn operations() -> Operations<Self> {
        Operations::new()
            .command(
                ttl_command(ops::SET, "set").arg("value", ParamType::Json),
                Self::set,
            )
            .command(
                ttl_command(ops::GET_AND_SET, "get_and_set").arg("value", ParamType::Json),
                Self::get_and_set,
            )
            .command(
                ttl_command(ops::COMPARE_AND_SET, "compare_and_set")
                    .opt("expect", ParamType::Json)
                    .arg("update", ParamType::Json),
                Self::compare_and_set,
            )
            .command(
                OperationDescriptor::command(ops::REGISTER, "register"),
                Self::register,
            )
            .command(
                OperationDescriptor::command(ops::UNREGISTER, "unregister")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .compaction(CompactionMode::Sequential),
                Self::unregister,
            )
            .query(OperationDescriptor::query(ops::GET, "get"), Self::get)
    }

    fn on_timer(&mut self, ctx: &mut Context<'_, Expire>, timer: Expire) {
        if timer.index != self.index {
            return;
        }
        let old = std::mem::take(&mut self.value);
        self.timer = None;
        self.expire_at = None;
        self.changed(ctx, &old);
    }

    fn on_session_lost(&mut self, _ctx: &mut Context<'_, Expire>, session: SessionId) {
        self.listeners.unregister(session);
    }
}

/// Typed client facade for a value resource.
#[derive(Clone)]
pub struct DistributedValue {
    handle: ResourceHandle,
}

impl DistributedValue {
    pub async fn create(invoker: Arc<dyn Invoker>, name: &str) -> Result<Self> {
        let handle =
            ResourceHandle::create(invoker, name, ValueState::TYPE_NAME, Value::Null).await?;
        Ok(Self { handle })
    }

    pub fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        Self {
            handle: ResourceHandle::attach(invoker, id),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.handle.id()
    }

    pub async fn get(&self) -> Result<Value> {
        self.handle.query(ops::GET, json!({})).await
    }

    pub async fn set(&self, value: Value) -> Result<()> {
        self.set_with_ttl(value, 0).await
    }

    pub async fn set_with_ttl(&self, value: Value, ttl_ms: i64) -> Result<()> {
        self.handle
            .command(ops::SET, SetArgs { value, ttl: ttl_ms })
            .await
    }

    pub async fn get_and_set(&self, value: Value) -> Result<Value> {
        self.handle
            .command(ops::GET_AND_SET, SetArgs { value, ttl: 0 })
            .await
    }

    pub async fn compare_and_set(&self, expect: Value, update: Value) -> Result<bool> {
        self.handle
            .command(
                ops::COMPARE_AND_SET,
                CompareAndSetArgs {
                    expect,
                    update,
                    ttl: 0,
                },
            )
            .await
    }

    /// Start receiving change events on this session. Returns the event
    /// index to pass to [`Self::next_change`].
    pub async fn listen(&self) -> Result<u64> {
        let resp = self.handle.command_raw(ops::REGISTER, json!({})).await?;
        Ok(resp.event_index)
    }

    pub async fn unlisten(&self) -> Result<bool> {
        self.handle.command(ops::UNREGISTER, json!({})).await
    }

    /// Wait for the next change after event index `after`.
    pub async fn next_change(
        &self,
        after: u64,
        wait: Option<Duration>,
    ) -> Result<Option<(u64, ValueChange)>> {
        next_change(&self.handle, after, wait).await
    }
}

pub(crate) async fn next_change(
    handle: &ResourceHandle,
    after: u64,
    wait: Option<Duration>,
) -> Result<Option<(u64, ValueChange)>> {
    match handle.wait_event(CHANGE_EVENT, after, wait).await? {
        Some(SessionEvent { index, payload, .. }) => {
            Ok(Some((index, trellis_core::invoker::decode(payload)?)))
        }
        None => Ok(None),
    }
}

impl ResourceFacade for DistributedValue {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        DistributedValue::attach(invoker, id)
    }
}
