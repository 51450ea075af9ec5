//! Replicated 64-bit counter. Arithmetic wraps on overflow.
//!
//! Every command is superseded by a later snapshot, since the whole state
//! is the integer itself (plus its listeners).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trellis_core::descriptor::{OperationDescriptor, ParamType};
use trellis_core::invoker::ResourceFacade;
use trellis_core::resource::{Clock, Context, NoArgs, Operations, ResourceState};
use trellis_core::{CompactionMode, Invoker, ResourceHandle, ResourceId, Result, SessionId};

use crate::listeners::Listeners;
use crate::value::{ValueChange, CHANGE_EVENT};

pub mod ops {
    use trellis_core::OperationId;

    pub const COMPARE_AND_SET: OperationId = -110;
    pub const GET: OperationId = -111;
    pub const GET_AND_SET: OperationId = -112;
    pub const SET: OperationId = -113;
    pub const INCREMENT_AND_GET: OperationId = -114;
    pub const DECREMENT_AND_GET: OperationId = -115;
    pub const GET_AND_INCREMENT: OperationId = -116;
    pub const GET_AND_DECREMENT: OperationId = -117;
    pub const ADD_AND_GET: OperationId = -118;
    pub const GET_AND_ADD: OperationId = -119;
    pub const REGISTER: OperationId = -121;
    pub const UNREGISTER: OperationId = -122;
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LongState {
    value: i64,
    listeners: Listeners,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetArgs {
    pub value: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeltaArgs {
    pub delta: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompareAndSetArgs {
    pub expect: i64,
    pub update: i64,
}

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    initial: i64,
}

impl LongState {
    /// Replace the counter and return the previous value.
    fn swap(&mut self, ctx: &mut Context<'_, ()>, value: i64) -> i64 {
        let old = std::mem::replace(&mut self.value, value);
        if old != value && !self.listeners.is_empty() {
            let change = ValueChange {
                old: json!(old),
                new: json!(value),
            };
            self.listeners.notify(ctx, CHANGE_EVENT, &change);
        }
        old
    }

    fn add(&mut self, ctx: &mut Context<'_, ()>, delta: i64) -> (i64, i64) {
        let old = self.value;
        let new = old.wrapping_add(delta);
        self.swap(ctx, new);
        (old, new)
    }

    fn set(&mut self, ctx: &mut Context<'_, ()>, args: SetArgs) -> Result<()> {
        self.swap(ctx, args.value);
        Ok(())
    }

    fn get_and_set(&mut self, ctx: &mut Context<'_, ()>, args: SetArgs) -> Result<i64> {
        Ok(self.swap(ctx, args.value))
    }

    fn compare_and_set(&mut self, ctx: &mut Context<'_, ()>, args: CompareAndSetArgs) -> Result<bool> {
        if self.value != args.expect {
            return Ok(false);
        }
        self.swap(ctx, args.update);
        Ok(true)
    }

    fn increment_and_get(&mut self, ctx: &mut Context<'_, ()>, _: NoArgs) -> Result<i64> {
        Ok(self.add(ctx, 1).1)
    }

    fn decrement_and_get(&mut self, ctx: &mut Context<'_, ()>, _: NoArgs) -> Result<i64> {
        Ok(self.add(ctx, -1).1)
    }

    fn get_and_increment(&mut self, ctx: &mut Context<'_, ()>, _: NoArgs) -> Result<i64> {
        Ok(self.add(ctx, 1).0)
    }

    fn get_and_decrement(&mut self, ctx: &mut Context<'_, ()>, _: NoArgs) -> Result<i64> {
        Ok(self.add(ctx, -1).0)
    }

    fn add_and_get(&mut self, ctx: &mut Context<'_, ()>, args: DeltaArgs) -> Result<i64> {
        Ok(self.add(ctx, args.delta).1)
    }

    fn get_and_add(&mut self, ctx: &mut Context<'_, ()>, args: DeltaArgs) -> Result<i64> {
        Ok(self.add(ctx, args.delta).0)
    }

    fn register(&mut self, ctx: &mut Context<'_, ()>, _: NoArgs) -> Result<bool> {
        Ok(self.listeners.register(ctx.session()))
    }

    fn unregister(&mut self, ctx: &mut Context<'_, ()>, _: NoArgs) -> Result<bool> {
        Ok(self.listeners.unregister(ctx.session()))
    }

    fn get(&self, _clock: Clock, _: NoArgs) -> Result<i64> {
        Ok(self.value)
    }
}

fn counter_op(id: i32, name: &'static str) -> OperationDescriptor {
    OperationDescriptor::command(id, name).compaction(CompactionMode::Snapshot)
}

impl ResourceState for LongState {
    type Timer = ();
    type Facade = DistributedLong;

    const TYPE_ID: i32 = 6;
    const TYPE_NAME: &'static str = "long";

    fn create(config: &Value) -> Result<Self> {
        let value = if config.is_null() {
            0
        } else {
            serde_json::from_value::<Config>(config.clone())?.initial
        };
        Ok(Self {
            value,
            listeners: Listeners::default(),
        })
    }

    fn operations() -> Operations<Self> {
        Operations::new()
            .command(
                counter_op(ops::SET, "set").arg("value", ParamType::Integer),
                Self::set,
            )
            .command(
                counter_op(ops::GET_AND_SET, "get_and_set").arg("value", ParamType::Integer),
                Self::get_and_set,
            )
            .command(
                counter_op(ops::COMPARE_AND_SET, "compare_and_set")
                    .arg("expect", ParamType::Integer)
                    .arg("update", ParamType::Integer),
                Self::compare_and_set,
            )
            .command(
                counter_op(ops::INCREMENT_AND_GET, "increment_and_get"),
                Self::increment_and_get,
            )
            .command(
                counter_op(ops::DECREMENT_AND_GET, "decrement_and_get"),
                Self::decrement_and_get,
            )
            .command(
                counter_op(ops::GET_AND_INCREMENT, "get_and_increment"),
                Self::get_and_increment,
            )
            .command(
                counter_op(ops::GET_AND_DECREMENT, "get_and_decrement"),
                Self::get_and_decrement,
            )
            .command(
                counter_op(ops::ADD_AND_GET, "add_and_get").arg("delta", ParamType::Integer),
                Self::add_and_get,
            )
            .command(
                counter_op(ops::GET_AND_ADD, "get_and_add").arg("delta", ParamType::Integer),
                Self::get_and_add,
            )
            .command(counter_op(ops::REGISTER, "register"), Self::register)
            .command(counter_op(ops::UNREGISTER, "unregister"), Self::unregister)
            .query(OperationDescriptor::query(ops::GET, "get"), Self::get)
    }

    fn on_session_lost(&mut self, _ctx: &mut Context<'_, ()>, session: SessionId) {
        self.listeners.unregister(session);
    }
}

/// Typed client facade for a long-counter resource.
#[derive(Clone)]
pub struct DistributedLong {
    handle: ResourceHandle,
}

impl DistributedLong {
    pub async fn create(invoker: Arc<dyn Invoker>, name: &str) -> Result<Self> {
        let handle =
            ResourceHandle::create(invoker, name, LongState::TYPE_NAME, Value::Null).await?;
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

    pub async fn get(&self) -> Result<i64> {
        self.handle.query(ops::GET, json!({})).await
    }

    pub async fn set(&self, value: i64) -> Result<()> {
        self.handle.command(ops::SET, SetArgs { value }).await
    }

    pub async fn get_and_set(&self, value: i64) -> Result<i64> {
        self.handle.command(ops::GET_AND_SET, SetArgs { value }).await
    }

    pub async fn compare_and_set(&self, expect: i64, update: i64) -> Result<bool> {
        self.handle
            .command(ops::COMPARE_AND_SET, CompareAndSetArgs { expect, update })
            .await
    }

    pub async fn increment_and_get(&self) -> Result<i64> {
        self.handle.command(ops::INCREMENT_AND_GET, json!({})).await
    }

    pub async fn decrement_and_get(&self) -> Result<i64> {
        self.handle.command(ops::DECREMENT_AND_GET, json!({})).await
    }

    pub async fn get_and_increment(&self) -> Result<i64> {
        self.handle.command(ops::GET_AND_INCREMENT, json!({})).await
    }

    pub async fn get_and_decrement(&self) -> Result<i64> {
        self.handle.command(ops::GET_AND_DECREMENT, json!({})).await
    }

    pub async fn add_and_get(&self, delta: i64) -> Result<i64> {
        self.handle.command(ops::ADD_AND_GET, DeltaArgs { delta }).await
    }

    pub async fn get_and_add(&self, delta: i64) -> Result<i64> {
        self.handle.command(ops::GET_AND_ADD, DeltaArgs { delta }).await
    }

    pub async fn listen(&self) -> Result<u64> {
        let resp = self.handle.command_raw(ops::REGISTER, json!({})).await?;
        Ok(resp.event_index)
    }

    pub async fn unlisten(&self) -> Result<bool> {
        self.handle.command(ops::UNREGISTER, json!({})).await
    }

    pub async fn next_change(
        &self,
        after: u64,
        wait: Option<Duration>,
    ) -> Result<Option<(u64, ValueChange)>> {
        crate::value::next_change(&self.handle, after, wait).await
    }
}

impl ResourceFacade for DistributedLong {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        DistributedLong::attach(invoker, id)
    }
}
