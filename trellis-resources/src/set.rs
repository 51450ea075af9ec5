//! Replicated set with per-element TTL. Iteration follows insertion order.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trellis_core::descriptor::{HttpVerb, OperationDescriptor, ParamType};
use trellis_core::invoker::ResourceFacade;
use trellis_core::resource::{Clock, Context, NoArgs, Operations, ResourceState};
use trellis_core::scheduler::TimerId;
use trellis_core::value::canonical;
use trellis_core::{CompactionMode, Invoker, ResourceHandle, ResourceId, Result};

use crate::{expiry, live};

pub mod ops {
    use trellis_core::OperationId;

    pub const CONTAINS: OperationId = -100;
    pub const ADD: OperationId = -101;
    pub const REMOVE: OperationId = -102;
    pub const IS_EMPTY: OperationId = -103;
    pub const SIZE: OperationId = -104;
    pub const CLEAR: OperationId = -105;
    pub const ITERATE: OperationId = -106;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Member {
    value: Value,
    index: u64,
    expire_at: Option<u64>,
    timer: Option<TimerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expire {
    value: String,
    index: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SetState {
    members: BTreeMap<String, Member>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueArgs {
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddArgs {
    pub value: Value,
    #[serde(default)]
    pub ttl: i64,
}

impl SetState {
    fn live_members(&self, now: u64) -> impl Iterator<Item = &Member> {
        self.members.values().filter(move |m| live(m.expire_at, now))
    }

    fn add(&mut self, ctx: &mut Context<'_, Expire>, args: AddArgs) -> Result<bool> {
        let canon = canonical(&args.value);
        if let Some(existing) = self.members.get(&canon) {
            if live(existing.expire_at, ctx.time()) {
                return Ok(false);
            }
            if let Some(t) = existing.timer {
                ctx.cancel(t);
            }
        }

        let index = ctx.index();
        let expire_at = expiry(ctx.time(), args.ttl);
        let timer = expire_at.map(|_| {
            ctx.schedule(
                args.ttl as u64,
                Expire {
                    value: canon.clone(),
                    index,
                },
            )
        });
        self.members.insert(
            canon,
            Member {
                value: args.value,
                index,
                expire_at,
                timer,
            },
        );
        Ok(true)
    }

    fn remove(&mut self, ctx: &mut Context<'_, Expire>, args: ValueArgs) -> Result<bool> {
        match self.members.remove(&canonical(&args.value)) {
            Some(m) => {
                if let Some(t) = m.timer {
                    ctx.cancel(t);
                }
                Ok(live(m.expire_at, ctx.time()))
            }
            None => Ok(false),
        }
    }

    fn clear(&mut self, ctx: &mut Context<'_, Expire>, _: NoArgs) -> Result<()> {
        for m in std::mem::take(&mut self.members).into_values() {
            if let Some(t) = m.timer {
                ctx.cancel(t);
            }
        }
        Ok(())
    }

    fn contains(&self, clock: Clock, args: ValueArgs) -> Result<bool> {
        Ok(self
            .members
            .get(&canonical(&args.value))
            .map(|m| live(m.expire_at, clock.time))
            .unwrap_or(false))
    }

    fn size(&self, clock: Clock, _: NoArgs) -> Result<usize> {
        Ok(self.live_members(clock.time).count())
    }

    fn is_empty(&self, clock: Clock, _: NoArgs) -> Result<bool> {
        Ok(self.live_members(clock.time).next().is_none())
    }

    fn iterate(&self, clock: Clock, _: NoArgs) -> Result<Vec<Value>> {
        let mut members: Vec<&Member> = self.live_members(clock.time).collect();
        members.sort_by_key(|m| m.index);
        Ok(members.into_iter().map(|m| m.value.clone()).collect())
    }
}

impl ResourceState for SetState {
    type Timer = Expire;
    type Facade = DistributedSet;

    const TYPE_ID: i32 = 3;
    const TYPE_NAME: &'static str = "set";

    fn create(_config: &Value) -> Result<Self> {
        Ok(Self::default())
    }

    fn operations() -> Operations<Self> {
        Operations::new()
            .command(
                OperationDescriptor::command(ops::ADD, "add")
                    .verbs(&[HttpVerb::Post, HttpVerb::Put])
                    .arg("value", ParamType::Json)
                    .query_param("ttl", ParamType::Integer)
                    .compaction_if_positive("ttl", CompactionMode::Expiring, CompactionMode::Quorum),
                Self::add,
            )
            .command(
                OperationDescriptor::command(ops::REMOVE, "remove")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .arg("value", ParamType::Json)
                    .compaction(CompactionMode::Sequential),
                Self::remove,
            )
            .command(
                OperationDescriptor::command(ops::CLEAR, "clear")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .compaction(CompactionMode::Sequential),
                Self::clear,
            )
            .query(
                OperationDescriptor::query(ops::CONTAINS, "contains")
                    .verbs(&[HttpVerb::Get, HttpVerb::Post])
                    .arg("value", ParamType::Json),
                Self::contains,
            )
            .query(OperationDescriptor::query(ops::IS_EMPTY, "is_empty"), Self::is_empty)
            .query(OperationDescriptor::query(ops::SIZE, "size"), Self::size)
            .query(OperationDescriptor::query(ops::ITERATE, "iterate"), Self::iterate)
    }

    fn on_timer(&mut self, _ctx: &mut Context<'_, Expire>, timer: Expire) {
        let current = self
            .members
            .get(&timer.value)
            .map(|m| m.index == timer.index)
            .unwrap_or(false);
        if current {
            self.members.remove(&timer.value);
        }
    }
}

/// Typed client facade for a set resource.
#[derive(Clone)]
pub struct DistributedSet {
    handle: ResourceHandle,
}

impl DistributedSet {
    pub async fn create(invoker: Arc<dyn Invoker>, name: &str) -> Result<Self> {
        let handle =
            ResourceHandle::create(invoker, name, SetState::TYPE_NAME, Value::Null).await?;
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

    pub async fn add(&self, value: Value) -> Result<bool> {
        self.handle.command(ops::ADD, AddArgs { value, ttl: 0 }).await
    }

    pub async fn add_with_ttl(&self, value: Value, ttl_ms: i64) -> Result<bool> {
        self.handle
            .command(ops::ADD, AddArgs { value, ttl: ttl_ms })
            .await
    }

    pub async fn remove(&self, value: Value) -> Result<bool> {
        self.handle.command(ops::REMOVE, ValueArgs { value }).await
    }

    pub async fn contains(&self, value: Value) -> Result<bool> {
        self.handle.query(ops::CONTAINS, ValueArgs { value }).await
    }

    pub async fn size(&self) -> Result<usize> {
        self.handle.query(ops::SIZE, json!({})).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.handle.query(ops::IS_EMPTY, json!({})).await
    }

    pub async fn iterate(&self) -> Result<Vec<Value>> {
        self.handle.query(ops::ITERATE, json!({})).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.handle.command(ops::CLEAR, json!({})).await
    }
}

impl ResourceFacade for DistributedSet {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        DistributedSet::attach(invoker, id)
    }
}
