//! Replicated unbounded FIFO queue.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trellis_core::descriptor::{HttpVerb, OperationDescriptor, ParamType};
use trellis_core::invoker::ResourceFacade;
use trellis_core::resource::{Clock, Context, NoArgs, Operations, ResourceState};
use trellis_core::value::{present, same};
use trellis_core::{CompactionMode, Error, Invoker, ResourceHandle, ResourceId, Result};

pub mod ops {
    use trellis_core::OperationId;

    pub const CONTAINS: OperationId = -90;
    pub const ADD: OperationId = -91;
    pub const OFFER: OperationId = -92;
    pub const PEEK: OperationId = -93;
    pub const POLL: OperationId = -94;
    pub const ELEMENT: OperationId = -95;
    pub const REMOVE: OperationId = -96;
    pub const IS_EMPTY: OperationId = -97;
    pub const SIZE: OperationId = -98;
    pub const CLEAR: OperationId = -99;
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueueState {
    items: VecDeque<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueArgs {
    pub value: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RemoveArgs {
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

impl QueueState {
    fn add(&mut self, _ctx: &mut Context<'_, ()>, args: ValueArgs) -> Result<bool> {
        self.items.push_back(args.value);
        Ok(true)
    }

    fn poll(&mut self, _ctx: &mut Context<'_, ()>, _: NoArgs) -> Result<Option<Value>> {
        Ok(self.items.pop_front())
    }

    /// Without a value, takes the head or fails when empty; with a value,
    /// removes its first occurrence.
    fn remove(&mut self, _ctx: &mut Context<'_, ()>, args: RemoveArgs) -> Result<Value> {
        match args.value {
            None => self.items.pop_front().ok_or(Error::NoSuchElement),
            Some(value) => match self.items.iter().position(|v| same(v, &value)) {
                Some(pos) => {
                    self.items.remove(pos);
                    Ok(json!(true))
                }
                None => Ok(json!(false)),
            },
        }
    }

    fn clear(&mut self, _ctx: &mut Context<'_, ()>, _: NoArgs) -> Result<()> {
        self.items.clear();
        Ok(())
    }

    fn peek(&self, _clock: Clock, _: NoArgs) -> Result<Option<Value>> {
        Ok(self.items.front().cloned())
    }

    fn element(&self, _clock: Clock, _: NoArgs) -> Result<Value> {
        self.items.front().cloned().ok_or(Error::NoSuchElement)
    }

    fn contains(&self, _clock: Clock, args: ValueArgs) -> Result<bool> {
        Ok(self.items.iter().any(|v| same(v, &args.value)))
    }

    fn size(&self, _clock: Clock, _: NoArgs) -> Result<usize> {
        Ok(self.items.len())
    }

    fn is_empty(&self, _clock: Clock, _: NoArgs) -> Result<bool> {
        Ok(self.items.is_empty())
    }
}

impl ResourceState for QueueState {
    type Timer = ();
    type Facade = DistributedQueue;

    const TYPE_ID: i32 = 4;
    const TYPE_NAME: &'static str = "queue";

    fn create(_config: &Value) -> Result<Self> {
        Ok(Self::default())
    }

    fn operations() -> Operations<Self> {
        Operations::new()
            .command(
                OperationDescriptor::command(ops::ADD, "add")
                    .verbs(&[HttpVerb::Post, HttpVerb::Put])
                    .arg("value", ParamType::Json),
                Self::add,
            )
            .command(
                OperationDescriptor::command(ops::OFFER, "offer").arg("value", ParamType::Json),
                Self::add,
            )
            .command(
                OperationDescriptor::command(ops::POLL, "poll").compaction(CompactionMode::Sequential),
                Self::poll,
            )
            .command(
                OperationDescriptor::command(ops::REMOVE, "remove")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .opt("value", ParamType::Json)
                    .compaction(CompactionMode::Sequential),
                Self::remove,
            )
            .command(
                OperationDescriptor::command(ops::CLEAR, "clear")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .compaction(CompactionMode::Sequential),
                Self::clear,
            )
            .query(OperationDescriptor::query(ops::PEEK, "peek"), Self::peek)
            .query(OperationDescriptor::query(ops::ELEMENT, "element"), Self::element)
            .query(
                OperationDescriptor::query(ops::CONTAINS, "contains")
                    .verbs(&[HttpVerb::Get, HttpVerb::Post])
                    .arg("value", ParamType::Json),
                Self::contains,
            )
            .query(OperationDescriptor::query(ops::IS_EMPTY, "is_empty"), Self::is_empty)
            .query(OperationDescriptor::query(ops::SIZE, "size"), Self::size)
    }
}

/// Typed client facade for a queue resource.
#[derive(Clone)]
pub struct DistributedQueue {
    handle: ResourceHandle,
}

impl DistributedQueue {
    pub async fn create(invoker: Arc<dyn Invoker>, name: &str) -> Result<Self> {
        let handle =
            ResourceHandle::create(invoker, name, QueueState::TYPE_NAME, Value::Null).await?;
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
        self.handle.command(ops::ADD, ValueArgs { value }).await
    }

    pub async fn offer(&self, value: Value) -> Result<bool> {
        self.handle.command(ops::OFFER, ValueArgs { value }).await
    }

    pub async fn poll(&self) -> Result<Option<Value>> {
        self.handle.command(ops::POLL, json!({})).await
    }

    /// Take the head, failing with `NoSuchElement` when empty.
    pub async fn remove(&self) -> Result<Value> {
        self.handle.command(ops::REMOVE, RemoveArgs::default()).await
    }

    pub async fn remove_value(&self, value: Value) -> Result<bool> {
        self.handle
            .command(ops::REMOVE, RemoveArgs { value: Some(value) })
            .await
    }

    pub async fn peek(&self) -> Result<Option<Value>> {
        self.handle.query(ops::PEEK, json!({})).await
    }

    pub async fn element(&self) -> Result<Value> {
        self.handle.query(ops::ELEMENT, json!({})).await
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

    pub async fn clear(&self) -> Result<()> {
        self.handle.command(ops::CLEAR, json!({})).await
    }
}

impl ResourceFacade for DistributedQueue {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        DistributedQueue::attach(invoker, id)
    }
}
