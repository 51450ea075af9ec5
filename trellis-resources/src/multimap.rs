//! Replicated multi-map: each key holds a set of distinct values, kept in
//! insertion order, each with its own optional TTL.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trellis_core::descriptor::{HttpVerb, OperationDescriptor, ParamType};
use trellis_core::invoker::ResourceFacade;
use trellis_core::resource::{Clock, Context, NoArgs, Operations, ResourceState};
use trellis_core::scheduler::TimerId;
use trellis_core::value::{canonical, present, same};
use trellis_core::{CompactionMode, Invoker, ResourceHandle, ResourceId, Result};

use crate::{expiry, live};

pub mod ops {
    use trellis_core::OperationId;

    pub const CONTAINS_KEY: OperationId = -80;
    pub const CONTAINS_ENTRY: OperationId = -81;
    pub const CONTAINS_VALUE: OperationId = -82;
    pub const PUT: OperationId = -83;
    pub const GET: OperationId = -84;
    pub const REMOVE: OperationId = -85;
    pub const REMOVE_VALUE: OperationId = -86;
    pub const IS_EMPTY: OperationId = -87;
    pub const SIZE: OperationId = -88;
    pub const CLEAR: OperationId = -89;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    value: Value,
    index: u64,
    expire_at: Option<u64>,
    timer: Option<TimerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bucket {
    key: Value,
    values: Vec<Slot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expire {
    key: String,
    index: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MultiMapState {
    buckets: BTreeMap<String, Bucket>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyArgs {
    pub key: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValueArgs {
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryArgs {
    pub key: Value,
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutArgs {
    pub key: Value,
    pub value: Value,
    #[serde(default)]
    pub ttl: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveArgs {
    pub key: Value,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SizeArgs {
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub key: Option<Value>,
}

impl MultiMapState {
    fn live_values<'a>(&'a self, key: &Value, now: u64) -> impl Iterator<Item = &'a Slot> + 'a {
        self.buckets
            .get(&canonical(key))
            .into_iter()
            .flat_map(|b| b.values.iter())
            .filter(move |s| live(s.expire_at, now))
    }

    fn all_live(&self, now: u64) -> impl Iterator<Item = (&Bucket, &Slot)> {
        self.buckets.values().flat_map(move |b| {
            b.values
                .iter()
                .filter(move |s| live(s.expire_at, now))
                .map(move |s| (b, s))
        })
    }

    fn drop_slot(ctx: &mut Context<'_, Expire>, slot: Slot) -> Value {
        if let Some(t) = slot.timer {
            ctx.cancel(t);
        }
        slot.value
    }

    fn put(&mut self, ctx: &mut Context<'_, Expire>, args: PutArgs) -> Result<bool> {
        let now = ctx.time();
        let canon = canonical(&args.key);
        if let Some(bucket) = self.buckets.get_mut(&canon) {
            if let Some(pos) = bucket.values.iter().position(|s| same(&s.value, &args.value)) {
                if live(bucket.values[pos].expire_at, now) {
                    return Ok(false);
                }
                let stale = bucket.values.remove(pos);
                Self::drop_slot(ctx, stale);
            }
        }

        let index = ctx.index();
        let expire_at = expiry(now, args.ttl);
        let timer = expire_at.map(|_| {
            ctx.schedule(
                args.ttl as u64,
                Expire {
                    key: canon.clone(),
                    index,
                },
            )
        });
        self.buckets
            .entry(canon)
            .or_insert_with(|| Bucket {
                key: args.key,
                values: Vec::new(),
            })
            .values
            .push(Slot {
                value: args.value,
                index,
                expire_at,
                timer,
            });
        Ok(true)
    }

    /// Without a value, removes the key and returns its live values; with a
    /// value, removes that entry and returns whether it was present.
    fn remove(&mut self, ctx: &mut Context<'_, Expire>, args: RemoveArgs) -> Result<Value> {
        let now = ctx.time();
        let canon = canonical(&args.key);
        match args.value {
            None => {
                let removed: Vec<Value> = match self.buckets.remove(&canon) {
                    Some(bucket) => bucket
                        .values
                        .into_iter()
                        .filter(|s| live(s.expire_at, now))
                        .map(|s| Self::drop_slot(ctx, s))
                        .collect(),
                    None => Vec::new(),
                };
                Ok(json!(removed))
            }
            Some(value) => {
                let Some(bucket) = self.buckets.get_mut(&canon) else {
                    return Ok(json!(false));
                };
                let found = bucket
                    .values
                    .iter()
                    .position(|s| same(&s.value, &value) && live(s.expire_at, now));
                let removed = match found {
                    Some(pos) => {
                        let slot = bucket.values.remove(pos);
                        Self::drop_slot(ctx, slot);
                        true
                    }
                    None => false,
                };
                if bucket.values.is_empty() {
                    self.buckets.remove(&canon);
                }
                Ok(json!(removed))
            }
        }
    }

    fn remove_value(&mut self, ctx: &mut Context<'_, Expire>, args: ValueArgs) -> Result<()> {
        let mut emptied = Vec::new();
        for (canon, bucket) in self.buckets.iter_mut() {
            if let Some(pos) = bucket.values.iter().position(|s| same(&s.value, &args.value)) {
                let slot = bucket.values.remove(pos);
                Self::drop_slot(ctx, slot);
            }
            if bucket.values.is_empty() {
                emptied.push(canon.clone());
            }
        }
        for canon in emptied {
            self.buckets.remove(&canon);
        }
        Ok(())
    }

    fn clear(&mut self, ctx: &mut Context<'_, Expire>, _: NoArgs) -> Result<()> {
        for bucket in std::mem::take(&mut self.buckets).into_values() {
            for slot in bucket.values {
                Self::drop_slot(ctx, slot);
            }
        }
        Ok(())
    }

    fn get(&self, clock: Clock, args: KeyArgs) -> Result<Vec<Value>> {
        Ok(self
            .live_values(&args.key, clock.time)
            .map(|s| s.value.clone())
            .collect())
    }

    fn contains_key(&self, clock: Clock, args: KeyArgs) -> Result<bool> {
        Ok(self.live_values(&args.key, clock.time).next().is_some())
    }

    fn contains_entry(&self, clock: Clock, args: EntryArgs) -> Result<bool> {
        Ok(self
            .live_values(&args.key, clock.time)
            .any(|s| same(&s.value, &args.value)))
    }

    fn contains_value(&self, clock: Clock, args: ValueArgs) -> Result<bool> {
        Ok(self
            .all_live(clock.time)
            .any(|(_, s)| same(&s.value, &args.value)))
    }

    fn size(&self, clock: Clock, args: SizeArgs) -> Result<usize> {
        Ok(match args.key {
            Some(key) => self.live_values(&key, clock.time).count(),
            None => self.all_live(clock.time).count(),
        })
    }

    fn is_empty(&self, clock: Clock, _: NoArgs) -> Result<bool> {
        Ok(self.all_live(clock.time).next().is_none())
    }
}

impl ResourceState for MultiMapState {
    type Timer = Expire;
    type Facade = DistributedMultiMap;

    const TYPE_ID: i32 = 2;
    const TYPE_NAME: &'static str = "multimap";

    fn create(_config: &Value) -> Result<Self> {
        Ok(Self::default())
    }

    fn operations() -> Operations<Self> {
        Operations::new()
            .command(
                OperationDescriptor::command(ops::PUT, "put")
                    .verbs(&[HttpVerb::Put, HttpVerb::Post])
                    .path("/{key}", ParamType::String)
                    .arg("value", ParamType::Json)
                    .query_param("ttl", ParamType::Integer)
                    .compaction_if_positive("ttl", CompactionMode::Expiring, CompactionMode::Quorum),
                Self::put,
            )
            .query(
                OperationDescriptor::query(ops::GET, "get").path("/{key}", ParamType::String),
                Self::get,
            )
            .command(
                OperationDescriptor::command(ops::REMOVE, "remove")
                    .verbs(&[HttpVerb::Delete, HttpVerb::Post])
                    .path("/{key}", ParamType::String)
                    .opt("value", ParamType::Json)
                    .compaction(CompactionMode::Sequential),
                Self::remove,
            )
            .command(
                OperationDescriptor::command(ops::REMOVE_VALUE, "remove_value")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .arg("value", ParamType::Json)
                    .compaction(CompactionMode::Sequential),
                Self::remove_value,
            )
            .command(
                OperationDescriptor::command(ops::CLEAR, "clear")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .compaction(CompactionMode::Sequential),
                Self::clear,
            )
            .query(
                OperationDescriptor::query(ops::CONTAINS_KEY, "contains_key")
                    .path("/contains_key/{key}", ParamType::String),
                Self::contains_key,
            )
            .query(
                OperationDescriptor::query(ops::CONTAINS_ENTRY, "contains_entry")
                    .arg("key", ParamType::Json)
                    .arg("value", ParamType::Json),
                Self::contains_entry,
            )
            .query(
                OperationDescriptor::query(ops::CONTAINS_VALUE, "contains_value")
                    .arg("value", ParamType::Json),
                Self::contains_value,
            )
            .query(OperationDescriptor::query(ops::IS_EMPTY, "is_empty"), Self::is_empty)
            .query(
                OperationDescriptor::query(ops::SIZE, "size").query_param("key", ParamType::String),
                Self::size,
            )
    }

    fn on_timer(&mut self, _ctx: &mut Context<'_, Expire>, timer: Expire) {
        if let Some(bucket) = self.buckets.get_mut(&timer.key) {
            bucket.values.retain(|s| s.index != timer.index);
            if bucket.values.is_empty() {
                self.buckets.remove(&timer.key);
            }
        }
    }
}

/// Typed client facade for a multi-map resource.
#[derive(Clone)]
pub struct DistributedMultiMap {
    handle: ResourceHandle,
}

impl DistributedMultiMap {
    pub async fn create(invoker: Arc<dyn Invoker>, name: &str) -> Result<Self> {
        let handle =
            ResourceHandle::create(invoker, name, MultiMapState::TYPE_NAME, Value::Null).await?;
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

    pub async fn put(&self, key: Value, value: Value) -> Result<bool> {
        self.handle
            .command(ops::PUT, PutArgs { key, value, ttl: 0 })
            .await
    }

    pub async fn put_with_ttl(&self, key: Value, value: Value, ttl_ms: i64) -> Result<bool> {
        self.handle
            .command(ops::PUT, PutArgs { key, value, ttl: ttl_ms })
            .await
    }

    pub async fn get(&self, key: Value) -> Result<Vec<Value>> {
        self.handle.query(ops::GET, KeyArgs { key }).await
    }

    pub async fn remove(&self, key: Value) -> Result<Vec<Value>> {
        self.handle
            .command(ops::REMOVE, RemoveArgs { key, value: None })
            .await
    }

    pub async fn remove_entry(&self, key: Value, value: Value) -> Result<bool> {
        self.handle
            .command(
                ops::REMOVE,
                RemoveArgs {
                    key,
                    value: Some(value),
                },
            )
            .await
    }

    pub async fn remove_value(&self, value: Value) -> Result<()> {
        self.handle.command(ops::REMOVE_VALUE, ValueArgs { value }).await
    }

    pub async fn contains_key(&self, key: Value) -> Result<bool> {
        self.handle.query(ops::CONTAINS_KEY, KeyArgs { key }).await
    }

    pub async fn contains_entry(&self, key: Value, value: Value) -> Result<bool> {
        self.handle
            .query(ops::CONTAINS_ENTRY, EntryArgs { key, value })
            .await
    }

    pub async fn contains_value(&self, value: Value) -> Result<bool> {
        self.handle.query(ops::CONTAINS_VALUE, ValueArgs { value }).await
    }

    pub async fn size(&self) -> Result<usize> {
        self.handle.query(ops::SIZE, SizeArgs::default()).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.handle.query(ops::IS_EMPTY, json!({})).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.handle.command(ops::CLEAR, json!({})).await
    }
}

impl ResourceFacade for DistributedMultiMap {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        DistributedMultiMap::attach(invoker, id)
    }
}
