//! Replicated map with per-entry TTL.
//!
//! Keys and values are arbitrary JSON values. Entries are indexed by the
//! canonical encoding of their key, so iteration is in sorted key order on
//! every replica. An entry with a TTL owns exactly one pending expiry
//! timer; replacing or removing the entry cancels it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trellis_core::descriptor::{HttpVerb, OperationDescriptor, ParamType};
use trellis_core::invoker::ResourceFacade;
use trellis_core::resource::{Clock, Context, NoArgs, Operations, ResourceState};
use trellis_core::scheduler::TimerId;
use trellis_core::value::{canonical, same};
use trellis_core::{CompactionMode, Invoker, ResourceHandle, ResourceId, Result};

use crate::{expiry, live};

pub mod ops {
    use trellis_core::OperationId;

    pub const CONTAINS_KEY: OperationId = -65;
    pub const CONTAINS_VALUE: OperationId = -66;
    pub const PUT: OperationId = -67;
    pub const PUT_IF_ABSENT: OperationId = -68;
    pub const GET: OperationId = -69;
    pub const GET_OR_DEFAULT: OperationId = -70;
    pub const REMOVE: OperationId = -71;
    pub const REMOVE_IF_PRESENT: OperationId = -72;
    pub const REPLACE: OperationId = -73;
    pub const REPLACE_IF_PRESENT: OperationId = -74;
    pub const IS_EMPTY: OperationId = -75;
    pub const SIZE: OperationId = -76;
    pub const CLEAR: OperationId = -77;
    pub const VALUES: OperationId = -155;
    pub const KEYS: OperationId = -156;
    pub const ENTRIES: OperationId = -157;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MapEntry {
    key: Value,
    value: Value,
    /// Index of the command that last wrote the entry.
    index: u64,
    expire_at: Option<u64>,
    timer: Option<TimerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expire {
    key: String,
    index: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MapState {
    entries: BTreeMap<String, MapEntry>,
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
pub struct KeyValueArgs {
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
pub struct GetOrDefaultArgs {
    pub key: Value,
    #[serde(default)]
    pub default: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplaceIfPresentArgs {
    pub key: Value,
    /// Expected current value.
    pub replace: Value,
    /// New value.
    pub value: Value,
    #[serde(default)]
    pub ttl: i64,
}

impl MapState {
    fn live(&self, key: &Value, now: u64) -> Option<&MapEntry> {
        self.entries
            .get(&canonical(key))
            .filter(|e| live(e.expire_at, now))
    }

    fn live_entries(&self, now: u64) -> impl Iterator<Item = &MapEntry> {
        self.entries.values().filter(move |e| live(e.expire_at, now))
    }

    /// Write an entry, cancelling any previous expiry, and return the prior value.
    fn write(
        &mut self,
        ctx: &mut Context<'_, Expire>,
        key: Value,
        value: Value,
        ttl: i64,
    ) -> Option<Value> {
        let canon = canonical(&key);
        let prior = self.entries.remove(&canon).map(|old| {
            if let Some(t) = old.timer {
                ctx.cancel(t);
            }
            old.value
        });

        let index = ctx.index();
        let expire_at = expiry(ctx.time(), ttl);
        let timer = expire_at.map(|_| {
            ctx.schedule(
                ttl as u64,
                Expire {
                    key: canon.clone(),
                    index,
                },
            )
        });
        self.entries.insert(
            canon,
            MapEntry {
                key,
                value,
                index,
                expire_at,
                timer,
            },
        );
        prior
    }

    fn delete(&mut self, ctx: &mut Context<'_, Expire>, key: &Value) -> Option<Value> {
        let entry = self.entries.remove(&canonical(key))?;
        if let Some(t) = entry.timer {
            ctx.cancel(t);
        }
        Some(entry.value)
    }

    fn put(&mut self, ctx: &mut Context<'_, Expire>, args: PutArgs) -> Result<Option<Value>> {
        Ok(self.write(ctx, args.key, args.value, args.ttl))
    }

    fn put_if_absent(
        &mut self,
        ctx: &mut Context<'_, Expire>,
        args: PutArgs,
    ) -> Result<Option<Value>> {
        if let Some(existing) = self.live(&args.key, ctx.time()) {
            return Ok(Some(existing.value.clone()));
        }
        self.write(ctx, args.key, args.value, args.ttl);
        Ok(None)
    }

    fn remove(&mut self, ctx: &mut Context<'_, Expire>, args: KeyArgs) -> Result<Option<Value>> {
        Ok(self.delete(ctx, &args.key))
    }

    fn remove_if_present(
        &mut self,
        ctx: &mut Context<'_, Expire>,
        args: KeyValueArgs,
    ) -> Result<bool> {
        match self.live(&args.key, ctx.time()) {
            Some(e) if same(&e.value, &args.value) => {
                self.delete(ctx, &args.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn replace(&mut self, ctx: &mut Context<'_, Expire>, args: PutArgs) -> Result<Option<Value>> {
        if self.live(&args.key, ctx.time()).is_none() {
            return Ok(None);
        }
        Ok(self.write(ctx, args.key, args.value, args.ttl))
    }

    fn replace_if_present(
        &mut self,
        ctx: &mut Context<'_, Expire>,
        args: ReplaceIfPresentArgs,
    ) -> Result<bool> {
        match self.live(&args.key, ctx.time()) {
            Some(e) if same(&e.value, &args.replace) => {
                self.write(ctx, args.key, args.value, args.ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear(&mut self, ctx: &mut Context<'_, Expire>, _: NoArgs) -> Result<()> {
        for entry in std::mem::take(&mut self.entries).into_values() {
            if let Some(t) = entry.timer {
                ctx.cancel(t);
            }
        }
        Ok(())
    }

    fn get(&self, clock: Clock, args: KeyArgs) -> Result<Option<Value>> {
        Ok(self.live(&args.key, clock.time).map(|e| e.value.clone()))
    }

    fn get_or_default(&self, clock: Clock, args: GetOrDefaultArgs) -> Result<Value> {
        Ok(self
            .live(&args.key, clock.time)
            .map(|e| e.value.clone())
            .unwrap_or(args.default))
    }

    fn contains_key(&self, clock: Clock, args: KeyArgs) -> Result<bool> {
        Ok(self.live(&args.key, clock.time).is_some())
    }

    fn contains_value(&self, clock: Clock, args: ValueArgs) -> Result<bool> {
        Ok(self
            .live_entries(clock.time)
            .any(|e| same(&e.value, &args.value)))
    }

    fn size(&self, clock: Clock, _: NoArgs) -> Result<usize> {
        Ok(self.live_entries(clock.time).count())
    }

    fn is_empty(&self, clock: Clock, _: NoArgs) -> Result<bool> {
        Ok(self.live_entries(clock.time).next().is_none())
    }

    fn keys(&self, clock: Clock, _: NoArgs) -> Result<Vec<Value>> {
        Ok(self.live_entries(clock.time).map(|e| e.key.clone()).collect())
    }

    fn values(&self, clock: Clock, _: NoArgs) -> Result<Vec<Value>> {
        Ok(self
            .live_entries(clock.time)
            .map(|e| e.value.clone())
            .collect())
    }

    fn entries(&self, clock: Clock, _: NoArgs) -> Result<Vec<Value>> {
        Ok(self
            .live_entries(clock.time)
            .map(|e| json!({"key": e.key, "value": e.value}))
            .collect())
    }
}

fn ttl_command(id: i32, name: &'static str) -> OperationDescriptor {
    OperationDescriptor::command(id, name)
        .verbs(&[HttpVerb::Put, HttpVerb::Post])
        .arg("key", ParamType::Json)
        .arg("value", ParamType::Json)
        .query_param("ttl", ParamType::Integer)
        .compaction_if_positive("ttl", CompactionMode::Expiring, CompactionMode::Quorum)
}

impl ResourceState for MapState {
    type Timer = Expire;
    type Facade = DistributedMap;

    const TYPE_ID: i32 = 1;
    const TYPE_NAME: &'static str = "map";

    fn create(_config: &Value) -> Result<Self> {
        Ok(Self::default())
    }

    fn operations() -> Operations<Self> {
        Operations::new()
            .command(ttl_command(ops::PUT_IF_ABSENT, "put_if_absent"), Self::put_if_absent)
            .command(ttl_command(ops::REPLACE, "replace"), Self::replace)
            .command(
                OperationDescriptor::command(ops::REPLACE_IF_PRESENT, "replace_if_present")
                    .verbs(&[HttpVerb::Put, HttpVerb::Post])
                    .arg("key", ParamType::Json)
                    .arg("replace", ParamType::Json)
                    .arg("value", ParamType::Json)
                    .query_param("ttl", ParamType::Integer)
                    .compaction_if_positive("ttl", CompactionMode::Expiring, CompactionMode::Quorum),
                Self::replace_if_present,
            )
            .command(
                OperationDescriptor::command(ops::REMOVE_IF_PRESENT, "remove_if_present")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .arg("key", ParamType::Json)
                    .arg("value", ParamType::Json)
                    .compaction(CompactionMode::Sequential),
                Self::remove_if_present,
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
                OperationDescriptor::query(ops::CONTAINS_VALUE, "contains_value")
                    .arg("value", ParamType::Json),
                Self::contains_value,
            )
            .query(
                OperationDescriptor::query(ops::GET_OR_DEFAULT, "get_or_default")
                    .arg("key", ParamType::Json)
                    .opt("default", ParamType::Json),
                Self::get_or_default,
            )
            .query(OperationDescriptor::query(ops::IS_EMPTY, "is_empty"), Self::is_empty)
            .query(OperationDescriptor::query(ops::SIZE, "size"), Self::size)
            .query(OperationDescriptor::query(ops::KEYS, "keys"), Self::keys)
            .query(OperationDescriptor::query(ops::VALUES, "values"), Self::values)
            .query(OperationDescriptor::query(ops::ENTRIES, "entries"), Self::entries)
            .command(
                ttl_command(ops::PUT, "put").path("/{key}", ParamType::String),
                Self::put,
            )
            .query(
                OperationDescriptor::query(ops::GET, "get").path("/{key}", ParamType::String),
                Self::get,
            )
            .command(
                OperationDescriptor::command(ops::REMOVE, "remove")
                    .verbs(&[HttpVerb::Delete])
                    .path("/{key}", ParamType::String)
                    .compaction(CompactionMode::Sequential),
                Self::remove,
            )
    }

    fn on_timer(&mut self, _ctx: &mut Context<'_, Expire>, timer: Expire) {
        let current = self
            .entries
            .get(&timer.key)
            .map(|e| e.index == timer.index)
            .unwrap_or(false);
        if current {
            self.entries.remove(&timer.key);
        }
    }
}

/// Typed client facade for a map resource.
#[derive(Clone)]
pub struct DistributedMap {
    handle: ResourceHandle,
}

impl DistributedMap {
    pub async fn create(invoker: Arc<dyn Invoker>, name: &str) -> Result<Self> {
        let handle =
            ResourceHandle::create(invoker, name, MapState::TYPE_NAME, Value::Null).await?;
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

    pub async fn put(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.put_with_ttl(key, value, 0).await
    }

    pub async fn put_with_ttl(&self, key: Value, value: Value, ttl_ms: i64) -> Result<Option<Value>> {
        self.handle
            .command(ops::PUT, PutArgs { key, value, ttl: ttl_ms })
            .await
    }

    pub async fn put_if_absent(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.handle
            .command(ops::PUT_IF_ABSENT, PutArgs { key, value, ttl: 0 })
            .await
    }

    pub async fn get(&self, key: Value) -> Result<Option<Value>> {
        self.handle.query(ops::GET, KeyArgs { key }).await
    }

    pub async fn get_or_default(&self, key: Value, default: Value) -> Result<Value> {
        self.handle
            .query(ops::GET_OR_DEFAULT, GetOrDefaultArgs { key, default })
            .await
    }

    pub async fn contains_key(&self, key: Value) -> Result<bool> {
        self.handle.query(ops::CONTAINS_KEY, KeyArgs { key }).await
    }

    pub async fn contains_value(&self, value: Value) -> Result<bool> {
        self.handle.query(ops::CONTAINS_VALUE, ValueArgs { value }).await
    }

    pub async fn remove(&self, key: Value) -> Result<Option<Value>> {
        self.handle.command(ops::REMOVE, KeyArgs { key }).await
    }

    pub async fn remove_if_present(&self, key: Value, value: Value) -> Result<bool> {
        self.handle
            .command(ops::REMOVE_IF_PRESENT, KeyValueArgs { key, value })
            .await
    }

    pub async fn replace(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.handle
            .command(ops::REPLACE, PutArgs { key, value, ttl: 0 })
            .await
    }

    pub async fn replace_if_present(&self, key: Value, expected: Value, value: Value) -> Result<bool> {
        self.handle
            .command(
                ops::REPLACE_IF_PRESENT,
                ReplaceIfPresentArgs {
                    key,
                    replace: expected,
                    value,
                    ttl: 0,
                },
            )
            .await
    }

    pub async fn size(&self) -> Result<usize> {
        self.handle.query(ops::SIZE, json!({})).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.handle.query(ops::IS_EMPTY, json!({})).await
    }

    pub async fn keys(&self) -> Result<Vec<Value>> {
        self.handle.query(ops::KEYS, json!({})).await
    }

    pub async fn values(&self) -> Result<Vec<Value>> {
        self.handle.query(ops::VALUES, json!({})).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.handle.command(ops::CLEAR, json!({})).await
    }
}

impl ResourceFacade for DistributedMap {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        DistributedMap::attach(invoker, id)
    }
}
