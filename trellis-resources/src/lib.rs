//! `trellis-resources`: the resource types a Trellis server ships with.
//!
//! Each module holds one deterministic state machine, its operation table
//! and a typed client facade:
//!
//! | type id | name       | state machine     | facade                |
//! |---------|------------|-------------------|-----------------------|
//! | 1       | `map`      | [`map::MapState`]           | [`DistributedMap`]      |
//! | 2       | `multimap` | [`multimap::MultiMapState`] | [`DistributedMultiMap`] |
//! | 3       | `set`      | [`set::SetState`]           | [`DistributedSet`]      |
//! | 4       | `queue`    | [`queue::QueueState`]       | [`DistributedQueue`]    |
//! | 5       | `value`    | [`value::ValueState`]       | [`DistributedValue`]    |
//! | 6       | `long`     | [`long::LongState`]         | [`DistributedLong`]     |
//! | 7       | `lock`     | [`lock::LockState`]         | [`DistributedLock`]     |
//! | 8       | `group`    | [`group::GroupState`]       | [`DistributedGroup`]    |

pub mod group;
pub mod listeners;
pub mod lock;
pub mod long;
pub mod map;
pub mod multimap;
pub mod queue;
pub mod set;
pub mod value;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod group_test;
#[cfg(test)]
mod collections_test;
#[cfg(test)]
mod value_test;

pub use group::DistributedGroup;
pub use lock::DistributedLock;
pub use long::DistributedLong;
pub use map::DistributedMap;
pub use multimap::DistributedMultiMap;
pub use queue::DistributedQueue;
pub use set::DistributedSet;
pub use value::DistributedValue;

use trellis_core::{ResourceRegistry, ResourceType, Result};

/// Registry holding every built-in resource type.
pub fn builtin_registry() -> Result<ResourceRegistry> {
    ResourceRegistry::new(vec![
        ResourceType::of::<map::MapState>()?,
        ResourceType::of::<multimap::MultiMapState>()?,
        ResourceType::of::<set::SetState>()?,
        ResourceType::of::<queue::QueueState>()?,
        ResourceType::of::<value::ValueState>()?,
        ResourceType::of::<long::LongState>()?,
        ResourceType::of::<lock::LockState>()?,
        ResourceType::of::<group::GroupState>()?,
    ])
}

/// Absolute expiry for a TTL argument; non-positive TTLs never expire.
pub(crate) fn expiry(now: u64, ttl: i64) -> Option<u64> {
    if ttl > 0 {
        Some(now.saturating_add(ttl as u64))
    } else {
        None
    }
}

pub(crate) fn live(expire_at: Option<u64>, now: u64) -> bool {
    expire_at.map_or(true, |t| t > now)
}
