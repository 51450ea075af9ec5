//! `trellis-core`: operation model and resource state machine traits.
//!
//! Everything here is transport- and consensus-agnostic: the replicated
//! dispatcher lives in `trellis-raft`, the concrete resources in
//! `trellis-resources`.

pub mod descriptor;
pub mod error;
pub mod invoker;
pub mod operation;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod value;

#[cfg(test)]
mod descriptor_test;
#[cfg(test)]
mod resource_test;
#[cfg(test)]
mod scheduler_test;

pub use error::{Error, Result};
pub use invoker::{Invoker, OperationResponse, ResourceFacade, ResourceHandle, SessionEvent};
pub use operation::{
    CompactionMode, ConsistencyLevel, OperationId, OperationKind, ResourceId, ResourceRef,
    ResourceTypeId, SessionId,
};
pub use registry::{ResourceRegistry, ResourceType};
