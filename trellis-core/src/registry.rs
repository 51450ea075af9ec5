//! Resource-type catalogue.
//!
//! Built once at startup from the types the server ships with and injected
//! into the dispatcher; it is immutable afterwards.

use std::any::{self, Any};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::descriptor::ResourceDescriptor;
use crate::error::{Error, Result};
use crate::invoker::{Invoker, ResourceFacade};
use crate::operation::{ResourceId, ResourceTypeId};
use crate::resource::{ManagedResource, Operations, ResourceExecutor, ResourceState};

/// Creates and restores instances of one resource type, and the client
/// facades that address them.
pub trait ResourceFactory: Send + Sync {
    fn descriptor(&self) -> &ResourceDescriptor;

    fn create(&self, config: &Value) -> Result<Box<dyn ManagedResource>>;

    fn restore(&self, snapshot: Value) -> Result<Box<dyn ManagedResource>>;

    fn facade(&self, invoker: Arc<dyn Invoker>, id: ResourceId) -> Box<dyn Any + Send + Sync>;
}

struct TypedFactory<S: ResourceState> {
    ops: Arc<Operations<S>>,
}

impl<S: ResourceState> ResourceFactory for TypedFactory<S> {
    fn descriptor(&self) -> &ResourceDescriptor {
        self.ops.descriptor()
    }

    fn create(&self, config: &Value) -> Result<Box<dyn ManagedResource>> {
        let state = S::create(config)?;
        Ok(Box::new(ResourceExecutor::new(self.ops.clone(), state)))
    }

    fn restore(&self, snapshot: Value) -> Result<Box<dyn ManagedResource>> {
        Ok(Box::new(ResourceExecutor::restore(
            self.ops.clone(),
            snapshot,
        )?))
    }

    fn facade(&self, invoker: Arc<dyn Invoker>, id: ResourceId) -> Box<dyn Any + Send + Sync> {
        Box::new(<S::Facade as ResourceFacade>::attach(invoker, id))
    }
}

pub struct ResourceType {
    pub id: ResourceTypeId,
    pub name: &'static str,
    factory: Box<dyn ResourceFactory>,
}

impl ResourceType {
    /// Build the type entry for `S`, validating its operation table.
    pub fn of<S: ResourceState>() -> Result<Self> {
        let ops = S::operations().validate()?;
        Ok(Self {
            id: S::TYPE_ID,
            name: S::TYPE_NAME,
            factory: Box::new(TypedFactory {
                ops: Arc::new(ops),
            }),
        })
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        self.factory.descriptor()
    }

    pub fn create(&self, config: &Value) -> Result<Box<dyn ManagedResource>> {
        self.factory.create(config)
    }

    pub fn restore(&self, snapshot: Value) -> Result<Box<dyn ManagedResource>> {
        self.factory.restore(snapshot)
    }

    /// The facade of this type bound to resource `id`. Fails with
    /// `WrongResourceType` when `F` is not this type's facade.
    pub fn facade<F: 'static>(&self, invoker: Arc<dyn Invoker>, id: ResourceId) -> Result<F> {
        self.factory
            .facade(invoker, id)
            .downcast::<F>()
            .map(|facade| *facade)
            .map_err(|_| {
                Error::WrongResourceType(format!(
                    "{} is not the facade of {}",
                    any::type_name::<F>(),
                    self.name
                ))
            })
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    types: BTreeMap<ResourceTypeId, Arc<ResourceType>>,
    names: HashMap<&'static str, ResourceTypeId>,
}

impl ResourceRegistry {
    pub fn new(types: impl IntoIterator<Item = ResourceType>) -> Result<Self> {
        let mut registry = Self::default();
        for t in types {
            if registry.types.contains_key(&t.id) || registry.names.contains_key(t.name) {
                return Err(Error::internal(format!(
                    "resource type {} ({}) registered twice",
                    t.name, t.id
                )));
            }
            registry.names.insert(t.name, t.id);
            registry.types.insert(t.id, Arc::new(t));
        }
        Ok(registry)
    }

    pub fn get(&self, id: ResourceTypeId) -> Option<&Arc<ResourceType>> {
        self.types.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<ResourceType>> {
        self.names.get(name).and_then(|id| self.types.get(id))
    }

    /// Look a type up by name, falling back to a numeric id.
    pub fn resolve(&self, type_name: &str) -> Result<&Arc<ResourceType>> {
        self.by_name(type_name)
            .or_else(|| {
                type_name
                    .parse::<ResourceTypeId>()
                    .ok()
                    .and_then(|id| self.get(id))
            })
            .ok_or_else(|| Error::bad_request(format!("unknown resource type: {}", type_name)))
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<ResourceType>> {
        self.types.values()
    }
}
