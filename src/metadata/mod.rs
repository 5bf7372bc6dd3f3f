// ============================================================================
// Mapping Metadata
// ============================================================================
//
// Read-only description of mapped entities and collection roles. Built once
// when the session factory is assembled and shared by every session.
//
// ============================================================================

pub mod collection;
pub mod persister;
pub mod types;

pub use collection::{CollectionElement, CollectionPersister};
pub use persister::{EntityPersister, IdentifierGeneration, Property};
pub use types::{CollectionType, ComponentType, EntityType, ForeignKeyDirection, Type};

use crate::core::{OrmError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of entity and collection persisters
#[derive(Debug, Default)]
pub struct Metamodel {
    entities: HashMap<String, Arc<EntityPersister>>,
    collections: HashMap<String, Arc<CollectionPersister>>,
}

impl Metamodel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, persister: EntityPersister) -> Self {
        self.entities
            .insert(persister.entity_name().to_string(), Arc::new(persister));
        self
    }

    pub fn collection(mut self, persister: CollectionPersister) -> Self {
        self.collections
            .insert(persister.role().to_string(), Arc::new(persister));
        self
    }

    pub fn entity_persister(&self, entity_name: &str) -> Result<Arc<EntityPersister>> {
        self.entities
            .get(entity_name)
            .cloned()
            .ok_or_else(|| OrmError::UnknownEntity(entity_name.to_string()))
    }

    pub fn collection_persister(&self, role: &str) -> Result<Arc<CollectionPersister>> {
        self.collections
            .get(role)
            .cloned()
            .ok_or_else(|| OrmError::UnknownCollectionRole(role.to_string()))
    }

    /// Root of the hierarchy `entity_name` belongs to; unmapped names are
    /// their own root.
    pub fn root_entity_name(&self, entity_name: &str) -> String {
        self.entities
            .get(entity_name)
            .map(|p| p.root_entity_name().to_string())
            .unwrap_or_else(|| entity_name.to_string())
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}
