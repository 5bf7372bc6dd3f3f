use crate::core::{EntityRef, InstanceId, OrmError, Result, Value};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status of an entity known to the persistence context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Persist was requested; the insert has not been resolved yet.
    Saving,
    Managed,
    ReadOnly,
    /// Scheduled for deletion in this unit of work.
    Deleted,
    /// Deleted and the delete statement has been executed.
    Gone,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Saving => "SAVING",
            Status::Managed => "MANAGED",
            Status::ReadOnly => "READ_ONLY",
            Status::Deleted => "DELETED",
            Status::Gone => "GONE",
        };
        write!(f, "{}", name)
    }
}

/// What the session knows about one entity instance
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub instance: EntityRef,
    pub entity_name: String,
    pub id: Option<Value>,
    pub status: Status,
    /// Property values as last read from or written to the database
    pub loaded_state: Option<Vec<Value>>,
    pub exists_in_database: bool,
}

impl EntityEntry {
    /// Whether references to this entity still wait for its insert.
    pub fn is_nullifiable(&self) -> bool {
        self.status == Status::Saving
    }
}

/// First-level cache of one session, keyed by instance identity
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entries: HashMap<InstanceId, EntityEntry>,
    order: Vec<InstanceId>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(
        &mut self,
        instance: &EntityRef,
        status: Status,
        loaded_state: Option<Vec<Value>>,
        exists_in_database: bool,
    ) -> &EntityEntry {
        let key = instance.instance_id();
        if !self.entries.contains_key(&key) {
            self.order.push(key);
        }
        let entry = EntityEntry {
            instance: instance.clone(),
            entity_name: instance.entity_name().to_string(),
            id: instance.id(),
            status,
            loaded_state,
            exists_in_database,
        };
        self.entries.insert(key, entry);
        &self.entries[&key]
    }

    /// Registers an instance read from the database.
    pub fn add_loaded(&mut self, instance: &EntityRef) -> &EntityEntry {
        self.add_entry(instance, Status::Managed, Some(instance.properties()), true)
    }

    pub fn entry(&self, instance: &EntityRef) -> Option<&EntityEntry> {
        self.entries.get(&instance.instance_id())
    }

    pub fn entry_mut(&mut self, instance: &EntityRef) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&instance.instance_id())
    }

    pub fn is_entry_for(&self, instance: &EntityRef) -> bool {
        self.entries.contains_key(&instance.instance_id())
    }

    pub fn set_status(&mut self, instance: &EntityRef, status: Status) -> Result<()> {
        let entry = self.entry_mut(instance).ok_or_else(|| {
            OrmError::AssertionFailure(format!("No entity entry for {}", instance))
        })?;
        entry.status = status;
        Ok(())
    }

    /// Records a completed insert or update: the instance is managed and
    /// its current state becomes the loaded state.
    pub fn mark_managed(&mut self, instance: &EntityRef, state: Vec<Value>) {
        let existing = self.entry(instance).map(|e| e.status);
        let status = match existing {
            Some(Status::ReadOnly) => Status::ReadOnly,
            _ => Status::Managed,
        };
        self.add_entry(instance, status, Some(state), true);
    }

    pub fn remove_entry(&mut self, instance: &EntityRef) -> Option<EntityEntry> {
        let key = instance.instance_id();
        self.order.retain(|k| *k != key);
        self.entries.remove(&key)
    }

    /// An instance is transient while the session has no entry for it or its
    /// own insert is still pending. Proxies always stand for existing rows.
    pub fn is_transient(&self, value: &Value) -> bool {
        match value {
            Value::Entity(instance) => match self.entry(instance) {
                Some(entry) => entry.is_nullifiable(),
                None => true,
            },
            Value::Proxy(proxy) => match proxy.implementation() {
                Some(instance) => self.entry(&instance).is_some_and(EntityEntry::is_nullifiable),
                None => false,
            },
            _ => false,
        }
    }

    /// Entries in the order they were first registered.
    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
