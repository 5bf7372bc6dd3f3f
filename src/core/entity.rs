// ============================================================================
// Entity, Proxy and Collection instances
// ============================================================================
//
// Runtime representation of the objects a session manages. Instances are
// shared (`Arc`) between the application, the persistence context and the
// pending actions; identity is the process-unique `InstanceId`, never the
// identifier value (transient instances have none yet).
//
// ============================================================================

use crate::core::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an entity instance within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance_{}", self.0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub type EntityRef = Arc<EntityInstance>;
pub type ProxyRef = Arc<LazyProxy>;
pub type CollectionRef = Arc<PersistentCollection>;

/// A mapped object: concrete entity name, optional identifier and property values
pub struct EntityInstance {
    instance_id: InstanceId,
    entity_name: String,
    id: Mutex<Option<Value>>,
    properties: Mutex<Vec<Value>>,
}

impl EntityInstance {
    /// Creates a transient instance (no identifier yet).
    pub fn new(entity_name: impl Into<String>, properties: Vec<Value>) -> EntityRef {
        Arc::new(Self {
            instance_id: InstanceId::next(),
            entity_name: entity_name.into(),
            id: Mutex::new(None),
            properties: Mutex::new(properties),
        })
    }

    /// Creates an instance carrying an assigned identifier.
    pub fn with_id(
        entity_name: impl Into<String>,
        id: impl Into<Value>,
        properties: Vec<Value>,
    ) -> EntityRef {
        let instance = Self::new(entity_name, properties);
        instance.set_id(id.into());
        instance
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Runtime entity name, which may name a subclass of the mapped entity.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn id(&self) -> Option<Value> {
        lock(&self.id).clone()
    }

    pub fn set_id(&self, id: Value) {
        *lock(&self.id) = Some(id);
    }

    pub fn properties(&self) -> Vec<Value> {
        lock(&self.properties).clone()
    }

    pub fn property(&self, index: usize) -> Option<Value> {
        lock(&self.properties).get(index).cloned()
    }

    pub fn set_property(&self, index: usize, value: Value) {
        let mut properties = lock(&self.properties);
        if index >= properties.len() {
            properties.resize(index + 1, Value::Null);
        }
        properties[index] = value;
    }

    pub fn set_properties(&self, values: Vec<Value>) {
        *lock(&self.properties) = values;
    }
}

impl fmt::Display for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}#{}", self.entity_name, id),
            None => write!(f, "{}#<transient {}>", self.entity_name, self.instance_id),
        }
    }
}

// Properties may point back at this instance, so Debug stays shallow.
impl fmt::Debug for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityInstance")
            .field("instance_id", &self.instance_id)
            .field("entity_name", &self.entity_name)
            .field("id", &self.id())
            .finish()
    }
}

/// Lazy-initializing stand-in for an entity that has not been loaded
pub struct LazyProxy {
    entity_name: String,
    id: Value,
    target: Mutex<Option<EntityRef>>,
}

impl LazyProxy {
    pub fn new(entity_name: impl Into<String>, id: impl Into<Value>) -> ProxyRef {
        Arc::new(Self {
            entity_name: entity_name.into(),
            id: id.into(),
            target: Mutex::new(None),
        })
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn initialize(&self, implementation: EntityRef) {
        *lock(&self.target) = Some(implementation);
    }

    pub fn is_uninitialized(&self) -> bool {
        lock(&self.target).is_none()
    }

    pub fn implementation(&self) -> Option<EntityRef> {
        lock(&self.target).clone()
    }
}

impl fmt::Debug for LazyProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyProxy")
            .field("entity_name", &self.entity_name)
            .field("id", &self.id)
            .field("initialized", &!self.is_uninitialized())
            .finish()
    }
}

/// Operation recorded against a collection that was never initialized
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedOperation {
    Add(Value),
    Remove(Value),
}

/// Collection-valued property tracked against its last persisted snapshot
pub struct PersistentCollection {
    role: String,
    initialized: AtomicBool,
    elements: Mutex<Vec<Value>>,
    snapshot: Mutex<Option<Vec<Value>>>,
    queued: Mutex<Vec<QueuedOperation>>,
}

impl PersistentCollection {
    /// A new, initialized collection that has never been persisted.
    pub fn new(role: impl Into<String>, elements: Vec<Value>) -> CollectionRef {
        Arc::new(Self {
            role: role.into(),
            initialized: AtomicBool::new(true),
            elements: Mutex::new(elements),
            snapshot: Mutex::new(None),
            queued: Mutex::new(Vec::new()),
        })
    }

    /// A collection loaded from the database with `elements` as its snapshot.
    pub fn loaded(role: impl Into<String>, elements: Vec<Value>) -> CollectionRef {
        let collection = Self::new(role, elements);
        collection.post_action();
        collection
    }

    /// A collection whose elements were never fetched; mutations are queued.
    pub fn uninitialized(role: impl Into<String>) -> CollectionRef {
        Arc::new(Self {
            role: role.into(),
            initialized: AtomicBool::new(false),
            elements: Mutex::new(Vec::new()),
            snapshot: Mutex::new(None),
            queued: Mutex::new(Vec::new()),
        })
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn was_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn elements(&self) -> Vec<Value> {
        lock(&self.elements).clone()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.elements).is_empty()
    }

    pub fn add(&self, element: Value) {
        if self.was_initialized() {
            lock(&self.elements).push(element);
        } else {
            lock(&self.queued).push(QueuedOperation::Add(element));
        }
    }

    pub fn remove(&self, element: &Value) -> bool {
        if !self.was_initialized() {
            lock(&self.queued).push(QueuedOperation::Remove(element.clone()));
            return true;
        }
        let mut elements = lock(&self.elements);
        match elements.iter().position(|e| e == element) {
            Some(index) => {
                elements.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Option<Vec<Value>> {
        lock(&self.snapshot).clone()
    }

    pub fn is_dirty(&self) -> bool {
        let snapshot = lock(&self.snapshot);
        match snapshot.as_ref() {
            Some(previous) => *previous != *lock(&self.elements),
            None => true,
        }
    }

    pub fn has_queued_operations(&self) -> bool {
        !lock(&self.queued).is_empty()
    }

    pub fn take_queued_operations(&self) -> Vec<QueuedOperation> {
        std::mem::take(&mut *lock(&self.queued))
    }

    /// Marks the current elements as the persisted state.
    pub fn post_action(&self) {
        let current = self.elements();
        *lock(&self.snapshot) = Some(current);
    }
}

impl fmt::Debug for PersistentCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCollection")
            .field("role", &self.role)
            .field("initialized", &self.was_initialized())
            .field("size", &lock(&self.elements).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = EntityInstance::new("Order", vec![]);
        let b = EntityInstance::new("Order", vec![]);
        assert_ne!(a.instance_id(), b.instance_id());
        assert!(a.id().is_none());
    }

    #[test]
    fn test_proxy_initialization() {
        let proxy = LazyProxy::new("Customer", 3i64);
        assert!(proxy.is_uninitialized());

        let customer = EntityInstance::with_id("Customer", 3i64, vec![]);
        proxy.initialize(customer.clone());
        assert!(!proxy.is_uninitialized());
        assert!(Arc::ptr_eq(&proxy.implementation().unwrap(), &customer));
    }

    #[test]
    fn test_collection_dirty_tracking() {
        let tags = PersistentCollection::loaded("Post.tags", vec![Value::from("a")]);
        assert!(!tags.is_dirty());

        tags.add(Value::from("b"));
        assert!(tags.is_dirty());

        tags.post_action();
        assert!(!tags.is_dirty());
        assert_eq!(tags.snapshot().unwrap().len(), 2);
    }

    #[test]
    fn test_uninitialized_collection_queues_operations() {
        let lines = PersistentCollection::uninitialized("Order.lines");
        lines.add(Value::Integer(1));
        assert!(lines.remove(&Value::Integer(2)));

        assert!(lines.is_empty());
        assert_eq!(
            lines.take_queued_operations(),
            vec![
                QueuedOperation::Add(Value::Integer(1)),
                QueuedOperation::Remove(Value::Integer(2)),
            ]
        );
        assert!(!lines.has_queued_operations());
    }
}
