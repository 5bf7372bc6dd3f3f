use super::{ActionKind, ActionSortKey, Executable};
use crate::core::{CollectionRef, EntityRef, OrmError, QueuedOperation, Result, Value};
use crate::event::CollectionEvent;
use crate::metadata::CollectionPersister;
use crate::session::SessionContext;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// What every collection action carries: the role, the owning entity
/// (whose identifier is the collection key) and the collection itself
struct CollectionTarget {
    persister: Arc<CollectionPersister>,
    owner: EntityRef,
    collection: Option<CollectionRef>,
}

impl CollectionTarget {
    fn key(&self) -> Result<Value> {
        self.owner.id().ok_or_else(|| {
            OrmError::AssertionFailure(format!(
                "Collection {} owned by {} has no key",
                self.persister.role(),
                self.owner
            ))
        })
    }

    fn spaces(&self) -> Vec<String> {
        self.persister.query_spaces()
    }

    fn sort_key(&self) -> ActionSortKey {
        ActionSortKey::new(self.persister.role(), self.owner.id())
    }

    async fn insert_rows(&self, session: &SessionContext, key: &Value, elements: &[Value]) -> Result<()> {
        if self.persister.is_inverse() || elements.is_empty() {
            return Ok(());
        }
        let sql = self.persister.insert_row_sql();
        let params: Vec<Vec<Value>> = elements
            .iter()
            .map(|element| self.row_params(key, element))
            .collect();
        session.connection()?.update_batch(&sql, &params).await?;
        Ok(())
    }

    async fn delete_rows(&self, session: &SessionContext, key: &Value, elements: &[Value]) -> Result<()> {
        if self.persister.is_inverse() || elements.is_empty() {
            return Ok(());
        }
        let sql = self.persister.delete_row_sql();
        let params: Vec<Vec<Value>> = elements
            .iter()
            .map(|element| self.row_params(key, element))
            .collect();
        session.connection()?.update_batch(&sql, &params).await?;
        Ok(())
    }

    async fn remove_all(&self, session: &SessionContext, key: &Value) -> Result<()> {
        if self.persister.is_inverse() {
            return Ok(());
        }
        let sql = self.persister.delete_rows_sql();
        session
            .connection()?
            .update(&sql, std::slice::from_ref(key))
            .await?;
        Ok(())
    }

    // (key, element); for one-to-many the element binds the child's identifier
    fn row_params(&self, key: &Value, element: &Value) -> Vec<Value> {
        vec![key.clone(), element.to_parameter()]
    }

    fn notify(&self, session: &SessionContext) {
        let owner_id = self.owner.id();
        session.listeners().post_collection_action(&CollectionEvent {
            role: self.persister.role(),
            owner_id: owner_id.as_ref(),
        });
    }
}

impl fmt::Debug for CollectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.persister.role(), self.owner)
    }
}

/// Elements of `from` that do not occur in `to`, matching duplicates one by one.
fn difference(from: &[Value], to: &[Value]) -> Vec<Value> {
    let mut remaining: Vec<&Value> = to.iter().collect();
    let mut result = Vec::new();
    for element in from {
        match remaining.iter().position(|candidate| *candidate == element) {
            Some(index) => {
                remaining.swap_remove(index);
            }
            None => result.push(element.clone()),
        }
    }
    result
}

// ============================================================================
// Recreate
// ============================================================================

/// Writes every row of a collection that has no rows yet
pub struct CollectionRecreateAction {
    target: CollectionTarget,
    rows: Option<Vec<Value>>,
}

impl CollectionRecreateAction {
    pub fn new(collection: CollectionRef, persister: Arc<CollectionPersister>, owner: EntityRef) -> Self {
        Self {
            target: CollectionTarget {
                persister,
                owner,
                collection: Some(collection),
            },
            rows: None,
        }
    }

    pub fn collection(&self) -> Option<&CollectionRef> {
        self.target.collection.as_ref()
    }
}

#[async_trait]
impl Executable for CollectionRecreateAction {
    fn kind(&self) -> ActionKind {
        ActionKind::CollectionRecreate
    }

    fn property_spaces(&self) -> Vec<String> {
        self.target.spaces()
    }

    fn before_executions(&mut self, _session: &SessionContext) -> Result<()> {
        self.rows = self.target.collection.as_ref().map(|c| c.elements());
        Ok(())
    }

    async fn execute(&mut self, session: &SessionContext) -> Result<()> {
        let key = self.target.key()?;
        let rows = match self.rows.take() {
            Some(rows) => rows,
            None => self
                .target
                .collection
                .as_ref()
                .map(|c| c.elements())
                .unwrap_or_default(),
        };
        self.target.insert_rows(session, &key, &rows).await?;
        if let Some(collection) = &self.target.collection {
            collection.post_action();
        }
        self.target.notify(session);
        Ok(())
    }

    fn sort_key(&self) -> ActionSortKey {
        self.target.sort_key()
    }
}

impl fmt::Debug for CollectionRecreateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionRecreateAction({:?})", self.target)
    }
}

// ============================================================================
// Update
// ============================================================================

/// Brings the rows of a changed collection in line with its elements
pub struct CollectionUpdateAction {
    target: CollectionTarget,
    removed: Vec<Value>,
    added: Vec<Value>,
    remove_all: bool,
    prepared: bool,
}

impl CollectionUpdateAction {
    pub fn new(collection: CollectionRef, persister: Arc<CollectionPersister>, owner: EntityRef) -> Self {
        Self {
            target: CollectionTarget {
                persister,
                owner,
                collection: Some(collection),
            },
            removed: Vec::new(),
            added: Vec::new(),
            remove_all: false,
            prepared: false,
        }
    }

    /// Rows to delete and rows to insert, as computed by preparation.
    pub fn diff(&self) -> (&[Value], &[Value]) {
        (&self.removed, &self.added)
    }

    fn compute_diff(&mut self) {
        let Some(collection) = &self.target.collection else {
            return;
        };
        let current = collection.elements();
        let snapshot = collection.snapshot().unwrap_or_default();
        self.remove_all = current.is_empty() && !snapshot.is_empty();
        self.removed = difference(&snapshot, &current);
        self.added = difference(&current, &snapshot);
        self.prepared = true;
    }
}

#[async_trait]
impl Executable for CollectionUpdateAction {
    fn kind(&self) -> ActionKind {
        ActionKind::CollectionUpdate
    }

    fn property_spaces(&self) -> Vec<String> {
        self.target.spaces()
    }

    fn before_executions(&mut self, _session: &SessionContext) -> Result<()> {
        self.compute_diff();
        Ok(())
    }

    async fn execute(&mut self, session: &SessionContext) -> Result<()> {
        if !self.prepared {
            self.compute_diff();
        }
        let key = self.target.key()?;
        if self.remove_all {
            self.target.remove_all(session, &key).await?;
        } else {
            self.target.delete_rows(session, &key, &self.removed).await?;
            self.target.insert_rows(session, &key, &self.added).await?;
        }
        if let Some(collection) = &self.target.collection {
            collection.post_action();
        }
        self.prepared = false;
        self.target.notify(session);
        Ok(())
    }

    fn sort_key(&self) -> ActionSortKey {
        self.target.sort_key()
    }
}

impl fmt::Debug for CollectionUpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionUpdateAction({:?})", self.target)
    }
}

// ============================================================================
// Remove
// ============================================================================

/// Deletes every row of a collection whose owner dropped or replaced it
pub struct CollectionRemoveAction {
    target: CollectionTarget,
}

impl CollectionRemoveAction {
    /// `collection` is `None` when the rows belong to a collection that was
    /// never loaded into the session.
    pub fn new(
        collection: Option<CollectionRef>,
        persister: Arc<CollectionPersister>,
        owner: EntityRef,
    ) -> Self {
        Self {
            target: CollectionTarget {
                persister,
                owner,
                collection,
            },
        }
    }

    pub fn owner(&self) -> &EntityRef {
        &self.target.owner
    }
}

#[async_trait]
impl Executable for CollectionRemoveAction {
    fn kind(&self) -> ActionKind {
        ActionKind::CollectionRemove
    }

    fn property_spaces(&self) -> Vec<String> {
        self.target.spaces()
    }

    fn before_executions(&mut self, _session: &SessionContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&mut self, session: &SessionContext) -> Result<()> {
        let key = self.target.key()?;
        self.target.remove_all(session, &key).await?;
        if let Some(collection) = &self.target.collection {
            collection.post_action();
        }
        self.target.notify(session);
        Ok(())
    }

    fn sort_key(&self) -> ActionSortKey {
        self.target.sort_key()
    }
}

impl fmt::Debug for CollectionRemoveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionRemoveAction({:?})", self.target)
    }
}

// ============================================================================
// Queued operations
// ============================================================================

/// Applies the adds and removes recorded against an uninitialized collection
pub struct QueuedOperationCollectionAction {
    target: CollectionTarget,
    operations: Vec<QueuedOperation>,
}

impl QueuedOperationCollectionAction {
    pub fn new(collection: CollectionRef, persister: Arc<CollectionPersister>, owner: EntityRef) -> Self {
        Self {
            target: CollectionTarget {
                persister,
                owner,
                collection: Some(collection),
            },
            operations: Vec::new(),
        }
    }

    pub fn operations(&self) -> &[QueuedOperation] {
        &self.operations
    }

    fn take_operations(&mut self) {
        if let Some(collection) = &self.target.collection {
            self.operations.extend(collection.take_queued_operations());
        }
    }
}

#[async_trait]
impl Executable for QueuedOperationCollectionAction {
    fn kind(&self) -> ActionKind {
        ActionKind::CollectionQueuedOperation
    }

    fn property_spaces(&self) -> Vec<String> {
        self.target.spaces()
    }

    fn before_executions(&mut self, _session: &SessionContext) -> Result<()> {
        self.take_operations();
        Ok(())
    }

    async fn execute(&mut self, session: &SessionContext) -> Result<()> {
        self.take_operations();
        let key = self.target.key()?;
        for operation in std::mem::take(&mut self.operations) {
            match operation {
                QueuedOperation::Add(element) => {
                    self.target.insert_rows(session, &key, &[element]).await?
                }
                QueuedOperation::Remove(element) => {
                    self.target.delete_rows(session, &key, &[element]).await?
                }
            }
        }
        self.target.notify(session);
        Ok(())
    }

    fn sort_key(&self) -> ActionSortKey {
        self.target.sort_key()
    }
}

impl fmt::Debug for QueuedOperationCollectionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueuedOperationCollectionAction({:?})", self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::MemoryBackend;
    use crate::core::{EntityInstance, PersistentCollection};
    use crate::event::ListenerRegistry;
    use crate::metadata::Metamodel;
    use crate::session::{FactoryServices, SessionFactoryOptions};

    fn session() -> (Arc<MemoryBackend>, SessionContext) {
        let backend = MemoryBackend::new();
        let services = FactoryServices::new(
            SessionFactoryOptions::default(),
            Metamodel::new(),
            ListenerRegistry::new(),
        );
        let session = SessionContext::new(services, Box::new(backend.connect(1)));
        (backend, session)
    }

    fn tags() -> Arc<CollectionPersister> {
        Arc::new(
            CollectionPersister::new("Post.tags", "post_tags")
                .key_column("post_id")
                .element_column("tag"),
        )
    }

    #[test]
    fn test_difference_matches_duplicates_individually() {
        let from = vec![Value::from("a"), Value::from("a"), Value::from("b")];
        let to = vec![Value::from("a")];
        assert_eq!(difference(&from, &to), vec![Value::from("a"), Value::from("b")]);
    }

    #[tokio::test]
    async fn test_recreate_writes_every_element() {
        let (backend, session) = session();
        let post = EntityInstance::with_id("Post", 1i64, vec![]);
        let collection = PersistentCollection::new("Post.tags", vec![Value::from("rust"), Value::from("orm")]);
        let mut action = CollectionRecreateAction::new(collection.clone(), tags(), post);

        action.before_executions(&session).unwrap();
        action.execute(&session).await.unwrap();

        let journal = backend.journal().unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[1].params, vec![Value::Integer(1), Value::from("orm")]);
        assert!(!collection.is_dirty());
    }

    #[tokio::test]
    async fn test_update_diff_is_fixed_at_preparation() {
        let (backend, session) = session();
        let post = EntityInstance::with_id("Post", 1i64, vec![]);
        let collection = PersistentCollection::loaded("Post.tags", vec![Value::from("a"), Value::from("b")]);
        collection.remove(&Value::from("a"));
        collection.add(Value::from("c"));

        let mut action = CollectionUpdateAction::new(collection.clone(), tags(), post);
        action.before_executions(&session).unwrap();
        assert_eq!(action.diff(), (&[Value::from("a")][..], &[Value::from("c")][..]));

        action.execute(&session).await.unwrap();
        assert_eq!(
            backend.statements().unwrap(),
            vec![
                "DELETE FROM post_tags WHERE post_id = ? AND tag = ?",
                "INSERT INTO post_tags (post_id, tag) VALUES (?, ?)",
            ]
        );
    }

    #[tokio::test]
    async fn test_emptied_collection_removes_all_rows() {
        let (backend, session) = session();
        let post = EntityInstance::with_id("Post", 1i64, vec![]);
        let collection = PersistentCollection::loaded("Post.tags", vec![Value::from("a")]);
        collection.remove(&Value::from("a"));

        let mut action = CollectionUpdateAction::new(collection, tags(), post);
        action.execute(&session).await.unwrap();

        assert_eq!(backend.statements().unwrap(), vec!["DELETE FROM post_tags WHERE post_id = ?"]);
    }

    #[tokio::test]
    async fn test_inverse_collection_writes_nothing() {
        let (backend, session) = session();
        let persister = Arc::new(
            CollectionPersister::new("Customer.orders", "orders")
                .one_to_many("Order")
                .inverse(),
        );
        let customer = EntityInstance::with_id("Customer", 1i64, vec![]);
        let mut action = CollectionRemoveAction::new(None, persister, customer);

        action.execute(&session).await.unwrap();
        assert!(backend.journal().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queued_operations_are_applied_as_rows() {
        let (backend, session) = session();
        let post = EntityInstance::with_id("Post", 2i64, vec![]);
        let collection = PersistentCollection::uninitialized("Post.tags");
        collection.add(Value::from("new"));
        collection.remove(&Value::from("old"));

        let mut action = QueuedOperationCollectionAction::new(collection.clone(), tags(), post);
        action.before_executions(&session).unwrap();
        assert_eq!(action.operations().len(), 2);
        assert!(!collection.has_queued_operations());

        action.execute(&session).await.unwrap();
        assert_eq!(
            backend.statements().unwrap(),
            vec![
                "INSERT INTO post_tags (post_id, tag) VALUES (?, ?)",
                "DELETE FROM post_tags WHERE post_id = ? AND tag = ?",
            ]
        );
    }

    #[tokio::test]
    async fn test_transient_owner_is_an_assertion_failure() {
        let (_, session) = session();
        let post = EntityInstance::new("Post", vec![]);
        let collection = PersistentCollection::new("Post.tags", vec![Value::from("a")]);
        let mut action = CollectionRecreateAction::new(collection, tags(), post);

        assert!(matches!(
            action.execute(&session).await,
            Err(OrmError::AssertionFailure(_))
        ));
    }
}
