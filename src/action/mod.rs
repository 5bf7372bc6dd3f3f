// ============================================================================
// Executable Actions
// ============================================================================
//
// One pending DML operation each. An action knows the query spaces it
// touches, runs its statements through the session's connection, and may
// leave behind callbacks for the end of the transaction.
//
// ============================================================================

pub mod cleanup;
pub mod collection;
pub mod delete;
pub mod insert;
pub mod list;
pub mod update;

pub use cleanup::BulkOperationCleanupAction;
pub use collection::{
    CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction,
    QueuedOperationCollectionAction,
};
pub use delete::EntityDeleteAction;
pub use insert::EntityInsertAction;
pub use list::{ExecutableList, ListSorter};
pub use update::EntityUpdateAction;

use crate::core::{Result, Value};
use crate::session::SessionContext;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::fmt;

/// Kind of a pending action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Insert,
    IdentityInsert,
    Update,
    Delete,
    OrphanRemoval,
    CollectionRecreate,
    CollectionUpdate,
    CollectionRemove,
    CollectionQueuedOperation,
    BulkCleanup,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Insert => "insert",
            ActionKind::IdentityInsert => "identity-insert",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::OrphanRemoval => "orphan-removal",
            ActionKind::CollectionRecreate => "collection-recreate",
            ActionKind::CollectionUpdate => "collection-update",
            ActionKind::CollectionRemove => "collection-remove",
            ActionKind::CollectionQueuedOperation => "collection-queued-operation",
            ActionKind::BulkCleanup => "bulk-cleanup",
        };
        write!(f, "{}", name)
    }
}

/// Ordering key used when a list is sorted without a dedicated sorter:
/// entity name (or collection role), then identifier (or owner key).
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSortKey {
    pub name: String,
    pub id: Value,
}

impl ActionSortKey {
    pub fn new(name: impl Into<String>, id: Option<Value>) -> Self {
        Self {
            name: name.into(),
            id: id.unwrap_or(Value::Null),
        }
    }

    pub fn compare(&self, other: &ActionSortKey) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.id.compare(&other.id).unwrap_or(Ordering::Equal))
    }
}

/// Callback run before the transaction commits
#[async_trait]
pub trait BeforeTransactionCompletionProcess: Send + Sync {
    async fn do_before_transaction_completion(self: Box<Self>, session: &SessionContext) -> Result<()>;
}

/// Callback run after the transaction commits or rolls back
#[async_trait]
pub trait AfterTransactionCompletionProcess: Send + Sync {
    async fn do_after_transaction_completion(
        self: Box<Self>,
        success: bool,
        session: &SessionContext,
    ) -> Result<()>;
}

#[async_trait]
pub trait Executable: Send + Sync + fmt::Debug {
    fn kind(&self) -> ActionKind;

    /// Tables (query spaces) this action writes to.
    fn property_spaces(&self) -> Vec<String>;

    /// Synchronous preparation before any action of the flush executes.
    ///
    /// Only collection actions take part in preparation.
    fn before_executions(&mut self, _session: &SessionContext) -> Result<()> {
        Err(crate::core::OrmError::AssertionFailure(format!(
            "before_executions() called for non-collection action {}",
            self.kind()
        )))
    }

    async fn execute(&mut self, session: &SessionContext) -> Result<()>;

    fn take_before_transaction_completion_process(
        &mut self,
    ) -> Option<Box<dyn BeforeTransactionCompletionProcess>> {
        None
    }

    fn take_after_transaction_completion_process(
        &mut self,
    ) -> Option<Box<dyn AfterTransactionCompletionProcess>> {
        None
    }

    fn sort_key(&self) -> ActionSortKey;
}
