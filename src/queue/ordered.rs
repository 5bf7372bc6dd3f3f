use super::completion::TransactionCompletionProcesses;
use crate::action::{
    ActionKind, CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction,
    EntityDeleteAction, EntityInsertAction, EntityUpdateAction, Executable, ExecutableList,
    QueuedOperationCollectionAction,
};
use crate::core::Result;
use crate::session::SessionContext;
use async_trait::async_trait;
use lazy_static::lazy_static;
use std::collections::BTreeSet;
use tracing::{Level, event};

/// The per-kind action lists; each is created on first use
#[derive(Debug, Default)]
pub(crate) struct ActionLists {
    pub orphan_removals: Option<ExecutableList<EntityDeleteAction>>,
    pub insertions: Option<ExecutableList<EntityInsertAction>>,
    pub updates: Option<ExecutableList<EntityUpdateAction>>,
    pub collection_queued_ops: Option<ExecutableList<QueuedOperationCollectionAction>>,
    pub collection_removals: Option<ExecutableList<CollectionRemoveAction>>,
    pub collection_updates: Option<ExecutableList<CollectionUpdateAction>>,
    pub collection_creations: Option<ExecutableList<CollectionRecreateAction>>,
    pub deletions: Option<ExecutableList<EntityDeleteAction>>,
}

/// Type-erased view of one action list
#[async_trait]
pub(crate) trait ActionListView: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn query_spaces(&self) -> &BTreeSet<String>;

    fn clear(&mut self);

    fn sort(&mut self);

    fn prepare(&mut self, session: &SessionContext) -> Result<()>;

    /// Executes the list front to back, then clears it and flushes the
    /// connection's statement batch.
    async fn execute_all(
        &mut self,
        session: &SessionContext,
        processes: &TransactionCompletionProcesses,
    ) -> Result<()>;
}

#[async_trait]
impl<E: Executable> ActionListView for ExecutableList<E> {
    fn len(&self) -> usize {
        ExecutableList::len(self)
    }

    fn query_spaces(&self) -> &BTreeSet<String> {
        ExecutableList::query_spaces(self)
    }

    fn clear(&mut self) {
        ExecutableList::clear(self)
    }

    fn sort(&mut self) {
        ExecutableList::sort(self)
    }

    fn prepare(&mut self, session: &SessionContext) -> Result<()> {
        for executable in self.iter_mut() {
            executable.before_executions(session)?;
        }
        Ok(())
    }

    async fn execute_all(
        &mut self,
        session: &SessionContext,
        processes: &TransactionCompletionProcesses,
    ) -> Result<()> {
        let mut outcome = Ok(());
        for executable in self.iter_mut() {
            let result = executable.execute(session).await;
            register_completion_processes(executable, processes)?;
            if let Err(e) = result {
                event!(Level::DEBUG, action = ?executable, error = %e, "action failed");
                outcome = Err(e);
                break;
            }
        }

        // spaces of a partially executed list are invalidated too
        if session.is_query_cache_enabled() {
            let spaces: Vec<String> = ExecutableList::query_spaces(self).iter().cloned().collect();
            invalidate_spaces(&spaces, session, processes)?;
        }
        outcome?;

        ExecutableList::clear(self);
        session.connection()?.execute_batch().await
    }
}

/// Hands the action's completion callbacks to the transaction queues.
pub(crate) fn register_completion_processes<E: Executable + ?Sized>(
    executable: &mut E,
    processes: &TransactionCompletionProcesses,
) -> Result<()> {
    if let Some(process) = executable.take_before_transaction_completion_process() {
        processes.before.register(process)?;
    }
    if let Some(process) = executable.take_after_transaction_completion_process() {
        processes.after.register(process)?;
    }
    Ok(())
}

/// Pre-invalidates `spaces` now and schedules their invalidation for the
/// end of the transaction.
pub(crate) fn invalidate_spaces<S: AsRef<str>>(
    spaces: &[S],
    session: &SessionContext,
    processes: &TransactionCompletionProcesses,
) -> Result<()> {
    if spaces.is_empty() {
        return Ok(());
    }
    for space in spaces {
        processes.after.add_space_to_invalidate(space.as_ref())?;
    }
    session.timestamps().pre_invalidate(spaces)
}

/// One row of the execution table: which list, and how to reach it
pub(crate) struct OrderedAction {
    pub kind: ActionKind,
    pub get: fn(&ActionLists) -> Option<&dyn ActionListView>,
    pub get_mut: fn(&mut ActionLists) -> Option<&mut dyn ActionListView>,
}

macro_rules! ordered_action {
    ($kind:expr, $field:ident) => {{
        fn get(lists: &ActionLists) -> Option<&dyn ActionListView> {
            lists.$field.as_ref().map(|list| list as &dyn ActionListView)
        }
        fn get_mut(lists: &mut ActionLists) -> Option<&mut dyn ActionListView> {
            lists.$field.as_mut().map(|list| list as &mut dyn ActionListView)
        }
        OrderedAction {
            kind: $kind,
            get,
            get_mut,
        }
    }};
}

lazy_static! {
    /// Lists in execution order
    pub(crate) static ref ORDERED_ACTIONS: Vec<OrderedAction> = vec![
        ordered_action!(ActionKind::OrphanRemoval, orphan_removals),
        ordered_action!(ActionKind::Insert, insertions),
        ordered_action!(ActionKind::Update, updates),
        ordered_action!(ActionKind::CollectionQueuedOperation, collection_queued_ops),
        ordered_action!(ActionKind::CollectionRemove, collection_removals),
        ordered_action!(ActionKind::CollectionUpdate, collection_updates),
        ordered_action!(ActionKind::CollectionRecreate, collection_creations),
        ordered_action!(ActionKind::Delete, deletions),
    ];
}
