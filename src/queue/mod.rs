// ============================================================================
// Action Queue
// ============================================================================
//
// Per-session coordinator of pending DML. Session operations hand actions
// to the queue; a flush prepares and sorts them, then executes the lists
// one after another in a fixed order:
//
//   orphan removals → inserts → updates → queued collection operations
//   → collection removals → collection updates → collection creations
//   → deletes
//
// Each list runs to completion before the next one starts and every action
// awaits its own statements, so a session never has more than one
// statement in flight. Inserts that reference entities still waiting for
// their own insert are parked until those entities become managed.
//
// ============================================================================

pub mod completion;
pub(crate) mod ordered;
pub mod sorter;
pub mod unresolved;

pub use completion::{
    AfterTransactionCompletionProcessQueue, BeforeTransactionCompletionProcessQueue,
    TransactionCompletionProcesses,
};
pub use sorter::InsertActionSorter;
pub use unresolved::UnresolvedEntityInsertActions;

use crate::action::{
    AfterTransactionCompletionProcess, BeforeTransactionCompletionProcess,
    BulkOperationCleanupAction, CollectionRecreateAction, CollectionRemoveAction,
    CollectionUpdateAction, EntityDeleteAction, EntityInsertAction, EntityUpdateAction,
    Executable, ExecutableList, QueuedOperationCollectionAction,
};
use crate::core::{OrmError, Result, Value};
use crate::engine::EntityEntry;
use crate::session::SessionContext;
use ordered::{
    ActionListView, ActionLists, ORDERED_ACTIONS, invalidate_spaces, register_completion_processes,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

fn list_for<E: Executable>(slot: &mut Option<ExecutableList<E>>, requires_sorting: bool) -> &mut ExecutableList<E> {
    slot.get_or_insert_with(|| ExecutableList::new(requires_sorting))
}

fn len_of<E: Executable>(slot: &Option<ExecutableList<E>>) -> usize {
    slot.as_ref().map_or(0, ExecutableList::len)
}

/// Pending actions of one session
pub struct ActionQueue {
    session: SessionContext,
    lists: ActionLists,
    unresolved_insertions: UnresolvedEntityInsertActions,
    transaction_completion_processes: TransactionCompletionProcesses,
    is_transaction_coordinator_shared: bool,
}

impl ActionQueue {
    pub fn new(session: SessionContext) -> Self {
        Self {
            session,
            lists: ActionLists::default(),
            unresolved_insertions: UnresolvedEntityInsertActions::new(),
            transaction_completion_processes: TransactionCompletionProcesses::new(),
            is_transaction_coordinator_shared: false,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    // ========================================================================
    // Adding actions
    // ========================================================================

    /// Queues an insert, or parks it while it references transient entities
    /// through non-nullable associations.
    ///
    /// Early (identity) inserts run immediately once resolved; a vetoed
    /// early insert fails with `OrmError::EntityActionVeto`.
    pub async fn add_insert_action(&mut self, insert: EntityInsertAction) -> Result<()> {
        if insert.is_early_insert() {
            event!(Level::TRACE, "executing inserts before finding non-nullable transient entities for early insert");
            self.execute_inserts().await?;
        }

        let dependencies =
            insert.find_non_nullable_transient_entities(&*self.session.persistence_context()?);
        if dependencies.is_empty() {
            event!(Level::TRACE, entity = %insert.instance(), "adding insert with no non-nullable transient entities");
            self.add_resolved_entity_insert_action(insert).await
        } else {
            event!(
                Level::TRACE,
                entity = %insert.instance(),
                dependencies = %dependencies,
                "adding insert with non-nullable transient entities"
            );
            self.unresolved_insertions
                .add_unresolved_entity_insert_action(insert, dependencies);
            Ok(())
        }
    }

    // Inserts released by a resolution are handled depth first, in the
    // order the tracker returns them.
    async fn add_resolved_entity_insert_action(&mut self, insert: EntityInsertAction) -> Result<()> {
        let mut pending = VecDeque::from([insert]);

        while let Some(mut insert) = pending.pop_front() {
            let instance = insert.instance().clone();
            if insert.is_early_insert() {
                event!(Level::TRACE, "executing insertions before resolved early insert");
                self.execute_inserts().await?;
                event!(Level::DEBUG, entity = %instance, "executing identity insert immediately");
                self.execute(&mut insert).await?;
                if insert.is_veto() {
                    return Err(OrmError::EntityActionVeto {
                        entity_name: insert.entity_name().to_string(),
                    });
                }
                insert.make_entity_managed(&self.session)?;
            } else {
                event!(Level::TRACE, entity = %instance, "adding resolved non-early insert action");
                insert.make_entity_managed(&self.session)?;
                self.insertions().add(insert);
            }

            let resolved = self
                .unresolved_insertions
                .resolve_dependent_actions(&instance, &*self.session.persistence_context()?)?;
            for action in resolved.into_iter().rev() {
                pending.push_front(action);
            }
        }
        Ok(())
    }

    fn insertions(&mut self) -> &mut ExecutableList<EntityInsertAction> {
        let order_inserts = self.session.options().order_inserts;
        let metamodel = self.session.metamodel().clone();
        self.lists.insertions.get_or_insert_with(|| {
            if order_inserts {
                ExecutableList::with_sorter(Box::new(InsertActionSorter::new(metamodel)))
            } else {
                ExecutableList::new(false)
            }
        })
    }

    pub fn add_update_action(&mut self, action: EntityUpdateAction) {
        let order_updates = self.session.options().order_updates;
        list_for(&mut self.lists.updates, order_updates).add(action);
    }

    pub fn add_delete_action(&mut self, action: EntityDeleteAction) {
        if action.is_orphan_removal() {
            list_for(&mut self.lists.orphan_removals, false).add(action);
        } else {
            list_for(&mut self.lists.deletions, false).add(action);
        }
    }

    pub fn add_orphan_removal_action(&mut self, action: EntityDeleteAction) {
        list_for(&mut self.lists.orphan_removals, false).add(action);
    }

    pub fn add_collection_recreate_action(&mut self, action: CollectionRecreateAction) {
        let order_updates = self.session.options().order_updates;
        list_for(&mut self.lists.collection_creations, order_updates).add(action);
    }

    pub fn add_collection_update_action(&mut self, action: CollectionUpdateAction) {
        let order_updates = self.session.options().order_updates;
        list_for(&mut self.lists.collection_updates, order_updates).add(action);
    }

    pub fn add_collection_remove_action(&mut self, action: CollectionRemoveAction) {
        let order_updates = self.session.options().order_updates;
        list_for(&mut self.lists.collection_removals, order_updates).add(action);
    }

    pub fn add_collection_queued_operation_action(&mut self, action: QueuedOperationCollectionAction) {
        let order_updates = self.session.options().order_updates;
        list_for(&mut self.lists.collection_queued_ops, order_updates).add(action);
    }

    /// Registers the callbacks of a bulk statement that bypassed the lists.
    pub fn add_bulk_cleanup_action(&mut self, mut cleanup: BulkOperationCleanupAction) -> Result<()> {
        self.register_cleanup_actions(&mut cleanup)
    }

    fn register_cleanup_actions<E: Executable + ?Sized>(&mut self, executable: &mut E) -> Result<()> {
        register_completion_processes(executable, &self.transaction_completion_processes)?;
        if self.session.is_query_cache_enabled() {
            invalidate_spaces(
                &executable.property_spaces(),
                &self.session,
                &self.transaction_completion_processes,
            )?;
        }
        Ok(())
    }

    pub fn register_before_process(&self, process: Box<dyn BeforeTransactionCompletionProcess>) -> Result<()> {
        self.transaction_completion_processes.before.register(process)
    }

    pub fn register_after_process(&self, process: Box<dyn AfterTransactionCompletionProcess>) -> Result<()> {
        self.transaction_completion_processes.after.register(process)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Executes every list in order. Fails up front while inserts are still
    /// waiting for transient entities.
    pub async fn execute_actions(&mut self) -> Result<()> {
        if self.has_unresolved_entity_insert_actions() {
            return Err(OrmError::IllegalState(
                "About to execute actions, but there are unresolved entity insert actions.".to_string(),
            ));
        }

        let span = info_span!("action_queue.execute", session = %self.session.session_id());
        async move {
            for ordered in ORDERED_ACTIONS.iter() {
                let Some(list) = (ordered.get_mut)(&mut self.lists) else {
                    continue;
                };
                if list.is_empty() {
                    continue;
                }
                event!(Level::DEBUG, kind = %ordered.kind, count = list.len(), "executing action list");
                list.execute_all(&self.session, &self.transaction_completion_processes)
                    .await?;
            }
            Ok::<(), OrmError>(())
        }
        .instrument(span)
        .await
    }

    /// Executes the queued inserts only.
    pub async fn execute_inserts(&mut self) -> Result<()> {
        if let Some(insertions) = self.lists.insertions.as_mut() {
            if !insertions.is_empty() {
                event!(Level::TRACE, count = insertions.len(), "executing queued inserts");
                insertions
                    .execute_all(&self.session, &self.transaction_completion_processes)
                    .await?;
            }
        }
        Ok(())
    }

    /// Executes one action outside the lists.
    pub async fn execute<E: Executable + ?Sized>(&mut self, executable: &mut E) -> Result<()> {
        let result = executable.execute(&self.session).await;
        self.register_cleanup_actions(executable)?;
        result
    }

    /// Runs the preparation hook of every collection action.
    pub fn prepare_actions(&mut self) -> Result<()> {
        let session = &self.session;
        let lists = &mut self.lists;
        let collection_lists: [Option<&mut dyn ActionListView>; 4] = [
            lists.collection_removals.as_mut().map(|l| l as &mut dyn ActionListView),
            lists.collection_updates.as_mut().map(|l| l as &mut dyn ActionListView),
            lists.collection_creations.as_mut().map(|l| l as &mut dyn ActionListView),
            lists.collection_queued_ops.as_mut().map(|l| l as &mut dyn ActionListView),
        ];
        for list in collection_lists.into_iter().flatten() {
            list.prepare(session)?;
        }
        Ok(())
    }

    pub fn sort_actions(&mut self) {
        let options = self.session.options();
        if options.order_updates {
            if let Some(updates) = self.lists.updates.as_mut() {
                updates.sort();
            }
        }
        if options.order_inserts {
            if let Some(insertions) = self.lists.insertions.as_mut() {
                insertions.sort();
            }
        }
    }

    pub fn sort_collection_actions(&mut self) {
        if !self.session.options().order_updates {
            return;
        }
        let lists = &mut self.lists;
        let collection_lists: [Option<&mut dyn ActionListView>; 4] = [
            lists.collection_creations.as_mut().map(|l| l as &mut dyn ActionListView),
            lists.collection_updates.as_mut().map(|l| l as &mut dyn ActionListView),
            lists.collection_queued_ops.as_mut().map(|l| l as &mut dyn ActionListView),
            lists.collection_removals.as_mut().map(|l| l as &mut dyn ActionListView),
        ];
        for list in collection_lists.into_iter().flatten() {
            list.sort();
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Whether a flush would write to any of `tables`.
    pub fn are_tables_to_be_updated(&self, tables: &[&str]) -> bool {
        if tables.is_empty() {
            return false;
        }
        for ordered in ORDERED_ACTIONS.iter() {
            let Some(list) = (ordered.get)(&self.lists) else {
                continue;
            };
            if list.is_empty() {
                continue;
            }
            if let Some(space) = list.query_spaces().iter().find(|s| tables.contains(&s.as_str())) {
                event!(Level::DEBUG, space = %space, "changes must be flushed to space");
                return true;
            }
        }
        if self.unresolved_insertions.is_empty() {
            return false;
        }
        self.unresolved_insertions.touches_any(tables)
    }

    pub fn has_any_queued_actions(&self) -> bool {
        ORDERED_ACTIONS
            .iter()
            .any(|ordered| (ordered.get)(&self.lists).is_some_and(|list| !list.is_empty()))
            || !self.unresolved_insertions.is_empty()
    }

    pub fn are_insertions_or_deletions_queued(&self) -> bool {
        self.number_of_insertions() > 0
            || !self.unresolved_insertions.is_empty()
            || self.number_of_deletions() > 0
    }

    pub fn has_unresolved_entity_insert_actions(&self) -> bool {
        !self.unresolved_insertions.is_empty()
    }

    pub fn check_no_unresolved_actions_after_operation(&self) -> Result<()> {
        self.unresolved_insertions
            .check_no_unresolved_actions_after_operation()
    }

    pub fn number_of_insertions(&self) -> usize {
        len_of(&self.lists.insertions)
    }

    pub fn number_of_updates(&self) -> usize {
        len_of(&self.lists.updates)
    }

    /// Deletes plus orphan removals.
    pub fn number_of_deletions(&self) -> usize {
        len_of(&self.lists.deletions) + len_of(&self.lists.orphan_removals)
    }

    pub fn number_of_collection_creations(&self) -> usize {
        len_of(&self.lists.collection_creations)
    }

    pub fn number_of_collection_updates(&self) -> usize {
        len_of(&self.lists.collection_updates)
    }

    pub fn number_of_collection_removals(&self) -> usize {
        len_of(&self.lists.collection_removals)
    }

    pub fn number_of_collection_queued_operations(&self) -> usize {
        len_of(&self.lists.collection_queued_ops)
    }

    pub fn number_of_unresolved_insertions(&self) -> usize {
        self.unresolved_insertions.len()
    }

    // ========================================================================
    // Resetting
    // ========================================================================

    pub fn clear(&mut self) {
        for ordered in ORDERED_ACTIONS.iter() {
            if let Some(list) = (ordered.get_mut)(&mut self.lists) {
                list.clear();
            }
        }
        self.unresolved_insertions.clear();
    }

    /// Drops what a flush-needed dry run scheduled. Collection removals
    /// beyond `previous_collection_removal_size` are dropped too; earlier
    /// ones may have been scheduled by an update of a detached owner.
    pub fn clear_from_flush_needed_check(&mut self, previous_collection_removal_size: usize) {
        if let Some(list) = self.lists.collection_creations.as_mut() {
            list.clear();
        }
        if let Some(list) = self.lists.collection_updates.as_mut() {
            list.clear();
        }
        if let Some(list) = self.lists.collection_queued_ops.as_mut() {
            list.clear();
        }
        if let Some(list) = self.lists.updates.as_mut() {
            list.clear();
        }
        if let Some(list) = self.lists.collection_removals.as_mut() {
            if list.len() > previous_collection_removal_size {
                list.remove_last_n(list.len() - previous_collection_removal_size);
            }
        }
    }

    /// Takes a scheduled delete (or orphan removal) of `rescued` back out of
    /// the queue.
    pub fn un_schedule_deletion(&mut self, entry: &EntityEntry, rescued: &Value) -> Result<()> {
        let rescued = match rescued {
            Value::Entity(instance) => Some(instance.clone()),
            Value::Proxy(proxy) => proxy.implementation(),
            _ => None,
        };

        if let Some(rescued) = rescued {
            for list in [&mut self.lists.deletions, &mut self.lists.orphan_removals]
                .into_iter()
                .flatten()
            {
                let found = list
                    .iter()
                    .position(|action| Arc::ptr_eq(action.instance(), &rescued));
                if let Some(index) = found {
                    list.remove(index);
                    return Ok(());
                }
            }
        }

        Err(OrmError::AssertionFailure(format!(
            "Unable to perform un-delete for instance {}",
            entry.entity_name
        )))
    }

    // ========================================================================
    // Transaction completion
    // ========================================================================

    pub fn transaction_completion_processes(&self) -> TransactionCompletionProcesses {
        self.transaction_completion_processes.clone()
    }

    /// Adopts another queue's completion processes. A shared queue only
    /// registers callbacks; the owner runs them.
    pub fn set_transaction_completion_processes(
        &mut self,
        processes: TransactionCompletionProcesses,
        is_transaction_coordinator_shared: bool,
    ) {
        self.is_transaction_coordinator_shared = is_transaction_coordinator_shared;
        self.transaction_completion_processes = processes;
    }

    pub fn has_before_transaction_actions(&self) -> bool {
        !self.is_transaction_coordinator_shared
            && self.transaction_completion_processes.before.has_actions()
    }

    pub fn has_after_transaction_actions(&self) -> bool {
        !self.is_transaction_coordinator_shared
            && self.transaction_completion_processes.after.has_actions()
    }

    pub async fn before_transaction_completion(&self) -> Result<()> {
        if self.is_transaction_coordinator_shared {
            return Ok(());
        }
        self.transaction_completion_processes
            .before
            .before_transaction_completion(&self.session)
            .await
    }

    pub async fn after_transaction_completion(&self, success: bool) -> Result<()> {
        if self.is_transaction_coordinator_shared {
            return Ok(());
        }
        self.transaction_completion_processes
            .after
            .after_transaction_completion(success, &self.session)
            .await
    }
}

impl fmt::Display for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ActionQueue[insertions={} updates={} deletions={} orphan_removals={} \
             collection_creations={} collection_removals={} collection_updates={} \
             collection_queued_ops={} unresolved_insert_dependencies={}]",
            self.number_of_insertions(),
            self.number_of_updates(),
            len_of(&self.lists.deletions),
            len_of(&self.lists.orphan_removals),
            self.number_of_collection_creations(),
            self.number_of_collection_removals(),
            self.number_of_collection_updates(),
            self.number_of_collection_queued_operations(),
            self.unresolved_insertions.len(),
        )
    }
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("session", &self.session.session_id())
            .field("lists", &self.lists)
            .field("unresolved_insertions", &self.unresolved_insertions)
            .field("shared", &self.is_transaction_coordinator_shared)
            .finish()
    }
}
