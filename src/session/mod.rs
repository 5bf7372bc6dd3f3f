// ============================================================================
// Reactive Session
// ============================================================================
//
// Unit of work over one pooled connection. Application operations register
// entity state changes; `flush` turns the differences between the managed
// instances and their loaded state into actions and runs them through the
// session's action queue.
//
// ============================================================================

pub mod context;
pub mod factory;
pub mod options;

pub use context::{FactoryServices, SessionContext};
pub use factory::SessionFactory;
pub use options::SessionFactoryOptions;

use crate::action::{
    BulkOperationCleanupAction, CollectionRecreateAction, CollectionRemoveAction,
    CollectionUpdateAction, EntityDeleteAction, EntityInsertAction, EntityUpdateAction,
    QueuedOperationCollectionAction,
};
use crate::core::{EntityRef, OrmError, Result, Value};
use crate::engine::{EntityEntry, PersistenceContext, Status};
use crate::metadata::{EntityPersister, Type};
use crate::queue::ActionQueue;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Transient entities reachable from `state` through cascaded properties.
fn cascade_targets(
    persister: &EntityPersister,
    state: &[Value],
    context: &PersistenceContext,
) -> Vec<EntityRef> {
    let mut targets: Vec<EntityRef> = Vec::new();
    let mut push = |instance: &EntityRef| {
        if !context.is_entry_for(instance) && !targets.iter().any(|t| Arc::ptr_eq(t, instance)) {
            targets.push(instance.clone());
        }
    };

    for (property, value) in persister.properties().iter().zip(state) {
        if !property.is_cascaded() {
            continue;
        }
        match value {
            Value::Entity(instance) => push(instance),
            Value::Collection(collection) => {
                for element in collection.elements() {
                    if let Value::Entity(instance) = &element {
                        push(instance);
                    }
                }
            }
            _ => {}
        }
    }
    targets
}

pub struct ReactiveSession {
    context: SessionContext,
    action_queue: ActionQueue,
}

impl ReactiveSession {
    pub fn new(context: SessionContext) -> Self {
        Self {
            action_queue: ActionQueue::new(context.clone()),
            context,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn action_queue(&self) -> &ActionQueue {
        &self.action_queue
    }

    pub fn action_queue_mut(&mut self) -> &mut ActionQueue {
        &mut self.action_queue
    }

    pub fn status_of(&self, instance: &EntityRef) -> Result<Option<Status>> {
        Ok(self
            .context
            .persistence_context()?
            .entry(instance)
            .map(|entry| entry.status))
    }

    /// Whether the instance is managed by this session and not scheduled for deletion.
    pub fn contains(&self, instance: &EntityRef) -> Result<bool> {
        Ok(matches!(
            self.status_of(instance)?,
            Some(Status::Managed) | Some(Status::ReadOnly) | Some(Status::Saving)
        ))
    }

    /// Registers an instance whose row already exists, e.g. one just read.
    pub fn load(&mut self, instance: &EntityRef) -> Result<()> {
        self.context.persistence_context()?.add_loaded(instance);
        Ok(())
    }

    /// Registers an existing instance whose changes are never written.
    pub fn load_read_only(&mut self, instance: &EntityRef) -> Result<()> {
        self.context.persistence_context()?.add_entry(
            instance,
            Status::ReadOnly,
            Some(instance.properties()),
            true,
        );
        Ok(())
    }

    // ========================================================================
    // Entity operations
    // ========================================================================

    /// Makes a transient instance persistent, cascading to the transient
    /// entities its cascaded properties reference.
    ///
    /// Fails with `OrmError::TransientPropertyValue` when a non-nullable
    /// association still points at an unsaved entity once the cascade is done.
    pub async fn persist(&mut self, instance: &EntityRef) -> Result<()> {
        let span = info_span!("session.persist", entity = %instance);
        async move {
            let mut pending = vec![instance.clone()];
            while let Some(next) = pending.pop() {
                let cascades = self.persist_one(&next).await?;
                pending.extend(cascades.into_iter().rev());
            }
            self.action_queue.check_no_unresolved_actions_after_operation()
        }
        .instrument(span)
        .await
    }

    async fn persist_one(&mut self, instance: &EntityRef) -> Result<Vec<EntityRef>> {
        match self.status_of(instance)? {
            Some(Status::Deleted) => {
                self.rescue(instance)?;
                return Ok(Vec::new());
            }
            Some(Status::Gone) => {
                return Err(OrmError::IllegalState(format!(
                    "Cannot persist {}: its row was deleted",
                    instance
                )));
            }
            Some(_) => return Ok(Vec::new()),
            None => {}
        }

        let persister = self.context.metamodel().entity_persister(instance.entity_name())?;
        if !persister.uses_identity() && instance.id().is_none() {
            return Err(OrmError::IllegalState(format!(
                "Identifier of {} must be assigned before persist",
                instance
            )));
        }

        let state = instance.properties();
        let cascades = {
            let mut context = self.context.persistence_context()?;
            context.add_entry(instance, Status::Saving, None, false);
            cascade_targets(&persister, &state, &context)
        };

        let insert = if persister.uses_identity() {
            EntityInsertAction::identity(instance.clone(), state, persister)
        } else {
            EntityInsertAction::new(instance.clone(), state, persister)
        };
        self.action_queue.add_insert_action(insert).await?;
        Ok(cascades)
    }

    /// Reattaches a detached instance. Its row is updated on the next flush
    /// and its collections are rewritten.
    pub fn update(&mut self, instance: &EntityRef) -> Result<()> {
        if instance.id().is_none() {
            return Err(OrmError::IllegalState(format!(
                "Cannot update transient instance {}",
                instance
            )));
        }
        let persister = self.context.metamodel().entity_persister(instance.entity_name())?;

        {
            let mut context = self.context.persistence_context()?;
            match context.entry(instance).map(|entry| entry.status) {
                Some(Status::Deleted) | Some(Status::Gone) => {
                    return Err(OrmError::IllegalState(format!(
                        "Cannot update deleted instance {}",
                        instance
                    )));
                }
                Some(_) => return Ok(()),
                None => {}
            }
            context.add_entry(instance, Status::Managed, None, true);
        }

        // rows of a collection the session never loaded are replaced wholesale
        for (property, value) in persister.properties().iter().zip(instance.properties()) {
            if let (Type::Collection(collection_type), Value::Collection(collection)) = (property.ty(), value) {
                if !collection.was_initialized() {
                    continue;
                }
                let collection_persister = self
                    .context
                    .metamodel()
                    .collection_persister(collection_type.role())?;
                self.action_queue.add_collection_remove_action(CollectionRemoveAction::new(
                    Some(collection),
                    collection_persister,
                    instance.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Schedules the deletion of a managed instance.
    pub fn remove(&mut self, instance: &EntityRef) -> Result<()> {
        self.schedule_deletion(instance, false)
    }

    /// Schedules the deletion of an instance its owner no longer references.
    pub fn remove_orphan(&mut self, instance: &EntityRef) -> Result<()> {
        self.schedule_deletion(instance, true)
    }

    fn schedule_deletion(&mut self, instance: &EntityRef, orphan: bool) -> Result<()> {
        let persister = self.context.metamodel().entity_persister(instance.entity_name())?;
        let entry = {
            let mut context = self.context.persistence_context()?;
            let entry = context.entry(instance).cloned().ok_or_else(|| {
                OrmError::IllegalState(format!("Removing a detached instance {}", instance))
            })?;
            match entry.status {
                Status::Deleted | Status::Gone => return Ok(()),
                Status::Saving => {
                    return Err(OrmError::IllegalState(format!(
                        "Cannot remove {} while its insert is waiting for unsaved entities",
                        instance
                    )));
                }
                Status::Managed | Status::ReadOnly => {}
            }
            context.set_status(instance, Status::Deleted)?;
            entry
        };

        let state = entry.loaded_state.unwrap_or_else(|| instance.properties());
        let action = if orphan {
            EntityDeleteAction::orphan_removal(instance.clone(), state, persister)?
        } else {
            EntityDeleteAction::new(instance.clone(), state, persister)?
        };
        event!(Level::TRACE, entity = %instance, orphan, "scheduled deletion");
        self.action_queue.add_delete_action(action);
        Ok(())
    }

    /// Cancels a scheduled deletion; the instance is managed again.
    pub fn rescue(&mut self, instance: &EntityRef) -> Result<()> {
        let entry: EntityEntry = self
            .context
            .persistence_context()?
            .entry(instance)
            .cloned()
            .ok_or_else(|| OrmError::IllegalState(format!("{} is not managed by this session", instance)))?;
        if entry.status != Status::Deleted {
            return Err(OrmError::IllegalState(format!(
                "{} is not scheduled for deletion",
                instance
            )));
        }

        self.action_queue
            .un_schedule_deletion(&entry, &Value::Entity(instance.clone()))?;
        self.context
            .persistence_context()?
            .set_status(instance, Status::Managed)
    }

    /// Runs a bulk statement against `spaces` outside the action lists.
    pub async fn execute_update(&mut self, sql: &str, params: &[Value], spaces: &[&str]) -> Result<u64> {
        self.auto_flush_if_required(spaces).await?;
        self.action_queue
            .add_bulk_cleanup_action(BulkOperationCleanupAction::new(spaces.iter().copied()))?;
        let count = self.context.connection()?.update(sql, params).await?;
        Ok(count)
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Writes every pending change.
    pub async fn flush(&mut self) -> Result<()> {
        let span = info_span!("session.flush", session = %self.context.session_id());
        async move {
            self.flush_everything_to_executions()?;
            self.perform_executions().await
        }
        .instrument(span)
        .await
    }

    /// Flushes only when pending changes touch one of `tables`, as before a
    /// query over them. Returns whether a flush happened.
    pub async fn auto_flush_if_required(&mut self, tables: &[&str]) -> Result<bool> {
        let previous_collection_removals = self.action_queue.number_of_collection_removals();
        self.flush_everything_to_executions()?;

        if self.action_queue.are_tables_to_be_updated(tables) {
            event!(Level::TRACE, "need to execute flush");
            self.perform_executions().await?;
            Ok(true)
        } else {
            event!(Level::TRACE, "no need to execute flush");
            self.action_queue
                .clear_from_flush_needed_check(previous_collection_removals);
            Ok(false)
        }
    }

    async fn perform_executions(&mut self) -> Result<()> {
        self.action_queue.prepare_actions()?;
        self.action_queue.execute_actions().await
    }

    /// Schedules updates and collection actions for every managed entity.
    fn flush_everything_to_executions(&mut self) -> Result<()> {
        let entries: Vec<EntityEntry> = self
            .context
            .persistence_context()?
            .entries()
            .cloned()
            .collect();
        let metamodel = self.context.metamodel().clone();

        for entry in entries {
            let persister = metamodel.entity_persister(&entry.entity_name)?;
            let state = entry.instance.properties();
            match entry.status {
                Status::Managed => {
                    self.flush_entity(&entry, &persister, &state)?;
                    self.flush_collections(&entry, &persister, &state)?;
                }
                Status::ReadOnly => self.flush_collections(&entry, &persister, &state)?,
                Status::Deleted => self.schedule_collection_removals(&entry, &persister, &state)?,
                Status::Saving | Status::Gone => {}
            }
        }

        self.action_queue.sort_collection_actions();
        self.action_queue.sort_actions();
        event!(Level::DEBUG, queue = %self.action_queue, "flushed everything to executions");
        Ok(())
    }

    fn flush_entity(&mut self, entry: &EntityEntry, persister: &Arc<EntityPersister>, state: &[Value]) -> Result<()> {
        if !persister.is_mutable() || persister.update_sql().is_none() {
            return Ok(());
        }
        let dirty = match &entry.loaded_state {
            Some(loaded) => persister.dehydrate(loaded) != persister.dehydrate(state),
            // reattached: nothing to compare against
            None => true,
        };
        if dirty {
            self.action_queue.add_update_action(EntityUpdateAction::new(
                entry.instance.clone(),
                state.to_vec(),
                entry.loaded_state.clone(),
                persister.clone(),
            )?);
        }
        Ok(())
    }

    fn flush_collections(&mut self, entry: &EntityEntry, persister: &EntityPersister, state: &[Value]) -> Result<()> {
        let reattached = entry.loaded_state.is_none();
        for (property, value) in persister.properties().iter().zip(state) {
            let (Type::Collection(collection_type), Value::Collection(collection)) = (property.ty(), value) else {
                continue;
            };
            let collection_persister = self
                .context
                .metamodel()
                .collection_persister(collection_type.role())?;
            let owner = entry.instance.clone();

            if !collection.was_initialized() {
                if collection.has_queued_operations() {
                    self.action_queue.add_collection_queued_operation_action(
                        QueuedOperationCollectionAction::new(collection.clone(), collection_persister, owner),
                    );
                }
            } else if reattached || collection.snapshot().is_none() {
                self.action_queue.add_collection_recreate_action(CollectionRecreateAction::new(
                    collection.clone(),
                    collection_persister,
                    owner,
                ));
            } else if collection.is_dirty() {
                self.action_queue.add_collection_update_action(CollectionUpdateAction::new(
                    collection.clone(),
                    collection_persister,
                    owner,
                ));
            }
        }
        Ok(())
    }

    fn schedule_collection_removals(
        &mut self,
        entry: &EntityEntry,
        persister: &EntityPersister,
        state: &[Value],
    ) -> Result<()> {
        for (property, value) in persister.properties().iter().zip(state) {
            let Type::Collection(collection_type) = property.ty() else {
                continue;
            };
            let collection = match value {
                Value::Collection(collection) => Some(collection.clone()),
                _ => None,
            };
            let collection_persister = self
                .context
                .metamodel()
                .collection_persister(collection_type.role())?;
            self.action_queue.add_collection_remove_action(CollectionRemoveAction::new(
                collection,
                collection_persister,
                entry.instance.clone(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin_transaction(&mut self) -> Result<()> {
        self.context.connection()?.begin_transaction().await
    }

    /// Flushes, runs the before-completion callbacks and commits. On failure
    /// the transaction is rolled back and the pending actions discarded.
    pub async fn commit(&mut self) -> Result<()> {
        let span = info_span!("session.commit", session = %self.context.session_id());
        async move {
            match self.flush_and_commit().await {
                Ok(()) => self.action_queue.after_transaction_completion(true).await,
                Err(e) => {
                    event!(Level::DEBUG, error = %e, "commit failed, rolling back");
                    {
                        let mut connection = self.context.connection()?;
                        if connection.is_in_transaction() {
                            connection.rollback_transaction().await?;
                        }
                    }
                    self.action_queue.clear();
                    self.action_queue.after_transaction_completion(false).await?;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn flush_and_commit(&mut self) -> Result<()> {
        self.flush().await?;
        self.action_queue.before_transaction_completion().await?;
        self.context.connection()?.commit_transaction().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.context.connection()?.rollback_transaction().await?;
        self.action_queue.clear();
        self.action_queue.after_transaction_completion(false).await
    }

    /// Registers this session's completion callbacks with `primary`, which
    /// owns the transaction and runs them.
    pub fn join_transaction_of(&mut self, primary: &ReactiveSession) {
        self.action_queue.set_transaction_completion_processes(
            primary.action_queue.transaction_completion_processes(),
            true,
        );
    }

    /// Rolls back an open transaction and hands the connection back to the pool.
    pub async fn close(mut self) -> Result<()> {
        {
            let mut connection = self.context.connection()?;
            if connection.is_in_transaction() {
                connection.rollback_transaction().await?;
            }
        }
        self.action_queue.clear();
        self.context.persistence_context()?.clear();
        event!(Level::DEBUG, session = %self.context.session_id(), "session closed");
        Ok(())
    }
}

impl std::fmt::Debug for ReactiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveSession")
            .field("session_id", &self.context.session_id())
            .field("action_queue", &self.action_queue.to_string())
            .finish()
    }
}
