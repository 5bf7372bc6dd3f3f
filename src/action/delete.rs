use super::insert::{PostCommitEntityEvent, PostCommitKind};
use super::{ActionKind, ActionSortKey, AfterTransactionCompletionProcess, Executable};
use crate::core::{EntityRef, OrmError, Result, Value};
use crate::event::EntityEvent;
use crate::metadata::EntityPersister;
use crate::session::SessionContext;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

/// Delete of one entity row; also used for orphan removal
pub struct EntityDeleteAction {
    instance: EntityRef,
    id: Value,
    state: Vec<Value>,
    persister: Arc<EntityPersister>,
    orphan_removal: bool,
    veto: bool,
    after_process: Option<Box<dyn AfterTransactionCompletionProcess>>,
}

impl EntityDeleteAction {
    pub fn new(instance: EntityRef, state: Vec<Value>, persister: Arc<EntityPersister>) -> Result<Self> {
        let id = instance.id().ok_or_else(|| {
            OrmError::AssertionFailure(format!("Cannot delete {} without an identifier", instance))
        })?;
        Ok(Self {
            instance,
            id,
            state,
            persister,
            orphan_removal: false,
            veto: false,
            after_process: None,
        })
    }

    /// Delete of an entity its owner no longer references.
    pub fn orphan_removal(
        instance: EntityRef,
        state: Vec<Value>,
        persister: Arc<EntityPersister>,
    ) -> Result<Self> {
        let mut action = Self::new(instance, state, persister)?;
        action.orphan_removal = true;
        Ok(action)
    }

    pub fn instance(&self) -> &EntityRef {
        &self.instance
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn is_orphan_removal(&self) -> bool {
        self.orphan_removal
    }

    pub fn is_veto(&self) -> bool {
        self.veto
    }

    fn event(&self) -> EntityEvent<'_> {
        EntityEvent {
            entity_name: self.instance.entity_name(),
            id: Some(&self.id),
            instance: &self.instance,
            state: &self.state,
        }
    }
}

#[async_trait]
impl Executable for EntityDeleteAction {
    fn kind(&self) -> ActionKind {
        if self.orphan_removal {
            ActionKind::OrphanRemoval
        } else {
            ActionKind::Delete
        }
    }

    fn property_spaces(&self) -> Vec<String> {
        self.persister.query_spaces().to_vec()
    }

    async fn execute(&mut self, session: &SessionContext) -> Result<()> {
        let listeners = session.listeners();
        if listeners.pre_delete(&self.event()) {
            event!(Level::DEBUG, entity = %self.instance, "delete vetoed");
            self.veto = true;
            return Ok(());
        }

        let sql = self.persister.delete_sql();
        session
            .connection()?
            .update(&sql, std::slice::from_ref(&self.id))
            .await?;

        session.persistence_context()?.remove_entry(&self.instance);

        listeners.post_delete(&self.event());
        if !listeners.is_empty() {
            self.after_process = Some(Box::new(PostCommitEntityEvent {
                kind: PostCommitKind::Delete,
                instance: self.instance.clone(),
                id: Some(self.id.clone()),
                state: self.state.clone(),
            }));
        }
        Ok(())
    }

    fn take_after_transaction_completion_process(
        &mut self,
    ) -> Option<Box<dyn AfterTransactionCompletionProcess>> {
        self.after_process.take()
    }

    fn sort_key(&self) -> ActionSortKey {
        ActionSortKey::new(self.instance.entity_name(), Some(self.id.clone()))
    }
}

impl fmt::Debug for EntityDeleteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDeleteAction")
            .field("entity", &self.instance)
            .field("orphan_removal", &self.orphan_removal)
            .field("veto", &self.veto)
            .finish()
    }
}
