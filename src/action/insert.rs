use super::{
    ActionKind, ActionSortKey, AfterTransactionCompletionProcess, Executable,
};
use crate::core::{EntityRef, Result, Value};
use crate::engine::{
    NonNullableTransientDependencies, PersistenceContext, Status,
    find_non_nullable_transient_entities,
};
use crate::event::EntityEvent;
use crate::metadata::EntityPersister;
use crate::session::SessionContext;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

/// Kind of post-commit notification an entity action leaves behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostCommitKind {
    Insert,
    Update,
    Delete,
}

/// Dispatches post-commit listener hooks once the transaction succeeded
pub(crate) struct PostCommitEntityEvent {
    pub kind: PostCommitKind,
    pub instance: EntityRef,
    pub id: Option<Value>,
    pub state: Vec<Value>,
}

#[async_trait]
impl AfterTransactionCompletionProcess for PostCommitEntityEvent {
    async fn do_after_transaction_completion(
        self: Box<Self>,
        success: bool,
        session: &SessionContext,
    ) -> Result<()> {
        if !success {
            return Ok(());
        }
        let event = EntityEvent {
            entity_name: self.instance.entity_name(),
            id: self.id.as_ref(),
            instance: &self.instance,
            state: &self.state,
        };
        let listeners = session.listeners();
        match self.kind {
            PostCommitKind::Insert => listeners.post_commit_insert(&event),
            PostCommitKind::Update => listeners.post_commit_update(&event),
            PostCommitKind::Delete => listeners.post_commit_delete(&event),
        }
        Ok(())
    }
}

/// Insert of one entity row
///
/// With an identity identifier the database generates the key, so the
/// insert has to run as soon as it is resolved (an early insert) and the
/// instance receives its identifier from the statement.
pub struct EntityInsertAction {
    instance: EntityRef,
    id: Option<Value>,
    state: Vec<Value>,
    persister: Arc<EntityPersister>,
    identity: bool,
    veto: bool,
    executed: bool,
    after_process: Option<Box<dyn AfterTransactionCompletionProcess>>,
}

impl EntityInsertAction {
    /// An insert whose identifier is already assigned.
    pub fn new(instance: EntityRef, state: Vec<Value>, persister: Arc<EntityPersister>) -> Self {
        Self {
            id: instance.id(),
            instance,
            state,
            persister,
            identity: false,
            veto: false,
            executed: false,
            after_process: None,
        }
    }

    /// An insert whose identifier the database generates.
    pub fn identity(instance: EntityRef, state: Vec<Value>, persister: Arc<EntityPersister>) -> Self {
        Self {
            identity: true,
            ..Self::new(instance, state, persister)
        }
    }

    pub fn instance(&self) -> &EntityRef {
        &self.instance
    }

    pub fn entity_name(&self) -> &str {
        self.instance.entity_name()
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn state(&self) -> &[Value] {
        &self.state
    }

    pub fn persister(&self) -> &Arc<EntityPersister> {
        &self.persister
    }

    pub fn is_identity_insert(&self) -> bool {
        self.identity
    }

    pub fn is_early_insert(&self) -> bool {
        self.identity
    }

    pub fn is_veto(&self) -> bool {
        self.veto
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn find_non_nullable_transient_entities(
        &self,
        context: &PersistenceContext,
    ) -> NonNullableTransientDependencies {
        find_non_nullable_transient_entities(&self.persister, &self.instance, &self.state, context)
    }

    /// Registers the instance as managed with its insert state.
    pub fn make_entity_managed(&self, session: &SessionContext) -> Result<()> {
        let mut context = session.persistence_context()?;
        let status = match context.entry(&self.instance).map(|e| e.status) {
            Some(Status::ReadOnly) => Status::ReadOnly,
            _ => Status::Managed,
        };
        context.add_entry(&self.instance, status, Some(self.state.clone()), self.executed);
        Ok(())
    }
}

#[async_trait]
impl Executable for EntityInsertAction {
    fn kind(&self) -> ActionKind {
        if self.identity {
            ActionKind::IdentityInsert
        } else {
            ActionKind::Insert
        }
    }

    fn property_spaces(&self) -> Vec<String> {
        self.persister.query_spaces().to_vec()
    }

    async fn execute(&mut self, session: &SessionContext) -> Result<()> {
        let listeners = session.listeners();
        let vetoed = listeners.pre_insert(&EntityEvent {
            entity_name: self.instance.entity_name(),
            id: self.id.as_ref(),
            instance: &self.instance,
            state: &self.state,
        });
        if vetoed {
            event!(Level::DEBUG, entity = %self.instance, "insert vetoed");
            self.veto = true;
            return Ok(());
        }

        let params = self.persister.dehydrate(&self.state);
        if self.identity {
            let sql = self.persister.insert_sql(false);
            let generated = session
                .connection()?
                .insert_and_select_identity(&sql, &params)
                .await?;
            self.instance.set_id(generated.clone());
            self.id = Some(generated);
        } else {
            let sql = self.persister.insert_sql(true);
            let mut bound = Vec::with_capacity(params.len() + 1);
            bound.push(self.id.clone().unwrap_or(Value::Null));
            bound.extend(params);
            session.connection()?.update(&sql, &bound).await?;
        }
        self.executed = true;

        session
            .persistence_context()?
            .mark_managed(&self.instance, self.state.clone());

        let event = EntityEvent {
            entity_name: self.instance.entity_name(),
            id: self.id.as_ref(),
            instance: &self.instance,
            state: &self.state,
        };
        listeners.post_insert(&event);
        if !listeners.is_empty() {
            self.after_process = Some(Box::new(PostCommitEntityEvent {
                kind: PostCommitKind::Insert,
                instance: self.instance.clone(),
                id: self.id.clone(),
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
        ActionSortKey::new(self.instance.entity_name(), self.id.clone())
    }
}

impl fmt::Debug for EntityInsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityInsertAction")
            .field("entity", &self.instance)
            .field("identity", &self.identity)
            .field("veto", &self.veto)
            .finish()
    }
}

impl fmt::Display for EntityInsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind(), self.instance)
    }
}
