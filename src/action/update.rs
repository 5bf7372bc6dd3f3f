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

/// Update of one managed entity row to its current state
pub struct EntityUpdateAction {
    instance: EntityRef,
    id: Value,
    state: Vec<Value>,
    previous_state: Option<Vec<Value>>,
    persister: Arc<EntityPersister>,
    veto: bool,
    after_process: Option<Box<dyn AfterTransactionCompletionProcess>>,
}

impl EntityUpdateAction {
    pub fn new(
        instance: EntityRef,
        state: Vec<Value>,
        previous_state: Option<Vec<Value>>,
        persister: Arc<EntityPersister>,
    ) -> Result<Self> {
        let id = instance.id().ok_or_else(|| {
            OrmError::AssertionFailure(format!("Cannot update {} without an identifier", instance))
        })?;
        Ok(Self {
            instance,
            id,
            state,
            previous_state,
            persister,
            veto: false,
            after_process: None,
        })
    }

    pub fn instance(&self) -> &EntityRef {
        &self.instance
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn state(&self) -> &[Value] {
        &self.state
    }

    pub fn previous_state(&self) -> Option<&[Value]> {
        self.previous_state.as_deref()
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
impl Executable for EntityUpdateAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Update
    }

    fn property_spaces(&self) -> Vec<String> {
        self.persister.query_spaces().to_vec()
    }

    async fn execute(&mut self, session: &SessionContext) -> Result<()> {
        let listeners = session.listeners();
        if listeners.pre_update(&self.event()) {
            event!(Level::DEBUG, entity = %self.instance, "update vetoed");
            self.veto = true;
            return Ok(());
        }

        if let Some(sql) = self.persister.update_sql() {
            let mut params = self.persister.dehydrate(&self.state);
            params.push(self.id.clone());
            session.connection()?.update(&sql, &params).await?;
        }

        session
            .persistence_context()?
            .mark_managed(&self.instance, self.state.clone());

        listeners.post_update(&self.event());
        if !listeners.is_empty() {
            self.after_process = Some(Box::new(PostCommitEntityEvent {
                kind: PostCommitKind::Update,
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

impl fmt::Debug for EntityUpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityUpdateAction")
            .field("entity", &self.instance)
            .field("veto", &self.veto)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityInstance;
    use crate::metadata::Property;

    #[test]
    fn test_update_requires_identifier() {
        let persister = Arc::new(EntityPersister::new("Account", "accounts"));
        let transient = EntityInstance::new("Account", vec![]);
        assert!(matches!(
            EntityUpdateAction::new(transient, vec![], None, persister),
            Err(OrmError::AssertionFailure(_))
        ));
    }

    #[test]
    fn test_sort_key_uses_identifier() {
        let persister = Arc::new(
            EntityPersister::new("Account", "accounts").property(Property::basic("balance")),
        );
        let account = EntityInstance::with_id("Account", 3i64, vec![Value::Integer(10)]);
        let action =
            EntityUpdateAction::new(account.clone(), account.properties(), None, persister).unwrap();

        assert_eq!(action.sort_key(), ActionSortKey::new("Account", Some(Value::Integer(3))));
        assert_eq!(action.property_spaces(), vec!["accounts".to_string()]);
    }
}
