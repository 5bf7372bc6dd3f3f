// ============================================================================
// Entity Action Listeners
// ============================================================================
//
// Hooks invoked by the actions around each statement they execute. Pre hooks
// may veto the statement; post-commit hooks run from the after-transaction
// completion queue and only when the transaction committed.
//
// ============================================================================

use crate::core::{EntityRef, Value};
use std::sync::Arc;

/// What a listener sees of the entity an action writes
#[derive(Debug, Clone, Copy)]
pub struct EntityEvent<'a> {
    pub entity_name: &'a str,
    pub id: Option<&'a Value>,
    pub instance: &'a EntityRef,
    pub state: &'a [Value],
}

/// Collection whose rows a collection action writes
#[derive(Debug, Clone, Copy)]
pub struct CollectionEvent<'a> {
    pub role: &'a str,
    pub owner_id: Option<&'a Value>,
}

/// Interceptor/listener surface; every hook defaults to a no-op.
///
/// Pre hooks return `true` to veto the statement.
pub trait EntityActionListener: Send + Sync {
    fn on_pre_insert(&self, _event: &EntityEvent<'_>) -> bool {
        false
    }

    fn on_post_insert(&self, _event: &EntityEvent<'_>) {}

    fn on_pre_update(&self, _event: &EntityEvent<'_>) -> bool {
        false
    }

    fn on_post_update(&self, _event: &EntityEvent<'_>) {}

    fn on_pre_delete(&self, _event: &EntityEvent<'_>) -> bool {
        false
    }

    fn on_post_delete(&self, _event: &EntityEvent<'_>) {}

    fn on_post_commit_insert(&self, _event: &EntityEvent<'_>) {}

    fn on_post_commit_update(&self, _event: &EntityEvent<'_>) {}

    fn on_post_commit_delete(&self, _event: &EntityEvent<'_>) {}

    fn on_post_collection_action(&self, _event: &CollectionEvent<'_>) {}
}

/// Ordered set of listeners shared by every session of a factory
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn EntityActionListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn EntityActionListener>) {
        self.listeners.push(listener);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Every listener sees the event; any single veto wins.
    pub fn pre_insert(&self, event: &EntityEvent<'_>) -> bool {
        self.listeners
            .iter()
            .fold(false, |veto, l| l.on_pre_insert(event) || veto)
    }

    pub fn post_insert(&self, event: &EntityEvent<'_>) {
        self.listeners.iter().for_each(|l| l.on_post_insert(event));
    }

    pub fn pre_update(&self, event: &EntityEvent<'_>) -> bool {
        self.listeners
            .iter()
            .fold(false, |veto, l| l.on_pre_update(event) || veto)
    }

    pub fn post_update(&self, event: &EntityEvent<'_>) {
        self.listeners.iter().for_each(|l| l.on_post_update(event));
    }

    pub fn pre_delete(&self, event: &EntityEvent<'_>) -> bool {
        self.listeners
            .iter()
            .fold(false, |veto, l| l.on_pre_delete(event) || veto)
    }

    pub fn post_delete(&self, event: &EntityEvent<'_>) {
        self.listeners.iter().for_each(|l| l.on_post_delete(event));
    }

    pub fn post_commit_insert(&self, event: &EntityEvent<'_>) {
        self.listeners
            .iter()
            .for_each(|l| l.on_post_commit_insert(event));
    }

    pub fn post_commit_update(&self, event: &EntityEvent<'_>) {
        self.listeners
            .iter()
            .for_each(|l| l.on_post_commit_update(event));
    }

    pub fn post_commit_delete(&self, event: &EntityEvent<'_>) {
        self.listeners
            .iter()
            .for_each(|l| l.on_post_commit_delete(event));
    }

    pub fn post_collection_action(&self, event: &CollectionEvent<'_>) {
        self.listeners
            .iter()
            .for_each(|l| l.on_post_collection_action(event));
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
