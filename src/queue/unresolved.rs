use crate::action::{EntityInsertAction, Executable};
use crate::core::{EntityRef, InstanceId, OrmError, Result};
use crate::engine::{NonNullableTransientDependencies, PersistenceContext, Status};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{Level, event};

struct UnresolvedInsert {
    action: EntityInsertAction,
    dependencies: NonNullableTransientDependencies,
}

/// Inserts waiting for transient entities they reference through
/// non-nullable associations
///
/// Actions are kept in the order they were added and are released once
/// every entity they wait for has been made managed.
#[derive(Default)]
pub struct UnresolvedEntityInsertActions {
    next_key: u64,
    dependencies_by_action: BTreeMap<u64, UnresolvedInsert>,
    dependent_actions_by_transient: HashMap<InstanceId, Vec<u64>>,
}

impl UnresolvedEntityInsertActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unresolved_entity_insert_action(
        &mut self,
        action: EntityInsertAction,
        dependencies: NonNullableTransientDependencies,
    ) {
        event!(
            Level::TRACE,
            action = %action,
            dependencies = %dependencies,
            "adding insert with non-nullable transient entities"
        );
        let key = self.next_key;
        self.next_key += 1;
        for transient in dependencies.non_nullable_transient_entities() {
            self.dependent_actions_by_transient
                .entry(transient.instance_id())
                .or_default()
                .push(key);
        }
        self.dependencies_by_action
            .insert(key, UnresolvedInsert { action, dependencies });
    }

    /// Releases the actions whose last outstanding dependency was
    /// `managed_entity`, in the order they were added.
    pub fn resolve_dependent_actions(
        &mut self,
        managed_entity: &EntityRef,
        context: &PersistenceContext,
    ) -> Result<Vec<EntityInsertAction>> {
        let status = context.entry(managed_entity).map(|entry| entry.status);
        if !matches!(status, Some(Status::Managed) | Some(Status::ReadOnly)) {
            return Err(OrmError::AssertionFailure(format!(
                "Entity entry for {} does not have status MANAGED or READ_ONLY: {:?}",
                managed_entity, status
            )));
        }

        let Some(dependent_keys) = self
            .dependent_actions_by_transient
            .remove(&managed_entity.instance_id())
        else {
            return Ok(Vec::new());
        };

        let mut resolved = Vec::new();
        for key in dependent_keys {
            let now_empty = match self.dependencies_by_action.get_mut(&key) {
                Some(unresolved) => {
                    unresolved
                        .dependencies
                        .resolve_non_nullable_transient_entity(managed_entity);
                    unresolved.dependencies.is_empty()
                }
                None => false,
            };
            if now_empty {
                if let Some(unresolved) = self.dependencies_by_action.remove(&key) {
                    event!(
                        Level::TRACE,
                        action = %unresolved.action,
                        resolved_by = %managed_entity,
                        "resolved insert action"
                    );
                    resolved.push(unresolved.action);
                }
            }
        }
        Ok(resolved)
    }

    /// Fails with the first insert still waiting, naming the transient
    /// entity and the property that references it.
    pub fn check_no_unresolved_actions_after_operation(&self) -> Result<()> {
        let Some(first) = self.dependencies_by_action.values().next() else {
            event!(
                Level::TRACE,
                "no entity insert actions have non-nullable transient dependencies"
            );
            return Ok(());
        };

        event!(
            Level::DEBUG,
            unresolved = self.dependencies_by_action.len(),
            "unable to resolve non-nullable transient dependencies"
        );
        let transient = first
            .dependencies
            .non_nullable_transient_entities()
            .next()
            .ok_or_else(|| {
                OrmError::AssertionFailure(format!(
                    "Unresolved insert {} has no dependencies",
                    first.action
                ))
            })?;
        let property_name = first
            .dependencies
            .property_paths(transient)
            .first()
            .cloned()
            .unwrap_or_default();

        Err(OrmError::TransientPropertyValue {
            message: "Not-null property references a transient value - transient instance must be saved before current operation".to_string(),
            transient_entity_name: transient.entity_name().to_string(),
            property_owner_entity_name: first.action.entity_name().to_string(),
            property_name,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies_by_action.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dependencies_by_action.len()
    }

    pub fn entity_insert_actions(&self) -> impl Iterator<Item = &EntityInsertAction> {
        self.dependencies_by_action.values().map(|u| &u.action)
    }

    /// Whether any waiting insert writes to one of `tables`.
    pub fn touches_any(&self, tables: &[&str]) -> bool {
        self.entity_insert_actions().any(|action| {
            action
                .property_spaces()
                .iter()
                .any(|space| tables.contains(&space.as_str()))
        })
    }

    pub fn clear(&mut self) {
        self.dependencies_by_action.clear();
        self.dependent_actions_by_transient.clear();
    }
}

impl fmt::Debug for UnresolvedEntityInsertActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for unresolved in self.dependencies_by_action.values() {
            list.entry(&format_args!(
                "{} waiting on {}",
                unresolved.action, unresolved.dependencies
            ));
        }
        list.finish()
    }
}
