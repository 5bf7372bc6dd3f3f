// ============================================================================
// Insert Ordering
// ============================================================================
//
// Groups the pending inserts by concrete entity and orders the groups so
// that a row referenced by a foreign key is written before the rows that
// reference it. Relationships are inferred from the mapping types of the
// values each insert carries:
//
//   many-to-one / one-to-one (FK on this side)   -> other entity is a parent
//   one-to-one with FK on the other side         -> other entity is a child
//   one-to-many collection of entities           -> element entity is a child
//
// The ordering pass is bounded at n² restarts. Mappings with circular
// relationships may never settle; the list is then left untouched.
//
// ============================================================================

use crate::action::{EntityInsertAction, ListSorter};
use crate::core::Value;
use crate::metadata::{ForeignKeyDirection, Metamodel, Type};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{Level, event};

/// One group of inserts for the same concrete entity
#[derive(Debug)]
struct BatchIdentifier {
    entity_name: String,
    root_entity_name: String,
    parent_entity_names: HashSet<String>,
    child_entity_names: HashSet<String>,
    /// Index of the batch that has to be written before this one
    parent: Option<usize>,
}

impl BatchIdentifier {
    fn new(entity_name: &str, root_entity_name: &str) -> Self {
        Self {
            entity_name: entity_name.to_string(),
            root_entity_name: root_entity_name.to_string(),
            parent_entity_names: HashSet::new(),
            child_entity_names: HashSet::new(),
            parent: None,
        }
    }

    fn has_any_parent_entity_names(&self, other: &BatchIdentifier) -> bool {
        self.parent_entity_names.contains(&other.entity_name)
            || self.parent_entity_names.contains(&other.root_entity_name)
    }

    fn has_any_child_entity_names(&self, other: &BatchIdentifier) -> bool {
        self.child_entity_names.contains(&other.entity_name)
    }
}

/// Whether `target` is an ancestor of `this` through parent links or
/// recorded parent names. `visited` cuts cycles.
fn has_parent(batches: &[BatchIdentifier], this: usize, target: usize, visited: &mut Vec<usize>) -> bool {
    if visited.contains(&this) {
        return false;
    }
    let Some(parent) = batches[this].parent else {
        return false;
    };
    visited.push(this);
    parent == target
        || batches[this]
            .parent_entity_names
            .contains(&batches[target].entity_name)
        || has_parent(batches, parent, target, visited)
}

fn is_ancestor(batches: &[BatchIdentifier], this: usize, target: usize) -> bool {
    has_parent(batches, this, target, &mut Vec::new())
}

/// Reorders insertions by inferred foreign key dependencies
pub struct InsertActionSorter {
    metamodel: Arc<Metamodel>,
}

impl InsertActionSorter {
    pub fn new(metamodel: Arc<Metamodel>) -> Self {
        Self { metamodel }
    }

    fn add_parent_child_entity_names(&self, action: &EntityInsertAction, batch: &mut BatchIdentifier) {
        let persister = action.persister();
        if let Type::Component(identifier) = persister.identifier_type() {
            for subtype in identifier.subtypes() {
                self.add_by_type_and_value(batch, subtype, None);
            }
        }

        for (value, property) in action.state().iter().zip(persister.properties()) {
            if !matches!(value, Value::Null) {
                self.add_by_type_and_value(batch, property.ty(), Some(value));
            }
        }
    }

    fn add_by_type_and_value(&self, batch: &mut BatchIdentifier, ty: &Type, value: Option<&Value>) {
        match ty {
            Type::Entity(entity_type) => {
                let entity_name = entity_type.associated_entity_name();
                let root_entity_name = self.metamodel.root_entity_name(entity_name);

                if entity_type.is_one_to_one()
                    && entity_type.foreign_key_direction() == ForeignKeyDirection::ToParent
                {
                    if !entity_type.is_reference_to_primary_key() {
                        batch.child_entity_names.insert(entity_name.to_string());
                    }
                    if root_entity_name != entity_name {
                        batch.child_entity_names.insert(root_entity_name);
                    }
                } else {
                    if batch.entity_name != entity_name {
                        batch.parent_entity_names.insert(entity_name.to_string());
                    }
                    let runtime_name = match value {
                        Some(Value::Entity(instance)) => Some(instance.entity_name()),
                        Some(Value::Proxy(proxy)) => Some(proxy.entity_name()),
                        _ => None,
                    };
                    if let Some(runtime_name) = runtime_name.filter(|name| *name != entity_name) {
                        batch.parent_entity_names.insert(runtime_name.to_string());
                    }
                    if root_entity_name != entity_name {
                        batch.parent_entity_names.insert(root_entity_name);
                    }
                }
            }
            Type::Collection(collection_type) => {
                let Ok(persister) = self.metamodel.collection_persister(collection_type.role()) else {
                    return;
                };
                if persister.is_many_to_many() {
                    return;
                }
                if let Some(element) = persister.element_entity_name() {
                    let root_entity_name = self.metamodel.root_entity_name(element);
                    batch.child_entity_names.insert(element.to_string());
                    if root_entity_name != element {
                        batch.child_entity_names.insert(root_entity_name);
                    }
                }
            }
            Type::Component(component) => {
                let values = match value {
                    Some(Value::Component(values)) => Some(values),
                    _ => None,
                };
                for (i, subtype) in component.subtypes().iter().enumerate() {
                    let sub_value = values
                        .and_then(|values| values.get(i))
                        .filter(|v| !matches!(v, Value::Null));
                    self.add_by_type_and_value(batch, subtype, sub_value);
                }
            }
            Type::Basic => {}
        }
    }

    /// Links every batch to the batches it must follow.
    fn infer_parents(batches: &mut [BatchIdentifier]) {
        for i in 0..batches.len() {
            for j in (0..i).rev() {
                if batches[j].has_any_parent_entity_names(&batches[i]) {
                    batches[j].parent = Some(i);
                }
                if batches[i].has_any_child_entity_names(&batches[j]) {
                    batches[j].parent = Some(i);
                }
            }
            for j in i + 1..batches.len() {
                if batches[j].has_any_parent_entity_names(&batches[i])
                    || batches[i].has_any_child_entity_names(&batches[j])
                {
                    let name = batches[i].entity_name.clone();
                    batches[j].parent = Some(i);
                    batches[j].parent_entity_names.insert(name);
                }
            }
        }
    }

    /// Moves each batch behind its ancestors. Returns `None` when the order
    /// did not settle within the iteration bound.
    fn order_batches(batches: &[BatchIdentifier]) -> Option<Vec<usize>> {
        let mut order: Vec<usize> = (0..batches.len()).collect();
        let max_iterations = order.len() * order.len();
        let mut iterations = 0;

        'sort: loop {
            iterations += 1;
            for i in 0..order.len() {
                for j in i + 1..order.len() {
                    let (current, next) = (order[i], order[j]);
                    if is_ancestor(batches, current, next) && !is_ancestor(batches, next, current) {
                        let moved = order.remove(i);
                        order.insert(j, moved);
                        if iterations > max_iterations {
                            break 'sort;
                        }
                        continue 'sort;
                    }
                }
            }
            return Some(order);
        }

        event!(
            Level::WARN,
            iterations,
            batches = batches.len(),
            "insert actions could not be sorted after {} iterations. This might indicate a circular entity relationship",
            iterations
        );
        None
    }
}

impl ListSorter<EntityInsertAction> for InsertActionSorter {
    fn sort(&self, insertions: &mut Vec<EntityInsertAction>) {
        let mut batches: Vec<BatchIdentifier> = Vec::new();
        let mut buckets: Vec<Vec<usize>> = Vec::new();

        for (position, action) in insertions.iter().enumerate() {
            let index = match batches
                .iter()
                .position(|batch| batch.entity_name == action.entity_name())
            {
                Some(index) => index,
                None => {
                    batches.push(BatchIdentifier::new(
                        action.entity_name(),
                        &self.metamodel.root_entity_name(action.entity_name()),
                    ));
                    buckets.push(Vec::new());
                    batches.len() - 1
                }
            };
            self.add_parent_child_entity_names(action, &mut batches[index]);
            buckets[index].push(position);
        }

        if batches.len() < 2 {
            return;
        }

        Self::infer_parents(&mut batches);
        let Some(order) = Self::order_batches(&batches) else {
            return;
        };

        event!(
            Level::TRACE,
            order = ?order.iter().map(|&i| batches[i].entity_name.as_str()).collect::<Vec<_>>(),
            "sorted insert batches"
        );

        let mut slots: Vec<Option<EntityInsertAction>> = insertions.drain(..).map(Some).collect();
        for batch in order {
            for &position in &buckets[batch] {
                if let Some(action) = slots[position].take() {
                    insertions.push(action);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityInstance, EntityRef, PersistentCollection};
    use crate::metadata::{CollectionPersister, EntityPersister, Property};

    fn metamodel() -> Arc<Metamodel> {
        Arc::new(
            Metamodel::new()
                .entity(EntityPersister::new("Customer", "customers").property(Property::basic("name")))
                .entity(
                    EntityPersister::new("Order", "orders")
                        .property(Property::many_to_one("customer", "Customer"))
                        .property(Property::collection("lines", "Order.lines")),
                )
                .entity(
                    EntityPersister::new("OrderLine", "order_lines")
                        .property(Property::basic("quantity")),
                )
                .entity(
                    EntityPersister::new("Person", "people").property(Property::new(
                        "address",
                        Type::one_to_one("Address", ForeignKeyDirection::ToParent),
                    )),
                )
                .entity(EntityPersister::new("Address", "addresses"))
                .collection(CollectionPersister::new("Order.lines", "order_lines").one_to_many("OrderLine")),
        )
    }

    fn insert(metamodel: &Metamodel, entity: &str, id: i64, state: Vec<Value>) -> EntityInsertAction {
        let persister = metamodel.entity_persister(entity).unwrap();
        let instance = EntityInstance::with_id(entity, id, state.clone());
        EntityInsertAction::new(instance, state, persister)
    }

    fn entity(value: &EntityRef) -> Value {
        Value::Entity(value.clone())
    }

    fn labels(actions: &[EntityInsertAction]) -> Vec<String> {
        actions
            .iter()
            .map(|a| format!("{}{}", a.entity_name(), a.id().unwrap()))
            .collect()
    }

    #[test]
    fn test_parents_move_ahead_and_batches_stay_stable() {
        let model = metamodel();
        let c1 = EntityInstance::with_id("Customer", 1i64, vec![]);
        let c2 = EntityInstance::with_id("Customer", 2i64, vec![]);

        let mut insertions = vec![
            insert(&model, "Order", 1, vec![entity(&c1), Value::Null]),
            insert(&model, "Customer", 1, vec![Value::from("ann")]),
            insert(&model, "Order", 2, vec![entity(&c2), Value::Null]),
            insert(&model, "Customer", 2, vec![Value::from("bob")]),
        ];

        InsertActionSorter::new(model).sort(&mut insertions);

        assert_eq!(labels(&insertions), vec!["Customer1", "Customer2", "Order1", "Order2"]);
    }

    #[test]
    fn test_one_to_many_elements_follow_owner() {
        let model = metamodel();
        let lines = PersistentCollection::new("Order.lines", vec![]);

        let mut insertions = vec![
            insert(&model, "OrderLine", 1, vec![Value::Integer(3)]),
            insert(&model, "Order", 1, vec![Value::Null, Value::Collection(lines)]),
        ];

        InsertActionSorter::new(model).sort(&mut insertions);

        assert_eq!(labels(&insertions), vec!["Order1", "OrderLine1"]);
    }

    #[test]
    fn test_one_to_one_to_parent_is_a_child() {
        let model = metamodel();
        let address = EntityInstance::with_id("Address", 1i64, vec![]);

        let mut insertions = vec![
            insert(&model, "Address", 1, vec![]),
            insert(&model, "Person", 1, vec![entity(&address)]),
        ];

        InsertActionSorter::new(model).sort(&mut insertions);

        assert_eq!(labels(&insertions), vec!["Person1", "Address1"]);
    }

    #[test]
    fn test_circular_relationships_terminate() {
        let model = Arc::new(
            Metamodel::new()
                .entity(EntityPersister::new("A", "a").property(Property::many_to_one("b", "B")))
                .entity(EntityPersister::new("B", "b").property(Property::many_to_one("c", "C")))
                .entity(EntityPersister::new("C", "c").property(Property::many_to_one("a", "A"))),
        );
        let a = EntityInstance::with_id("A", 1i64, vec![]);
        let b = EntityInstance::with_id("B", 1i64, vec![]);
        let c = EntityInstance::with_id("C", 1i64, vec![]);

        let mut insertions = vec![
            insert(&model, "A", 1, vec![entity(&b)]),
            insert(&model, "B", 1, vec![entity(&c)]),
            insert(&model, "C", 1, vec![entity(&a)]),
        ];

        InsertActionSorter::new(model).sort(&mut insertions);

        let mut sorted = labels(&insertions);
        sorted.sort();
        assert_eq!(sorted, vec!["A1", "B1", "C1"]);
    }

    #[test]
    fn test_has_parent_guards_cycles() {
        let mut batches = vec![BatchIdentifier::new("A", "A"), BatchIdentifier::new("B", "B")];
        batches[0].parent = Some(1);
        batches[1].parent = Some(0);

        assert!(is_ancestor(&batches, 0, 1));
        assert!(is_ancestor(&batches, 1, 0));

        batches.push(BatchIdentifier::new("C", "C"));
        assert!(!is_ancestor(&batches, 0, 2));
    }
}
