//! Unresolved insert tests
//!
//! Inserts referencing unsaved entities through non-nullable associations
//! wait until those entities are managed.
//! Run with: cargo test --test unresolved_insert_tests

use reactorm::action::EntityInsertAction;
use reactorm::core::{EntityInstance, EntityRef, Value};
use reactorm::event::EntityEvent;
use reactorm::metadata::IdentifierGeneration;
use reactorm::session::FactoryServices;
use reactorm::{
    ActionQueue, EntityActionListener, EntityPersister, ListenerRegistry, MemoryBackend, Metamodel,
    OrmError, Property, SessionContext, SessionFactory, SessionFactoryOptions, Status,
};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn shop(cascade: bool) -> Metamodel {
    let association = |name: &str, target: &str| {
        let property = Property::many_to_one(name, target).not_null();
        if cascade { property.cascade() } else { property }
    };
    Metamodel::new()
        .entity(EntityPersister::new("Customer", "customers").property(Property::basic("name")))
        .entity(EntityPersister::new("Product", "products").property(Property::basic("sku")))
        .entity(
            EntityPersister::new("Order", "orders")
                .property(Property::basic("total"))
                .property(association("customer", "Customer")),
        )
        .entity(
            EntityPersister::new("OrderLine", "order_lines")
                .property(association("order", "Order"))
                .property(association("product", "Product")),
        )
        .entity(
            EntityPersister::new("Invoice", "invoices")
                .identifier("id", IdentifierGeneration::Identity)
                .property(association("order", "Order")),
        )
}

fn queue_over(backend: &Arc<MemoryBackend>, listeners: ListenerRegistry) -> ActionQueue {
    let services = FactoryServices::new(SessionFactoryOptions::default(), shop(false), listeners);
    ActionQueue::new(SessionContext::new(services, Box::new(backend.connect(1))))
}

fn insert(queue: &ActionQueue, instance: &EntityRef) -> EntityInsertAction {
    let persister = queue
        .session()
        .metamodel()
        .entity_persister(instance.entity_name())
        .unwrap();
    if persister.uses_identity() {
        EntityInsertAction::identity(instance.clone(), instance.properties(), persister)
    } else {
        EntityInsertAction::new(instance.clone(), instance.properties(), persister)
    }
}

fn customer() -> EntityRef {
    EntityInstance::with_id("Customer", 1, vec![Value::from("ann")])
}

fn order(customer: &EntityRef) -> EntityRef {
    EntityInstance::with_id("Order", 1, vec![Value::from(30), Value::Entity(customer.clone())])
}

fn line(order: &EntityRef, product: &EntityRef) -> EntityRef {
    EntityInstance::with_id(
        "OrderLine",
        1,
        vec![Value::Entity(order.clone()), Value::Entity(product.clone())],
    )
}

fn tables(backend: &MemoryBackend) -> Vec<String> {
    backend
        .statements()
        .unwrap()
        .iter()
        .filter_map(|sql| sql.strip_prefix("INSERT INTO "))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_insert_waits_for_every_dependency() {
    let backend = MemoryBackend::new();
    let mut queue = queue_over(&backend, ListenerRegistry::new());
    let ann = customer();
    let bolt = EntityInstance::with_id("Product", 5, vec![Value::from("bolt")]);
    let order = order(&ann);
    let line = line(&order, &bolt);

    // the customer is already managed, so only the line has to wait
    queue
        .session()
        .persistence_context()
        .unwrap()
        .add_loaded(&ann);

    assert_ok!(queue.add_insert_action(insert(&queue, &line)).await);
    assert_eq!(queue.number_of_unresolved_insertions(), 1);
    assert_eq!(queue.number_of_insertions(), 0);

    assert_ok!(queue.add_insert_action(insert(&queue, &order)).await);
    assert_eq!(queue.number_of_unresolved_insertions(), 1);
    assert_eq!(queue.number_of_insertions(), 1);

    assert_ok!(queue.add_insert_action(insert(&queue, &bolt)).await);
    assert!(!queue.has_unresolved_entity_insert_actions());
    assert_eq!(queue.number_of_insertions(), 3);

    assert_ok!(queue.check_no_unresolved_actions_after_operation());
    assert_ok!(queue.execute_actions().await);
    assert_eq!(tables(&backend), vec!["orders", "products", "order_lines"]);
}

#[tokio::test]
async fn test_dependency_never_saved_is_reported() {
    let backend = MemoryBackend::new();
    let mut queue = queue_over(&backend, ListenerRegistry::new());
    let order = order(&customer());

    assert_ok!(queue.add_insert_action(insert(&queue, &order)).await);

    match queue.check_no_unresolved_actions_after_operation() {
        Err(OrmError::TransientPropertyValue {
            message,
            transient_entity_name,
            property_owner_entity_name,
            property_name,
        }) => {
            assert!(message.starts_with("Not-null property references a transient value"));
            assert_eq!(transient_entity_name, "Customer");
            assert_eq!(property_owner_entity_name, "Order");
            assert_eq!(property_name, "customer");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // executing with unresolved inserts left over is a usage error
    let err = assert_err!(queue.execute_actions().await);
    assert!(matches!(err, OrmError::IllegalState(_)));
}

#[tokio::test]
async fn test_cascade_order_resolves_customer_order_line() {
    let backend = MemoryBackend::new();
    let mut queue = queue_over(&backend, ListenerRegistry::new());
    let ann = customer();
    let bolt = EntityInstance::with_id("Product", 5, vec![Value::from("bolt")]);
    queue
        .session()
        .persistence_context()
        .unwrap()
        .add_loaded(&bolt);
    let order = order(&ann);
    let line = line(&order, &bolt);

    assert_ok!(queue.add_insert_action(insert(&queue, &order)).await);
    assert_ok!(queue.add_insert_action(insert(&queue, &ann)).await);
    assert_ok!(queue.add_insert_action(insert(&queue, &line)).await);
    assert_eq!(queue.number_of_insertions(), 3);

    assert_ok!(queue.execute_actions().await);
    assert_eq!(tables(&backend), vec!["customers", "orders", "order_lines"]);
}

#[tokio::test]
async fn test_persist_cascades_through_unsaved_parents() {
    let backend = MemoryBackend::new();
    let factory = SessionFactory::in_memory(
        backend.clone(),
        SessionFactoryOptions::default(),
        shop(true),
        ListenerRegistry::new(),
    )
    .await
    .unwrap();
    let mut session = factory.open_session().await.unwrap();
    let ann = customer();
    let bolt = EntityInstance::with_id("Product", 5, vec![Value::from("bolt")]);
    let order = order(&ann);
    let line = line(&order, &bolt);

    assert_ok!(session.persist(&line).await);
    for instance in [&ann, &bolt, &order, &line] {
        assert_eq!(session.status_of(instance).unwrap(), Some(Status::Managed));
    }

    assert_ok!(session.flush().await);
    assert_eq!(tables(&backend), vec!["customers", "orders", "products", "order_lines"]);
}

#[tokio::test]
async fn test_persist_without_cascade_fails_on_transient_reference() {
    let backend = MemoryBackend::new();
    let factory = SessionFactory::in_memory(
        backend.clone(),
        SessionFactoryOptions::default(),
        shop(false),
        ListenerRegistry::new(),
    )
    .await
    .unwrap();
    let mut session = factory.open_session().await.unwrap();
    let order = order(&customer());

    let err = assert_err!(session.persist(&order).await);
    assert!(matches!(
        err,
        OrmError::TransientPropertyValue { ref property_name, .. } if property_name == "customer"
    ));
}

#[tokio::test]
async fn test_identity_insert_runs_queued_inserts_first() {
    let backend = MemoryBackend::new();
    let mut queue = queue_over(&backend, ListenerRegistry::new());
    let ann = customer();
    let order = order(&ann);
    let invoice = EntityInstance::new("Invoice", vec![Value::Entity(order.clone())]);

    assert_ok!(queue.add_insert_action(insert(&queue, &ann)).await);
    assert_ok!(queue.add_insert_action(insert(&queue, &order)).await);
    assert!(backend.statements().unwrap().is_empty());

    assert_ok!(queue.add_insert_action(insert(&queue, &invoice)).await);

    assert_eq!(tables(&backend), vec!["customers", "orders", "invoices"]);
    assert_eq!(queue.number_of_insertions(), 0);
    assert_eq!(invoice.id(), Some(Value::from(1)));
}

struct VetoInvoices;

impl EntityActionListener for VetoInvoices {
    fn on_pre_insert(&self, event: &EntityEvent<'_>) -> bool {
        event.entity_name == "Invoice"
    }
}

#[tokio::test]
async fn test_vetoed_identity_insert_is_an_error() {
    let backend = MemoryBackend::new();
    let mut listeners = ListenerRegistry::new();
    listeners.register(Arc::new(VetoInvoices));
    let mut queue = queue_over(&backend, listeners);
    let order = order(&customer());
    queue
        .session()
        .persistence_context()
        .unwrap()
        .add_loaded(&order);
    let invoice = EntityInstance::new("Invoice", vec![Value::Entity(order.clone())]);

    let err = assert_err!(queue.add_insert_action(insert(&queue, &invoice)).await);
    assert!(matches!(err, OrmError::EntityActionVeto { ref entity_name } if entity_name == "Invoice"));
    assert!(backend.statements().unwrap().is_empty());
    assert!(invoice.id().is_none());
}
