//! Action queue tests
//!
//! Execution order of the action lists, clearing, and the table-overlap check
//! used before queries.
//! Run with: cargo test --test action_queue_tests

use reactorm::action::{
    CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction, EntityDeleteAction,
    EntityInsertAction, EntityUpdateAction, QueuedOperationCollectionAction,
};
use reactorm::core::{EntityInstance, PersistentCollection, Value};
use reactorm::event::EntityEvent;
use reactorm::session::FactoryServices;
use reactorm::{
    ActionQueue, CollectionPersister, EntityActionListener, EntityPersister, ListenerRegistry,
    MemoryBackend, Metamodel, Property, SessionContext, SessionFactoryOptions,
};
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

fn metamodel() -> Metamodel {
    Metamodel::new()
        .entity(EntityPersister::new("Account", "accounts").property(Property::basic("balance")))
        .entity(EntityPersister::new("Entry", "ledger").property(Property::basic("amount")))
        .entity(EntityPersister::new("Customer", "customers").property(Property::basic("name")))
        .entity(EntityPersister::new("Line", "lines").property(Property::basic("sku")))
        .collection(CollectionPersister::new("Customer.queued", "queued_rows"))
        .collection(CollectionPersister::new("Customer.removed", "removed_rows"))
        .collection(CollectionPersister::new("Customer.updated", "updated_rows"))
        .collection(CollectionPersister::new("Customer.created", "created_rows"))
}

fn queue(backend: &Arc<MemoryBackend>, options: SessionFactoryOptions) -> ActionQueue {
    queue_with(backend, options, 1, ListenerRegistry::new())
}

fn queue_with(
    backend: &Arc<MemoryBackend>,
    options: SessionFactoryOptions,
    batch_size: usize,
    listeners: ListenerRegistry,
) -> ActionQueue {
    let services = FactoryServices::new(options, metamodel(), listeners);
    ActionQueue::new(SessionContext::new(services, Box::new(backend.connect(batch_size))))
}

fn persister(queue: &ActionQueue, entity_name: &str) -> Arc<EntityPersister> {
    queue.session().metamodel().entity_persister(entity_name).unwrap()
}

fn collection_persister(queue: &ActionQueue, role: &str) -> Arc<CollectionPersister> {
    queue.session().metamodel().collection_persister(role).unwrap()
}

/// Table a recorded statement writes to.
fn table_of(sql: &str) -> &str {
    let rest = sql
        .strip_prefix("INSERT INTO ")
        .or_else(|| sql.strip_prefix("UPDATE "))
        .or_else(|| sql.strip_prefix("DELETE FROM "))
        .unwrap_or(sql);
    rest.split_whitespace().next().unwrap_or(rest)
}

/// Tables written by one action of every kind, in execution order.
const KIND_ORDER: [&str; 8] = [
    "lines",
    "accounts",
    "customers",
    "queued_rows",
    "removed_rows",
    "updated_rows",
    "created_rows",
    "customers",
];

/// Queues one action of every kind, in reverse of execution order.
async fn queue_one_of_each(queue: &mut ActionQueue) {
    let owner = EntityInstance::with_id("Customer", 1, vec![Value::from("ann")]);

    let gone = EntityInstance::with_id("Customer", 7, vec![Value::from("gone")]);
    queue.add_delete_action(
        EntityDeleteAction::new(gone.clone(), gone.properties(), persister(queue, "Customer")).unwrap(),
    );

    let created = PersistentCollection::new("Customer.created", vec![Value::from("a")]);
    queue.add_collection_recreate_action(CollectionRecreateAction::new(
        created,
        collection_persister(queue, "Customer.created"),
        owner.clone(),
    ));

    let updated = PersistentCollection::loaded("Customer.updated", vec![Value::from("a")]);
    updated.add(Value::from("b"));
    queue.add_collection_update_action(CollectionUpdateAction::new(
        updated,
        collection_persister(queue, "Customer.updated"),
        owner.clone(),
    ));

    let removed = PersistentCollection::loaded("Customer.removed", vec![Value::from("a")]);
    queue.add_collection_remove_action(CollectionRemoveAction::new(
        Some(removed),
        collection_persister(queue, "Customer.removed"),
        owner.clone(),
    ));

    let queued = PersistentCollection::uninitialized("Customer.queued");
    queued.add(Value::from("late"));
    queue.add_collection_queued_operation_action(QueuedOperationCollectionAction::new(
        queued,
        collection_persister(queue, "Customer.queued"),
        owner.clone(),
    ));

    queue.add_update_action(
        EntityUpdateAction::new(
            owner.clone(),
            vec![Value::from("anne")],
            Some(vec![Value::from("ann")]),
            persister(queue, "Customer"),
        )
        .unwrap(),
    );

    let fresh = EntityInstance::with_id("Account", 3, vec![Value::from(10)]);
    assert_ok!(
        queue
            .add_insert_action(EntityInsertAction::new(
                fresh.clone(),
                fresh.properties(),
                persister(queue, "Account"),
            ))
            .await
    );

    let orphan = EntityInstance::with_id("Line", 9, vec![Value::from("x-1")]);
    queue.add_orphan_removal_action(
        EntityDeleteAction::orphan_removal(orphan.clone(), orphan.properties(), persister(queue, "Line"))
            .unwrap(),
    );

}

#[tokio::test]
async fn test_lists_execute_in_kind_order() {
    let backend = MemoryBackend::new();
    let mut queue = queue(&backend, SessionFactoryOptions::default());
    queue_one_of_each(&mut queue).await;

    assert_ok!(queue.prepare_actions());
    assert_ok!(queue.execute_actions().await);

    let statements = backend.statements().unwrap();
    let tables: Vec<&str> = statements.iter().map(|sql| table_of(sql)).collect();
    assert_eq!(tables, KIND_ORDER);
    assert!(statements[0].starts_with("DELETE FROM lines"));
    assert!(statements[7].starts_with("DELETE FROM customers"));
    assert!(!queue.has_any_queued_actions());
}

/// Records how many statements had reached the backend whenever an update
/// or delete is about to run.
struct JournalWatcher {
    backend: Arc<MemoryBackend>,
    seen: Mutex<Vec<usize>>,
}

impl JournalWatcher {
    fn note(&self) {
        let written = self.backend.journal().unwrap().len();
        self.seen.lock().unwrap().push(written);
    }
}

impl EntityActionListener for JournalWatcher {
    fn on_pre_update(&self, _event: &EntityEvent<'_>) -> bool {
        self.note();
        false
    }

    fn on_pre_delete(&self, _event: &EntityEvent<'_>) -> bool {
        self.note();
        false
    }
}

#[tokio::test]
async fn test_batched_lists_flush_between_kinds() {
    let backend = MemoryBackend::new();
    let watcher = Arc::new(JournalWatcher {
        backend: backend.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let mut listeners = ListenerRegistry::new();
    listeners.register(watcher.clone());
    let mut queue = queue_with(&backend, SessionFactoryOptions::default(), 5, listeners);
    queue_one_of_each(&mut queue).await;

    assert_ok!(queue.prepare_actions());
    assert_ok!(queue.execute_actions().await);

    let statements = backend.statements().unwrap();
    let tables: Vec<&str> = statements.iter().map(|sql| table_of(sql)).collect();
    assert_eq!(tables, KIND_ORDER);

    // orphan removal first, the update after the insert list was sent, the
    // delete after every collection list was sent
    assert_eq!(*watcher.seen.lock().unwrap(), vec![0, 2, 7]);
}

#[tokio::test]
async fn test_clear_discards_everything() {
    let backend = MemoryBackend::new();
    let mut queue = queue(&backend, SessionFactoryOptions::default());

    let account = EntityInstance::with_id("Account", 1, vec![Value::from(5)]);
    assert_ok!(
        queue
            .add_insert_action(EntityInsertAction::new(
                account.clone(),
                account.properties(),
                persister(&queue, "Account"),
            ))
            .await
    );
    let entry = EntityInstance::with_id("Entry", 2, vec![Value::from(1)]);
    queue.add_update_action(
        EntityUpdateAction::new(entry.clone(), entry.properties(), None, persister(&queue, "Entry")).unwrap(),
    );
    queue.add_delete_action(
        EntityDeleteAction::new(entry.clone(), entry.properties(), persister(&queue, "Entry")).unwrap(),
    );
    assert!(queue.has_any_queued_actions());

    queue.clear();

    assert!(!queue.has_any_queued_actions());
    assert_eq!(queue.number_of_insertions(), 0);
    assert_eq!(queue.number_of_updates(), 0);
    assert_eq!(queue.number_of_deletions(), 0);

    // clearing twice is harmless, and nothing reached the connection
    queue.clear();
    assert_ok!(queue.execute_actions().await);
    assert!(backend.statements().unwrap().is_empty());
}

#[tokio::test]
async fn test_tables_to_be_updated_before_and_after_execution() {
    let backend = MemoryBackend::new();
    let mut queue = queue(&backend, SessionFactoryOptions::default());

    let account = EntityInstance::with_id("Account", 1, vec![Value::from(100)]);
    let entry = EntityInstance::with_id("Entry", 1, vec![Value::from(-100)]);
    queue.add_update_action(
        EntityUpdateAction::new(account.clone(), account.properties(), None, persister(&queue, "Account"))
            .unwrap(),
    );
    queue.add_update_action(
        EntityUpdateAction::new(entry.clone(), entry.properties(), None, persister(&queue, "Entry")).unwrap(),
    );

    assert!(queue.are_tables_to_be_updated(&["ledger"]));
    assert!(queue.are_tables_to_be_updated(&["accounts", "other"]));
    assert!(!queue.are_tables_to_be_updated(&["customers"]));
    assert!(!queue.are_tables_to_be_updated(&[]));

    assert_ok!(queue.execute_actions().await);
    queue.clear();

    assert!(!queue.are_tables_to_be_updated(&["ledger"]));
    assert_eq!(backend.statements().unwrap().len(), 2);
}

#[tokio::test]
async fn test_executed_spaces_are_invalidated_at_completion() {
    let backend = MemoryBackend::new();
    let mut queue = queue(&backend, SessionFactoryOptions::new().query_cache_enabled(true));

    let account = EntityInstance::with_id("Account", 1, vec![Value::from(1)]);
    queue.add_update_action(
        EntityUpdateAction::new(account.clone(), account.properties(), None, persister(&queue, "Account"))
            .unwrap(),
    );
    assert_ok!(queue.execute_actions().await);

    let timestamps = queue.session().timestamps();
    assert!(timestamps.is_pre_invalidated("accounts").unwrap());
    assert!(!timestamps.is_pre_invalidated("ledger").unwrap());
    let after = queue.transaction_completion_processes().after;
    assert_eq!(after.spaces_to_invalidate().unwrap(), vec!["accounts".to_string()]);

    assert_ok!(queue.after_transaction_completion(true).await);
    assert!(!timestamps.is_pre_invalidated("accounts").unwrap());
    assert!(timestamps.last_invalidation("accounts").unwrap().is_some());
    assert!(after.spaces_to_invalidate().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_statement_surfaces_unchanged() {
    let backend = MemoryBackend::new();
    backend.fail_on("UPDATE accounts").unwrap();
    let mut queue = queue(&backend, SessionFactoryOptions::new().query_cache_enabled(true));

    let account = EntityInstance::with_id("Account", 1, vec![Value::from(1)]);
    queue.add_update_action(
        EntityUpdateAction::new(account.clone(), account.properties(), None, persister(&queue, "Account"))
            .unwrap(),
    );
    let entry = EntityInstance::with_id("Entry", 1, vec![Value::from(1)]);
    queue.add_delete_action(
        EntityDeleteAction::new(entry.clone(), entry.properties(), persister(&queue, "Entry")).unwrap(),
    );

    let err = assert_err!(queue.execute_actions().await);
    assert!(matches!(err, reactorm::OrmError::Connection(_)));

    // later lists never ran, the failing list's spaces were still invalidated
    assert!(backend.statements().unwrap().is_empty());
    assert!(queue.session().timestamps().is_pre_invalidated("accounts").unwrap());
    assert_eq!(queue.number_of_deletions(), 1);
}

#[tokio::test]
async fn test_flush_check_trims_only_newer_removals() {
    let backend = MemoryBackend::new();
    let mut queue = queue(&backend, SessionFactoryOptions::default());
    let remove_rows_of = |queue: &mut ActionQueue, id: i64| {
        let owner = EntityInstance::with_id("Customer", id, vec![Value::from("c")]);
        let rows = PersistentCollection::loaded("Customer.removed", vec![Value::from("a")]);
        let persister = collection_persister(queue, "Customer.removed");
        queue.add_collection_remove_action(CollectionRemoveAction::new(Some(rows), persister, owner));
    };

    // scheduled before the dry run, e.g. by reattaching a detached owner
    remove_rows_of(&mut queue, 1);
    let previous = queue.number_of_collection_removals();

    remove_rows_of(&mut queue, 2);
    remove_rows_of(&mut queue, 3);
    let owner = EntityInstance::with_id("Customer", 2, vec![Value::from("c")]);
    queue.add_update_action(
        EntityUpdateAction::new(owner.clone(), owner.properties(), None, persister(&queue, "Customer")).unwrap(),
    );
    queue.add_collection_recreate_action(CollectionRecreateAction::new(
        PersistentCollection::new("Customer.created", vec![Value::from("a")]),
        collection_persister(&queue, "Customer.created"),
        owner,
    ));
    assert_eq!(queue.number_of_collection_removals(), 3);

    queue.clear_from_flush_needed_check(previous);

    assert_eq!(queue.number_of_collection_removals(), 1);
    assert_eq!(queue.number_of_updates(), 0);
    assert_eq!(queue.number_of_collection_creations(), 0);

    assert_ok!(queue.execute_actions().await);
    let journal = backend.journal().unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(table_of(&journal[0].sql), "removed_rows");
    assert_eq!(journal[0].params, vec![Value::from(1)]);
}

/// Queues account updates for `ids`, flushes, and returns the ids in the
/// order their statements were written.
async fn run_updates(options: SessionFactoryOptions, ids: &[i64]) -> Vec<Value> {
    let backend = MemoryBackend::new();
    let mut queue = queue(&backend, options);
    for &id in ids {
        let account = EntityInstance::with_id("Account", id, vec![Value::from(0)]);
        queue.add_update_action(
            EntityUpdateAction::new(account.clone(), account.properties(), None, persister(&queue, "Account"))
                .unwrap(),
        );
        let rows = PersistentCollection::new("Customer.created", vec![Value::from("a")]);
        let owner = EntityInstance::with_id("Customer", id, vec![Value::from("c")]);
        queue.add_collection_recreate_action(CollectionRecreateAction::new(
            rows,
            collection_persister(&queue, "Customer.created"),
            owner,
        ));
    }

    queue.sort_collection_actions();
    queue.sort_actions();
    assert_ok!(queue.execute_actions().await);

    // the update binds the id last, the collection row binds the owner first
    backend
        .journal()
        .unwrap()
        .into_iter()
        .map(|statement| match table_of(&statement.sql) {
            "accounts" => statement.params.last().cloned().unwrap_or(Value::Null),
            _ => statement.params.first().cloned().unwrap_or(Value::Null),
        })
        .collect()
}

#[tokio::test]
async fn test_ordered_updates_run_by_identifier() {
    let ids = run_updates(SessionFactoryOptions::new().order_updates(true), &[3, 1, 2]).await;

    let expected: Vec<Value> = [1i64, 2, 3, 1, 2, 3].into_iter().map(Value::from).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_unordered_updates_keep_queue_order() {
    let ids = run_updates(SessionFactoryOptions::default(), &[3, 1, 2]).await;

    let expected: Vec<Value> = [3i64, 1, 2, 3, 1, 2].into_iter().map(Value::from).collect();
    assert_eq!(ids, expected);
}
