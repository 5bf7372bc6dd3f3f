// ============================================================================
// Reactorm Library
// ============================================================================
//
// Asynchronous unit-of-work write path for an object-relational mapper.
// A session collects entity state changes as executable actions in its
// action queue and writes them over a non-blocking connection in a fixed,
// dependency-safe order.
//
// ============================================================================

pub mod action;
pub mod cache;
pub mod connection;
pub mod core;
pub mod engine;
pub mod event;
pub mod metadata;
pub mod queue;
pub mod session;

// Re-export main types for convenience
pub use core::{
    CollectionRef, EntityInstance, EntityRef, LazyProxy, OrmError, PersistentCollection, Result,
    Value,
};
pub use engine::Status;
pub use metadata::{
    CollectionPersister, EntityPersister, ForeignKeyDirection, IdentifierGeneration, Metamodel,
    Property, Type,
};
pub use queue::ActionQueue;

// Re-export connection API
pub use connection::{
    ReactiveConnection,
    config::ConnectionConfig,
    memory::{MemoryBackend, MemoryConnection},
    pool::{ConnectionPool, PoolGuard, PoolStats},
};

// Re-export session API
pub use event::{EntityActionListener, ListenerRegistry};
pub use session::{ReactiveSession, SessionContext, SessionFactory, SessionFactoryOptions};
