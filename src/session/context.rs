use super::options::SessionFactoryOptions;
use crate::cache::UpdateTimestampsCache;
use crate::connection::ReactiveConnection;
use crate::core::{OrmError, Result};
use crate::engine::PersistenceContext;
use crate::event::ListenerRegistry;
use crate::metadata::Metamodel;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// State shared by every session of one factory
#[derive(Debug)]
pub struct FactoryServices {
    pub options: SessionFactoryOptions,
    pub metamodel: Arc<Metamodel>,
    pub timestamps: UpdateTimestampsCache,
    pub listeners: ListenerRegistry,
}

impl FactoryServices {
    pub fn new(
        options: SessionFactoryOptions,
        metamodel: Metamodel,
        listeners: ListenerRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            metamodel: Arc::new(metamodel),
            timestamps: UpdateTimestampsCache::new(),
            listeners,
        })
    }
}

/// Handle to one session's connection and persistence context
///
/// Cheap to clone. The connection admits a single operation at a time: a
/// second caller arriving while one is in flight gets
/// `OrmError::ConcurrentOperation` instead of queuing behind it.
#[derive(Clone)]
pub struct SessionContext {
    session_id: Uuid,
    services: Arc<FactoryServices>,
    connection: Arc<tokio::sync::Mutex<Box<dyn ReactiveConnection>>>,
    persistence_context: Arc<Mutex<PersistenceContext>>,
}

impl SessionContext {
    pub fn new(services: Arc<FactoryServices>, connection: Box<dyn ReactiveConnection>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            services,
            connection: Arc::new(tokio::sync::Mutex::new(connection)),
            persistence_context: Arc::new(Mutex::new(PersistenceContext::new())),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn services(&self) -> &Arc<FactoryServices> {
        &self.services
    }

    pub fn options(&self) -> &SessionFactoryOptions {
        &self.services.options
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.services.metamodel
    }

    pub fn timestamps(&self) -> &UpdateTimestampsCache {
        &self.services.timestamps
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.services.listeners
    }

    pub fn is_query_cache_enabled(&self) -> bool {
        self.services.options.query_cache_enabled
    }

    /// Exclusive access to the connection for one operation.
    pub fn connection(&self) -> Result<tokio::sync::MutexGuard<'_, Box<dyn ReactiveConnection>>> {
        self.connection.try_lock().map_err(|_| {
            OrmError::ConcurrentOperation(format!(
                "session {} already has an operation in flight",
                self.session_id
            ))
        })
    }

    /// Must not be held across an `.await`.
    pub fn persistence_context(&self) -> Result<MutexGuard<'_, PersistenceContext>> {
        Ok(self.persistence_context.lock()?)
    }

    /// Takes the connection back out once no other handle remains.
    pub fn into_connection(self) -> Option<Box<dyn ReactiveConnection>> {
        Arc::into_inner(self.connection).map(tokio::sync::Mutex::into_inner)
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .finish()
    }
}
