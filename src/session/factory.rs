use super::context::{FactoryServices, SessionContext};
use super::options::SessionFactoryOptions;
use super::ReactiveSession;
use crate::cache::UpdateTimestampsCache;
use crate::connection::config::ConnectionConfig;
use crate::connection::memory::{MemoryBackend, MemoryConnectionFactory};
use crate::connection::pool::{ConnectionFactory, ConnectionPool, PoolStats};
use crate::core::Result;
use crate::event::ListenerRegistry;
use crate::metadata::Metamodel;
use std::sync::Arc;
use tracing::{Level, event};

/// Opens sessions over a connection pool
///
/// Everything sessions share (options, metamodel, timestamps cache,
/// listeners) lives in one `FactoryServices` value.
pub struct SessionFactory {
    pool: ConnectionPool,
    services: Arc<FactoryServices>,
}

impl SessionFactory {
    pub async fn new(
        config: ConnectionConfig,
        connections: Arc<dyn ConnectionFactory>,
        options: SessionFactoryOptions,
        metamodel: Metamodel,
        listeners: ListenerRegistry,
    ) -> Result<Self> {
        options.validate()?;
        let pool = ConnectionPool::new(config, connections).await?;
        event!(
            Level::INFO,
            order_inserts = options.order_inserts,
            order_updates = options.order_updates,
            query_cache = options.query_cache_enabled,
            batch_size = options.batch_size,
            "session factory started"
        );
        Ok(Self {
            pool,
            services: FactoryServices::new(options, metamodel, listeners),
        })
    }

    /// A factory over an in-memory backend, batching per `options.batch_size`.
    pub async fn in_memory(
        backend: Arc<MemoryBackend>,
        options: SessionFactoryOptions,
        metamodel: Metamodel,
        listeners: ListenerRegistry,
    ) -> Result<Self> {
        let connections = Arc::new(MemoryConnectionFactory::new(backend, options.batch_size));
        Self::new(ConnectionConfig::default(), connections, options, metamodel, listeners).await
    }

    /// Takes a connection from the pool for a new session.
    pub async fn open_session(&self) -> Result<ReactiveSession> {
        let connection = self.pool.get_connection().await?;
        let context = SessionContext::new(self.services.clone(), Box::new(connection));
        event!(Level::DEBUG, session = %context.session_id(), "session opened");
        Ok(ReactiveSession::new(context))
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

    pub fn services(&self) -> &Arc<FactoryServices> {
        &self.services
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }
}
