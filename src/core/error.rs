use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrmError {
    #[error("Insert action for entity '{entity_name}' was vetoed")]
    EntityActionVeto { entity_name: String },

    #[error(
        "{message}: {property_owner_entity_name}.{property_name} -> {transient_entity_name}"
    )]
    TransientPropertyValue {
        message: String,
        transient_entity_name: String,
        property_owner_entity_name: String,
        property_name: String,
    },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Assertion failure: {0}")]
    AssertionFailure(String),

    #[error("Unable to release cache lock: {0}")]
    CacheRelease(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Concurrent operation on a single connection: {0}")]
    ConcurrentOperation(String),

    #[error("Connection pool timeout: no connections available")]
    PoolTimeout,

    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("Unknown collection role '{0}'")]
    UnknownCollectionRole(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl OrmError {
    /// Whether the error is tolerated while draining after-completion callbacks.
    pub fn is_cache_release(&self) -> bool {
        matches!(self, OrmError::CacheRelease(_))
    }
}

pub type Result<T> = std::result::Result<T, OrmError>;

impl<T> From<std::sync::PoisonError<T>> for OrmError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
