pub mod entity;
pub mod error;
pub mod value;

pub use entity::{
    CollectionRef, EntityInstance, EntityRef, InstanceId, LazyProxy, PersistentCollection,
    ProxyRef, QueuedOperation,
};
pub use error::{OrmError, Result};
pub use value::Value;
