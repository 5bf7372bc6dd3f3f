// ============================================================================
// Session Engine
// ============================================================================
//
// Per-session bookkeeping the action queue consults: which instances the
// session manages (and in which lifecycle state), and which references of a
// pending insert still point at entities that have not been persisted.
//
// ============================================================================

pub mod context;
pub mod foreign_keys;

pub use context::{EntityEntry, PersistenceContext, Status};
pub use foreign_keys::{NonNullableTransientDependencies, find_non_nullable_transient_entities};
