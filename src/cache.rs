// ============================================================================
// Update Timestamps Cache
// ============================================================================
//
// Tracks when each query space (table) last changed so cached query results
// can be checked for staleness. Executing a statement pre-invalidates its
// spaces; the spaces are invalidated for good when the transaction
// completes, so readers of the old snapshot never see a half-applied state.
//
// ============================================================================

use crate::core::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{Level, event};

/// Pre-invalidated spaces stay stale for this long unless invalidated sooner
const PRE_INVALIDATION_TIMEOUT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpaceState {
    /// Changed by a transaction still in flight; stale until the timestamp.
    PreInvalidated(DateTime<Utc>),
    Invalidated(DateTime<Utc>),
}

#[derive(Debug, Default)]
pub struct UpdateTimestampsCache {
    spaces: Mutex<HashMap<String, SpaceState>>,
}

impl UpdateTimestampsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_invalidate<S: AsRef<str>>(&self, spaces: &[S]) -> Result<()> {
        let until = Utc::now() + Duration::seconds(PRE_INVALIDATION_TIMEOUT_SECS);
        let mut map = self.spaces.lock()?;
        for space in spaces {
            event!(Level::TRACE, space = space.as_ref(), "pre-invalidating query space");
            map.insert(space.as_ref().to_string(), SpaceState::PreInvalidated(until));
        }
        Ok(())
    }

    pub fn invalidate<S: AsRef<str>>(&self, spaces: &[S]) -> Result<()> {
        let now = Utc::now();
        let mut map = self.spaces.lock()?;
        for space in spaces {
            event!(Level::TRACE, space = space.as_ref(), "invalidating query space");
            map.insert(space.as_ref().to_string(), SpaceState::Invalidated(now));
        }
        Ok(())
    }

    /// Whether results computed at `timestamp` over `spaces` are still valid.
    pub fn is_up_to_date<S: AsRef<str>>(&self, spaces: &[S], timestamp: DateTime<Utc>) -> Result<bool> {
        let map = self.spaces.lock()?;
        for space in spaces {
            match map.get(space.as_ref()) {
                None => {}
                Some(SpaceState::PreInvalidated(_)) => return Ok(false),
                Some(SpaceState::Invalidated(at)) if *at >= timestamp => return Ok(false),
                Some(SpaceState::Invalidated(_)) => {}
            }
        }
        Ok(true)
    }

    /// When `space` last changed, if it ever did.
    pub fn last_invalidation(&self, space: &str) -> Result<Option<DateTime<Utc>>> {
        let map = self.spaces.lock()?;
        Ok(map.get(space).and_then(|state| match state {
            SpaceState::Invalidated(at) => Some(*at),
            SpaceState::PreInvalidated(_) => None,
        }))
    }

    pub fn is_pre_invalidated(&self, space: &str) -> Result<bool> {
        let map = self.spaces.lock()?;
        Ok(matches!(
            map.get(space),
            Some(SpaceState::PreInvalidated(until)) if *until > Utc::now()
        ))
    }

    pub fn clear(&self) -> Result<()> {
        self.spaces.lock()?.clear();
        Ok(())
    }
}
