//! Read-through cache for NPC activation state.
//!
//! The database is the source of truth; this layer only absorbs the
//! per-message roster reads the ingress path performs. Every in-process
//! write invalidates synchronously, so staleness up to the TTL is only
//! possible for out-of-process mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ChatError, Result};
use crate::npc::NpcActivationState;
use crate::store::NpcStateStore;

struct CachedState {
    state: NpcActivationState,
    expires_at: Instant,
}

struct CachedRoster {
    roster: Vec<NpcActivationState>,
    expires_at: Instant,
}

/// TTL + sliding-expiry cache over an [`NpcStateStore`].
pub struct NpcActivationCache {
    store: Arc<dyn NpcStateStore>,
    ttl: Duration,
    entries: Mutex<HashMap<(i64, i64), CachedState>>,
    rosters: Mutex<HashMap<i64, CachedRoster>>,
}

impl NpcActivationCache {
    pub fn new(store: Arc<dyn NpcStateStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: Mutex::new(HashMap::new()),
            rosters: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch one NPC's state, read-through on miss.
    ///
    /// Hits slide the expiry forward by the TTL. Negative lookups are not
    /// cached — an NPC that does not exist yet should appear as soon as its
    /// row does.
    pub fn get(&self, session_id: i64, npc_id: i64) -> Result<Option<NpcActivationState>> {
        let now = Instant::now();
        {
            let mut entries = self.lock_entries()?;
            if let Some(cached) = entries.get_mut(&(session_id, npc_id)) {
                if cached.expires_at > now {
                    cached.expires_at = now + self.ttl;
                    return Ok(Some(cached.state.clone()));
                }
                entries.remove(&(session_id, npc_id));
            }
        }

        let state = self.store.npc_state(session_id, npc_id)?;
        if let Some(ref state) = state {
            self.lock_entries()?.insert(
                (session_id, npc_id),
                CachedState {
                    state: state.clone(),
                    expires_at: now + self.ttl,
                },
            );
        }
        Ok(state)
    }

    /// Write through to the store, then invalidate both the single-entry
    /// cache and the session roster so no stale roster is ever served.
    pub fn put(&self, state: &NpcActivationState) -> Result<()> {
        self.store.upsert_npc_state(state)?;
        self.lock_entries()?
            .remove(&(state.session_id, state.npc_id));
        self.lock_rosters()?.remove(&state.session_id);
        Ok(())
    }

    /// Drop every cached entry for a session.
    pub fn invalidate_session(&self, session_id: i64) -> Result<()> {
        self.lock_entries()?
            .retain(|(sid, _), _| *sid != session_id);
        self.lock_rosters()?.remove(&session_id);
        Ok(())
    }

    /// All active + visible NPCs for a session, read-through on miss.
    pub fn list_active_visible(&self, session_id: i64) -> Result<Vec<NpcActivationState>> {
        let now = Instant::now();
        {
            let mut rosters = self.lock_rosters()?;
            if let Some(cached) = rosters.get_mut(&session_id) {
                if cached.expires_at > now {
                    cached.expires_at = now + self.ttl;
                    return Ok(cached.roster.clone());
                }
                rosters.remove(&session_id);
            }
        }

        let roster = self.store.active_visible_npcs(session_id)?;
        self.lock_rosters()?.insert(
            session_id,
            CachedRoster {
                roster: roster.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(roster)
    }

    fn lock_entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(i64, i64), CachedState>>> {
        self.entries
            .lock()
            .map_err(|_| ChatError::Storage("activation cache mutex poisoned".to_owned()))
    }

    fn lock_rosters(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i64, CachedRoster>>> {
        self.rosters
            .lock()
            .map_err(|_| ChatError::Storage("activation cache mutex poisoned".to_owned()))
    }
}
