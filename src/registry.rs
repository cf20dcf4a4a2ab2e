//! Registry of live server sessions.
//!
//! Sessions are independent, so the registry is never used for routing.
//! It bounds how many peers may be connected at once and reports
//! connect/disconnect counts. Entries are removed by dropping the
//! [`SessionGuard`] returned on registration, so every exit path of a
//! session releases its slot.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// Membership record for one live session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

#[derive(Debug)]
struct Inner {
    sessions: Mutex<Slab<SessionEntry>>,
    /// `None` means unbounded.
    max_sessions: Option<usize>,
}

/// Shared, cloneable handle to the registry.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Create a registry. A `max_sessions` of `None` accepts any number of peers.
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(Slab::new()),
                max_sessions,
            }),
        }
    }

    /// Register a newly accepted peer.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn register(&self, peer: SocketAddr) -> Option<SessionGuard> {
        let mut sessions = self.lock();
        if let Some(max) = self.inner.max_sessions {
            if sessions.len() >= max {
                return None;
            }
        }

        let id = sessions.insert(SessionEntry {
            peer,
            connected_at: Instant::now(),
        });

        Some(SessionGuard {
            registry: self.clone(),
            id,
        })
    }

    /// Number of live sessions. May be stale by the time it is read.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.max_sessions
    }

    /// Copy of the current membership.
    pub fn snapshot(&self) -> Vec<SessionEntry> {
        self.lock().iter().map(|(_, entry)| entry.clone()).collect()
    }

    fn remove(&self, id: usize) -> Option<SessionEntry> {
        self.lock().try_remove(id)
    }

    fn lock(&self) -> MutexGuard<'_, Slab<SessionEntry>> {
        // No slab operation panics midway; a poisoned slab is still consistent.
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a session registered for as long as it is alive.
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    id: usize,
}

impl SessionGuard {
    #[cfg(test)]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.remove(self.id) {
            let lifetime: Duration = entry.connected_at.elapsed();
            debug!(
                peer = %entry.peer,
                session = self.id,
                lifetime_ms = lifetime.as_millis() as u64,
                "Session deregistered"
            );
        }
    }
}
