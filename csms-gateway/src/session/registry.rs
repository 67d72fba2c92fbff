//! Session registry
//!
//! Authoritative map from charge point id to its live session. The map lock
//! only covers map mutation; terminating a superseded session happens after
//! it is released.
//!
//! Admission is two-phase: [`SessionRegistry::admit`] claims the per-id
//! creation guard and evicts any previous session, [`Admission::install`]
//! publishes the new handle. A connection arriving while the guard is held
//! is refused. An admission that is dropped after evicting a session leaves
//! announcing that session's departure to whoever abandoned it.
//!
//! Once [`SessionRegistry::close`] has run, admission is refused and any
//! session installed by an admission already in flight is terminated at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::session::{SessionHandle, StateRecord};

#[derive(Default)]
struct Sessions {
    live: HashMap<String, Arc<SessionHandle>>,
    creating: HashSet<String>,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Sessions>>,
}

/// Creation guard for one charge point id
///
/// Dropping it without calling [`Admission::install`] releases the guard.
pub struct Admission {
    registry: SessionRegistry,
    charge_point_id: String,
    displaced: Option<Arc<SessionHandle>>,
    installed: bool,
}

impl Admission {
    pub fn charge_point_id(&self) -> &str {
        &self.charge_point_id
    }

    /// Whether a previous session was terminated to make room
    pub fn superseded(&self) -> bool {
        self.displaced.is_some()
    }

    /// The evicted session. Its own teardown no longer finds it in the
    /// registry, so if this admission is abandoned the caller must announce
    /// the disconnect while the guard is still held.
    pub fn displaced(&self) -> Option<&Arc<SessionHandle>> {
        self.displaced.as_ref()
    }

    /// Make `handle` the live session and release the guard
    pub fn install(mut self, handle: Arc<SessionHandle>) {
        let closed = {
            let mut sessions = self.registry.inner.lock();
            sessions
                .live
                .insert(self.charge_point_id.clone(), handle.clone());
            sessions.creating.remove(&self.charge_point_id);
            sessions.closed
        };
        self.installed = true;

        if closed {
            debug!(
                "{}: installed after registry closed, terminating",
                self.charge_point_id
            );
            handle.terminate();
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.installed {
            self.registry.inner.lock().creating.remove(&self.charge_point_id);
            debug!("{}: admission abandoned", self.charge_point_id);
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the creation guard for `charge_point_id`
    pub fn admit(&self, charge_point_id: &str) -> Result<Admission, GatewayError> {
        let previous = {
            let mut sessions = self.inner.lock();
            if sessions.closed {
                debug!("{}: connection refused, shutting down", charge_point_id);
                return Err(GatewayError::ShuttingDown);
            }
            if sessions.creating.contains(charge_point_id) {
                warn!(
                    "{}: connection rejected, session creation already in progress",
                    charge_point_id
                );
                return Err(GatewayError::RaceRejection(charge_point_id.to_string()));
            }
            sessions.creating.insert(charge_point_id.to_string());
            sessions.live.remove(charge_point_id)
        };

        if let Some(old) = &previous {
            info!(
                "{}: new connection supersedes session {}",
                charge_point_id,
                old.session_id()
            );
            old.terminate();
        }

        Ok(Admission {
            registry: self.clone(),
            charge_point_id: charge_point_id.to_string(),
            displaced: previous,
            installed: false,
        })
    }

    pub fn lookup(&self, charge_point_id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.lock().live.get(charge_point_id).cloned()
    }

    /// Remove `handle` if it is still the live session. A stale handle is a
    /// no-op and returns false.
    pub fn remove(&self, charge_point_id: &str, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.inner.lock();
        match sessions.live.get(charge_point_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.live.remove(charge_point_id);
                true
            }
            _ => {
                debug!(
                    "{}: stale close for session {} ignored",
                    charge_point_id,
                    handle.session_id()
                );
                false
            }
        }
    }

    /// State records of every live session
    pub fn snapshot(&self) -> Vec<StateRecord> {
        let handles: Vec<_> = self.inner.lock().live.values().cloned().collect();
        handles.iter().map(|h| h.state()).collect()
    }

    /// Ask every live session to end; they deregister as they finish
    pub fn terminate_all(&self) -> usize {
        let handles: Vec<_> = self.inner.lock().live.values().cloned().collect();
        for handle in &handles {
            handle.terminate();
        }
        handles.len()
    }

    /// Refuse further admissions and terminate every live session
    pub fn close(&self) -> usize {
        self.inner.lock().closed = true;
        self.terminate_all()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support;

    #[tokio::test]
    async fn test_guard_rejects_concurrent_admission() {
        let registry = SessionRegistry::new();

        let first = registry.admit("CP1").unwrap();
        assert!(matches!(
            registry.admit("CP1"),
            Err(GatewayError::RaceRejection(id)) if id == "CP1"
        ));
        // Other ids are unaffected
        drop(registry.admit("CP2").unwrap());

        let (handle, _rx, _shutdown) = test_support::handle("CP1");
        first.install(handle.clone());
        assert!(Arc::ptr_eq(&registry.lookup("CP1").unwrap(), &handle));

        // Guard cleared after install
        let second = registry.admit("CP1").unwrap();
        assert!(second.superseded());
        drop(second);

        // Abandoned admission also clears the guard
        assert!(registry.admit("CP1").is_ok());
    }

    #[tokio::test]
    async fn test_takeover_terminates_old_session() {
        let registry = SessionRegistry::new();

        let (old, _old_rx, mut old_shutdown) = test_support::handle("CP1");
        registry.admit("CP1").unwrap().install(old.clone());

        let admission = registry.admit("CP1").unwrap();
        old_shutdown.changed().await.unwrap();
        assert!(!old.is_open());
        assert!(registry.lookup("CP1").is_none());

        let (new, _new_rx, _new_shutdown) = test_support::handle("CP1");
        admission.install(new.clone());
        assert_eq!(registry.len(), 1);

        // Old session's teardown must not evict the new one
        assert!(!registry.remove("CP1", &old));
        assert!(Arc::ptr_eq(&registry.lookup("CP1").unwrap(), &new));

        assert!(registry.remove("CP1", &new));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_and_terminate_all() {
        let registry = SessionRegistry::new();
        for id in ["CP1", "CP2"] {
            let (handle, _rx, _shutdown) = test_support::handle(id);
            registry.admit(id).unwrap().install(handle);
        }

        let mut ids: Vec<_> = registry.snapshot().into_iter().map(|s| s.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["CP1", "CP2"]);

        assert_eq!(registry.terminate_all(), 2);
        assert!(registry.lookup("CP1").map(|h| !h.is_open()).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_abandoned_takeover_hands_back_displaced_session() {
        let registry = SessionRegistry::new();
        let (old, _old_rx, _old_shutdown) = test_support::handle("CP1");
        registry.admit("CP1").unwrap().install(old.clone());

        let admission = registry.admit("CP1").unwrap();
        let displaced = admission.displaced().cloned().unwrap();
        assert!(Arc::ptr_eq(&displaced, &old));
        assert!(!displaced.is_open());
        drop(admission);

        // The old session's own teardown is a no-op
        assert!(!registry.remove("CP1", &old));
        assert!(registry.is_empty());
        assert!(registry.admit("CP1").unwrap().displaced().is_none());
    }

    #[tokio::test]
    async fn test_close_refuses_admission_and_stops_late_installs() {
        let registry = SessionRegistry::new();
        let in_flight = registry.admit("CP1").unwrap();

        assert_eq!(registry.close(), 0);
        assert!(registry.is_closed());
        assert!(matches!(registry.admit("CP2"), Err(GatewayError::ShuttingDown)));

        let (handle, _rx, mut shutdown) = test_support::handle("CP1");
        in_flight.install(handle.clone());
        shutdown.changed().await.unwrap();
        assert!(*shutdown.borrow());
        assert!(!handle.is_open());
    }
}
