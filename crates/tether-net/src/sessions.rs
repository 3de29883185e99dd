//! Table of postponed sessions.
//!
//! When a connection drops or idles out, its endpoint is postponed here under
//! its session id.  A reconnecting peer presents the id on a fresh connection
//! and [`SessionTable::resume`] moves the fresh socket into the old endpoint,
//! so per-session state survives the reconnect.
//!
//! Entries are swept once their postpone window passes.  A bounded memory of
//! swept ids lets late resume attempts be told apart (`SessionExpired`) from
//! ids that never existed (`SessionNotFound`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::NetError;

const EXPIRED_MEMORY: usize = 1024;

#[derive(Default)]
struct Inner {
    postponed: HashMap<Uuid, Arc<Endpoint>>,
    expired: VecDeque<Uuid>,
}

impl Inner {
    fn remember_expired(&mut self, session_id: Uuid) {
        if self.expired.len() == EXPIRED_MEMORY {
            self.expired.pop_front();
        }
        self.expired.push_back(session_id);
    }
}

#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<Inner>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Postpones `endpoint` and records it under its session id.
    pub fn postpone(&self, endpoint: &Arc<Endpoint>) -> Result<Uuid, NetError> {
        let session_id = endpoint.postpone()?;
        self.inner.lock().postponed.insert(session_id, Arc::clone(endpoint));
        info!("session {session_id} postponed (endpoint {})", endpoint.id());
        Ok(session_id)
    }

    /// Moves the socket of `fresh` into the endpoint postponed as `session_id`
    /// and returns that endpoint, now active again.
    ///
    /// # Errors
    ///
    /// - [`NetError::SessionExpired`] when the session outlived its postpone
    ///   window.  `fresh` is left untouched.
    /// - [`NetError::SessionNotFound`] for an unknown id.  `fresh` is left
    ///   untouched.
    pub fn resume(&self, session_id: Uuid, fresh: &Endpoint) -> Result<Arc<Endpoint>, NetError> {
        let endpoint = {
            let mut inner = self.inner.lock();
            match inner.postponed.remove(&session_id) {
                Some(endpoint) if endpoint.is_postpone_expired() => {
                    inner.remember_expired(session_id);
                    drop(inner);
                    endpoint.force_close();
                    return Err(NetError::SessionExpired);
                }
                Some(endpoint) => endpoint,
                None if inner.expired.contains(&session_id) => return Err(NetError::SessionExpired),
                None => return Err(NetError::SessionNotFound),
            }
        };

        let detached = match fresh.detach_socket() {
            Ok(detached) => detached,
            Err(e) => {
                self.inner.lock().postponed.insert(session_id, endpoint);
                return Err(e);
            }
        };
        if let Err(e) = endpoint.resume(detached) {
            self.inner.lock().remember_expired(session_id);
            return Err(e);
        }
        info!("session {session_id} resumed (endpoint {})", endpoint.id());
        Ok(endpoint)
    }

    /// Closes and forgets every session whose postpone window has passed.
    /// Returns how many were swept.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<(Uuid, Arc<Endpoint>)> = {
            let mut inner = self.inner.lock();
            let ids: Vec<Uuid> = inner
                .postponed
                .iter()
                .filter(|(_, endpoint)| endpoint.is_postpone_expired())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let endpoint = inner.postponed.remove(&id)?;
                    inner.remember_expired(id);
                    Some((id, endpoint))
                })
                .collect()
        };
        for (id, endpoint) in &expired {
            endpoint.force_close();
            debug!("session {id} expired");
        }
        expired.len()
    }

    /// Postpones every endpoint in `endpoints` that has been idle past its
    /// idle timeout.  Returns the session ids postponed.
    pub fn reap_idle(&self, endpoints: &[Arc<Endpoint>]) -> Vec<Uuid> {
        endpoints
            .iter()
            .filter(|endpoint| endpoint.is_idle_expired())
            .filter_map(|endpoint| self.postpone(endpoint).ok())
            .collect()
    }

    pub fn contains(&self, session_id: &Uuid) -> bool {
        self.inner.lock().postponed.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().postponed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointConfig, EndpointState};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn pair(config: EndpointConfig) -> (Arc<Endpoint>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Endpoint::new(server, config), client)
    }

    fn short_window() -> EndpointConfig {
        EndpointConfig {
            postpone_timeout: Duration::from_millis(20),
            ..EndpointConfig::default()
        }
    }

    #[test]
    fn test_resume_within_window() {
        let table = SessionTable::new();
        let (endpoint, _old) = pair(EndpointConfig::default());
        endpoint.set_session_state(Arc::new(7u32));
        let id = table.postpone(&endpoint).unwrap();
        assert!(table.contains(&id));

        let (fresh, mut client) = pair(EndpointConfig::default());
        let resumed = table.resume(id, &fresh).unwrap();

        assert!(Arc::ptr_eq(&resumed, &endpoint));
        assert_eq!(resumed.state(), EndpointState::Active);
        assert!(table.is_empty());
        let state = resumed.session_state().unwrap();
        assert_eq!(state.downcast_ref::<u32>(), Some(&7));

        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        resumed.read_exactly(&mut buf, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let table = SessionTable::new();
        let (fresh, _client) = pair(EndpointConfig::default());

        let err = table.resume(Uuid::new_v4(), &fresh).unwrap_err();

        assert!(matches!(err, NetError::SessionNotFound));
        assert_eq!(fresh.state(), EndpointState::Active);
    }

    #[test]
    fn test_late_resume_is_expired_and_fresh_survives() {
        let table = SessionTable::new();
        let (endpoint, _old) = pair(short_window());
        let id = table.postpone(&endpoint).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let (fresh, _client) = pair(EndpointConfig::default());
        let err = table.resume(id, &fresh).unwrap_err();

        assert!(matches!(err, NetError::SessionExpired));
        assert!(endpoint.is_closed());
        assert_eq!(fresh.state(), EndpointState::Active);
        assert!(matches!(table.resume(id, &fresh), Err(NetError::SessionExpired)));
    }

    #[test]
    fn test_sweep_closes_expired_sessions() {
        let table = SessionTable::new();
        let (stale, _a) = pair(short_window());
        let (recent, _b) = pair(EndpointConfig::default());
        let stale_id = table.postpone(&stale).unwrap();
        table.postpone(&recent).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(table.sweep_expired(), 1);

        assert!(stale.is_closed());
        assert_eq!(table.len(), 1);
        let (fresh, _c) = pair(EndpointConfig::default());
        assert!(matches!(table.resume(stale_id, &fresh), Err(NetError::SessionExpired)));
    }

    #[test]
    fn test_reap_idle_postpones_only_idle_endpoints() {
        let table = SessionTable::new();
        let config = EndpointConfig {
            idle_timeout: Duration::from_millis(10),
            ..EndpointConfig::default()
        };
        let (idle, _a) = pair(config);
        let (busy, _b) = pair(config);
        assert!(busy.try_to_use());
        std::thread::sleep(Duration::from_millis(30));

        let reaped = table.reap_idle(&[Arc::clone(&idle), Arc::clone(&busy)]);

        assert_eq!(reaped, vec![idle.session_id()]);
        assert_eq!(idle.state(), EndpointState::Postponed);
        assert_eq!(busy.state(), EndpointState::Active);
    }
}
