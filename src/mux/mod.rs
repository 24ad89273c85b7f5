//! Session registry and pending-establishment deduplication

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::config::{Config, MuxTimings};
use crate::credentials::CredentialSource;
use crate::protocol::{self, CloseReason, ControlEvent};
use crate::session::{
    establish_session, AuthState, ClientChannel, EstablishError, Session, SessionRegistry,
};

type Waiter = oneshot::Sender<Result<Arc<Session>, EstablishError>>;

/// Basic per-session info for the stats snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub server_id: String,
    pub client_count: usize,
    pub auth_state: AuthState,
    pub transport_open: bool,
    pub token_issued_at: Option<DateTime<Utc>>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Point-in-time snapshot of the whole mux. Introspection only.
#[derive(Debug, Clone, Serialize)]
pub struct MuxStats {
    pub session_count: usize,
    pub sessions: Vec<SessionStats>,
}

/// Owns the registry of live upstream sessions and deduplicates concurrent
/// establishment attempts per server identifier.
///
/// A constructed component: the surrounding process builds one, hands it to
/// whatever owns the client-facing endpoints, and calls [`shutdown`] on the
/// way out.
///
/// [`shutdown`]: SessionMux::shutdown
pub struct SessionMux {
    /// Resolved timing knobs applied to every session
    timings: MuxTimings,

    /// Issues `(token, socket_url)` pairs per server
    creds: Arc<dyn CredentialSource>,

    /// server id -> at most one live session
    registry: Arc<SessionRegistry>,

    /// server id -> waiters on the one in-flight establishment attempt.
    /// An id never appears here and in the registry at the same time.
    pending: Arc<Mutex<HashMap<String, Vec<Waiter>>>>,
}

impl SessionMux {
    /// Create a new mux with the given credential source and timings
    pub fn new(creds: Arc<dyn CredentialSource>, timings: MuxTimings) -> Self {
        Self {
            timings,
            creds,
            registry: Arc::new(SessionRegistry::default()),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a new mux from a loaded configuration
    pub fn with_config(creds: Arc<dyn CredentialSource>, config: &Config) -> Self {
        Self::new(creds, config.timings())
    }

    /// Get the session for `server_id`, establishing one if needed.
    ///
    /// A usable registered session returns immediately. If an establishment
    /// is already in flight, this call joins it; every concurrent caller
    /// resolves with the same session or the same error, and exactly one
    /// credential request and connect attempt is made.
    pub async fn acquire(&self, server_id: &str) -> Result<Arc<Session>, EstablishError> {
        if let Some(existing) = self.lookup(server_id).await {
            if existing.is_usable().await {
                return Ok(existing);
            }
        }

        let waiter = {
            let mut pending = self.pending.lock().await;

            // Re-check under the pending lock: an owner publishing between
            // the fast path and here must be observed, not raced.
            if let Some(existing) = self.lookup(server_id).await {
                if existing.is_usable().await {
                    return Ok(existing);
                }
            }

            let (tx, rx) = oneshot::channel();
            match pending.get_mut(server_id) {
                Some(waiters) => waiters.push(tx),
                None => {
                    pending.insert(server_id.to_string(), vec![tx]);
                    self.spawn_establishment(server_id.to_string());
                }
            }
            rx
        };

        match waiter.await {
            Ok(result) => result,
            Err(_) => Err(EstablishError::Canceled),
        }
    }

    /// Run one establishment attempt on a detached task.
    ///
    /// Detached so a caller dropping its `acquire` future can never strand
    /// the other waiters or leak the pending entry.
    fn spawn_establishment(&self, server_id: String) {
        let timings = self.timings;
        let creds = Arc::clone(&self.creds);
        let registry = Arc::clone(&self.registry);
        let pending = Arc::clone(&self.pending);

        tokio::spawn(async move {
            let result =
                establish_session(&server_id, timings, creds, Arc::downgrade(&registry)).await;

            // Publish and drain under the pending lock so the id moves from
            // "pending" to "registered" without a window where it is both.
            let waiters = {
                let mut pending = pending.lock().await;
                if let Ok(session) = &result {
                    registry
                        .write()
                        .await
                        .insert(server_id.clone(), Arc::clone(session));
                }
                pending.remove(&server_id).unwrap_or_default()
            };

            if let Err(e) = &result {
                tracing::warn!("establishment for '{}' failed: {}", server_id, e);
            }
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });
    }

    /// Attach a client channel to the session for `server_id`.
    ///
    /// Returns false if no usable session exists; callers are expected to
    /// `acquire` first.
    pub async fn attach_client(&self, server_id: &str, client: ClientChannel) -> bool {
        match self.lookup(server_id).await {
            Some(session) => session.attach(client).await,
            None => false,
        }
    }

    /// Detach a client channel from the session for `server_id`
    pub async fn detach_client(&self, server_id: &str, client_id: Uuid) -> bool {
        match self.lookup(server_id).await {
            Some(session) => session.detach(client_id).await,
            None => false,
        }
    }

    /// Forward a client message verbatim to the upstream transport.
    ///
    /// Returns whether the send was possible. The auth step is synthesized
    /// locally, so a client frame carrying an auth event is consumed here
    /// and never reaches the wire.
    pub async fn send_to_upstream(&self, server_id: &str, text: &str) -> bool {
        let Some(session) = self.lookup(server_id).await else {
            return false;
        };

        if matches!(
            protocol::parse_control(text),
            Some(ControlEvent::Auth { .. })
        ) {
            tracing::debug!("swallowing client auth frame for '{}'", server_id);
            return session.is_usable().await;
        }

        session.send_payload(text).await
    }

    /// Snapshot the registry for monitoring. No side effects.
    pub async fn stats(&self) -> MuxStats {
        let sessions: Vec<Arc<Session>> = self.registry.read().await.values().cloned().collect();

        let mut per_session = Vec::with_capacity(sessions.len());
        for session in sessions {
            per_session.push(SessionStats {
                server_id: session.server_id().to_string(),
                client_count: session.client_count().await,
                auth_state: session.auth_state().await,
                transport_open: session.transport_open().await,
                token_issued_at: session.token_issued_at().await,
                token_expires_at: session.token_expires_at().await,
            });
        }

        MuxStats {
            session_count: per_session.len(),
            sessions: per_session,
        }
    }

    /// Tear down the session for `server_id`, closing all of its clients.
    ///
    /// Returns whether a session existed.
    pub async fn close_session(&self, server_id: &str) -> bool {
        match self.lookup(server_id).await {
            Some(session) => {
                session.teardown(CloseReason::Requested).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every session. Called by the process entry point on exit.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.registry.read().await.values().cloned().collect();
        if !sessions.is_empty() {
            tracing::info!("shutting down {} upstream session(s)", sessions.len());
        }
        for session in sessions {
            session.teardown(CloseReason::Requested).await;
        }
    }

    async fn lookup(&self, server_id: &str) -> Option<Arc<Session>> {
        self.registry.read().await.get(server_id).cloned()
    }
}
