//! Session state - auth lifecycle, attached clients, timer slots

mod establish;
mod token;

pub use establish::EstablishError;
pub(crate) use establish::establish as establish_session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::MuxTimings;
use crate::credentials::CredentialSource;
use crate::protocol::{self, ClientFrame, CloseReason};

/// The registry map shared between the mux and its sessions.
///
/// Sessions hold a `Weak` reference so teardown can evict its own entry
/// without keeping the mux alive.
pub(crate) type SessionRegistry = RwLock<HashMap<String, Arc<Session>>>;

/// Authentication lifecycle of an upstream session.
///
/// Monotonic except for `Authenticated -> Authenticating` during a token
/// refresh, which repeats only the control-plane handshake; payload fan-out
/// keeps flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// Outbound connect issued, transport not yet confirmed
    Connecting,
    /// Auth request sent, awaiting the upstream acknowledgment
    Authenticating,
    /// Steady state, payload messages flow both ways
    Authenticated,
    /// Teardown in progress
    Closing,
    /// Terminal
    Closed,
}

impl AuthState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthState::Closing | AuthState::Closed)
    }
}

/// Handle to one attached dashboard client.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    /// Unique client identifier
    id: Uuid,

    /// Channel to deliver frames to this client
    sender: mpsc::Sender<ClientFrame>,
}

impl ClientChannel {
    /// Create a new client channel handle
    pub fn new(sender: mpsc::Sender<ClientFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    /// Get client ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver a frame without blocking the fan-out loop.
    ///
    /// A closed channel is skipped; a full one drops this frame for this
    /// client only.
    pub(crate) fn send(&self, frame: ClientFrame) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("client {} channel full, dropping frame", self.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Current credential and its validity window. Replaced wholesale on refresh.
#[derive(Debug, Clone)]
pub(crate) struct TokenWindow {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One upstream WebSocket bound to one server identifier, shared by all
/// locally attached clients.
///
/// # Locking
///
/// No method holds two of the inner locks at once; each is taken and
/// released before the next is touched, so there is no ordering hazard.
/// The registry map (reached through the `Weak` handle) is only locked
/// from teardown, after the session state is already terminal.
pub struct Session {
    /// Registry key, immutable for the session's lifetime
    server_id: String,

    /// Resolved timing knobs
    timings: MuxTimings,

    /// Issues fresh tokens for establishment and refresh
    creds: Arc<dyn CredentialSource>,

    /// Auth lifecycle state
    state: RwLock<AuthState>,

    /// Whether the session ever completed the initial handshake
    ever_authenticated: AtomicBool,

    /// Current token and validity window
    token: RwLock<Option<TokenWindow>>,

    /// Attached client channels by id
    clients: RwLock<HashMap<Uuid, ClientChannel>>,

    /// Sender feeding the writer task that owns the upstream sink
    upstream_tx: RwLock<Option<mpsc::Sender<Message>>>,

    /// Bumped on every transport install and on teardown; reader tasks from
    /// older generations go quiet before delivering anything further
    generation: AtomicU64,

    /// Resolved exactly once by the establishment handshake outcome
    auth_waiter: Mutex<Option<oneshot::Sender<Result<(), EstablishError>>>>,

    /// Guards against a proactive refresh and an upstream-driven one
    /// running concurrently
    refresh_in_flight: AtomicBool,

    /// Pending proactive refresh timer, at most one
    refresh_timer: Mutex<Option<JoinHandle<()>>>,

    /// Pending idle-reap timer, at most one
    idle_timer: Mutex<Option<JoinHandle<()>>>,

    /// Task draining the upstream read half
    reader_task: Mutex<Option<JoinHandle<()>>>,

    /// Task owning the upstream write half
    writer_task: Mutex<Option<JoinHandle<()>>>,

    /// Registry this session evicts itself from on teardown
    registry: Weak<SessionRegistry>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        server_id: String,
        timings: MuxTimings,
        creds: Arc<dyn CredentialSource>,
        registry: Weak<SessionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_id,
            timings,
            creds,
            state: RwLock::new(AuthState::Connecting),
            ever_authenticated: AtomicBool::new(false),
            token: RwLock::new(None),
            clients: RwLock::new(HashMap::new()),
            upstream_tx: RwLock::new(None),
            generation: AtomicU64::new(0),
            auth_waiter: Mutex::new(None),
            refresh_in_flight: AtomicBool::new(false),
            refresh_timer: Mutex::new(None),
            idle_timer: Mutex::new(None),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
            registry,
        })
    }

    /// Get the server identifier this session is bound to
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Get the current auth state
    pub async fn auth_state(&self) -> AuthState {
        *self.state.read().await
    }

    /// Whether the session can still serve clients
    pub async fn is_usable(&self) -> bool {
        !self.auth_state().await.is_terminal()
    }

    /// Whether an upstream transport is currently installed and writable
    pub async fn transport_open(&self) -> bool {
        match self.upstream_tx.read().await.as_ref() {
            Some(tx) => !tx.is_closed(),
            None => false,
        }
    }

    /// Number of currently attached clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Issuance time of the current token, if one is held
    pub async fn token_issued_at(&self) -> Option<DateTime<Utc>> {
        self.token.read().await.as_ref().map(|t| t.issued_at)
    }

    /// Expiry of the current token, if one is held
    pub async fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.token.read().await.as_ref().map(|t| t.expires_at)
    }

    pub(crate) async fn set_state(&self, state: AuthState) {
        *self.state.write().await = state;
    }

    pub(crate) fn transport_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Attach a client channel.
    ///
    /// Cancels any pending idle timer. A client attaching to a session that
    /// already completed its handshake is told immediately that the console
    /// is live. Returns false if the session is already going away.
    pub async fn attach(self: &Arc<Self>, client: ClientChannel) -> bool {
        if self.auth_state().await.is_terminal() {
            return false;
        }

        let client_id = client.id();
        self.clients.write().await.insert(client_id, client.clone());
        self.clear_idle_timer().await;

        // Lost a race against a concurrent teardown: the drain already ran,
        // so nobody would ever close this channel. Undo the attach.
        if self.auth_state().await.is_terminal() {
            self.clients.write().await.remove(&client_id);
            return false;
        }

        if self.ever_authenticated.load(Ordering::SeqCst) {
            client.send(ClientFrame::Ready);
        }

        tracing::debug!("client {} attached to '{}'", client_id, self.server_id);
        true
    }

    /// Detach a client channel by id.
    ///
    /// Arms the idle timer when the last client leaves. Returns whether the
    /// client was attached.
    pub async fn detach(self: &Arc<Self>, client_id: Uuid) -> bool {
        let (removed, now_empty) = {
            let mut clients = self.clients.write().await;
            let removed = clients.remove(&client_id).is_some();
            (removed, clients.is_empty())
        };

        if removed {
            tracing::debug!("client {} detached from '{}'", client_id, self.server_id);
            if now_empty && !self.auth_state().await.is_terminal() {
                self.arm_idle_timer().await;
            }
        }

        removed
    }

    /// Mirror a frame to every attached client in upstream arrival order
    pub(crate) async fn fan_out(&self, frame: ClientFrame) {
        let clients = self.clients.read().await;
        for client in clients.values() {
            client.send(frame.clone());
        }
    }

    /// Queue a raw frame for the upstream writer task
    pub(crate) async fn send_raw(&self, message: Message) -> bool {
        let tx = self.upstream_tx.read().await.clone();
        match tx {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        }
    }

    /// Serialize and queue a control event for the upstream
    pub(crate) async fn send_control(
        &self,
        event: &protocol::ControlEvent,
    ) -> anyhow::Result<()> {
        let text = event.to_text()?;
        if !self.send_raw(Message::Text(text)).await {
            anyhow::bail!("upstream transport for '{}' is closed", self.server_id);
        }
        Ok(())
    }

    /// Forward a client payload to the upstream if the session is live.
    ///
    /// Remains possible during a refresh handshake; the transport never
    /// dropped.
    pub(crate) async fn send_payload(&self, text: &str) -> bool {
        if !self.payload_live().await {
            return false;
        }
        self.send_raw(Message::Text(text.to_string())).await
    }

    /// Whether payload may flow: the initial handshake completed and the
    /// session is not going away. Stays true through a refresh handshake.
    async fn payload_live(&self) -> bool {
        self.ever_authenticated.load(Ordering::SeqCst) && !self.auth_state().await.is_terminal()
    }

    /// Dispatch one upstream text frame: control events are intercepted,
    /// payload is mirrored to clients once the session is authenticated.
    pub(crate) async fn on_upstream_text(self: &Arc<Self>, text: String) {
        match protocol::parse_control(&text) {
            Some(event) => self.on_control(event).await,
            None => {
                if self.payload_live().await {
                    self.fan_out(ClientFrame::Payload(text)).await;
                } else {
                    tracing::debug!(
                        "dropping upstream payload for '{}' received before auth completed",
                        self.server_id
                    );
                }
            }
        }
    }

    /// Dispatch one upstream binary frame (always opaque payload)
    pub(crate) async fn on_upstream_binary(self: &Arc<Self>, data: Vec<u8>) {
        if self.payload_live().await {
            self.fan_out(ClientFrame::Binary(data)).await;
        }
    }

    /// Record a freshly issued token and its validity window
    pub(crate) async fn store_token(&self, token: String, issued_at: DateTime<Utc>) {
        let validity = chrono::Duration::from_std(self.timings.token_validity)
            .unwrap_or_else(|_| chrono::Duration::zero());
        *self.token.write().await = Some(TokenWindow {
            token,
            issued_at,
            expires_at: issued_at + validity,
        });
    }

    /// Register the oneshot resolved by the handshake outcome
    pub(crate) async fn register_auth_waiter(
        &self,
    ) -> oneshot::Receiver<Result<(), EstablishError>> {
        let (tx, rx) = oneshot::channel();
        *self.auth_waiter.lock().await = Some(tx);
        rx
    }

    /// Arm the idle-reap timer, replacing any pending one.
    ///
    /// The timer re-checks the client set at fire time; an attach that won
    /// the race keeps the session alive.
    pub(crate) async fn arm_idle_timer(self: &Arc<Self>) {
        let delay = self.timings.idle_timeout;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            // This task is done either way; drop our own slot entry without
            // an abort so a later arm never cancels a live teardown.
            session.idle_timer.lock().await.take();
            if session.clients.read().await.is_empty()
                && !session.auth_state().await.is_terminal()
            {
                tracing::info!(
                    "session '{}' idle with no attached clients, closing",
                    session.server_id
                );
                session.teardown(CloseReason::Idle).await;
            }
        });

        let mut slot = self.idle_timer.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = Some(handle);
    }

    pub(crate) async fn clear_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().await.take() {
            timer.abort();
        }
    }

    /// Tear the session down: cancel timers, stop the transport tasks,
    /// close every attached client with `reason`, and evict the registry
    /// entry. Idempotent.
    pub(crate) async fn teardown(self: &Arc<Self>, reason: CloseReason) {
        {
            let mut state = self.state.write().await;
            if state.is_terminal() {
                return;
            }
            *state = AuthState::Closing;
        }

        tracing::info!("closing session '{}' ({:?})", self.server_id, reason);

        // Invalidate the current transport generation so an in-flight reader
        // stops delivering even before its abort lands.
        self.generation.fetch_add(1, Ordering::SeqCst);

        self.clear_refresh_timer().await;
        self.clear_idle_timer().await;

        if let Some(waiter) = self.auth_waiter.lock().await.take() {
            let _ = waiter.send(Err(EstablishError::Canceled));
        }

        // Best-effort close frame; dropping the sender lets the writer task
        // drain it and exit on its own.
        let upstream_tx = self.upstream_tx.write().await.take();
        if let Some(tx) = upstream_tx {
            let _ = tx.try_send(Message::Close(None));
        }
        if let Some(reader) = self.reader_task.lock().await.take() {
            reader.abort();
        }
        let _ = self.writer_task.lock().await.take();

        let clients: Vec<ClientChannel> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.send(ClientFrame::Closed { reason });
        }

        self.set_state(AuthState::Closed).await;

        if let Some(registry) = self.registry.upgrade() {
            let mut map = registry.write().await;
            let ours = map
                .get(&self.server_id)
                .map_or(false, |current| Arc::ptr_eq(current, self));
            if ours {
                map.remove(&self.server_id);
            }
        }
    }
}
