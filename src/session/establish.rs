//! Upstream establishment - connect, authenticate, spawn the transport tasks

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Session, SessionRegistry};
use crate::config::MuxTimings;
use crate::credentials::CredentialSource;
use crate::protocol::CloseReason;

/// Outbound frame buffer toward the upstream socket
const UPSTREAM_BUFFER: usize = 64;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why an establishment attempt was rejected.
///
/// Cloneable so the same failure reaches every caller waiting on the same
/// in-flight attempt. None of these are retried automatically; retry policy
/// belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EstablishError {
    /// The credential source could not issue a token
    #[error("credential request failed: {0}")]
    Credentials(String),

    /// The outbound WebSocket connect failed
    #[error("upstream connect failed: {0}")]
    Connect(String),

    /// The upstream rejected the authentication handshake
    #[error("upstream rejected authentication: {0}")]
    AuthFailed(String),

    /// No auth acknowledgment arrived within the bounded window
    #[error("no auth acknowledgment within {0:?}")]
    AuthTimeout(Duration),

    /// The attempt was torn down before it resolved
    #[error("establishment canceled")]
    Canceled,
}

/// Establish a new upstream session: fetch credentials, open the socket,
/// complete the auth handshake within the configured window.
///
/// On success the returned session is `Authenticated` with its refresh
/// timer armed. On failure the half-open transport is torn down and nothing
/// is left behind for this server id.
pub(crate) async fn establish(
    server_id: &str,
    timings: MuxTimings,
    creds: Arc<dyn CredentialSource>,
    registry: Weak<SessionRegistry>,
) -> Result<Arc<Session>, EstablishError> {
    tracing::debug!("establishing upstream session for '{}'", server_id);

    let issued = creds
        .credentials(server_id)
        .await
        .map_err(|e| EstablishError::Credentials(e.to_string()))?;

    let (socket, _response) = connect_async(issued.socket_url.as_str())
        .await
        .map_err(|e| EstablishError::Connect(e.to_string()))?;

    let session = Session::new(server_id.to_string(), timings, creds, registry);
    session.install_transport(socket).await;

    let handshake = session.register_auth_waiter().await;
    session.store_token(issued.token, Utc::now()).await;

    if let Err(e) = session.authenticate().await {
        session.teardown(CloseReason::UpstreamLost).await;
        return Err(EstablishError::Connect(e.to_string()));
    }

    match timeout(timings.establish_timeout, handshake).await {
        Ok(Ok(Ok(()))) => {
            tracing::info!("upstream session for '{}' authenticated", server_id);
            session.arm_refresh_timer().await;
            Ok(session)
        }
        Ok(Ok(Err(e))) => {
            session.teardown(CloseReason::UpstreamLost).await;
            Err(e)
        }
        Ok(Err(_recv)) => {
            // Waiter dropped without resolving: a teardown beat us to it.
            Err(EstablishError::Canceled)
        }
        Err(_elapsed) => {
            tracing::warn!(
                "auth handshake for '{}' timed out after {:?}",
                server_id,
                timings.establish_timeout
            );
            session.teardown(CloseReason::UpstreamLost).await;
            Err(EstablishError::AuthTimeout(timings.establish_timeout))
        }
    }
}

impl Session {
    /// Split the socket and spawn the generation-tagged reader and writer
    /// tasks, replacing any previous transport.
    pub(crate) async fn install_transport(self: &Arc<Self>, socket: WsStream) {
        let generation = self.generation.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let (sink, stream) = socket.split();

        let (tx, rx) = mpsc::channel::<Message>(UPSTREAM_BUFFER);
        let writer = tokio::spawn(upstream_writer(sink, rx));
        let reader = tokio::spawn(upstream_reader(Arc::downgrade(self), stream, generation));

        if let Some(old) = self.reader_task.lock().await.replace(reader) {
            old.abort();
        }
        if let Some(old) = self.writer_task.lock().await.replace(writer) {
            old.abort();
        }
        *self.upstream_tx.write().await = Some(tx);
    }

    /// The upstream read half ended or errored for the current transport.
    pub(crate) async fn on_transport_lost(self: &Arc<Self>) {
        // During the handshake this fails the establishment; the establish
        // caller owns the teardown in that path.
        if let Some(waiter) = self.auth_waiter.lock().await.take() {
            let _ = waiter.send(Err(EstablishError::Connect(
                "upstream closed during authentication".to_string(),
            )));
            return;
        }

        tracing::warn!("upstream transport lost for '{}'", self.server_id);

        // Teardown aborts the reader task; run it from a fresh task since
        // this is called on the reader itself.
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.teardown(CloseReason::UpstreamLost).await;
        });
    }
}

/// Owns the upstream write half: drains queued frames into the sink and
/// closes it when the feed channel is dropped.
async fn upstream_writer(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!("upstream write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

/// Owns the upstream read half: dispatches frames into the session until
/// the stream ends, the session goes away, or the transport is swapped out.
async fn upstream_reader(session: Weak<Session>, mut stream: SplitStream<WsStream>, generation: u64) {
    while let Some(next) = stream.next().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.transport_generation() != generation {
            // Swapped out; nothing from this transport may be delivered.
            return;
        }

        match next {
            Ok(Message::Text(text)) => session.on_upstream_text(text).await,
            Ok(Message::Binary(data)) => session.on_upstream_binary(data).await,
            Ok(Message::Ping(payload)) => {
                session.send_raw(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => {
                tracing::debug!("upstream sent close for '{}'", session.server_id());
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("upstream read error for '{}': {}", session.server_id(), e);
                break;
            }
        }
    }

    if let Some(session) = session.upgrade() {
        if session.transport_generation() == generation {
            session.on_transport_lost().await;
        }
    }
}
