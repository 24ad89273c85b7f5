//! Shared test fixtures: a mock upstream console endpoint and credential stubs
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use switchboard::{ClientChannel, ClientFrame, CredentialSource, Credentials, MuxTimings};

/// How the mock upstream answers an auth request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthBehavior {
    /// Acknowledge with `auth success`
    Ack,
    /// Reject with `auth error`
    Reject,
    /// Never answer
    Silent,
}

enum UpstreamCommand {
    SendText(String),
    Close,
}

/// In-process WebSocket server speaking the upstream console vocabulary.
///
/// Records every auth token and payload frame it receives and lets a test
/// push frames to (or close) the most recent connection.
pub struct MockUpstream {
    pub url: String,
    connects: Arc<AtomicUsize>,
    auth_tokens: Arc<Mutex<Vec<String>>>,
    inbound: Arc<Mutex<Vec<String>>>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<UpstreamCommand>>>>,
}

impl MockUpstream {
    pub async fn spawn(behavior: AuthBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock upstream");
        let addr = listener.local_addr().expect("mock upstream addr");

        let connects = Arc::new(AtomicUsize::new(0));
        let auth_tokens = Arc::new(Mutex::new(Vec::new()));
        let inbound = Arc::new(Mutex::new(Vec::new()));
        let current = Arc::new(Mutex::new(None));

        {
            let connects = Arc::clone(&connects);
            let auth_tokens = Arc::clone(&auth_tokens);
            let inbound = Arc::clone(&inbound);
            let current = Arc::clone(&current);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    connects.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(handle_connection(
                        stream,
                        behavior,
                        Arc::clone(&auth_tokens),
                        Arc::clone(&inbound),
                        Arc::clone(&current),
                    ));
                }
            });
        }

        Self {
            url: format!("ws://{}", addr),
            connects,
            auth_tokens,
            inbound,
            current,
        }
    }

    /// Number of accepted connections so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Tokens received in auth requests, in arrival order
    pub async fn auth_tokens(&self) -> Vec<String> {
        self.auth_tokens.lock().await.clone()
    }

    /// Non-auth text frames received from the mux, in arrival order
    pub async fn inbound(&self) -> Vec<String> {
        self.inbound.lock().await.clone()
    }

    /// Push a text frame through the most recent connection
    pub async fn send_text(&self, text: impl Into<String>) {
        if let Some(tx) = self.current.lock().await.as_ref() {
            let _ = tx.send(UpstreamCommand::SendText(text.into()));
        }
    }

    /// Close the most recent connection from the upstream side
    pub async fn close_current(&self) {
        if let Some(tx) = self.current.lock().await.as_ref() {
            let _ = tx.send(UpstreamCommand::Close);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    behavior: AuthBehavior,
    auth_tokens: Arc<Mutex<Vec<String>>>,
    inbound: Arc<Mutex<Vec<String>>>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<UpstreamCommand>>>>,
) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    // Publish a clone for the test-driver helpers but keep our own sender
    // alive for this connection's lifetime. Otherwise a later connection
    // overwriting `current` would drop the only sender, making `rx.recv()`
    // yield `None` and spuriously close this still-open connection.
    *current.lock().await = Some(tx.clone());
    let _keepalive = tx;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(UpstreamCommand::SendText(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(UpstreamCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let parsed: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(value) => value,
                        Err(_) => {
                            inbound.lock().await.push(text);
                            continue;
                        }
                    };
                    if parsed["event"] == "auth" {
                        let token = parsed["args"][0].as_str().unwrap_or_default().to_string();
                        auth_tokens.lock().await.push(token);
                        let reply = match behavior {
                            AuthBehavior::Ack => Some(r#"{"event":"auth success"}"#),
                            AuthBehavior::Reject => {
                                Some(r#"{"event":"auth error","args":["invalid token"]}"#)
                            }
                            AuthBehavior::Silent => None,
                        };
                        if let Some(reply) = reply {
                            if sink.send(Message::Text(reply.to_string())).await.is_err() {
                                break;
                            }
                        }
                    } else {
                        inbound.lock().await.push(text);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

/// Issues sequentially numbered tokens pointing at a fixed upstream URL
pub struct CountingCredentials {
    url: String,
    calls: Arc<AtomicUsize>,
}

impl CountingCredentials {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for CountingCredentials {
    async fn credentials(&self, _server_id: &str) -> Result<Credentials> {
        let issued = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credentials {
            token: format!("token-{}", issued),
            socket_url: self.url.clone(),
        })
    }
}

/// Always fails, counting attempts
pub struct FailingCredentials {
    calls: Arc<AtomicUsize>,
}

impl FailingCredentials {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for FailingCredentials {
    async fn credentials(&self, _server_id: &str) -> Result<Credentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("credential backend unavailable")
    }
}

/// Opt-in log output for debugging test runs (RUST_LOG=switchboard=debug)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Timings with production-like windows but a short establishment bound
pub fn test_timings() -> MuxTimings {
    MuxTimings {
        establish_timeout: Duration::from_secs(2),
        token_validity: Duration::from_secs(600),
        refresh_buffer: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(300),
    }
}

/// Build a client channel plus the receiver a dashboard handler would drain
pub fn client_pair() -> (ClientChannel, mpsc::Receiver<ClientFrame>) {
    let (tx, rx) = mpsc::channel(64);
    (ClientChannel::new(tx), rx)
}
