//! Token lifecycle - proactive refresh and upstream-driven expiry handling

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;

use super::{AuthState, EstablishError, Session};
use crate::protocol::ControlEvent;

impl Session {
    /// Handle an intercepted control event. Never forwarded to clients.
    pub(crate) async fn on_control(self: &Arc<Self>, event: ControlEvent) {
        match event {
            ControlEvent::AuthSuccess => self.on_auth_success().await,
            ControlEvent::AuthError { message } => self.on_auth_error(message).await,
            ControlEvent::TokenExpiring | ControlEvent::TokenExpired => {
                tracing::debug!(
                    "upstream token notice for '{}', refreshing",
                    self.server_id
                );
                self.trigger_refresh().await;
            }
            ControlEvent::Auth { .. } => {
                tracing::warn!(
                    "unexpected auth request from upstream for '{}', dropping",
                    self.server_id
                );
            }
        }
    }

    async fn on_auth_success(self: &Arc<Self>) {
        self.refresh_in_flight.store(false, Ordering::SeqCst);
        self.ever_authenticated.store(true, Ordering::SeqCst);

        {
            let mut state = self.state.write().await;
            if !state.is_terminal() {
                *state = AuthState::Authenticated;
            }
        }

        // Present during establishment, absent for a refresh handshake.
        if let Some(waiter) = self.auth_waiter.lock().await.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn on_auth_error(self: &Arc<Self>, message: Option<String>) {
        let message = message.unwrap_or_else(|| "authentication rejected".to_string());

        // During establishment this fails the attempt outright; the
        // establish caller owns the teardown.
        if let Some(waiter) = self.auth_waiter.lock().await.take() {
            let _ = waiter.send(Err(EstablishError::AuthFailed(message)));
            return;
        }

        // Steady state: the current token went bad. Treat it like an expiry
        // notice and re-authenticate in place.
        tracing::warn!(
            "upstream auth error for '{}' ({}), refreshing token",
            self.server_id,
            message
        );
        self.refresh_in_flight.store(false, Ordering::SeqCst);
        self.trigger_refresh().await;
    }

    /// Run one refresh cycle unless one is already in flight.
    ///
    /// The in-flight flag clears when the upstream acknowledges (or rejects)
    /// the new token, or immediately if the attempt fails locally.
    //
    // Returns a boxed future with an explicit `Send` bound rather than an
    // `async fn`'s opaque type: the refresh path is mutually recursive
    // (trigger_refresh -> refresh_once -> arm_refresh_timer spawns
    // trigger_refresh), and a concrete return type is what lets the compiler
    // resolve the spawned task's `Send` bound without chasing that cycle.
    pub(crate) fn trigger_refresh<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if self.auth_state().await.is_terminal() {
                return;
            }
            if self.refresh_in_flight.swap(true, Ordering::SeqCst) {
                tracing::debug!("refresh already in flight for '{}'", self.server_id);
                return;
            }

            if let Err(e) = self.refresh_once().await {
                // Best effort: keep the current token and rely on upstream
                // expiry notices to trigger the next attempt.
                tracing::warn!("token refresh for '{}' failed: {}", self.server_id, e);
                self.refresh_in_flight.store(false, Ordering::SeqCst);
            }
        })
    }

    async fn refresh_once(self: &Arc<Self>) -> anyhow::Result<()> {
        let issued = self.creds.credentials(&self.server_id).await?;

        if !self.transport_open().await {
            anyhow::bail!("no open upstream transport");
        }

        // Re-enter the handshake without touching the socket; fan-out keeps
        // flowing while the upstream acknowledges the new token.
        self.store_token(issued.token, Utc::now()).await;
        self.authenticate().await?;

        self.arm_refresh_timer().await;
        Ok(())
    }

    /// Send the stored token upstream and enter the handshake state.
    ///
    /// Used both by establishment and by every refresh cycle; the stored
    /// token window is the single source of truth for what goes on the wire.
    pub(crate) async fn authenticate(self: &Arc<Self>) -> anyhow::Result<()> {
        let token = match self.token.read().await.as_ref() {
            Some(window) => window.token.clone(),
            None => anyhow::bail!("no token stored for '{}'", self.server_id),
        };

        {
            let mut state = self.state.write().await;
            if state.is_terminal() {
                anyhow::bail!("session '{}' is closed", self.server_id);
            }
            *state = AuthState::Authenticating;
        }

        self.send_control(&ControlEvent::Auth { token }).await
    }

    /// Arm the proactive refresh timer at `validity - buffer` from now,
    /// replacing any pending one.
    pub(crate) async fn arm_refresh_timer(self: &Arc<Self>) {
        let delay = self.timings.refresh_delay();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            // Drop our own slot entry without an abort: the re-arm inside a
            // successful refresh must never cancel the task running it.
            session.refresh_timer.lock().await.take();
            session.trigger_refresh().await;
        });

        let mut slot = self.refresh_timer.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = Some(handle);
    }

    pub(crate) async fn clear_refresh_timer(&self) {
        if let Some(timer) = self.refresh_timer.lock().await.take() {
            timer.abort();
        }
    }
}
