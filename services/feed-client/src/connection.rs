//! Connection lifecycle
//!
//! The supervisory loop connects, publishes the connection's lifetime as an
//! ordered stream of `ConnectionEvent`s (open, every inbound frame, then
//! closed or error), and after the connection ends waits a fixed interval and
//! connects again, forever. There is no retry cap; callers observe
//! connectivity only through the flags held here.
//!
//! State groups owned by this module:
//! - `Link`: phase (disconnected / connecting / open) and the writer half
//! - `AuthState`: authorized flag, permanent-failure flag, balance

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::metrics::FeedMetrics;
use crate::transport::{FrameSink, Transport};

/// Everything the router learns about the connection, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Message(String),
    Closed,
    Error(String),
}

/// Transport-level phase of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Open,
}

/// Client-visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    AuthPending,
    Authorized,
    AuthFailedPermanent,
}

/// Connection flags plus the writer half of the live connection.
pub struct Link {
    phase: watch::Sender<LinkPhase>,
    writer: tokio::sync::Mutex<Option<FrameSink>>,
}

impl Link {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(LinkPhase::Disconnected);
        Self {
            phase,
            writer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn phase(&self) -> LinkPhase {
        *self.phase.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.phase() == LinkPhase::Open
    }

    pub fn set_phase(&self, phase: LinkPhase) {
        self.phase.send_replace(phase);
    }

    /// Resolve once the phase is `Open`.
    pub async fn wait_open(&self) {
        let mut rx = self.phase.subscribe();
        // The sender lives as long as `self`, so this cannot fail while borrowed.
        let _ = rx.wait_for(|phase| *phase == LinkPhase::Open).await;
    }

    /// Resolve once the phase leaves `Open`.
    pub async fn wait_closed(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase != LinkPhase::Open).await;
    }

    pub(crate) fn writer(&self) -> &tokio::sync::Mutex<Option<FrameSink>> {
        &self.writer
    }

    async fn install_writer(&self, sink: FrameSink) {
        *self.writer.lock().await = Some(sink);
    }

    async fn clear_writer(&self) {
        self.writer.lock().await.take();
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct AuthInner {
    authorized: bool,
    failed_permanently: bool,
    balance: Option<f64>,
    currency: String,
}

/// Authorization outcome and account balance.
#[derive(Debug, Default)]
pub struct AuthState {
    inner: Mutex<AuthInner>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AuthInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_authorized(&self) -> bool {
        self.lock().authorized
    }

    pub fn failed_permanently(&self) -> bool {
        self.lock().failed_permanently
    }

    pub fn record_success(&self, balance: f64, currency: &str) {
        let mut inner = self.lock();
        inner.authorized = true;
        inner.balance = Some(balance);
        inner.currency = currency.to_string();
    }

    /// Start a new connection instance: an earlier permanent failure no
    /// longer applies to it.
    pub fn begin_connection(&self) {
        self.lock().failed_permanently = false;
    }

    pub fn record_permanent_failure(&self) {
        let mut inner = self.lock();
        inner.authorized = false;
        inner.failed_permanently = true;
    }

    pub fn balance(&self) -> Option<(f64, String)> {
        let inner = self.lock();
        inner.balance.map(|b| (b, inner.currency.clone()))
    }
}

/// Combine link phase and auth flags into the client-visible state.
pub fn derive_state(phase: LinkPhase, auth: &AuthState, has_credential: bool) -> ConnectionState {
    match phase {
        LinkPhase::Disconnected => ConnectionState::Disconnected,
        LinkPhase::Connecting => ConnectionState::Connecting,
        LinkPhase::Open if !has_credential => ConnectionState::Open,
        LinkPhase::Open => {
            if auth.failed_permanently() {
                ConnectionState::AuthFailedPermanent
            } else if auth.is_authorized() {
                ConnectionState::Authorized
            } else {
                ConnectionState::AuthPending
            }
        }
    }
}

/// Connect, pump inbound frames into `events`, and reconnect forever.
///
/// Returns only when the event receiver is gone.
pub(crate) async fn run_connection_loop(
    transport: Arc<dyn Transport>,
    link: Arc<Link>,
    metrics: Arc<FeedMetrics>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    reconnect_interval: Duration,
) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        link.set_phase(LinkPhase::Connecting);
        info!(attempt, "Connecting to venue");

        match transport.connect().await {
            Ok((sink, mut stream)) => {
                link.install_writer(sink).await;
                if events.send(ConnectionEvent::Open).is_err() {
                    return;
                }

                let mut ended_with_error = None;
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(text) => {
                            if events.send(ConnectionEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            ended_with_error = Some(e.to_string());
                            break;
                        }
                    }
                }

                link.clear_writer().await;
                let event = match ended_with_error {
                    Some(reason) => {
                        warn!(%reason, "Connection error");
                        ConnectionEvent::Error(reason)
                    }
                    None => {
                        info!("Connection closed by venue");
                        ConnectionEvent::Closed
                    }
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(attempt, error = %e, "Connect attempt failed");
            }
        }

        metrics.record_reconnect();
        tokio::time::sleep(reconnect_interval).await;
    }
}
