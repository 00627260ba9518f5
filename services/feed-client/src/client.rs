//! Client facade
//!
//! `FeedClient` owns the shared state groups and the three background tasks
//! (connection loop, router, sender). Public operations validate their
//! precondition locally, then either read state or push a request onto the
//! outbound queue; nothing here touches the socket directly.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use types::errors::FeedError;
use types::ids::{RequestId, RequestIdGenerator, Symbol};
use types::market::{CandleSeries, ContractSide, PriceUpdate};

use crate::candles::{self, CandleSlot};
use crate::config::ClientConfig;
use crate::connection::{
    derive_state, run_connection_loop, AuthState, ConnectionState, Link, LinkPhase,
};
use crate::metrics::FeedMetrics;
use crate::protocol::{CandleQuery, Outbound, ProposalParams, Request};
use crate::queue::OutboundQueue;
use crate::router::{run_router, Backoff, MessageRouter};
use crate::sender::run_sender_loop;
use crate::subscriptions::{ProposalSnapshot, QuoteSnapshot, SubscriptionState};
use crate::time_sync::{ServerTime, TimeSync};
use crate::transport::{Transport, WebSocketTransport};

/// State shared by the facade and the background tasks.
///
/// Lock order when more than one group is held:
/// link → auth → subscriptions → queue → time.
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) link: Arc<Link>,
    pub(crate) auth: AuthState,
    pub(crate) subscriptions: SubscriptionState,
    pub(crate) queue: OutboundQueue,
    pub(crate) time: TimeSync,
    pub(crate) candles: CandleSlot,
    pub(crate) backoff: Backoff,
    pub(crate) ids: RequestIdGenerator,
    pub(crate) metrics: Arc<FeedMetrics>,
    pub(crate) prices: broadcast::Sender<PriceUpdate>,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig) -> Self {
        let (prices, _) = broadcast::channel(config.price_channel_capacity.max(1));
        Self {
            config,
            link: Arc::new(Link::new()),
            auth: AuthState::new(),
            subscriptions: SubscriptionState::new(),
            queue: OutboundQueue::new(),
            time: TimeSync::new(),
            candles: CandleSlot::new(),
            backoff: Backoff::new(),
            ids: RequestIdGenerator::new(),
            metrics: Arc::new(FeedMetrics::new()),
            prices,
        }
    }
}

/// Streaming venue client.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct FeedClient {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedClient {
    /// Connect to `config.endpoint` over WebSocket.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(config: ClientConfig) -> Self {
        let transport = Arc::new(WebSocketTransport::new(config.endpoint.clone()));
        Self::with_transport(config, transport)
    }

    /// Run the client over an arbitrary transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(Shared::new(config));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let connection = tokio::spawn(run_connection_loop(
            transport,
            shared.link.clone(),
            shared.metrics.clone(),
            events_tx,
            shared.config.reconnect_interval,
        ));
        let router = tokio::spawn(run_router(MessageRouter::new(shared.clone()), events_rx));
        let sender = tokio::spawn(run_sender_loop(shared.clone()));

        info!(
            authenticated = shared.config.credential().is_some(),
            "Feed client started"
        );

        Self {
            shared,
            tasks: Mutex::new(vec![connection, router, sender]),
        }
    }

    // ── Connection state ────────────────────────────────────────────

    pub fn is_open(&self) -> bool {
        self.shared.link.is_open()
    }

    pub fn is_authorized(&self) -> bool {
        self.shared.auth.is_authorized()
    }

    /// True once the venue rejected the credential; never cleared.
    pub fn auth_failed_permanently(&self) -> bool {
        self.shared.auth.failed_permanently()
    }

    pub fn connection_state(&self) -> ConnectionState {
        derive_state(
            self.shared.link.phase(),
            &self.shared.auth,
            self.shared.config.credential().is_some(),
        )
    }

    /// Account balance and currency from the last successful authorization.
    pub fn balance(&self) -> Option<(f64, String)> {
        self.shared.auth.balance()
    }

    pub fn server_time(&self) -> ServerTime {
        self.shared.time.snapshot()
    }

    /// Resolve once the connection is open.
    pub async fn wait_open(&self) {
        self.shared.link.wait_open().await;
    }

    // ── Outbound queue ──────────────────────────────────────────────

    fn push(&self, request: &Request) -> Result<RequestId, FeedError> {
        let outbound = Outbound::new(self.shared.ids.next_id(), request)?;
        let id = outbound.id;
        self.shared.queue.push(outbound);
        Ok(id)
    }

    /// Queue `request` if the connection is open.
    pub fn enqueue_open(&self, request: &Request) -> Result<RequestId, FeedError> {
        if !self.is_open() {
            return Err(FeedError::NoOpenConnection);
        }
        self.push(request)
    }

    /// Queue `request` if the session is authorized.
    pub fn enqueue_authorized(&self, request: &Request) -> Result<RequestId, FeedError> {
        if !self.is_authorized() {
            return Err(FeedError::NoAuthorization);
        }
        self.push(request)
    }

    /// Ask the venue for its clock; the reply lands in `server_time()`.
    pub fn request_time(&self) -> Result<RequestId, FeedError> {
        self.enqueue_open(&Request::Time)
    }

    // ── Streams ─────────────────────────────────────────────────────

    /// Replace the tracked symbols; both streams must be started again.
    pub fn init_symbols(&self, symbols: &[Symbol]) {
        self.shared.subscriptions.init_symbols(symbols);
        self.shared.queue.forget_subscriptions();
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.shared.subscriptions.symbols()
    }

    /// Backfill `window_minutes` of bars per symbol, then subscribe to ticks.
    ///
    /// Stops at the first failed backfill and returns its error. Symbols
    /// already backfilled keep their bars.
    pub async fn start_quote_stream(&self, window_minutes: u32) -> Result<(), FeedError> {
        let symbols = self.shared.subscriptions.symbols();
        if symbols.is_empty() {
            return Err(FeedError::NoInit);
        }

        for symbol in &symbols {
            let series = self
                .fetch_candles(symbol.as_str(), window_minutes, 0, 0)
                .await?;
            debug!(symbol = %symbol, bars = series.len(), "Backfilled");
            self.shared
                .subscriptions
                .replace_series(symbol.as_str(), series.to_bars())?;
            self.shared.subscriptions.mark_quotes_started();
        }

        self.enqueue_open(&Request::Ticks { symbols: symbols.clone() })?;
        info!(symbols = symbols.len(), window_minutes, "Quote stream started");
        Ok(())
    }

    /// Subscribe to buy and sell payout proposals for every symbol.
    pub fn start_proposal_stream(&self, params: &ProposalParams) -> Result<(), FeedError> {
        let symbols = self.shared.subscriptions.symbols();
        if symbols.is_empty() {
            return Err(FeedError::NoInit);
        }
        if !self.is_authorized() {
            return Err(FeedError::NoAuthorization);
        }

        for symbol in &symbols {
            for side in ContractSide::both() {
                self.enqueue_authorized(&Request::Proposal {
                    symbol: symbol.clone(),
                    side,
                    params: params.clone(),
                })?;
            }
        }
        self.shared.subscriptions.mark_proposals_started();
        info!(symbols = symbols.len(), amount = params.amount, "Proposal stream started");
        Ok(())
    }

    pub fn read_quote_snapshot(&self) -> Result<QuoteSnapshot, FeedError> {
        self.shared.subscriptions.quote_snapshot()
    }

    pub fn read_proposal_snapshot(&self) -> Result<ProposalSnapshot, FeedError> {
        self.shared.subscriptions.proposal_snapshot()
    }

    // ── One-shot queries ────────────────────────────────────────────

    /// Fetch one-minute candles for `symbol`.
    ///
    /// `start_epoch == 0` asks for the latest `count` candles; `end_epoch == 0`
    /// means up to now. Waits at most the configured fetch timeout.
    ///
    /// Only one fetch is tracked per client. A second call made before the
    /// first resolves abandons the first, which then fails with
    /// `UnknownError`.
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        count: u32,
        start_epoch: i64,
        end_epoch: i64,
    ) -> Result<CandleSeries, FeedError> {
        if !self.is_open() {
            return Err(FeedError::NoOpenConnection);
        }
        let request = Request::Candles(CandleQuery {
            symbol: Symbol::new(symbol),
            count,
            start_epoch,
            end_epoch,
        });
        let outbound = Outbound::new(self.shared.ids.next_id(), &request)?;
        let id = outbound.id;

        let rx = self.shared.candles.install(id);
        self.shared.queue.push(outbound);

        let result = candles::await_outcome(id, rx, self.shared.config.fetch_timeout).await;
        self.shared.candles.clear(id);
        // A rejected query keeps its tracking for the one replay.
        if result.as_ref().is_err_and(|failure| failure.unanswered()) {
            self.shared.queue.abandon(id);
        }
        result.map_err(FeedError::from)
    }

    // ── Fan-out and housekeeping ────────────────────────────────────

    /// Live ticks for tracked symbols, in arrival order.
    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate> {
        self.shared.prices.subscribe()
    }

    pub fn metrics(&self) -> BTreeMap<String, u64> {
        self.shared.metrics.export()
    }

    /// Requests waiting for transmission.
    pub fn queued_requests(&self) -> usize {
        self.shared.queue.len()
    }

    /// Sent requests still waiting for a reply.
    pub fn in_flight_requests(&self) -> usize {
        self.shared.queue.in_flight_count()
    }

    /// Stop the background tasks. The client is inert afterwards.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        self.shared.link.set_phase(LinkPhase::Disconnected);
        info!("Feed client stopped");
    }
}

impl Drop for FeedClient {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            debug!(tasks = tasks.len(), "Feed client dropped, aborting tasks");
        }
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
