//! Inbound message routing
//!
//! Consumes `ConnectionEvent`s strictly in delivery order. Connection events
//! drive the link phase and the handshake; each message is parsed,
//! classified by `msg_type` (tick → proposal → authorize → time → candles,
//! first match wins) and either applied to client state or, when it carries
//! an error, recovered according to the code's `RetryPolicy`.
//!
//! A failed reply is matched to the request that produced it by `req_id`
//! through the queue's in-flight map. Replies without a tracked id fall
//! back to replaying the venue's `echo_req` copy under a fresh id.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use types::errors::{RetryPolicy, VenueErrorCode};
use types::market::{payout_return, ContractSide, PriceUpdate};

use crate::candles::CandleOutcome;
use crate::client::Shared;
use crate::connection::{ConnectionEvent, LinkPhase};
use crate::protocol::{Outbound, Reply, ReplyError, ReplyKind, Request, RequestKind};

/// One-shot transmission delay armed by rate-limit replies.
#[derive(Debug, Default)]
pub struct Backoff {
    deadline: Mutex<Option<Instant>>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold the next transmission until at least `delay` from now.
    pub fn arm(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut deadline = self.lock();
        *deadline = Some(deadline.map_or(until, |d| d.max(until)));
    }

    /// Consume the armed deadline, if any.
    pub fn take(&self) -> Option<Instant> {
        self.lock().take()
    }

    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }
}

fn request_kind(kind: ReplyKind) -> RequestKind {
    match kind {
        ReplyKind::Tick => RequestKind::Ticks,
        ReplyKind::Proposal => RequestKind::Proposal,
        ReplyKind::Authorize => RequestKind::Authorize,
        ReplyKind::Time => RequestKind::Time,
        ReplyKind::Candles => RequestKind::Candles,
    }
}

/// Applies inbound events to the shared client state.
#[derive(Clone)]
pub struct MessageRouter {
    shared: Arc<Shared>,
}

impl MessageRouter {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => self.on_open(),
            ConnectionEvent::Message(text) => self.on_message(&text),
            ConnectionEvent::Closed => {
                info!("Connection closed");
                self.on_disconnect();
            }
            ConnectionEvent::Error(reason) => {
                warn!(%reason, "Connection failed");
                self.on_disconnect();
            }
        }
    }

    fn on_disconnect(&self) {
        self.shared.link.set_phase(LinkPhase::Disconnected);
        let dropped = self.shared.queue.forget_unanswered();
        if dropped > 0 {
            debug!(dropped, "Dropped in-flight requests of the closed connection");
        }
    }

    fn on_open(&self) {
        let shared = &self.shared;
        shared.auth.begin_connection();
        let handshake = match shared.config.credential() {
            Some(token) => Request::Authorize {
                token: token.to_string(),
            },
            None => Request::Ping,
        };

        match Outbound::new(shared.ids.next_id(), &handshake) {
            Ok(outbound) => {
                info!(req_id = %outbound.id, kind = ?outbound.kind, "Connection open, handshake queued");
                shared.queue.push_front(outbound);
            }
            Err(e) => warn!(error = %e, "Failed to build handshake"),
        }
        shared.link.set_phase(LinkPhase::Open);
    }

    fn on_message(&self, text: &str) {
        let shared = &self.shared;
        shared.metrics.record_message();

        let reply = match Reply::parse(text) {
            Ok(reply) => reply,
            Err(e) => {
                shared.metrics.record_malformed();
                warn!(error = %e, len = text.len(), "Dropping malformed message");
                return;
            }
        };

        let Some(kind) = reply.kind() else {
            trace!(msg_type = %reply.msg_type, "Unrouted reply");
            self.settle(&reply);
            return;
        };

        if let Some(error) = &reply.error {
            self.on_error(kind, &reply, error);
            return;
        }

        match kind {
            ReplyKind::Tick => self.on_tick(&reply),
            ReplyKind::Proposal => self.on_proposal(&reply),
            ReplyKind::Authorize => self.on_authorize(&reply),
            ReplyKind::Time => self.on_time(&reply),
            ReplyKind::Candles => self.on_candles(&reply),
        }
    }

    /// Stop tracking a finished one-shot exchange.
    fn settle(&self, reply: &Reply) {
        let Some(id) = reply.req_id else { return };
        let queue = &self.shared.queue;
        if queue
            .in_flight(id)
            .is_some_and(|tracked| !tracked.kind.is_subscription())
        {
            queue.complete(id);
        }
    }

    fn on_error(&self, kind: ReplyKind, reply: &Reply, error: &ReplyError) {
        let shared = &self.shared;
        let code = error.classify();

        if kind == ReplyKind::Candles {
            shared
                .candles
                .resolve(reply.req_id, CandleOutcome::Failed(code.clone()));
            // A historical query is replayed at most once.
            let replayed_before = reply
                .req_id
                .and_then(|id| shared.queue.in_flight(id))
                .is_some_and(|tracked| tracked.replays > 0);
            if replayed_before {
                debug!(code = code.as_str(), "Candle query already replayed, giving up");
                self.settle(reply);
                return;
            }
        }

        let subscription = matches!(kind, ReplyKind::Tick | ReplyKind::Proposal);
        let credential = kind == ReplyKind::Authorize;

        match code.retry_policy(subscription, credential) {
            RetryPolicy::Suppress => {
                debug!(kind = kind.tag(), "Subscription already active");
            }
            RetryPolicy::GiveUp => {
                shared.auth.record_permanent_failure();
                self.settle(reply);
                warn!(code = code.as_str(), message = %error.message, "Authorization rejected permanently");
            }
            RetryPolicy::ReplayAfterBackoff => {
                shared.backoff.arm(shared.config.rate_limit_backoff);
                shared.metrics.record_backoff();
                self.replay(kind, reply, &code);
            }
            RetryPolicy::Replay => self.replay(kind, reply, &code),
        }
    }

    /// Re-enqueue exactly one copy of the request behind `reply`.
    fn replay(&self, kind: ReplyKind, reply: &Reply, code: &VenueErrorCode) {
        let shared = &self.shared;

        if let Some(replays) = reply.req_id.and_then(|id| shared.queue.replay(id)) {
            shared.metrics.record_retry();
            warn!(kind = kind.tag(), code = code.as_str(), replays, "Replaying request");
            return;
        }

        let Some(mut echo) = reply.echo_req.clone().filter(Value::is_object) else {
            warn!(kind = kind.tag(), code = code.as_str(), "Cannot replay: request unknown");
            return;
        };
        let id = shared.ids.next_id();
        echo["req_id"] = json!(id);
        match serde_json::to_string(&echo) {
            Ok(text) => {
                shared.queue.push(Outbound {
                    id,
                    kind: request_kind(kind),
                    text,
                    replays: 1,
                });
                shared.metrics.record_retry();
                warn!(kind = kind.tag(), code = code.as_str(), req_id = %id, "Replaying echoed request");
            }
            Err(e) => warn!(error = %e, "Cannot replay: echo not serializable"),
        }
    }

    fn on_tick(&self, reply: &Reply) {
        let shared = &self.shared;
        let Some(tick) = &reply.tick else {
            shared.metrics.record_malformed();
            warn!("Tick reply without body");
            return;
        };

        match shared
            .subscriptions
            .apply_tick(tick.symbol.as_str(), tick.quote, tick.epoch)
        {
            Some(_) => {
                shared.metrics.record_tick();
                // No receivers is fine.
                let _ = shared.prices.send(PriceUpdate {
                    symbol: tick.symbol.clone(),
                    price: tick.quote,
                    epoch: tick.epoch,
                });
            }
            None => debug!(symbol = %tick.symbol, "Tick for untracked symbol"),
        }
        shared.time.advance(tick.epoch);
    }

    fn on_proposal(&self, reply: &Reply) {
        let shared = &self.shared;
        let Some(proposal) = &reply.proposal else {
            shared.metrics.record_malformed();
            warn!("Proposal reply without body");
            return;
        };
        let Some(symbol) = reply.echo_str("symbol") else {
            warn!("Proposal reply without echoed symbol");
            return;
        };
        let side = ContractSide::from_wire(reply.echo_str("contract_type").unwrap_or_default());
        let effective = payout_return(proposal.payout, proposal.ask_price);

        match shared.subscriptions.apply_proposal(symbol, side, effective) {
            Some(()) => shared.metrics.record_proposal(),
            None => debug!(symbol, "Proposal for untracked symbol"),
        }
    }

    fn on_authorize(&self, reply: &Reply) {
        let shared = &self.shared;
        let (balance, currency) = reply
            .authorize
            .as_ref()
            .map(|a| (a.balance, a.currency.as_str()))
            .unwrap_or((0.0, ""));
        shared.auth.record_success(balance, currency);
        self.settle(reply);
        info!(balance, currency, "Authorized");
    }

    fn on_time(&self, reply: &Reply) {
        let Some(epoch) = reply.time else {
            warn!("Time reply without value");
            return;
        };
        let now = self.shared.time.record_server_time(epoch);
        self.settle(reply);
        debug!(epoch, server_time = now, "Server time updated");
    }

    fn on_candles(&self, reply: &Reply) {
        let candles = reply.candles.clone().unwrap_or_default();
        let count = candles.len();
        let resolved = self
            .shared
            .candles
            .resolve(reply.req_id, CandleOutcome::Completed(candles));
        self.settle(reply);
        debug!(count, resolved, "Candles received");
    }
}

/// Drain connection events until the connection loop goes away.
pub(crate) async fn run_router(
    router: MessageRouter,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        router.handle_event(event);
    }
    debug!("Router stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use types::ids::Symbol;

    fn router(config: ClientConfig) -> (MessageRouter, Arc<Shared>) {
        let shared = Arc::new(Shared::new(config));
        (MessageRouter::new(shared.clone()), shared)
    }

    fn message(value: Value) -> ConnectionEvent {
        ConnectionEvent::Message(value.to_string())
    }

    #[tokio::test]
    async fn test_open_queues_ping_without_credential() {
        let (router, shared) = router(ClientConfig::default());
        router.handle_event(ConnectionEvent::Open);
        assert!(shared.link.is_open());
        let head = shared.queue.pop().unwrap();
        assert_eq!(head.kind, RequestKind::Ping);
    }

    #[tokio::test]
    async fn test_open_queues_authorize_ahead_of_backlog() {
        let (router, shared) = router(ClientConfig::default().with_token("secret"));
        shared
            .queue
            .push(Outbound::new(shared.ids.next_id(), &Request::Time).unwrap());
        router.handle_event(ConnectionEvent::Open);
        let head = shared.queue.pop().unwrap();
        assert_eq!(head.kind, RequestKind::Authorize);
        assert!(head.text.contains("secret"));
    }

    #[tokio::test]
    async fn test_close_leaves_auth_untouched() {
        let (router, shared) = router(ClientConfig::default().with_token("t"));
        router.handle_event(ConnectionEvent::Open);
        router.handle_event(message(json!({
            "msg_type": "authorize",
            "authorize": {"balance": 10.5, "currency": "USD"}
        })));
        router.handle_event(ConnectionEvent::Error("reset".into()));
        assert!(!shared.link.is_open());
        assert!(shared.auth.is_authorized());
    }

    #[tokio::test]
    async fn test_disconnect_forgets_one_shots_only() {
        let (router, shared) = router(ClientConfig::default());
        router.handle_event(ConnectionEvent::Open);
        shared.queue.push(
            Outbound::new(shared.ids.next_id(), &Request::Ticks { symbols: vec![Symbol::new("A")] })
                .unwrap(),
        );
        while shared.queue.pop().is_some() {}
        assert_eq!(shared.queue.in_flight_count(), 2);

        router.handle_event(ConnectionEvent::Closed);
        assert!(!shared.link.is_open());
        assert_eq!(shared.queue.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (router, shared) = router(ClientConfig::default());
        router.handle_event(ConnectionEvent::Message("{not json".into()));
        assert_eq!(shared.metrics.export()["messages_malformed"], 1);
        assert!(shared.queue.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_replays_tracked_request_once() {
        let (router, shared) = router(ClientConfig::default());
        let id = shared.ids.next_id();
        shared.queue.push(Outbound::new(id, &Request::Time).unwrap());
        let sent = shared.queue.pop().unwrap();

        router.handle_event(message(json!({
            "msg_type": "time",
            "req_id": id,
            "error": {"code": "RateLimit", "message": "slow"},
            "echo_req": {"time": 1, "req_id": id}
        })));

        assert!(shared.backoff.is_armed());
        assert_eq!(shared.queue.pending_texts(), vec![sent.text]);
    }

    #[tokio::test]
    async fn test_untracked_error_replays_echo_with_fresh_id() {
        let (router, shared) = router(ClientConfig::default());
        router.handle_event(message(json!({
            "msg_type": "proposal",
            "error": {"code": "MarketIsClosed"},
            "echo_req": {"proposal": 1, "symbol": "R_50", "contract_type": "PUT"}
        })));
        let queued = shared.queue.pop().unwrap();
        assert_eq!(queued.kind, RequestKind::Proposal);
        let body: Value = serde_json::from_str(&queued.text).unwrap();
        assert_eq!(body["symbol"], "R_50");
        assert!(body["req_id"].as_u64().unwrap() > 0);
        assert!(!shared.backoff.is_armed());
    }

    #[tokio::test]
    async fn test_already_subscribed_is_suppressed() {
        let (router, shared) = router(ClientConfig::default());
        router.handle_event(message(json!({
            "msg_type": "tick",
            "error": {"code": "AlreadySubscribed"},
            "echo_req": {"ticks": ["R_50"], "subscribe": 1}
        })));
        assert!(shared.queue.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_token_is_terminal() {
        let (router, shared) = router(ClientConfig::default().with_token("bad"));
        router.handle_event(ConnectionEvent::Open);
        let auth = shared.queue.pop().unwrap();
        router.handle_event(message(json!({
            "msg_type": "authorize",
            "req_id": auth.id,
            "error": {"code": "InvalidToken"},
            "echo_req": {"authorize": "bad", "req_id": auth.id}
        })));
        assert!(shared.auth.failed_permanently());
        assert!(shared.queue.is_empty());

        // A new connection instance tries the token again.
        router.handle_event(ConnectionEvent::Closed);
        router.handle_event(ConnectionEvent::Open);
        assert!(!shared.auth.failed_permanently());
        assert_eq!(shared.queue.pop().unwrap().kind, RequestKind::Authorize);
    }

    #[tokio::test]
    async fn test_tick_updates_bars_time_and_fanout() {
        let (router, shared) = router(ClientConfig::default());
        shared.subscriptions.init_symbols(&[Symbol::new("R_50")]);
        shared.subscriptions.mark_quotes_started();
        let mut prices = shared.prices.subscribe();

        router.handle_event(message(json!({
            "msg_type": "tick",
            "tick": {"symbol": "R_50", "quote": 101.5, "epoch": 125}
        })));

        let snap = shared.subscriptions.quote_snapshot().unwrap();
        assert_eq!(snap.series[0].len(), 1);
        assert_eq!(snap.series[0][0].open_time, 120);
        assert_eq!(shared.time.snapshot().last_epoch, 125);
        assert!(!shared.time.snapshot().known);
        assert_eq!(prices.try_recv().unwrap().price, 101.5);
    }

    #[tokio::test]
    async fn test_proposal_routes_by_echoed_contract_type() {
        let (router, shared) = router(ClientConfig::default());
        shared.subscriptions.init_symbols(&[Symbol::new("R_50")]);
        shared.subscriptions.mark_proposals_started();

        router.handle_event(message(json!({
            "msg_type": "proposal",
            "proposal": {"ask_price": 10, "payout": 19.5},
            "echo_req": {"symbol": "R_50", "contract_type": "CALL"}
        })));
        router.handle_event(message(json!({
            "msg_type": "proposal",
            "proposal": {"ask_price": 0, "payout": 19.5},
            "echo_req": {"symbol": "R_50", "contract_type": "PUT"}
        })));

        let pair = shared
            .subscriptions
            .proposal_snapshot()
            .unwrap()
            .pair_for("R_50")
            .unwrap();
        assert!((pair.buy_return - 0.95).abs() < 1e-12);
        assert_eq!(pair.sell_return, 0.0);
    }

    #[tokio::test]
    async fn test_candle_error_replays_only_once() {
        let (router, shared) = router(ClientConfig::default());
        let id = shared.ids.next_id();
        let _rx = shared.candles.install(id);
        shared.queue.push(
            Outbound::new(
                id,
                &Request::Candles(crate::protocol::CandleQuery {
                    symbol: Symbol::new("R_50"),
                    count: 5,
                    start_epoch: 0,
                    end_epoch: 0,
                }),
            )
            .unwrap(),
        );
        shared.queue.pop();

        let failure = json!({
            "msg_type": "candles",
            "req_id": id,
            "error": {"code": "MarketIsClosed"}
        });
        router.handle_event(message(failure.clone()));
        assert!(!shared.candles.is_pending());
        assert_eq!(shared.queue.len(), 1);

        shared.queue.pop();
        router.handle_event(message(failure));
        assert!(shared.queue.is_empty());
        assert!(shared.queue.in_flight(id).is_none());
    }

    #[tokio::test]
    async fn test_time_reply_marks_known_and_settles() {
        let (router, shared) = router(ClientConfig::default());
        let id = shared.ids.next_id();
        shared.queue.push(Outbound::new(id, &Request::Time).unwrap());
        shared.queue.pop();

        router.handle_event(message(json!({"msg_type": "time", "req_id": id, "time": "1700000000"})));
        let t = shared.time.snapshot();
        assert!(t.known);
        assert_eq!(t.last_epoch, 1_700_000_000);
        assert!(shared.queue.in_flight(id).is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_tick_epoch_is_dropped() {
        let (router, shared) = router(ClientConfig::default());
        shared.subscriptions.init_symbols(&[Symbol::new("A")]);
        shared.subscriptions.mark_quotes_started();

        router.handle_event(message(json!({
            "msg_type": "tick",
            "tick": {"symbol": "A", "quote": 1.0, "epoch": -1e300}
        })));
        assert_eq!(shared.metrics.export()["messages_malformed"], 1);
        assert!(shared.subscriptions.quote_snapshot().unwrap().series[0].is_empty());

        router.handle_event(message(json!({"msg_type": "time", "time": 42})));
        assert!(shared.time.snapshot().known);
        assert_eq!(shared.time.snapshot().last_epoch, 42);
    }
}
