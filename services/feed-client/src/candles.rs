//! One-shot historical candle queries
//!
//! A fetch installs a `PendingQuery` (the request id plus a oneshot sender)
//! in the client's single `CandleSlot`, enqueues the `ticks_history`
//! request and waits on the oneshot receiver for at most the fetch timeout.
//! The router resolves the slot when the matching `candles` reply arrives.
//!
//! Only one query is tracked at a time. Installing a new one drops the
//! previous sender, so an overlapped earlier caller resolves immediately
//! with `UnknownError`. A fetch that times out or is abandoned stops
//! tracking its request so nothing waits on a reply that may never come.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use types::errors::{FeedError, VenueErrorCode};
use types::ids::RequestId;
use types::market::CandleSeries;

use crate::protocol::RawCandle;

/// How the router resolved a pending query.
#[derive(Debug, Clone, PartialEq)]
pub enum CandleOutcome {
    Completed(Vec<RawCandle>),
    Failed(VenueErrorCode),
}

#[derive(Debug)]
struct PendingQuery {
    id: RequestId,
    tx: oneshot::Sender<CandleOutcome>,
}

/// Holder for the single outstanding candle query.
#[derive(Debug, Default)]
pub struct CandleSlot {
    pending: Mutex<Option<PendingQuery>>,
}

impl CandleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingQuery>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new query, replacing any outstanding one.
    pub fn install(&self, id: RequestId) -> oneshot::Receiver<CandleOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.lock().replace(PendingQuery { id, tx }) {
            warn!(previous = %previous.id, current = %id, "Overlapping candle fetch; earlier query abandoned");
        }
        rx
    }

    /// Resolve the pending query.
    ///
    /// With `Some(id)` only a query with that id is resolved; `None` resolves
    /// whatever is pending (replies that lost their `req_id`). Returns true
    /// if a waiter was resolved.
    pub fn resolve(&self, id: Option<RequestId>, outcome: CandleOutcome) -> bool {
        let pending = {
            let mut slot = self.lock();
            match (slot.as_ref(), id) {
                (Some(p), Some(id)) if p.id != id => None,
                (Some(_), _) => slot.take(),
                (None, _) => None,
            }
        };
        match pending {
            Some(p) => {
                debug!(req_id = %p.id, "Candle query resolved");
                p.tx.send(outcome).is_ok()
            }
            None => false,
        }
    }

    /// Drop the slot if it still holds `id`.
    pub fn clear(&self, id: RequestId) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|p| p.id == id) {
            slot.take();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock().is_some()
    }
}

/// Split raw candles into parallel close/open-time arrays.
pub fn to_series(raw: &[RawCandle]) -> CandleSeries {
    CandleSeries {
        prices: raw.iter().map(|c| c.close).collect(),
        times: raw.iter().map(|c| c.epoch).collect(),
    }
}

/// Why a fetch produced no series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchFailure {
    /// The venue answered with an error.
    Rejected,
    /// A later fetch replaced this one.
    Abandoned,
    TimedOut,
}

impl FetchFailure {
    /// True when no reply was ever routed to the waiter.
    pub(crate) fn unanswered(self) -> bool {
        !matches!(self, FetchFailure::Rejected)
    }
}

impl From<FetchFailure> for FeedError {
    fn from(_: FetchFailure) -> Self {
        FeedError::UnknownError
    }
}

/// Wait for a query's outcome, bounded by `limit`.
pub(crate) async fn await_outcome(
    id: RequestId,
    rx: oneshot::Receiver<CandleOutcome>,
    limit: Duration,
) -> Result<CandleSeries, FetchFailure> {
    match tokio::time::timeout(limit, rx).await {
        Ok(Ok(CandleOutcome::Completed(raw))) => Ok(to_series(&raw)),
        Ok(Ok(CandleOutcome::Failed(code))) => {
            warn!(req_id = %id, code = code.as_str(), "Candle fetch failed");
            Err(FetchFailure::Rejected)
        }
        Ok(Err(_)) => {
            warn!(req_id = %id, "Candle fetch abandoned");
            Err(FetchFailure::Abandoned)
        }
        Err(_) => {
            warn!(req_id = %id, timeout_ms = limit.as_millis() as u64, "Candle fetch timed out");
            Err(FetchFailure::TimedOut)
        }
    }
}
