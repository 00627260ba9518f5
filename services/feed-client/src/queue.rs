//! Outbound request queue and correlation map
//!
//! A FIFO of serialized requests drained by the sender loop, plus the
//! `in_flight` map from `req_id` to the request that was transmitted under
//! it. The router uses the map to replay the exact original request when a
//! reply carries a retryable error.
//!
//! Producers never block: `push` appends under a short lock and wakes the
//! sender through a `Notify` permit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use types::ids::RequestId;

use crate::protocol::{Outbound, RequestKind};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Outbound>,
    in_flight: HashMap<RequestId, Outbound>,
}

/// Thread-safe FIFO of outbound requests.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the tail.
    pub fn push(&self, outbound: Outbound) {
        {
            let mut state = self.lock();
            debug!(req_id = %outbound.id, kind = ?outbound.kind, depth = state.pending.len() + 1, "Request queued");
            state.pending.push_back(outbound);
        }
        self.ready.notify_one();
    }

    /// Insert at the head, ahead of everything already queued.
    ///
    /// Used for the connection handshake and for a frame whose send failed.
    pub fn push_front(&self, outbound: Outbound) {
        self.lock().pending.push_front(outbound);
        self.ready.notify_one();
    }

    /// Take the head and record it as in flight.
    pub fn pop(&self) -> Option<Outbound> {
        let mut state = self.lock();
        let outbound = state.pending.pop_front()?;
        state.in_flight.insert(outbound.id, outbound.clone());
        Some(outbound)
    }

    /// Wait until something has been pushed since the last wake-up.
    pub async fn notified(&self) {
        self.ready.notified().await;
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Snapshot of the queued request texts, head first.
    pub fn pending_texts(&self) -> Vec<String> {
        self.lock().pending.iter().map(|o| o.text.clone()).collect()
    }

    /// The transmitted request for `id`, if still tracked.
    pub fn in_flight(&self, id: RequestId) -> Option<Outbound> {
        self.lock().in_flight.get(&id).cloned()
    }

    /// Stop tracking `id` (its exchange is finished).
    pub fn complete(&self, id: RequestId) -> Option<Outbound> {
        self.lock().in_flight.remove(&id)
    }

    /// Re-enqueue one copy of a tracked request, bumping its replay count.
    ///
    /// Returns the replay count after the bump, or `None` if `id` is unknown.
    pub fn replay(&self, id: RequestId) -> Option<u32> {
        let copy = {
            let mut state = self.lock();
            let tracked = state.in_flight.get_mut(&id)?;
            tracked.replays += 1;
            let copy = tracked.clone();
            state.pending.push_back(copy.clone());
            copy
        };
        debug!(req_id = %copy.id, replays = copy.replays, "Request replayed");
        self.ready.notify_one();
        Some(copy.replays)
    }

    /// Drop tracking for every standing subscription.
    pub fn forget_subscriptions(&self) {
        self.lock()
            .in_flight
            .retain(|_, outbound| !outbound.kind.is_subscription());
    }

    /// Drop every trace of `id`, queued or in flight.
    ///
    /// Returns true if anything was removed.
    pub fn abandon(&self, id: RequestId) -> bool {
        let mut state = self.lock();
        let queued = state.pending.len();
        state.pending.retain(|o| o.id != id);
        let dequeued = state.pending.len() != queued;
        state.in_flight.remove(&id).is_some() || dequeued
    }

    /// Drop in-flight one-shot requests; their replies died with the
    /// connection. Standing subscriptions stay tracked.
    pub fn forget_unanswered(&self) -> usize {
        let mut state = self.lock();
        let before = state.in_flight.len();
        state.in_flight.retain(|_, outbound| outbound.kind.is_subscription());
        before - state.in_flight.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Count of queued requests of one kind.
    pub fn pending_of(&self, kind: RequestKind) -> usize {
        self.lock().pending.iter().filter(|o| o.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;

    fn outbound(n: u64, request: &Request) -> Outbound {
        Outbound::new(RequestId::from_u64(n), request).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::new();
        queue.push(outbound(1, &Request::Time));
        queue.push(outbound(2, &Request::Ping));
        assert_eq!(queue.pop().unwrap().id.as_u64(), 1);
        assert_eq!(queue.pop().unwrap().id.as_u64(), 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_push_front_jumps_queue() {
        let queue = OutboundQueue::new();
        queue.push(outbound(1, &Request::Time));
        queue.push_front(outbound(2, &Request::Ping));
        assert_eq!(queue.pop().unwrap().kind, RequestKind::Ping);
    }

    #[test]
    fn test_pop_tracks_in_flight() {
        let queue = OutboundQueue::new();
        queue.push(outbound(5, &Request::Time));
        let sent = queue.pop().unwrap();
        assert_eq!(queue.in_flight(sent.id), Some(sent.clone()));
        assert_eq!(queue.complete(sent.id), Some(sent));
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[test]
    fn test_replay_enqueues_exactly_one_copy() {
        let queue = OutboundQueue::new();
        queue.push(outbound(3, &Request::Time));
        let sent = queue.pop().unwrap();

        assert_eq!(queue.replay(sent.id), Some(1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_texts(), vec![sent.text.clone()]);
        assert_eq!(queue.replay(RequestId::from_u64(99)), None);
    }

    #[test]
    fn test_forget_subscriptions_keeps_one_shots() {
        let queue = OutboundQueue::new();
        queue.push(outbound(1, &Request::Ticks { symbols: vec![] }));
        queue.push(outbound(2, &Request::Time));
        queue.pop();
        queue.pop();
        queue.forget_subscriptions();
        assert!(queue.in_flight(RequestId::from_u64(1)).is_none());
        assert!(queue.in_flight(RequestId::from_u64(2)).is_some());
    }

    #[test]
    fn test_forget_unanswered_keeps_subscriptions() {
        let queue = OutboundQueue::new();
        queue.push(outbound(1, &Request::Ticks { symbols: vec![] }));
        queue.push(outbound(2, &Request::Time));
        queue.push(outbound(3, &Request::Ping));
        queue.pop();
        queue.pop();
        queue.pop();
        assert_eq!(queue.forget_unanswered(), 2);
        assert_eq!(queue.in_flight_count(), 1);
        assert!(queue.in_flight(RequestId::from_u64(1)).is_some());
    }

    #[test]
    fn test_abandon_removes_queued_and_in_flight() {
        let queue = OutboundQueue::new();
        queue.push(outbound(1, &Request::Time));
        queue.push(outbound(2, &Request::Ping));
        queue.pop();

        assert!(queue.abandon(RequestId::from_u64(1)));
        assert!(queue.abandon(RequestId::from_u64(2)));
        assert!(!queue.abandon(RequestId::from_u64(3)));
        assert_eq!(queue.in_flight_count(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = std::sync::Arc::new(OutboundQueue::new());
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.notified().await });
        queue.push(outbound(1, &Request::Ping));
        waiter.await.unwrap();
        assert_eq!(queue.pending_of(RequestKind::Ping), 1);
    }
}
