//! Outbound sender loop
//!
//! While the link is open: pop the queue head, honor a rate-limit backoff
//! armed by the router, and write the frame. An idle queue parks on the
//! queue's `Notify` instead of spinning; if nothing is sent for the
//! keepalive interval a `ping` is synthesized. A failed write puts the frame
//! back at the head and waits for the connection to be replaced.

use std::sync::Arc;

use futures::SinkExt;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::client::Shared;
use crate::connection::Link;
use crate::protocol::{Outbound, Request};
use crate::transport::TransportError;

async fn transmit(link: &Link, text: String) -> Result<(), TransportError> {
    let mut writer = link.writer().lock().await;
    let sink = writer
        .as_mut()
        .ok_or_else(|| TransportError::Send("no open connection".to_string()))?;
    sink.send(text).await
}

fn keepalive(shared: &Shared) -> Option<Outbound> {
    match Outbound::new(shared.ids.next_id(), &Request::Ping) {
        Ok(ping) => Some(ping),
        Err(e) => {
            warn!(error = %e, "Failed to build keepalive");
            None
        }
    }
}

pub(crate) async fn run_sender_loop(shared: Arc<Shared>) {
    let idle = shared.config.keepalive_idle;
    loop {
        shared.link.wait_open().await;
        debug!("Sender active");
        let mut idle_deadline = Instant::now() + idle;

        while shared.link.is_open() {
            let Some(outbound) = shared.queue.pop() else {
                tokio::select! {
                    _ = shared.queue.notified() => {}
                    _ = sleep_until(idle_deadline) => {
                        if let Some(ping) = keepalive(&shared) {
                            trace!(req_id = %ping.id, "Idle, queueing keepalive");
                            shared.metrics.record_keepalive();
                            shared.queue.push(ping);
                        }
                        idle_deadline = Instant::now() + idle;
                    }
                    _ = shared.link.wait_closed() => {}
                }
                continue;
            };

            if let Some(deadline) = shared.backoff.take() {
                debug!(req_id = %outbound.id, "Holding transmission for rate limit");
                sleep_until(deadline).await;
            }

            match transmit(&shared.link, outbound.text.clone()).await {
                Ok(()) => {
                    shared.metrics.record_frame_sent();
                    trace!(req_id = %outbound.id, kind = ?outbound.kind, "Frame sent");
                    idle_deadline = Instant::now() + idle;
                }
                Err(e) => {
                    warn!(req_id = %outbound.id, error = %e, "Send failed, request requeued");
                    shared.queue.push_front(outbound);
                    shared.link.wait_closed().await;
                }
            }
        }
        debug!("Sender parked until reconnect");
    }
}
