use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use feed_client::{AppConfig, FeedClient};
use persistence::RecordStore;
use types::market::PriceUpdate;

/// Delay between attempts to start the quote stream.
const START_RETRY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env();
    if config.symbols.is_empty() {
        anyhow::bail!("FEED_SYMBOLS lists no symbols");
    }
    info!(
        endpoint = %config.client.endpoint,
        symbols = config.symbols.len(),
        window = config.quote_window_minutes,
        "Starting feed client"
    );

    let client = Arc::new(FeedClient::start(config.client.clone()));

    let recorder = match &config.record_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating record directory {}", dir.display()))?;
            let store = RecordStore::new(dir);
            let prices = client.subscribe_prices();
            let (stop_tx, stop_rx) = oneshot::channel();
            info!(dir = %dir.display(), "Recording live prices");
            let (updates_tx, updates_rx) = mpsc::unbounded_channel();
            tokio::spawn(forward_prices(prices, updates_tx, stop_rx));
            let writer = tokio::task::spawn_blocking(move || write_records(store, updates_rx));
            Some((stop_tx, writer))
        }
        None => None,
    };

    tokio::select! {
        result = run(client.clone(), &config) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    client.shutdown();
    if let Some((stop, task)) = recorder {
        let _ = stop.send(());
        task.await.context("record writer panicked")?;
    }
    info!(metrics = ?client.metrics(), "Feed client exited");
    Ok(())
}

async fn run(client: Arc<FeedClient>, config: &AppConfig) -> Result<(), anyhow::Error> {
    client.wait_open().await;
    client.init_symbols(&config.symbols);

    loop {
        match client.start_quote_stream(config.quote_window_minutes).await {
            Ok(()) => break,
            Err(e) => {
                warn!(error = %e, code = e.code(), "Quote stream start failed, retrying");
                tokio::time::sleep(START_RETRY).await;
                client.wait_open().await;
            }
        }
    }

    let mut proposals_started = false;
    let mut report = tokio::time::interval(config.report_interval);
    loop {
        report.tick().await;

        if let Err(e) = client.request_time() {
            warn!(code = e.code(), "Time request skipped");
        }

        if !proposals_started {
            if let Some(params) = &config.proposal {
                if client.is_authorized() {
                    proposals_started = client.start_proposal_stream(params).is_ok();
                }
            }
        }

        log_snapshot(&client);
    }
}

fn log_snapshot(client: &FeedClient) {
    let time = client.server_time();
    info!(
        state = ?client.connection_state(),
        server_time = time.last_epoch,
        time_known = time.known,
        queued = client.queued_requests(),
        "Status"
    );

    if let Ok(quotes) = client.read_quote_snapshot() {
        for (symbol, bars) in quotes.symbols.iter().zip(&quotes.series) {
            if let Some(last) = bars.last() {
                match last.open_time_utc() {
                    Some(opened) => info!(symbol = %symbol, bars = bars.len(), close = last.close, %opened, "Quotes"),
                    None => info!(symbol = %symbol, bars = bars.len(), close = last.close, open_time = last.open_time, "Quotes"),
                }
            }
        }
    }
    if let Ok(proposals) = client.read_proposal_snapshot() {
        for (symbol, pair) in proposals.symbols.iter().zip(&proposals.pairs) {
            info!(symbol = %symbol, buy = pair.buy_return, sell = pair.sell_return, "Proposals");
        }
    }
}

/// Relay live prices to the record writer until told to stop.
async fn forward_prices(
    mut prices: broadcast::Receiver<PriceUpdate>,
    updates: mpsc::UnboundedSender<PriceUpdate>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let received = tokio::select! {
            received = prices.recv() => received,
            _ = &mut stop => break,
        };
        match received {
            Ok(update) => {
                if updates.send(update).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Recorder lagged behind the price feed");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Append relayed prices to the daily record files; runs on a blocking thread.
fn write_records(mut store: RecordStore, mut updates: mpsc::UnboundedReceiver<PriceUpdate>) {
    while let Some(update) = updates.blocking_recv() {
        if let Err(e) = store.append(&update.symbol, update.price, update.epoch) {
            error!(symbol = %update.symbol, error = %e, "Failed to record price");
        }
    }
    if let Err(e) = store.sync_all() {
        error!(error = %e, "Failed to sync record files");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::Record;
    use tempfile::TempDir;
    use types::ids::Symbol;

    #[test]
    fn test_writer_drains_updates_then_syncs() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let symbol = Symbol::new("R_50");
        for (price, epoch) in [(100.0, 1_704_067_200), (100.5, 1_704_067_201)] {
            tx.send(PriceUpdate { symbol: symbol.clone(), price, epoch }).unwrap();
        }
        drop(tx);

        write_records(RecordStore::new(dir.path()), rx);

        let store = RecordStore::new(dir.path());
        let day = RecordStore::day_of(1_704_067_200).unwrap();
        assert_eq!(
            store.read_day(&symbol, day).unwrap(),
            vec![Record::new(100.0, 1_704_067_200), Record::new(100.5, 1_704_067_201)]
        );
    }

    #[tokio::test]
    async fn test_relay_stops_on_signal() {
        let (prices_tx, prices_rx) = broadcast::channel(16);
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let relay = tokio::spawn(forward_prices(prices_rx, updates_tx, stop_rx));

        let update = PriceUpdate { symbol: Symbol::new("A"), price: 1.5, epoch: 60 };
        prices_tx.send(update.clone()).unwrap();
        assert_eq!(updates_rx.recv().await, Some(update));

        stop_tx.send(()).unwrap();
        relay.await.unwrap();
        assert_eq!(updates_rx.recv().await, None);
    }
}
