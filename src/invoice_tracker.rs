//! Long-lived tracker for the set of known Lightning invoice hashes and
//! their lifecycle states, fed by a streaming subscription, supporting
//! blocking queries that wait for a target state with a timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::TrackerError;

/// Finite set of invoice lifecycle states the tracker is aware of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvoiceState {
    Open,
    Settled,
    Cancelled,
    /// HTLC held, not yet settled.
    Accepted,
}

/// A single update observed on the invoice subscription stream.
#[derive(Debug, Clone)]
pub struct InvoiceUpdate {
    pub payment_hash: [u8; 32],
    pub state: InvoiceState,
    pub add_index: u64,
    pub settle_index: u64,
    /// `true` for `Open` invoices whose expiry has already elapsed.
    pub expired: bool,
}

/// A snapshot of an existing invoice observed at startup.
#[derive(Debug, Clone)]
pub struct InvoiceSnapshot {
    pub payment_hash: [u8; 32],
    pub state: InvoiceState,
    pub add_index: u64,
    pub settle_index: u64,
    pub expired: bool,
}

/// External collaborator yielding the backing Lightning node's invoice
/// state: an initial snapshot (bounded by the backend's max-page
/// convention) plus a subscription to subsequent updates from a given
/// `(add_index, settle_index)` cursor.
#[async_trait]
pub trait InvoiceSource: Send + Sync {
    async fn list_invoices(&self) -> Result<Vec<InvoiceSnapshot>, TrackerError>;

    /// Returns the next update on the stream, or an error terminal to the
    /// ingest loop (EOF, non-cancellation error, or cancellation).
    async fn next_update(&self, add_index: u64, settle_index: u64) -> Result<InvoiceUpdate, TrackerError>;
}

fn invoice_irrelevant(update_state: InvoiceState, expired: bool) -> bool {
    matches!(update_state, InvoiceState::Cancelled) || (update_state == InvoiceState::Open && expired)
}

struct TrackerState {
    invoices: Mutex<HashMap<[u8; 32], InvoiceState>>,
    changed: Notify,
}

/// Maintains the in-memory invoice state map, ingesting updates from an
/// [`InvoiceSource`] and serving [`InvoiceTracker::wait_for_state`] queries.
pub struct InvoiceTracker {
    state: Arc<TrackerState>,
    shutdown_tx: watch::Sender<()>,
    ingest_handle: Mutex<Option<JoinHandle<()>>>,
}

impl InvoiceTracker {
    /// Starts the tracker: fetches the existing invoice snapshot, populates
    /// the map (skipping irrelevant entries), then spawns the ingest loop
    /// from the highest seen `(add_index, settle_index)` onward. Fatal
    /// stream errors are published to `err_tx` (bounded, non-blocking).
    pub async fn start(
        source: Arc<dyn InvoiceSource>,
        err_tx: tokio::sync::mpsc::Sender<TrackerError>,
    ) -> Result<Self, TrackerError> {
        let snapshot = source.list_invoices().await?;

        let mut invoices = HashMap::new();
        let mut add_index = 0u64;
        let mut settle_index = 0u64;
        for entry in snapshot {
            add_index = add_index.max(entry.add_index);
            settle_index = settle_index.max(entry.settle_index);
            if invoice_irrelevant(entry.state, entry.expired) {
                continue;
            }
            invoices.insert(entry.payment_hash, entry.state);
        }

        let state = Arc::new(TrackerState {
            invoices: Mutex::new(invoices),
            changed: Notify::new(),
        });

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        let ingest_state = state.clone();
        let handle = tokio::spawn(async move {
            let mut add_index = add_index;
            let mut settle_index = settle_index;
            loop {
                let update = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        return;
                    }
                    res = source.next_update(add_index, settle_index) => res,
                };

                match update {
                    Ok(update) => {
                        add_index = add_index.max(update.add_index);
                        settle_index = settle_index.max(update.settle_index);

                        if update.payment_hash == [0u8; 32] {
                            continue;
                        }

                        let mut guard = ingest_state.invoices.lock().await;
                        if invoice_irrelevant(update.state, update.expired) {
                            guard.remove(&update.payment_hash);
                        } else {
                            guard.insert(update.payment_hash, update.state);
                        }
                        drop(guard);
                        ingest_state.changed.notify_waiters();
                    }
                    Err(TrackerError::Cancelled) => {
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "invoice subscription terminated fatally");
                        let _ = err_tx.try_send(e);
                        return;
                    }
                }
            }
        });

        Ok(Self {
            state,
            shutdown_tx,
            ingest_handle: Mutex::new(Some(handle)),
        })
    }

    /// Blocks (asynchronously) until `hash` reaches `state`, or `timeout`
    /// elapses. A late subscriber whose state already matches returns
    /// immediately.
    pub async fn wait_for_state(
        &self,
        hash: [u8; 32],
        state: InvoiceState,
        timeout: Duration,
    ) -> Result<(), TrackerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for the next broadcast *before* checking state, so an
            // update landing between the check below and the await can't be
            // missed: `notify_waiters()` calls that happen after `notified()`
            // is created but before it is polled still wake it.
            let notified = self.state.changed.notified();

            {
                let guard = self.state.invoices.lock().await;
                if guard.get(&hash) == Some(&state) {
                    return Ok(());
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let guard = self.state.invoices.lock().await;
                return match guard.get(&hash) {
                    Some(observed) if *observed == state => Ok(()),
                    None => Err(TrackerError::NotFound),
                    Some(observed) => Err(TrackerError::WrongState(format!("{observed:?}"))),
                };
            }

            match tokio::time::timeout(remaining, notified).await {
                Ok(()) => continue,
                Err(_elapsed) => {
                    let guard = self.state.invoices.lock().await;
                    return match guard.get(&hash) {
                        Some(observed) if *observed == state => Ok(()),
                        None => Err(TrackerError::NotFound),
                        Some(observed) => Err(TrackerError::WrongState(format!("{observed:?}"))),
                    };
                }
            }
        }
    }

    /// Cancels the ingest subscription, and waits for the ingest task to
    /// finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.ingest_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "ingest task join error during shutdown");
            }
        }
        info!("invoice tracker shut down");
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeInvoiceSource;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_state_returns_immediately_if_already_settled() {
        let (source, tx) = FakeInvoiceSource::new(vec![]);
        let (err_tx, _err_rx) = tokio::sync::mpsc::channel(1);
        let tracker = InvoiceTracker::start(source, err_tx).await.unwrap();

        let hash = [5u8; 32];
        tx.send(InvoiceUpdate {
            payment_hash: hash,
            state: InvoiceState::Settled,
            add_index: 1,
            settle_index: 1,
            expired: false,
        })
        .await
        .unwrap();

        // Give the ingest loop a moment to process.
        tokio::time::sleep(Duration::from_millis(20)).await;

        tracker
            .wait_for_state(hash, InvoiceState::Settled, Duration::from_secs(1))
            .await
            .unwrap();

        // Late subscriber after settlement: still returns immediately.
        tracker
            .wait_for_state(hash, InvoiceState::Settled, Duration::from_millis(50))
            .await
            .unwrap();

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn wait_for_state_times_out_with_not_found_when_absent() {
        let (source, _tx) = FakeInvoiceSource::new(vec![]);
        let (err_tx, _err_rx) = tokio::sync::mpsc::channel(1);
        let tracker = InvoiceTracker::start(source, err_tx).await.unwrap();

        let err = tracker
            .wait_for_state([1u8; 32], InvoiceState::Settled, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound));

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn wait_for_state_times_out_with_wrong_state_when_present_but_different() {
        let (source, tx) = FakeInvoiceSource::new(vec![]);
        let (err_tx, _err_rx) = tokio::sync::mpsc::channel(1);
        let tracker = InvoiceTracker::start(source, err_tx).await.unwrap();

        let hash = [9u8; 32];
        tx.send(InvoiceUpdate {
            payment_hash: hash,
            state: InvoiceState::Open,
            add_index: 1,
            settle_index: 0,
            expired: false,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = tracker
            .wait_for_state(hash, InvoiceState::Settled, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::WrongState(_)));

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn empty_payment_hash_update_is_ignored() {
        let (source, tx) = FakeInvoiceSource::new(vec![]);
        let (err_tx, _err_rx) = tokio::sync::mpsc::channel(1);
        let tracker = InvoiceTracker::start(source, err_tx).await.unwrap();

        tx.send(InvoiceUpdate {
            payment_hash: [0u8; 32],
            state: InvoiceState::Settled,
            add_index: 1,
            settle_index: 1,
            expired: false,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = tracker
            .wait_for_state([0u8; 32], InvoiceState::Settled, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound));

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_after_settled_removes_entry() {
        let (source, tx) = FakeInvoiceSource::new(vec![]);
        let (err_tx, _err_rx) = tokio::sync::mpsc::channel(1);
        let tracker = InvoiceTracker::start(source, err_tx).await.unwrap();

        let hash = [3u8; 32];
        tx.send(InvoiceUpdate {
            payment_hash: hash,
            state: InvoiceState::Settled,
            add_index: 1,
            settle_index: 1,
            expired: false,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        tx.send(InvoiceUpdate {
            payment_hash: hash,
            state: InvoiceState::Cancelled,
            add_index: 2,
            settle_index: 1,
            expired: false,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = tracker
            .wait_for_state(hash, InvoiceState::Settled, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound));

        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn startup_skips_cancelled_and_expired_open_invoices() {
        let snapshot = vec![
            InvoiceSnapshot {
                payment_hash: [1u8; 32],
                state: InvoiceState::Cancelled,
                add_index: 1,
                settle_index: 0,
                expired: false,
            },
            InvoiceSnapshot {
                payment_hash: [2u8; 32],
                state: InvoiceState::Open,
                add_index: 2,
                settle_index: 0,
                expired: true,
            },
            InvoiceSnapshot {
                payment_hash: [3u8; 32],
                state: InvoiceState::Settled,
                add_index: 3,
                settle_index: 1,
                expired: false,
            },
        ];
        let (source, _tx) = FakeInvoiceSource::new(snapshot);
        let (err_tx, _err_rx) = tokio::sync::mpsc::channel(1);
        let tracker = InvoiceTracker::start(source, err_tx).await.unwrap();

        tracker
            .wait_for_state([3u8; 32], InvoiceState::Settled, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(
            tracker
                .wait_for_state([1u8; 32], InvoiceState::Cancelled, Duration::from_millis(10))
                .await,
            Err(TrackerError::NotFound)
        ));
        assert!(matches!(
            tracker
                .wait_for_state([2u8; 32], InvoiceState::Open, Duration::from_millis(10))
                .await,
            Err(TrackerError::NotFound)
        ));

        tracker.shutdown().await;
    }
}
