//! LND-backed [`InvoiceSource`]: the Lightning node collaborator the
//! invoice tracker ingests from. The node itself is external to the core
//! and specified only by the messages exchanged (`ListInvoices`,
//! `SubscribeInvoices`); this module is the concrete gRPC adapter a
//! deployment wires in.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic_lnd::lnrpc::{self, GetInfoResponse, InvoiceSubscription, ListInvoiceRequest};
use tonic_lnd::tonic::Streaming;
use tracing::{error, info};

use crate::error::TrackerError;
use crate::invoice_tracker::{InvoiceSnapshot, InvoiceSource, InvoiceState, InvoiceUpdate};

/// Bound on the page size requested from `ListInvoices` at startup, per the
/// "bounded by backend's max-page convention" design note.
const LIST_INVOICES_MAX_PAGE: u64 = 1_000;

/// Thin, clonable wrapper around the generated LND gRPC client.
pub struct Client {
    lnd: Arc<Mutex<tonic_lnd::Client>>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self { lnd: self.lnd.clone() }
    }
}

impl Client {
    pub async fn init(host: String, tls_path: String, mac_path: String) -> Client {
        let client = tonic_lnd::connect(host, tls_path, mac_path)
            .await
            .expect("failed to connect to lnd");
        Self {
            lnd: Arc::new(Mutex::new(client)),
        }
    }

    pub async fn get_info(&self) -> Result<GetInfoResponse, tonic_lnd::tonic::Status> {
        Ok(self
            .lnd
            .lock()
            .await
            .lightning()
            .get_info(lnrpc::GetInfoRequest {})
            .await?
            .into_inner())
    }
}

fn invoice_state_of(raw: i32) -> InvoiceState {
    match lnrpc::invoice::InvoiceState::from_i32(raw) {
        Some(lnrpc::invoice::InvoiceState::Settled) => InvoiceState::Settled,
        Some(lnrpc::invoice::InvoiceState::Canceled) => InvoiceState::Cancelled,
        Some(lnrpc::invoice::InvoiceState::Accepted) => InvoiceState::Accepted,
        _ => InvoiceState::Open,
    }
}

fn payment_hash_of(inv: &lnrpc::Invoice) -> [u8; 32] {
    let mut out = [0u8; 32];
    let n = inv.r_hash.len().min(32);
    out[..n].copy_from_slice(&inv.r_hash[..n]);
    out
}

fn is_expired(inv: &lnrpc::Invoice) -> bool {
    let now = crate::secret_store::now_unix();
    inv.creation_date + inv.expiry < now
}

/// Implements [`InvoiceSource`] by driving LND's `ListInvoices` at startup
/// and a long-lived `SubscribeInvoices` stream afterward.
pub struct LndInvoiceSource {
    client: Client,
    subscription: Mutex<Option<Streaming<lnrpc::Invoice>>>,
}

impl LndInvoiceSource {
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Self {
            client,
            subscription: Mutex::new(None),
        })
    }

    async fn ensure_subscribed(&self, add_index: u64, settle_index: u64) -> Result<(), TrackerError> {
        let mut guard = self.subscription.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        info!(add_index, settle_index, "subscribing to LND invoice updates");
        let stream = self
            .client
            .lnd
            .lock()
            .await
            .lightning()
            .subscribe_invoices(InvoiceSubscription {
                add_index,
                settle_index,
            })
            .await
            .map_err(|e| TrackerError::StreamError(e.to_string()))?
            .into_inner();
        *guard = Some(stream);
        Ok(())
    }
}

#[async_trait]
impl InvoiceSource for LndInvoiceSource {
    async fn list_invoices(&self) -> Result<Vec<InvoiceSnapshot>, TrackerError> {
        let resp = self
            .client
            .lnd
            .lock()
            .await
            .lightning()
            .list_invoices(ListInvoiceRequest {
                pending_only: false,
                index_offset: 0,
                num_max_invoices: LIST_INVOICES_MAX_PAGE,
                reversed: true,
            })
            .await
            .map_err(|e| TrackerError::StreamError(e.to_string()))?
            .into_inner();

        Ok(resp
            .invoices
            .iter()
            .map(|inv| InvoiceSnapshot {
                payment_hash: payment_hash_of(inv),
                state: invoice_state_of(inv.state),
                add_index: inv.add_index,
                settle_index: inv.settle_index,
                expired: is_expired(inv),
            })
            .collect())
    }

    async fn next_update(&self, add_index: u64, settle_index: u64) -> Result<InvoiceUpdate, TrackerError> {
        self.ensure_subscribed(add_index, settle_index).await?;

        let mut guard = self.subscription.lock().await;
        let stream = guard.as_mut().expect("subscribed above");
        match stream.message().await {
            Ok(Some(inv)) => Ok(InvoiceUpdate {
                payment_hash: payment_hash_of(&inv),
                state: invoice_state_of(inv.state),
                add_index: inv.add_index,
                settle_index: inv.settle_index,
                expired: is_expired(&inv),
            }),
            Ok(None) => {
                *guard = None;
                Err(TrackerError::StreamEof)
            }
            Err(status) => {
                *guard = None;
                if status.code() == tonic_lnd::tonic::Code::Cancelled {
                    Err(TrackerError::Cancelled)
                } else {
                    error!(error = %status, "invoice subscription stream error");
                    Err(TrackerError::StreamError(status.to_string()))
                }
            }
        }
    }
}
