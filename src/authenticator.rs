//! Inspects request headers, invokes `Mint::verify` and
//! `InvoiceTracker::wait_for_state`, and emits challenge headers on failure.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bitcoin_hashes::{sha256, Hash};
use macaroon::{Format, Macaroon};
use regex::Regex;
use tracing::{debug, error, instrument};

use crate::caveat::Service;
use crate::error::AuthError;
use crate::invoice_tracker::{InvoiceState, InvoiceTracker};
use crate::mint::{Identifier, Mint, L402_RIGHT_EXPIRY_SECS};

/// Default bound `Authenticator::accept` waits for the invoice tracker to
/// observe settlement before giving up.
pub const DEFAULT_INVOICE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

const AUTH_HEADER_RE: &str = r"(?i)^(?:L402|LSAT)\s+([A-Za-z0-9+/=]+):([a-f0-9]{64})$";

/// A per-token observability state machine. The authorization decision does
/// not depend on this being persisted; it only drives log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Issued,
    AwaitingPayment,
    Settled,
    Active,
    Expired,
}

/// Glue between the HTTP layer, the [`Mint`], and the [`InvoiceTracker`].
pub struct Authenticator {
    mint: Mint,
    tracker: Arc<InvoiceTracker>,
    invoice_lookup_timeout: Duration,
    now: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Authenticator {
    pub fn new(mint: Mint, tracker: Arc<InvoiceTracker>) -> Self {
        Self {
            mint,
            tracker,
            invoice_lookup_timeout: DEFAULT_INVOICE_LOOKUP_TIMEOUT,
            now: Box::new(crate::secret_store::now_unix),
        }
    }

    pub fn with_invoice_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.invoice_lookup_timeout = timeout;
        self
    }

    /// Overrides the clock used for the final freshness bound. Test-only
    /// hook to exercise the 1-hour expiry boundary deterministically.
    #[cfg(test)]
    pub fn with_clock(mut self, now: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.now = Box::new(now);
        self
    }

    /// Returns whether `header` successfully authenticates the caller for
    /// `service_name`.
    #[instrument(skip(self, header))]
    pub async fn accept(&self, header: &str, service_name: &str) -> bool {
        match self.accept_inner(header, service_name).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "deny");
                false
            }
        }
    }

    async fn accept_inner(&self, header: &str, service_name: &str) -> Result<(), AuthError> {
        let (mac, preimage) = parse_authorization_header(header).ok_or(AuthError::MalformedHeader)?;

        self.mint.verify(&mac, &preimage, service_name).await?;

        let payment_hash = sha256::Hash::hash(&preimage).into_inner();
        self.tracker
            .wait_for_state(payment_hash, InvoiceState::Settled, self.invoice_lookup_timeout)
            .await?;
        debug!(state = ?TokenState::Settled, %service_name, "invoice settlement confirmed");

        if let Err(e) = self
            .mint
            .secret_store()
            .set_settled_at(payment_hash, (self.now)())
            .await
        {
            error!(error = %e, "failed to persist settlement, tracker state is authoritative for this process");
        }

        let identifier = Identifier::from_macaroon(&mac).map_err(AuthError::Verify)?;
        let created_at = self
            .mint
            .secret_store()
            .get_created_at(identifier.id_hash())
            .await
            .map_err(|_| AuthError::Expired)?;

        let now = (self.now)();
        if now - created_at >= L402_RIGHT_EXPIRY_SECS {
            debug!(state = ?TokenState::Expired, %service_name, "token past freshness bound");
            return Err(AuthError::Expired);
        }

        debug!(state = ?TokenState::Active, %service_name, "request authorized");
        Ok(())
    }

    /// Mints a fresh challenge for `service_name` and returns the
    /// `WWW-Authenticate` header value.
    #[instrument(skip(self))]
    pub async fn fresh_challenge_header(
        &self,
        service_name: &str,
        recipient_lud16: &str,
        price_sats: i64,
    ) -> Result<String, crate::error::MintError> {
        let service = Service::new(service_name, recipient_lud16, price_sats);
        debug!(state = ?TokenState::Issued, %service_name, "minting fresh challenge");
        let (mac, bolt11) = self.mint.mint(&[service]).await?;

        let mac_bytes = mac
            .serialize(Format::V1)
            .map_err(|e| crate::error::MintError::Macaroon(e.to_string()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(mac_bytes);

        let header = format!(r#"L402 macaroon="{encoded}", invoice="{bolt11}""#);
        debug!(state = ?TokenState::AwaitingPayment, %header, "issued fresh challenge");
        Ok(header)
    }
}

/// Parses `(macaroon, preimage)` from an `Authorization` header of the form
/// `L402 <base64-macaroon>:<hex-preimage>`, also accepting the legacy
/// `LSAT` scheme prefix.
fn parse_authorization_header(header: &str) -> Option<(Macaroon, [u8; 32])> {
    let re = Regex::new(AUTH_HEADER_RE).expect("static regex is valid");
    let caps = re.captures(header.trim())?;

    let mac_b64 = caps.get(1)?.as_str();
    let preimage_hex = caps.get(2)?.as_str();

    let mac_bytes = base64::engine::general_purpose::STANDARD.decode(mac_b64).ok()?;
    let mac_str = String::from_utf8(mac_bytes).ok()?;
    let mac = Macaroon::deserialize(&mac_str).ok()?;

    let preimage_bytes = hex::decode(preimage_hex).ok()?;
    let preimage: [u8; 32] = preimage_bytes.try_into().ok()?;

    Some((mac, preimage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenger::FakeChallenger;
    use crate::invoice_tracker::fakes::FakeInvoiceSource;
    use crate::invoice_tracker::InvoiceUpdate;
    use crate::secret_store::SledSecretStore;
    use std::sync::Arc;

    async fn authenticator() -> (Authenticator, tempfile::TempDir, tokio::sync::mpsc::Sender<InvoiceUpdate>) {
        let dir = tempfile::tempdir().unwrap();
        let store: crate::secret_store::SharedSecretStore = Arc::new(SledSecretStore::open(dir.path()).unwrap());
        let challenger: Arc<dyn crate::challenger::Challenger> = Arc::new(FakeChallenger::always_succeeds());
        let mint = Mint::new(store, challenger);

        let (source, tx) = FakeInvoiceSource::new(vec![]);
        let (err_tx, _err_rx) = tokio::sync::mpsc::channel(1);
        let tracker = Arc::new(InvoiceTracker::start(source, err_tx).await.unwrap());

        (
            Authenticator::new(mint, tracker).with_invoice_lookup_timeout(Duration::from_millis(200)),
            dir,
            tx,
        )
    }

    #[tokio::test]
    async fn happy_path_accept_succeeds_after_settlement() {
        let (auth, _dir, tx) = authenticator().await;

        let header = auth
            .fresh_challenge_header("demo", "alice@example.com", 1_000)
            .await
            .unwrap();

        let mac_b64 = extract_macaroon_b64(&header);
        let preimage = FakeChallenger::preimage_for([0u8; 32]);
        let payment_hash = sha256::Hash::hash(&preimage).into_inner();

        tx.send(InvoiceUpdate {
            payment_hash,
            state: InvoiceState::Settled,
            add_index: 1,
            settle_index: 1,
            expired: false,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let auth_header = format!("L402 {}:{}", mac_b64, hex::encode(preimage));
        assert!(auth.accept(&auth_header, "demo").await);
    }

    #[tokio::test]
    async fn wrong_preimage_is_denied() {
        let (auth, _dir, _tx) = authenticator().await;
        let header = auth
            .fresh_challenge_header("demo", "alice@example.com", 1_000)
            .await
            .unwrap();
        let mac_b64 = extract_macaroon_b64(&header);

        let auth_header = format!("L402 {}:{}", mac_b64, hex::encode([0u8; 32]));
        assert!(!auth.accept(&auth_header, "demo").await);
    }

    #[tokio::test]
    async fn expired_token_is_denied() {
        let (auth, _dir, tx) = authenticator().await;

        let header = auth
            .fresh_challenge_header("demo", "alice@example.com", 1_000)
            .await
            .unwrap();
        let mac_b64 = extract_macaroon_b64(&header);
        let preimage = FakeChallenger::preimage_for([0u8; 32]);
        let payment_hash = sha256::Hash::hash(&preimage).into_inner();

        // Advance the clock past the 1-hour freshness bound, relative to the
        // token's actual `created_at`, rather than an absolute timestamp.
        let (mac, _) = parse_authorization_header(&format!(
            "L402 {}:{}",
            mac_b64,
            hex::encode(preimage)
        ))
        .unwrap();
        let identifier = Identifier::from_macaroon(&mac).unwrap();
        let created_at = auth
            .mint
            .secret_store()
            .get_created_at(identifier.id_hash())
            .await
            .unwrap();
        let auth = auth.with_clock(move || created_at + L402_RIGHT_EXPIRY_SECS + 1);

        tx.send(InvoiceUpdate {
            payment_hash,
            state: InvoiceState::Settled,
            add_index: 1,
            settle_index: 1,
            expired: false,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let auth_header = format!("L402 {}:{}", mac_b64, hex::encode(preimage));
        assert!(!auth.accept(&auth_header, "demo").await);
    }

    #[tokio::test]
    async fn malformed_header_is_denied() {
        let (auth, _dir, _tx) = authenticator().await;
        assert!(!auth.accept("not a valid header", "demo").await);
    }

    #[tokio::test]
    async fn legacy_lsat_prefix_is_accepted_by_parser() {
        let (auth, _dir, tx) = authenticator().await;
        let header = auth
            .fresh_challenge_header("demo", "alice@example.com", 1_000)
            .await
            .unwrap();
        let mac_b64 = extract_macaroon_b64(&header);
        let preimage = FakeChallenger::preimage_for([0u8; 32]);
        let payment_hash = sha256::Hash::hash(&preimage).into_inner();

        tx.send(InvoiceUpdate {
            payment_hash,
            state: InvoiceState::Settled,
            add_index: 1,
            settle_index: 1,
            expired: false,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let auth_header = format!("LSAT {}:{}", mac_b64, hex::encode(preimage));
        assert!(auth.accept(&auth_header, "demo").await);
    }

    fn extract_macaroon_b64(header: &str) -> String {
        let re = Regex::new(r#"macaroon="([^"]+)""#).unwrap();
        re.captures(header).unwrap().get(1).unwrap().as_str().to_string()
    }
}
