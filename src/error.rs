//! Typed error taxonomy for the gateway core.
//!
//! Every subsystem gets its own `thiserror` enum; [`ErrorKind`] buckets each
//! variant into the policy classes from the design's error handling section
//! (transient / authorization / minting / fatal) so callers can decide how to
//! log and respond without string matching.

use thiserror::Error;

/// Coarse bucket a concrete error falls into, used to decide logging level
/// and client-facing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Safe to retry: DB serialization conflict, transient network error.
    Transient,
    /// Caller is not authorized; respond with a fresh challenge.
    Authorization,
    /// Minting itself failed; surface as an internal error.
    Minting,
    /// The invoice tracker's ingest loop died and needs a restart.
    FatalTracker,
}

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret not found")]
    NotFound,
    #[error("id_hash already present")]
    Duplicate,
    #[error("transaction conflict, retries exhausted")]
    RetriesExhausted,
    #[error("backend error: {0}")]
    Backend(String),
}

impl SecretStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretStoreError::NotFound => ErrorKind::Authorization,
            SecretStoreError::Duplicate => ErrorKind::Minting,
            SecretStoreError::RetriesExhausted => ErrorKind::Transient,
            SecretStoreError::Backend(_) => ErrorKind::Minting,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaveatError {
    #[error("no services found")]
    NoServices,
    #[error("missing service name")]
    MissingName,
    #[error("service must be of the form \"name:tier\"")]
    InvalidService,
    #[error("caveat value is not a valid integer")]
    InvalidTimestamp,
    #[error("malformed caveat, expected \"condition=value\"")]
    MalformedCaveat,
}

#[derive(Debug, Error)]
pub enum MintError {
    #[error("no services provided")]
    NoServices,
    #[error("challenge generation failed: {0}")]
    Challenge(#[from] ChallengeError),
    #[error("secret store error: {0}")]
    SecretStore(#[from] SecretStoreError),
    #[error("caveat error: {0}")]
    Caveat(#[from] CaveatError),
    #[error("macaroon construction failed: {0}")]
    Macaroon(String),
}

impl MintError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Minting
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed macaroon identifier")]
    MalformedIdentifier,
    #[error("preimage does not hash to the identifier's payment hash")]
    PaymentHashMismatch,
    #[error("secret not found for macaroon")]
    Unauthorized,
    #[error("macaroon signature invalid")]
    InvalidSignature,
    #[error("caveat not satisfied: {0}")]
    CaveatUnsatisfied(String),
}

impl VerifyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Authorization
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no entry present for payment hash")]
    NotFound,
    #[error("observed invoice state {0:?} does not match expected state")]
    WrongState(String),
    #[error("invoice subscription ended (EOF)")]
    StreamEof,
    #[error("invoice subscription error: {0}")]
    StreamError(String),
    #[error("invoice subscription cancelled")]
    Cancelled,
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::NotFound | TrackerError::WrongState(_) => ErrorKind::Authorization,
            TrackerError::StreamEof | TrackerError::StreamError(_) => ErrorKind::FatalTracker,
            TrackerError::Cancelled => ErrorKind::Transient,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("invalid lud16 address: {0}")]
    InvalidLud16(String),
    #[error("lnurl endpoint returned non-OK status: {0}")]
    LnurlNotOk(String),
    #[error("lnurl response missing callback")]
    MissingCallback,
    #[error("lnurl callback returned non-OK status or missing invoice")]
    CallbackFailed,
    #[error("wrapping proxy returned an error: {0}")]
    ProxyError(String),
    #[error("wrapping proxy response missing proxy_invoice")]
    ProxyMissingInvoice,
    #[error("failed to decode bolt11 invoice: {0}")]
    Bolt11Decode(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ChallengeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChallengeError::Network(_) => ErrorKind::Transient,
            _ => ErrorKind::Minting,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed Authorization header")]
    MalformedHeader,
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("invoice not settled: {0}")]
    NotSettled(#[from] TrackerError),
    #[error("token expired")]
    Expired,
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Authorization
    }
}
