//! Macaroon issuance, caveat attachment, and verification of presented
//! tokens against the persisted secret store.

use std::sync::Arc;

use bitcoin_hashes::{sha256, Hash};
use macaroon::{ByteString, Caveat as MacCaveat, Format, Macaroon, MacaroonKey, Verifier};
use rand::RngCore;
use tracing::{debug, instrument};

use crate::caveat::{self, Caveat, Service};
use crate::challenger::Challenger;
use crate::error::{MintError, VerifyError};
use crate::satisfier::{
    capabilities_attenuation_satisfier, capabilities_satisfier, services_satisfier, timeout_satisfier,
    SatisfierRegistry,
};
use crate::secret_store::{now_unix, SharedSecretStore};

/// Fixed layout size of a macaroon identifier: `version(2) | payment_hash(32) | token_id(32)`.
pub const IDENTIFIER_SIZE: usize = 2 + 32 + 32;
const ID_VERSION: u16 = 0;

/// Default duration an L402's rights remain valid for, from mint time.
pub const L402_RIGHT_EXPIRY_SECS: i64 = 3_600;

/// The macaroon identifier blob: `version | payment_hash | token_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier {
    pub version: u16,
    pub payment_hash: [u8; 32],
    pub token_id: [u8; 32],
}

impl Identifier {
    pub fn new(payment_hash: [u8; 32]) -> Self {
        let mut token_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_id);
        Self {
            version: ID_VERSION,
            payment_hash,
            token_id,
        }
    }

    pub fn to_bytes(self) -> [u8; IDENTIFIER_SIZE] {
        let mut out = [0u8; IDENTIFIER_SIZE];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..34].copy_from_slice(&self.payment_hash);
        out[34..66].copy_from_slice(&self.token_id);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VerifyError> {
        if bytes.len() != IDENTIFIER_SIZE {
            return Err(VerifyError::MalformedIdentifier);
        }
        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if version != ID_VERSION {
            return Err(VerifyError::MalformedIdentifier);
        }
        let mut payment_hash = [0u8; 32];
        payment_hash.copy_from_slice(&bytes[2..34]);
        let mut token_id = [0u8; 32];
        token_id.copy_from_slice(&bytes[34..66]);
        Ok(Self {
            version,
            payment_hash,
            token_id,
        })
    }

    pub fn id_hash(&self) -> [u8; 32] {
        sha256::Hash::hash(&self.to_bytes()).into_inner()
    }

    fn to_macaroon_identifier(self) -> ByteString {
        ByteString::from(hex::encode(self.to_bytes()))
    }

    pub(crate) fn from_macaroon(mac: &Macaroon) -> Result<Self, VerifyError> {
        let hex_id = mac.identifier();
        let bytes = hex::decode(hex_id).map_err(|_| VerifyError::MalformedIdentifier)?;
        Self::from_bytes(&bytes)
    }
}

/// Orchestrates the challenger, secret store, and satisfier registry to mint
/// and verify L402 macaroons.
pub struct Mint {
    secret_store: SharedSecretStore,
    challenger: Arc<dyn Challenger>,
    right_expiry_secs: i64,
}

impl Mint {
    pub fn new(secret_store: SharedSecretStore, challenger: Arc<dyn Challenger>) -> Self {
        Self {
            secret_store,
            challenger,
            right_expiry_secs: L402_RIGHT_EXPIRY_SECS,
        }
    }

    pub fn with_right_expiry(mut self, secs: i64) -> Self {
        self.right_expiry_secs = secs;
        self
    }

    /// Mints a macaroon authorizing `services` and returns it along with the
    /// bolt11 payment request the caller must pay.
    #[instrument(skip(self, services), fields(count = services.len()))]
    pub async fn mint(&self, services: &[Service]) -> Result<(Macaroon, String), MintError> {
        if services.is_empty() {
            return Err(MintError::NoServices);
        }
        let primary = &services[0];

        let (bolt11, payment_hash) = self
            .challenger
            .new_challenge(&primary.recipient_lud16, primary.price_sats)
            .await?;

        let identifier = Identifier::new(payment_hash);
        let id_hash = identifier.id_hash();

        let mut secret = [0u8; crate::secret_store::SECRET_SIZE];
        rand::thread_rng().fill_bytes(&mut secret);

        let created_at = now_unix();
        self.secret_store
            .insert_secret(id_hash, payment_hash, secret, created_at)
            .await?;

        let macaroon_key = MacaroonKey::generate(&secret);
        let mut mac = Macaroon::create(None, &macaroon_key, identifier.to_macaroon_identifier())
            .map_err(|e| MintError::Macaroon(e.to_string()))?;

        let services_caveat = caveat::services_caveat(services)?;
        mac.add_first_party_caveat(ByteString::from(services_caveat.encode()));

        let timeout_caveat = caveat::encode_timeout(primary, created_at, self.right_expiry_secs);
        mac.add_first_party_caveat(ByteString::from(timeout_caveat.encode()));

        debug!(id_hash = %hex::encode(id_hash), "minted new L402");
        Ok((mac, bolt11))
    }

    /// Verifies a presented macaroon + preimage pair against `target_service`.
    #[instrument(skip(self, mac, preimage))]
    pub async fn verify(
        &self,
        mac: &Macaroon,
        preimage: &[u8; 32],
        target_service: &str,
    ) -> Result<(), VerifyError> {
        let identifier = Identifier::from_macaroon(mac)?;

        let preimage_hash = sha256::Hash::hash(preimage).into_inner();
        if preimage_hash != identifier.payment_hash {
            return Err(VerifyError::PaymentHashMismatch);
        }

        let id_hash = identifier.id_hash();
        let secret = self
            .secret_store
            .get_secret(id_hash)
            .await
            .map_err(|_| VerifyError::Unauthorized)?;

        let macaroon_key = MacaroonKey::generate(&secret);

        let mut verifier = Verifier::default();
        // Caveat satisfaction is handled by our own registry below; the
        // crate's own verifier is used for signature verification only.
        verifier.satisfy_general(|_: &ByteString| true);
        verifier
            .verify(mac, &macaroon_key, Default::default())
            .map_err(|_| VerifyError::InvalidSignature)?;

        let caveats = extract_caveats(mac)?;

        let mut registry = SatisfierRegistry::new();
        registry.register(services_satisfier(target_service));
        if caveats
            .iter()
            .any(|c| c.condition == format!("{target_service}_capabilities"))
        {
            // A capability restriction was attached by the client; enforce
            // that it only ever narrows, even though this entry point has no
            // specific capability to check the final caveat against. Callers
            // that need to require a specific capability use
            // `verify_with_capability` instead.
            registry.register(capabilities_attenuation_satisfier(target_service));
        }
        registry.register(timeout_satisfier(target_service, now_unix));

        registry
            .verify(&caveats)
            .map_err(VerifyError::CaveatUnsatisfied)?;

        Ok(())
    }

    /// As [`Mint::verify`], additionally requiring `target_capability` be
    /// authorized by any `<target_service>_capabilities` caveat present.
    pub async fn verify_with_capability(
        &self,
        mac: &Macaroon,
        preimage: &[u8; 32],
        target_service: &str,
        target_capability: &str,
    ) -> Result<(), VerifyError> {
        let identifier = Identifier::from_macaroon(mac)?;
        let preimage_hash = sha256::Hash::hash(preimage).into_inner();
        if preimage_hash != identifier.payment_hash {
            return Err(VerifyError::PaymentHashMismatch);
        }

        let id_hash = identifier.id_hash();
        let secret = self
            .secret_store
            .get_secret(id_hash)
            .await
            .map_err(|_| VerifyError::Unauthorized)?;
        let macaroon_key = MacaroonKey::generate(&secret);

        let mut verifier = Verifier::default();
        verifier.satisfy_general(|_: &ByteString| true);
        verifier
            .verify(mac, &macaroon_key, Default::default())
            .map_err(|_| VerifyError::InvalidSignature)?;

        let caveats = extract_caveats(mac)?;

        let mut registry = SatisfierRegistry::new();
        registry.register(services_satisfier(target_service));
        registry.register(capabilities_satisfier(target_service, target_capability));
        registry.register(timeout_satisfier(target_service, now_unix));

        registry
            .verify(&caveats)
            .map_err(VerifyError::CaveatUnsatisfied)
    }

    pub fn secret_store(&self) -> &SharedSecretStore {
        &self.secret_store
    }

    /// Whether `payment_hash` has a durable settlement record, independent
    /// of the in-memory tracker. Used on restart, when the tracker has lost
    /// its state and re-ingests invoices from the Lightning node.
    pub async fn is_settled_durable(&self, payment_hash: [u8; 32]) -> bool {
        matches!(self.secret_store.get_settled_at(payment_hash).await, Ok(Some(_)))
    }
}

fn extract_caveats(mac: &Macaroon) -> Result<Vec<Caveat>, VerifyError> {
    mac.caveats()
        .iter()
        .filter_map(|c| match c {
            MacCaveat::FirstParty(p) => Some(p.predicate().to_string()),
            _ => None,
        })
        .map(|predicate| Caveat::decode(&predicate).map_err(|_| VerifyError::MalformedIdentifier))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenger::FakeChallenger;
    use crate::secret_store::SledSecretStore;

    fn mint_for_test() -> (Mint, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedSecretStore = Arc::new(SledSecretStore::open(dir.path()).unwrap());
        let challenger: Arc<dyn Challenger> = Arc::new(FakeChallenger::always_succeeds());
        (Mint::new(store, challenger), dir)
    }

    fn preimage_for(payment_hash: [u8; 32]) -> [u8; 32] {
        // FakeChallenger derives payment_hash = sha256(preimage) from a
        // fixed preimage, so tests can recover it directly.
        crate::challenger::FakeChallenger::preimage_for(payment_hash)
    }

    #[tokio::test]
    async fn mint_then_verify_with_honest_preimage_succeeds() {
        let (mint, _dir) = mint_for_test();
        let services = vec![Service::new("demo", "alice@x.com", 1_000)];
        let (mac, _bolt11) = mint.mint(&services).await.unwrap();

        let identifier = Identifier::from_macaroon(&mac).unwrap();
        let preimage = preimage_for(identifier.payment_hash);

        mint.verify(&mac, &preimage, "demo").await.unwrap();
    }

    #[tokio::test]
    async fn verify_wrong_preimage_rejected() {
        let (mint, _dir) = mint_for_test();
        let services = vec![Service::new("demo", "alice@x.com", 1_000)];
        let (mac, _bolt11) = mint.mint(&services).await.unwrap();

        let err = mint.verify(&mac, &[0u8; 32], "demo").await.unwrap_err();
        assert!(matches!(err, VerifyError::PaymentHashMismatch));
    }

    #[tokio::test]
    async fn empty_services_rejected() {
        let (mint, _dir) = mint_for_test();
        let err = mint.mint(&[]).await.unwrap_err();
        assert!(matches!(err, MintError::NoServices));
    }

    #[tokio::test]
    async fn attenuated_service_request_for_disallowed_service_rejected() {
        let (mint, _dir) = mint_for_test();
        let services = vec![Service::new("a", "alice@x.com", 1_000), Service::new("b", "alice@x.com", 1_000)];
        let (mut mac, _bolt11) = mint.mint(&services).await.unwrap();

        mac.add_first_party_caveat(ByteString::from(Caveat::new("services", "a:0").encode()));

        let identifier = Identifier::from_macaroon(&mac).unwrap();
        let preimage = preimage_for(identifier.payment_hash);

        mint.verify(&mac, &preimage, "a").await.unwrap();
        let err = mint.verify(&mac, &preimage, "b").await.unwrap_err();
        match err {
            VerifyError::CaveatUnsatisfied(msg) => assert!(msg.contains("not previously allowed")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn attached_capabilities_caveat_must_only_narrow_on_plain_verify() {
        let (mint, _dir) = mint_for_test();
        let services = vec![Service::new("demo", "alice@x.com", 1_000)];
        let (mut mac, _bolt11) = mint.mint(&services).await.unwrap();

        mac.add_first_party_caveat(ByteString::from(Caveat::new("demo_capabilities", "read,write").encode()));
        mac.add_first_party_caveat(ByteString::from(Caveat::new("demo_capabilities", "read,write,admin").encode()));

        let identifier = Identifier::from_macaroon(&mac).unwrap();
        let preimage = preimage_for(identifier.payment_hash);

        let err = mint.verify(&mac, &preimage, "demo").await.unwrap_err();
        match err {
            VerifyError::CaveatUnsatisfied(msg) => assert!(msg.contains("not previously allowed")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn identifier_round_trips_through_bytes() {
        let id = Identifier::new([7u8; 32]);
        let bytes = id.to_bytes();
        let parsed = Identifier::from_bytes(&bytes).unwrap();
        assert_eq!(id, parsed);
    }
}
