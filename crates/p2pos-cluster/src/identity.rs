//! Node key material and signature helpers.
//!
//! A node's identity is a single 32-byte ed25519 seed: the same bytes back
//! the transport's secret key and the [`NodeKey`] used to sign heartbeats
//! and snapshots, so the transport-level peer identifier *is* the signing
//! key's verifying key. [`verify_from_peer`] recovers that verifying key
//! straight from a [`PeerId`].

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use p2pos_types::PeerId;
use rand::RngCore as _;

use crate::error::ClusterError;

/// The node's exclusive ed25519 keypair.
///
/// Also used by the keygen CLI for system and administrator keypairs:
/// it is a plain ed25519 keypair wrapper, nothing node-specific beyond
/// the [`peer_id`](Self::peer_id) derivation.
#[derive(Clone)]
pub struct NodeKey {
    signing: SigningKey,
}

impl NodeKey {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Restore a keypair from its base64-encoded 32-byte seed.
    pub fn from_base64(encoded: &str) -> Result<Self, ClusterError> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| ClusterError::Decode(format!("node key: {e}")))?;
        let seed: [u8; 32] = raw
            .try_into()
            .map_err(|_| ClusterError::Key("node key must be a 32-byte seed".to_string()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// Base64 encoding of the 32-byte seed, for the configuration file.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.signing.to_bytes())
    }

    /// The raw seed, shared with the transport's secret key.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The peer id derived from this key's verifying half.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.signing.verifying_key().to_bytes())
    }

    /// Base64 encoding of the verifying key (public half).
    pub fn public_base64(&self) -> String {
        BASE64.encode(self.signing.verifying_key().to_bytes())
    }

    /// Sign a payload; the signature travels base64-encoded.
    pub fn sign_b64(&self, payload: &[u8]) -> String {
        BASE64.encode(self.signing.sign(payload).to_bytes())
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the seed.
        f.debug_struct("NodeKey")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Recover the ed25519 verifying key embedded in a peer id.
pub fn verifying_key_of(peer: &PeerId) -> Result<VerifyingKey, ClusterError> {
    VerifyingKey::from_bytes(peer.as_bytes())
        .map_err(|e| ClusterError::Key(format!("peer id is not a valid public key: {e}")))
}

/// Verify a base64 signature over `payload` with the key recoverable from
/// `peer`.
pub fn verify_from_peer(peer: &PeerId, payload: &[u8], sig_b64: &str) -> Result<(), ClusterError> {
    let key = verifying_key_of(peer)?;
    let raw = BASE64
        .decode(sig_b64.trim())
        .map_err(|e| ClusterError::Decode(format!("signature: {e}")))?;
    let sig = Signature::from_slice(&raw).map_err(|_| ClusterError::SignatureInvalid)?;
    key.verify(payload, &sig)
        .map_err(|_| ClusterError::SignatureInvalid)
}

/// The configured system public key.
///
/// When present, every admin proof must verify against it.
#[derive(Clone)]
pub struct SystemKey {
    verifying: VerifyingKey,
}

impl SystemKey {
    /// Parse a base64-encoded 32-byte ed25519 public key.
    pub fn from_base64(encoded: &str) -> Result<Self, ClusterError> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| ClusterError::Decode(format!("system_pubkey: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| ClusterError::Key("system_pubkey must be 32 bytes".to_string()))?;
        let verifying = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ClusterError::Key(format!("system_pubkey: {e}")))?;
        Ok(Self { verifying })
    }

    /// Verify a base64 signature over `payload`.
    pub fn verify(&self, payload: &[u8], sig_b64: &str) -> Result<(), ClusterError> {
        let raw = BASE64
            .decode(sig_b64.trim())
            .map_err(|e| ClusterError::Decode(format!("signature: {e}")))?;
        let sig =
            Signature::from_slice(&raw).map_err(|_| ClusterError::ProofSignatureInvalid)?;
        self.verifying
            .verify(payload, &sig)
            .map_err(|_| ClusterError::ProofSignatureInvalid)
    }
}

impl std::fmt::Debug for SystemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemKey")
            .field("key", &BASE64.encode(self.verifying.to_bytes()))
            .finish()
    }
}
