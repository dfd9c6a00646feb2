//! Message signing.
//!
//! A sender may sign a [`crate::message_bus::Envelope`] with an Ed25519 key; recipients verify
//! against a known public key if one is on file. The default policy is "accept unsigned if no
//! authorized-keys file is present" — callers that want strict rejection of unsigned traffic
//! populate [`AuthorizedKeys`] and flip [`SigningPolicy::reject_unsigned_from_known_senders`].
//!
//! `ed25519-dalek` is not part of the chosen teacher's own root `Cargo.toml` (it ships in the
//! same author's sibling `mentisdb` package) — pulled in here because detached-signature
//! verification is needed and the teacher's own stack has no signing primitive; see DESIGN.md.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug)]
pub enum SigningError {
    InvalidKey(String),
    InvalidSignature(String),
}

impl fmt::Display for SigningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningError::InvalidKey(m) => write!(f, "invalid signing key: {}", m),
            SigningError::InvalidSignature(m) => write!(f, "invalid signature: {}", m),
        }
    }
}

impl std::error::Error for SigningError {}

/// SHA-256 hex digest of `content`, used as the `content-hash` component of the signed string.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The exact byte string signed/verified: `id|from|to|timestamp|nonce|content-hash`.
pub fn signing_payload(
    id: &str,
    from: &str,
    to: &str,
    timestamp: &str,
    nonce: &str,
    content: &str,
) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        id,
        from,
        to,
        timestamp,
        nonce,
        content_hash(content)
    )
}

/// A sender's keypair, used to produce detached signatures over outgoing envelopes.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh keypair (used by tests and first-run bootstrap).
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Identity {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Load from 32 raw secret-key bytes (the on-disk format behind `identityPath`).
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Identity {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex_encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Produce a detached hex-encoded signature over the canonical payload.
    pub fn sign(&self, id: &str, from: &str, to: &str, timestamp: &str, nonce: &str, content: &str) -> String {
        let payload = signing_payload(id, from, to, timestamp, nonce, content);
        let sig: Signature = self.signing_key.sign(payload.as_bytes());
        hex_encode(&sig.to_bytes())
    }
}

/// The set of public keys the recipient trusts, keyed by agent id. Loaded once from an
/// operator-provisioned "authorized keys" file; absence of this set is what makes unsigned
/// traffic acceptable by default (see module docs).
#[derive(Default, Clone)]
pub struct AuthorizedKeys {
    keys: HashMap<String, VerifyingKey>,
}

impl AuthorizedKeys {
    pub fn empty() -> Self {
        AuthorizedKeys {
            keys: HashMap::new(),
        }
    }

    pub fn insert(&mut self, agent_id: impl Into<String>, public_key_hex: &str) -> Result<(), SigningError> {
        let bytes = hex_decode(public_key_hex)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKey("expected 32 bytes".into()))?;
        let vk = VerifyingKey::from_bytes(&arr).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        self.keys.insert(agent_id.into(), vk);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.keys.contains_key(agent_id)
    }

    /// Verify a detached signature for `agent_id`'s known key. Returns `Err` only when the
    /// sender is known and the signature is invalid; callers decide separately whether an
    /// unsigned message from an unknown sender is acceptable.
    pub fn verify(
        &self,
        agent_id: &str,
        id: &str,
        from: &str,
        to: &str,
        timestamp: &str,
        nonce: &str,
        content: &str,
        signature_hex: &str,
    ) -> Result<bool, SigningError> {
        let vk = match self.keys.get(agent_id) {
            Some(vk) => vk,
            None => return Ok(true), // unknown sender: not ours to vouch for
        };
        let sig_bytes = hex_decode(signature_hex)
            .map_err(|e| SigningError::InvalidSignature(e.to_string()))?;
        let sig_arr: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| SigningError::InvalidSignature("expected 64 bytes".into()))?;
        let sig = Signature::from_bytes(&sig_arr);
        let payload = signing_payload(id, from, to, timestamp, nonce, content);
        Ok(vk.verify(payload.as_bytes(), &sig).is_ok())
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

/// Policy governing how the message bus treats unsigned envelopes.
#[derive(Clone, Copy, Debug)]
pub struct SigningPolicy {
    /// If true, an unsigned message from a sender present in [`AuthorizedKeys`] is rejected.
    /// Default `false`: unsigned is accepted whenever there is no authorized-keys file at all,
    /// and tolerated even for known senders unless the deployment opts into strict mode.
    pub reject_unsigned_from_known_senders: bool,
}

impl Default for SigningPolicy {
    fn default() -> Self {
        SigningPolicy {
            reject_unsigned_from_known_senders: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let identity = Identity::generate();
        let sig = identity.sign("id1", "a", "b", "t1", "n1", "hello");
        let mut keys = AuthorizedKeys::empty();
        keys.insert("a", &identity.public_key_hex()).unwrap();
        assert!(keys.verify("a", "id1", "a", "b", "t1", "n1", "hello", &sig).unwrap());
    }

    #[test]
    fn tampered_content_fails_verification() {
        let identity = Identity::generate();
        let sig = identity.sign("id1", "a", "b", "t1", "n1", "hello");
        let mut keys = AuthorizedKeys::empty();
        keys.insert("a", &identity.public_key_hex()).unwrap();
        assert!(!keys.verify("a", "id1", "a", "b", "t1", "n1", "goodbye", &sig).unwrap());
    }

    #[test]
    fn unknown_sender_is_vouched_true() {
        let keys = AuthorizedKeys::empty();
        assert!(keys.verify("unknown", "id1", "a", "b", "t1", "n1", "hello", "00").unwrap());
    }
}
