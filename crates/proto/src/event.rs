//! Signed, content-addressed events.
//!
//! An event is immutable once signed: its `id` is the sha256 of a canonical
//! serialization of the remaining fields, and `sig` is a Schnorr signature
//! over that hash by the author key. This module implements the canonical
//! serialization, id computation, signing, verification, and the kind
//! classification used by the storage and broadcast paths.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{schnorr, Keypair, Message, SecretKey, XOnlyPublicKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Kind used for event deletion requests.
pub const KIND_DELETION: u16 = 5;

/// Kind used for client-to-relay authentication responses.
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// Kinds whose visibility defaults to author-and-recipients only.
///
/// Encrypted direct message, seal, gift wrap, application-specific data.
/// The relay treats this as a default; the effective set is configuration.
pub const DEFAULT_PRIVILEGED_KINDS: [u16; 4] = [4, 13, 1059, 30078];

/// A signed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex sha256 of the canonical serialization
    pub id: String,
    /// 32-byte lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Ordered sequence of tags, each an ordered sequence of strings
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-byte lowercase hex Schnorr signature
    pub sig: String,
}

/// An event before signing; the id and signature are derived from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Storage treatment of an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Stored as-is
    Regular,
    /// Only the latest event per author+kind is retained
    Replaceable,
    /// Broadcast but never stored
    Ephemeral,
    /// Only the latest event per author+kind+`d` tag is retained
    Addressable,
}

/// Classify a kind for storage purposes.
pub fn classify_kind(kind: u16) -> KindClass {
    let k = kind as u32;
    if (10000..20000).contains(&k) || k == 0 || k == 3 {
        KindClass::Replaceable
    } else if (20000..30000).contains(&k) {
        KindClass::Ephemeral
    } else if (30000..40000).contains(&k) {
        KindClass::Addressable
    } else {
        KindClass::Regular
    }
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

impl Event {
    /// Canonical serialization: `[0, pubkey, created_at, kind, tags, content]`.
    ///
    /// The id must equal the sha256 of exactly these bytes.
    pub fn canonical(&self) -> Result<String, ProtoError> {
        canonical_serialization(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Recompute the id from the canonical serialization.
    pub fn compute_id(&self) -> Result<String, ProtoError> {
        let canonical = self.canonical()?;
        let hash = sha256::Hash::hash(canonical.as_bytes());
        Ok(hex::encode(hash.as_byte_array()))
    }

    /// Structural validation: hex field shapes, without any crypto.
    pub fn validate_shape(&self) -> bool {
        is_lower_hex(&self.id, 64) && is_lower_hex(&self.pubkey, 64) && is_lower_hex(&self.sig, 128)
    }

    /// Verify that the id matches the canonical hash and the signature
    /// verifies against the author key.
    ///
    /// Returns `Ok(false)` for a well-formed event that fails either check;
    /// `Err` only for events too malformed to attempt verification.
    pub fn verify(&self) -> Result<bool, ProtoError> {
        if !self.validate_shape() {
            return Ok(false);
        }
        if self.compute_id()? != self.id {
            return Ok(false);
        }
        let secp = Secp256k1::verification_only();
        let id_bytes = hex::decode(&self.id)
            .map_err(|e| ProtoError::Verification(format!("invalid id hex: {}", e)))?;
        let message = Message::from_digest_slice(&id_bytes)
            .map_err(|e| ProtoError::Verification(format!("invalid message: {}", e)))?;
        let sig_bytes = hex::decode(&self.sig)
            .map_err(|e| ProtoError::Verification(format!("invalid sig hex: {}", e)))?;
        let sig = schnorr::Signature::from_slice(&sig_bytes)
            .map_err(|e| ProtoError::Verification(format!("invalid signature: {}", e)))?;
        let pubkey_bytes = hex::decode(&self.pubkey)
            .map_err(|e| ProtoError::Verification(format!("invalid pubkey hex: {}", e)))?;
        let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|e| ProtoError::Verification(format!("invalid pubkey: {}", e)))?;
        Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
    }

    /// Storage classification of this event's kind.
    pub fn kind_class(&self) -> KindClass {
        classify_kind(self.kind)
    }

    /// All values of tags named `name` (second element of each matching tag).
    pub fn tag_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        // owned so the iterator borrows only the event
        let name = name.to_owned();
        self.tags
            .iter()
            .filter(move |t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// First value of a tag named `name`, if present.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tag_values(name).next()
    }

    /// The parties to this event: the author plus every `p`-tagged recipient.
    pub fn parties(&self) -> Vec<&str> {
        let mut parties = vec![self.pubkey.as_str()];
        parties.extend(self.tag_values("p"));
        parties
    }
}

impl EventTemplate {
    /// Sign with a secret key, producing a complete event.
    pub fn sign(&self, secret_key: &[u8; 32]) -> Result<Event, ProtoError> {
        let secp = Secp256k1::new();
        let sk =
            SecretKey::from_slice(secret_key).map_err(|e| ProtoError::Signing(e.to_string()))?;
        let (xonly, _parity) = sk.x_only_public_key(&secp);
        let pubkey = hex::encode(xonly.serialize());

        let canonical = canonical_serialization(
            &pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        let hash = sha256::Hash::hash(canonical.as_bytes());
        let id = hex::encode(hash.as_byte_array());

        let message = Message::from_digest_slice(hash.as_byte_array())
            .map_err(|e| ProtoError::Signing(format!("invalid message: {}", e)))?;
        let keypair = Keypair::from_secret_key(&secp, &sk);
        let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

        Ok(Event {
            id,
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
            sig: hex::encode(sig.serialize()),
        })
    }
}

fn canonical_serialization(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, ProtoError> {
    if !is_lower_hex(pubkey, 64) {
        return Err(ProtoError::InvalidEvent(
            "author key must be 64 lowercase hex characters".to_string(),
        ));
    }
    serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))
        .map_err(|e| ProtoError::Serialization(e.to_string()))
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Derive the x-only public key, hex encoded, from a secret key.
pub fn public_key_hex(secret_key: &[u8; 32]) -> Result<String, ProtoError> {
    let secp = Secp256k1::new();
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| ProtoError::InvalidPublicKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(hex::encode(xonly.serialize()))
}
