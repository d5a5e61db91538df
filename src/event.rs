//! Nostr event model.
//!
//! An event is content-addressed: its `id` is the SHA-256 of a canonical
//! array, and its `sig` is a BIP-340 Schnorr signature over that hash by the
//! key in `pubkey`.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result, VerificationError},
    keys,
    tag::Tag,
};

pub const KIND_METADATA: u16 = 0;
pub const KIND_TEXT_NOTE: u16 = 1;
pub const KIND_RECOMMEND_RELAY: u16 = 2;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// Core Nostr event.
///
/// ```json
/// {
///   "content": "hello",
///   "created_at": 1700000000,
///   "id": "aa11...",
///   "kind": 1,
///   "pubkey": "79be...",
///   "sig": "dead...",
///   "tags": [["t", "news"], ["d", "slug"]]
/// }
/// ```
///
/// Fields are declared in the order they are written so the JSON form is
/// stable. Empty `id`, `pubkey` and `sig` are left out, which is how an
/// unsigned template travels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Event {
    /// Event body.
    pub content: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Hex SHA-256 of the canonical serialization.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u16,
    /// Author x-only public key (hex).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pubkey: String,
    /// Schnorr signature over the id (hex).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sig: String,
    pub tags: Vec<Tag>,
}

impl Event {
    /// Unsigned event template.
    pub fn new(kind: u16, content: impl Into<String>, tags: Vec<Tag>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags,
            ..Default::default()
        }
    }

    /// NIP-42 authentication template answering `challenge` from `relay_url`.
    pub fn auth(relay_url: impl Into<String>, challenge: impl Into<String>) -> Self {
        Self::new(
            KIND_CLIENT_AUTH,
            "",
            vec![Tag::relay(relay_url), Tag::challenge(challenge)],
        )
    }

    /// Canonical bytes `[0,pubkey,created_at,kind,tags,content]` the id is
    /// computed over.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        Ok(serde_json::to_vec(&arr)?)
    }

    /// SHA-256 of the canonical serialization of the current fields.
    pub fn id_hash(&self) -> Result<[u8; 32]> {
        let data = self.serialize()?;
        Ok(Sha256::digest(&data).into())
    }

    /// Hex id of the current fields, whatever `id` currently holds.
    pub fn compute_id(&self) -> Result<String> {
        Ok(hex::encode(self.id_hash()?))
    }

    pub fn is_signed(&self) -> bool {
        !self.id.is_empty() && !self.sig.is_empty()
    }

    /// Seal the event with `secret_hex`, stamping the current time.
    pub fn sign(&mut self, secret_hex: &str) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.sign_at(secret_hex, now)
    }

    /// Seal the event with `secret_hex` at a fixed `created_at`.
    ///
    /// Nothing is modified unless signing succeeds.
    pub fn sign_at(&mut self, secret_hex: &str, created_at: u64) -> Result<()> {
        if self.is_signed() {
            return Err(Error::AlreadySigned);
        }
        let keypair = keys::keypair(secret_hex)?;
        let (xonly, _parity) = keypair.x_only_public_key();

        let mut sealed = Event {
            pubkey: hex::encode(xonly.serialize()),
            created_at,
            id: String::new(),
            sig: String::new(),
            ..self.clone()
        };
        let hash = sealed.id_hash()?;
        let secp = Secp256k1::signing_only();
        let sig = secp.sign_schnorr(&Message::from_digest(hash), &keypair);
        sealed.id = hex::encode(hash);
        sealed.sig = hex::encode(sig.serialize());

        *self = sealed;
        Ok(())
    }

    /// Check that `id` matches the contents and `sig` is valid for `pubkey`.
    pub fn verify(&self) -> Result<()> {
        let pk_bytes = hex::decode(&self.pubkey)
            .map_err(|e| VerificationError::InvalidPublicKey(e.to_string()))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|e| VerificationError::InvalidPublicKey(e.to_string()))?;
        let sig_bytes =
            hex::decode(&self.sig).map_err(|e| VerificationError::InvalidSignature(e.to_string()))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|e| VerificationError::InvalidSignature(e.to_string()))?;

        let hash = self.id_hash()?;
        if hex::encode(hash) != self.id {
            return Err(VerificationError::IdMismatch.into());
        }
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &Message::from_digest(hash), &pk)
            .map_err(|_| VerificationError::BadSignature)?;
        Ok(())
    }

    /// Tags whose type is `kind`, in order.
    pub fn tags_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.kind() == kind)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}
