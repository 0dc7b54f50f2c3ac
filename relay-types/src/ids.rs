//! Identifier types for webrelay.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// Prefix of the network topic that carries messages for a subscription key.
pub const TOPIC_PREFIX: &str = "/offlinemessage/";

/// Multihash code for SHA2-256.
const SHA2_256: u64 = 0x12;

/// Longest digest a subscription key may carry.
const MAX_DIGEST_LEN: u64 = 127;

/// A subscription key identifying one logical topic.
///
/// The canonical form is the base58 (Bitcoin alphabet) encoding of a
/// multihash. Two keys are the same topic iff their canonical strings match.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    /// Parse a subscription key from its canonical base58 form.
    pub fn parse(s: &str) -> Result<Self, TypesError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| TypesError::InvalidSubscriptionKey(e.to_string()))?;
        validate_multihash(&bytes)?;
        Ok(Self(s.to_string()))
    }

    /// Build the key whose multihash is the SHA2-256 digest of `data`.
    pub fn from_sha256(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = Vec::with_capacity(2 + digest.len());
        bytes.push(SHA2_256 as u8);
        bytes.push(digest.len() as u8);
        bytes.extend_from_slice(&digest);
        Self(bs58::encode(bytes).into_string())
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The network topic messages for this key are published on.
    pub fn topic(&self) -> String {
        format!("{TOPIC_PREFIX}{}", self.0)
    }
}

/// Check `<varint code><varint length><digest>` with a matching length.
fn validate_multihash(bytes: &[u8]) -> Result<(), TypesError> {
    let invalid = |reason: &str| TypesError::InvalidSubscriptionKey(reason.to_string());

    let (_code, used) = read_varint(bytes).ok_or_else(|| invalid("bad hash code"))?;
    let rest = &bytes[used..];
    let (len, used) = read_varint(rest).ok_or_else(|| invalid("bad digest length"))?;
    let digest = &rest[used..];

    if len == 0 || len > MAX_DIGEST_LEN {
        return Err(invalid("digest length out of range"));
    }
    if digest.len() as u64 != len {
        return Err(invalid("digest length mismatch"));
    }
    Ok(())
}

/// Decode an unsigned LEB128 varint, returning the value and bytes consumed.
fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate().take(9) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

impl FromStr for SubscriptionKey {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SubscriptionKey {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SubscriptionKey> for String {
    fn from(key: SubscriptionKey) -> Self {
        key.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionKey({})", self.0)
    }
}

/// Identity of a peer on the underlying network.
///
/// The peer's 32-byte Ed25519 public key, displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive the peer identity from a raw Ed25519 public key.
    pub fn from_public_key(bytes: &[u8]) -> Result<Self, TypesError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TypesError::InvalidPeerId(format!("expected 32 bytes, got {}", bytes.len())))?;
        VerifyingKey::from_bytes(&arr)
            .map_err(|_| TypesError::InvalidPeerId("not an ed25519 public key".to_string()))?;
        Ok(Self(arr))
    }

    /// Parse a peer identity from its hex form.
    pub fn parse(s: &str) -> Result<Self, TypesError> {
        let bytes = hex::decode(s).map_err(|e| TypesError::InvalidPeerId(e.to_string()))?;
        Self::from_public_key(&bytes)
    }

    /// Get the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> Self {
        peer.to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_string()[..8])
    }
}

/// Content address of a stored message: lowercase hex SHA-256 of its payload.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    /// Compute the id of a payload.
    pub fn for_payload(payload: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(payload)))
    }

    /// Parse a client-supplied id.
    pub fn parse(s: &str) -> Result<Self, TypesError> {
        let well_formed = s.len() == 64
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(TypesError::InvalidMessageId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageId {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", &self.0[..8.min(self.0.len())])
    }
}
