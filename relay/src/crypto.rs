//! Challenge encryption for identity-proof authentication.
//!
//! A challenge is sealed to the peer's Ed25519 identity key with NaCl `box`
//! (X25519 + XSalsa20-Poly1305) from a fresh ephemeral key. Only the holder
//! of the matching signing key can open it, so echoing the plaintext back
//! proves key possession without the key ever leaving the peer.
//!
//! Blob layout: `sealing_nonce (24) || ephemeral_public (32) || ciphertext`.
//!
//! # Security Notes
//!
//! - Every call draws a new ephemeral key and sealing nonce; reusing either
//!   with the same recipient would break the AEAD's confidentiality.
//! - The Ed25519 public key is mapped to its Montgomery form, and the
//!   recipient derives the matching X25519 secret from its signing scalar.

use crate::error::CryptoError;
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use ed25519_dalek::{SigningKey, VerifyingKey};

/// Sealing nonce size for XSalsa20-Poly1305 (192 bits = 24 bytes).
pub const SEAL_NONCE_SIZE: usize = 24;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// Encrypt `nonce` to the holder of the Ed25519 key `recipient_public_key`.
///
/// # Errors
///
/// Returns [`CryptoError::UnsupportedKeyType`] if the key is not a valid
/// Ed25519 public key.
pub fn encrypt_challenge(recipient_public_key: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key_bytes: [u8; 32] = recipient_public_key
        .try_into()
        .map_err(|_| CryptoError::UnsupportedKeyType)?;
    let verifying =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::UnsupportedKeyType)?;
    let recipient = PublicKey::from(verifying.to_montgomery().to_bytes());

    let ephemeral = SecretKey::generate(&mut OsRng);
    let sealing_nonce = SalsaBox::generate_nonce(&mut OsRng);

    let ciphertext = SalsaBox::new(&recipient, &ephemeral)
        .encrypt(&sealing_nonce, nonce)
        .map_err(|_| CryptoError::Seal)?;

    let mut out = Vec::with_capacity(SEAL_NONCE_SIZE + PUBLIC_KEY_SIZE + ciphertext.len());
    out.extend_from_slice(&sealing_nonce);
    out.extend_from_slice(ephemeral.public_key().as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a blob produced by [`encrypt_challenge`] with the recipient's signing key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidCiphertext`] if the blob is truncated or was
/// not sealed to this key.
pub fn open_challenge(signing_key: &SigningKey, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < SEAL_NONCE_SIZE + PUBLIC_KEY_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidCiphertext);
    }
    let (sealing_nonce, rest) = blob.split_at(SEAL_NONCE_SIZE);
    let (ephemeral, ciphertext) = rest.split_at(PUBLIC_KEY_SIZE);

    let ephemeral: [u8; 32] = ephemeral
        .try_into()
        .map_err(|_| CryptoError::InvalidCiphertext)?;
    let secret = SecretKey::from(signing_key.to_scalar_bytes());

    SalsaBox::new(&PublicKey::from(ephemeral), &secret)
        .decrypt(GenericArray::from_slice(sealing_nonce), ciphertext)
        .map_err(|_| CryptoError::InvalidCiphertext)
}
