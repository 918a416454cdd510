//! Authenticated encryption of message bodies.
//!
//! XChaCha20-Poly1305 with a random 192-bit nonce per message. The nonce is
//! prepended to the ciphertext, so a sealed body is `nonce || ciphertext`.

use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::MessagingError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// 256-bit symmetric key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SecretKey([u8; KEY_LEN]);

#[derive(Clone)]
pub struct MessageCipher {
    key: SecretKey,
}

impl MessageCipher {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key: SecretKey(bytes),
        }
    }

    /// Accepts standard or URL-safe base64 of exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, MessagingError> {
        let encoded = encoded.trim();
        let mut decoded = general_purpose::STANDARD
            .decode(encoded)
            .or_else(|_| general_purpose::URL_SAFE.decode(encoded))
            .map_err(|e| MessagingError::Security(format!("encryption key is not base64: {e}")))?;

        if decoded.len() != KEY_LEN {
            let len = decoded.len();
            decoded.zeroize();
            return Err(MessagingError::Security(format!(
                "encryption key must be {KEY_LEN} bytes, got {len}"
            )));
        }

        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self::from_bytes(bytes))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.key.0)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, MessagingError> {
        let cipher = XChaCha20Poly1305::new((&self.key.0).into());
        let mut nonce = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| MessagingError::Security(format!("encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, MessagingError> {
        if sealed.len() < NONCE_LEN {
            return Err(MessagingError::Security(format!(
                "ciphertext too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new((&self.key.0).into());

        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|e| MessagingError::Security(format!("decryption failed: {e}")))
    }
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageCipher(XChaCha20Poly1305)")
    }
}
