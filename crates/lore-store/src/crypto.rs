use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use crate::error::{Result, StoreError};

const NONCE_LEN: usize = 12;

/// AES-256-GCM wrapper for API keys at rest. Ciphertexts are stored as
/// base64(nonce || ciphertext); the plaintext only leaves this boundary on
/// its way to a provider.
#[derive(Clone)]
pub struct KeyCrypto {
    key: Key<Aes256Gcm>,
}

impl KeyCrypto {
    /// `key` must be exactly 32 bytes (checked by config validation too).
    pub fn new(key: &str) -> Result<Self> {
        let bytes = key.as_bytes();
        if bytes.len() != 32 {
            return Err(StoreError::Crypto(
                "AEAD key must be exactly 32 bytes".to_string(),
            ));
        }
        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(bytes),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(B64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = B64
            .decode(encoded)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        if raw.len() < NONCE_LEN {
            return Err(StoreError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| StoreError::Crypto(e.to_string()))
    }
}

/// Middle-masked display form: first and last four characters survive.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 8), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn round_trip() {
        let crypto = KeyCrypto::new(KEY).unwrap();
        let ct = crypto.encrypt("sk-super-secret").unwrap();
        assert_ne!(ct, "sk-super-secret");
        assert_eq!(crypto.decrypt(&ct).unwrap(), "sk-super-secret");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let crypto = KeyCrypto::new(KEY).unwrap();
        let a = crypto.encrypt("same").unwrap();
        let b = crypto.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(KeyCrypto::new("short").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let crypto = KeyCrypto::new(KEY).unwrap();
        let mut ct = crypto.encrypt("secret").unwrap();
        ct.replace_range(0..1, if ct.starts_with('A') { "B" } else { "A" });
        assert!(crypto.decrypt(&ct).is_err());
    }

    #[test]
    fn masking_keeps_edges() {
        assert_eq!(mask_api_key("sk-1234567890abcd"), "sk-1*********abcd");
        assert_eq!(mask_api_key("tiny"), "****");
    }
}
