// SPDX-License-Identifier: Apache-2.0

//! Secret sealing and tags
//!
//! Session secrets are sealed with AES-256-GCM under the process key
//! (`nonce(12) || ciphertext+tag`). Tags are HMAC-SHA256 under a key derived
//! from the same process key with a fixed label, so a tag never doubles as
//! an encryption key.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use lumen_core::{LumenError, LumenResult};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const MAC_KEY_LABEL: &[u8] = b"lumen-pg/hmac-sha256/v1";

#[derive(Clone)]
pub struct Crypto {
    key: [u8; KEY_LEN],
    mac_key: [u8; KEY_LEN],
}

impl fmt::Debug for Crypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Crypto(***)")
    }
}

impl Crypto {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(MAC_KEY_LABEL);
        hasher.update(key);
        let mut mac_key = [0u8; KEY_LEN];
        mac_key.copy_from_slice(&hasher.finalize());
        Self { key, mac_key }
    }

    /// Key from 64 hex characters.
    pub fn from_hex(hex_key: &str) -> LumenResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|_| LumenError::invalid_input("encryption key must be hex"))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            LumenError::invalid_input(format!("encryption key must be {} bytes", KEY_LEN))
        })?;
        Ok(Self::new(key))
    }

    fn cipher(&self) -> LumenResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| LumenError::internal(format!("invalid encryption key: {e}")))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> LumenResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| LumenError::internal(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Fails with `CryptoTampered` on truncated input or a tag mismatch.
    pub fn decrypt(&self, sealed: &[u8]) -> LumenResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(LumenError::CryptoTampered);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| LumenError::CryptoTampered)
    }

    pub fn sign(&self, bytes: &[u8]) -> LumenResult<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| LumenError::internal(format!("invalid hmac key: {e}")))?;
        mac.update(bytes);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time tag check.
    pub fn verify(&self, bytes: &[u8], tag: &[u8]) -> bool {
        match <HmacSha256 as Mac>::new_from_slice(&self.mac_key) {
            Ok(mut mac) => {
                mac.update(bytes);
                mac.verify_slice(tag).is_ok()
            }
            Err(_) => false,
        }
    }

    /// Seals a secret into a base64 string.
    pub fn encrypt_secret(&self, secret: &str) -> LumenResult<String> {
        Ok(STANDARD.encode(self.encrypt(secret.as_bytes())?))
    }

    pub fn decrypt_secret(&self, sealed: &str) -> LumenResult<String> {
        let bytes = STANDARD
            .decode(sealed)
            .map_err(|_| LumenError::CryptoTampered)?;
        let plain = self.decrypt(&bytes)?;
        String::from_utf8(plain).map_err(|_| LumenError::CryptoTampered)
    }
}

/// `n` random bytes from the OS, hex encoded (`2n` characters).
pub fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
