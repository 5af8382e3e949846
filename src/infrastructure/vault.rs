//! Credential vault: AES-256-GCM encryption of broker tokens at rest.
//!
//! The 256-bit key is derived from the configured master secret with
//! SHA-256. A fresh 96-bit IV is generated per encryption; a nonce is
//! never reused under the same key. The AEAD tag check runs in constant
//! time inside the cipher.

use crate::domain::connection::EncryptedBlob;
use crate::domain::errors::VaultError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};

const ALGORITHM: &str = "AES-256-GCM";
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Decrypted token material. The backing bytes are overwritten on drop so
/// plaintext does not outlive its use site.
pub struct Plaintext(Vec<u8>);

impl Plaintext {
    pub fn expose(&self) -> &str {
        // Constructed from verified UTF-8 only.
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl Drop for Plaintext {
    fn drop(&mut self) {
        for b in self.0.iter_mut() {
            *b = 0;
        }
    }
}

impl std::fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print token material.
        write!(f, "Plaintext(<redacted>)")
    }
}

pub struct CredentialVault {
    key: Option<[u8; 32]>,
}

impl CredentialVault {
    /// `master_secret` comes from configuration; `None` produces a vault
    /// that fails every operation with `KeyUnavailable`.
    pub fn new(master_secret: Option<&str>) -> Self {
        let key = master_secret.map(|secret| {
            let digest = Sha256::digest(secret.as_bytes());
            let mut key = [0u8; 32];
            key.copy_from_slice(&digest);
            key
        });
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedBlob, VaultError> {
        let key = self.key.ok_or(VaultError::KeyUnavailable)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| VaultError::CryptoFailure {
            reason: e.to_string(),
        })?;

        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| VaultError::CryptoFailure {
                reason: "AEAD encryption failed".into(),
            })?;

        Ok(EncryptedBlob {
            ciphertext: B64.encode(ciphertext),
            iv: B64.encode(iv),
            algorithm: ALGORITHM.to_string(),
            key_size: 256,
            created_at: Utc::now(),
        })
    }

    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Plaintext, VaultError> {
        let key = self.key.ok_or(VaultError::KeyUnavailable)?;

        if blob.algorithm != ALGORITHM {
            return Err(VaultError::Malformed {
                reason: format!("unsupported algorithm {}", blob.algorithm),
            });
        }

        let iv = B64.decode(&blob.iv).map_err(|_| VaultError::Malformed {
            reason: "iv is not base64".into(),
        })?;
        if iv.len() != IV_LEN {
            return Err(VaultError::Malformed {
                reason: format!("iv length {} != {}", iv.len(), IV_LEN),
            });
        }

        let ciphertext = B64
            .decode(&blob.ciphertext)
            .map_err(|_| VaultError::Malformed {
                reason: "ciphertext is not base64".into(),
            })?;
        if ciphertext.len() < TAG_LEN {
            return Err(VaultError::Malformed {
                reason: "ciphertext shorter than auth tag".into(),
            });
        }

        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| VaultError::CryptoFailure {
            reason: e.to_string(),
        })?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| VaultError::Tampered)?;

        if std::str::from_utf8(&plaintext).is_err() {
            return Err(VaultError::Malformed {
                reason: "plaintext is not UTF-8".into(),
            });
        }

        Ok(Plaintext(plaintext))
    }
}
