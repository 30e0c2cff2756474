//! At-rest encryption of host admin passwords
//!
//! Passwords are sealed with AES-256-GCM under a 32-byte master key and
//! stored as hex of `nonce || ciphertext`.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use rand::Rng;
use std::fmt;

use crate::error::{NimbusError, NimbusResult};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretCipher {
    master_key: [u8; 32],
}

impl SecretCipher {
    /// Build from 64 hex characters
    pub fn from_hex(key_hex: &str) -> NimbusResult<Self> {
        let bytes = hex::decode(key_hex.trim()).map_err(|_| NimbusError::Security {
            message: "Invalid master key format - must be 64 hex characters".to_string(),
        })?;
        if bytes.len() != 32 {
            return Err(NimbusError::Security {
                message: "Master key must be exactly 32 bytes (64 hex characters)".to_string(),
            });
        }
        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(&bytes);
        Ok(Self { master_key })
    }

    /// Read the key from the named environment variable
    pub fn from_env(var: &str) -> NimbusResult<Self> {
        match std::env::var(var) {
            Ok(key_hex) => Self::from_hex(&key_hex),
            Err(_) => Err(NimbusError::Security {
                message: format!(
                    "{} environment variable required for host password storage. Generate with: openssl rand -hex 32",
                    var
                ),
            }),
        }
    }

    /// Random key, for tests and throwaway stores
    pub fn generate() -> Self {
        Self {
            master_key: rand::thread_rng().gen(),
        }
    }

    fn cipher(&self) -> NimbusResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.master_key).map_err(|e| NimbusError::Security {
            message: format!("Failed to create cipher: {}", e),
        })
    }

    pub fn seal(&self, plaintext: &str) -> NimbusResult<String> {
        let cipher = self.cipher()?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| NimbusError::Security {
                message: format!("Failed to encrypt secret: {}", e),
            })?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn open(&self, sealed_hex: &str) -> NimbusResult<String> {
        let sealed = hex::decode(sealed_hex).map_err(|e| NimbusError::Security {
            message: format!("Sealed secret is not hex: {}", e),
        })?;
        if sealed.len() <= NONCE_LEN {
            return Err(NimbusError::Security {
                message: "Sealed secret is truncated".to_string(),
            });
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| NimbusError::Security {
                message: format!("Failed to decrypt secret: {}", e),
            })?;

        String::from_utf8(plaintext).map_err(|e| NimbusError::Security {
            message: format!("Invalid UTF-8 in decrypted secret: {}", e),
        })
    }
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_open() {
        let cipher = SecretCipher::generate();
        let sealed = cipher.seal("s3cret").unwrap();
        assert!(!sealed.contains("s3cret"));
        assert_eq!(cipher.open(&sealed).unwrap(), "s3cret");
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let cipher = SecretCipher::generate();
        assert_ne!(cipher.seal("same").unwrap(), cipher.seal("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = SecretCipher::generate().seal("s3cret").unwrap();
        let err = SecretCipher::generate().open(&sealed).unwrap_err();
        assert!(matches!(err, NimbusError::Security { .. }));
    }

    #[test]
    fn test_key_length_is_checked() {
        assert!(SecretCipher::from_hex("abcd").is_err());
        assert!(SecretCipher::from_hex(&"ab".repeat(32)).is_ok());
    }
}
