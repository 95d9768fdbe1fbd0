//! Credential vault.
//!
//! Secrets at rest (database passwords, object-store keys) are sealed with
//! AES-256-GCM under a key derived per call from the process secret with
//! Argon2id and a fresh salt. Operator passwords are hashed with the same KDF.
//!
//! Wire formats (base64, standard alphabet):
//! - sealed secret: `salt(16) ‖ nonce(12) ‖ ciphertext+tag`
//! - password hash: `salt(16) ‖ hash(32)`

use crate::errors::{AppError, Result};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::{RngCore, rngs::OsRng};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 2,
        }
    }
}

pub struct Vault {
    secret: Zeroizing<String>,
    params: KdfParams,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("secret", &"[REDACTED]")
            .field("params", &self.params)
            .finish()
    }
}

impl Vault {
    pub fn new(secret: &str) -> Result<Self> {
        Self::with_params(secret, KdfParams::default())
    }

    pub fn with_params(secret: &str, params: KdfParams) -> Result<Self> {
        if secret.is_empty() {
            return Err(AppError::Config("SECRET_KEY environment variable is not set".to_string()));
        }
        Ok(Self {
            secret: Zeroizing::new(secret.to_string()),
            params,
        })
    }

    /// Hashes `plain` together with the process secret under a random salt.
    pub fn hash_password(&self, plain: &str) -> Result<String> {
        let salt = random_bytes::<SALT_LEN>();
        let hash = self.password_hash_with_salt(plain, &salt)?;

        let mut encoded = Vec::with_capacity(SALT_LEN + KEY_LEN);
        encoded.extend_from_slice(&salt);
        encoded.extend_from_slice(hash.as_slice());
        Ok(BASE64.encode(encoded))
    }

    pub fn validate_password(&self, plain: &str, hashed: &str) -> Result<()> {
        let data = BASE64
            .decode(hashed.trim())
            .map_err(|e| AppError::Crypto(format!("failed to decode hashed password: {}", e)))?;
        if data.len() != SALT_LEN + KEY_LEN {
            return Err(AppError::Crypto("invalid password".to_string()));
        }

        let (salt, stored) = data.split_at(SALT_LEN);
        let computed = self.password_hash_with_salt(plain, salt)?;

        if bool::from(stored.ct_eq(computed.as_slice())) {
            Ok(())
        } else {
            Err(AppError::Crypto("invalid password".to_string()))
        }
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<String> {
        let salt = random_bytes::<SALT_LEN>();
        let nonce_bytes = random_bytes::<NONCE_LEN>();

        let cipher = self.cipher_for_salt(&salt)?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| AppError::Crypto("failed to encrypt".to_string()))?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    /// Fails closed: any malformed, truncated or tampered input is an error.
    pub fn decrypt_string(&self, encrypted: &str) -> Result<Zeroizing<String>> {
        let data = BASE64
            .decode(encrypted.trim())
            .map_err(|e| AppError::Crypto(format!("failed to decode base64: {}", e)))?;
        if data.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(AppError::Crypto("encrypted data too short".to_string()));
        }

        let (salt, rest) = data.split_at(SALT_LEN);
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);

        let cipher = self.cipher_for_salt(salt)?;
        let plain = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce_bytes), sealed)
                .map_err(|_| AppError::Crypto("failed to decrypt: authentication failed".to_string()))?,
        );

        let text = std::str::from_utf8(plain.as_slice())
            .map_err(|_| AppError::Crypto("decrypted data is not valid UTF-8".to_string()))?;
        Ok(Zeroizing::new(text.to_string()))
    }

    fn cipher_for_salt(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let key = self.derive(self.secret.as_bytes(), salt)?;
        Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| AppError::Crypto("invalid key length".to_string()))
    }

    fn password_hash_with_salt(&self, plain: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let mut input = Zeroizing::new(Vec::with_capacity(plain.len() + self.secret.len()));
        input.extend_from_slice(plain.as_bytes());
        input.extend_from_slice(self.secret.as_bytes());
        self.derive(input.as_slice(), salt)
    }

    fn derive(&self, input: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| AppError::Config(format!("invalid key derivation parameters: {}", e)))?;

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(input, salt, key.as_mut_slice())
            .map_err(|e| AppError::Crypto(format!("failed to derive key: {}", e)))?;
        Ok(key)
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
pub(crate) fn test_vault(secret: &str) -> Vault {
    // Cheap parameters: the full 64 MiB cost makes debug-mode tests crawl.
    Vault::with_params(
        secret,
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        },
    )
    .expect("non-empty secret")
}
