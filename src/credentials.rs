//! Storage credential service.
//!
//! Mints per-user S3 access keys, persists them with the secret encrypted at
//! rest, and resolves access key ids back to `(user_id, secret)` for the
//! SigV4 verifier. Secrets are AES-256-GCM-encrypted under the process key
//! with the access key id as associated data, so a ciphertext cannot be
//! replayed onto a different key id. The decrypted secret is returned to the
//! caller and never logged.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::{credentials as store, Database, StorageError};

pub const ACCESS_KEY_PREFIX: &str = "HAEX";
const ACCESS_KEY_RANDOM_LEN: usize = 16;
const SECRET_KEY_LEN: usize = 40;

const ACCESS_KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SECRET_KEY_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential ciphertext could not be decrypted")]
    Decrypt,
    #[error("Credential encryption failed")]
    Encrypt,
    #[error("STORAGE_ENCRYPTION_KEY is not configured")]
    KeyUnavailable,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A decrypted credential pair handed to the caller.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

// ============================================================================
// Generation
// ============================================================================

/// `"HAEX"` followed by 16 characters of `[A-Z0-9]`, from OS entropy.
pub fn generate_access_key_id() -> String {
    let mut id = String::with_capacity(ACCESS_KEY_PREFIX.len() + ACCESS_KEY_RANDOM_LEN);
    id.push_str(ACCESS_KEY_PREFIX);
    for _ in 0..ACCESS_KEY_RANDOM_LEN {
        let idx = OsRng.gen_range(0..ACCESS_KEY_ALPHABET.len());
        id.push(ACCESS_KEY_ALPHABET[idx] as char);
    }
    id
}

/// 40 characters over the fixed `[A-Za-z0-9+/]` alphabet, from OS entropy.
pub fn generate_secret_key() -> String {
    let mut secret = String::with_capacity(SECRET_KEY_LEN);
    for _ in 0..SECRET_KEY_LEN {
        let idx = OsRng.gen_range(0..SECRET_KEY_ALPHABET.len());
        secret.push(SECRET_KEY_ALPHABET[idx] as char);
    }
    secret
}

/// Syntactic check for `^HAEX[A-Z0-9]{16}$`.
pub fn is_valid_access_key_id(candidate: &str) -> bool {
    candidate.len() == ACCESS_KEY_PREFIX.len() + ACCESS_KEY_RANDOM_LEN
        && candidate.starts_with(ACCESS_KEY_PREFIX)
        && candidate[ACCESS_KEY_PREFIX.len()..]
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

// ============================================================================
// Encryption at rest
// ============================================================================

/// AES-256-GCM over stored secrets. The cipher key is the SHA-256 digest of
/// the configured key string, so operators may use a passphrase of any
/// length.
#[derive(Clone, Debug)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    pub fn from_key_string(key: &str) -> Self {
        Self {
            key: Sha256::digest(key.as_bytes()).into(),
        }
    }

    /// Encrypt a secret, binding it to its access key id. Output is
    /// base64(nonce || ciphertext).
    pub fn encrypt(&self, access_key_id: &str, secret: &str) -> Result<String, CredentialError> {
        let cipher = Aes256Gcm::new(&self.key.into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: secret.as_bytes(),
                    aad: access_key_id.as_bytes(),
                },
            )
            .map_err(|_| CredentialError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, access_key_id: &str, stored: &str) -> Result<String, CredentialError> {
        let blob = BASE64.decode(stored).map_err(|_| CredentialError::Decrypt)?;
        if blob.len() <= NONCE_LEN {
            return Err(CredentialError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce_bytes: [u8; NONCE_LEN] = nonce_bytes.try_into().expect("split length");

        let cipher = Aes256Gcm::new(&self.key.into());
        let plaintext = cipher
            .decrypt(
                &Nonce::from(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: access_key_id.as_bytes(),
                },
            )
            .map_err(|_| CredentialError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CredentialError::Decrypt)
    }
}

// ============================================================================
// Service
// ============================================================================

/// Mint / lookup / rotate over the credential store. Holds no pool itself;
/// callers pass the shared [`Database`].
#[derive(Clone)]
pub struct CredentialService {
    cipher: Option<SecretCipher>,
}

impl CredentialService {
    pub fn new(encryption_key: Option<&str>) -> Self {
        Self {
            cipher: encryption_key.map(SecretCipher::from_key_string),
        }
    }

    /// Whether the service can encrypt and decrypt secrets.
    pub fn available(&self) -> bool {
        self.cipher.is_some()
    }

    fn cipher(&self) -> Result<&SecretCipher, CredentialError> {
        self.cipher.as_ref().ok_or(CredentialError::KeyUnavailable)
    }

    /// Return the user's credential pair, minting one on first request.
    pub async fn get_or_mint(
        &self,
        db: &Database,
        user_id: Uuid,
    ) -> Result<IssuedCredentials, CredentialError> {
        let cipher = self.cipher()?;

        if let Some(row) = store::fetch_by_user(db, user_id).await? {
            return Ok(IssuedCredentials {
                secret_access_key: cipher.decrypt(&row.access_key_id, &row.encrypted_secret_key)?,
                access_key_id: row.access_key_id,
            });
        }

        let access_key_id = generate_access_key_id();
        let secret_access_key = generate_secret_key();
        let encrypted = cipher.encrypt(&access_key_id, &secret_access_key)?;

        if store::insert(db, user_id, &access_key_id, &encrypted).await? {
            tracing::info!(user_id = %user_id, access_key_id = %access_key_id, "Minted storage credentials");
            return Ok(IssuedCredentials {
                access_key_id,
                secret_access_key,
            });
        }

        // Lost a mint race; the winner's row is authoritative.
        let row = store::fetch_by_user(db, user_id)
            .await?
            .ok_or(CredentialError::Decrypt)?;
        Ok(IssuedCredentials {
            secret_access_key: cipher.decrypt(&row.access_key_id, &row.encrypted_secret_key)?,
            access_key_id: row.access_key_id,
        })
    }

    /// Resolve an access key id to `(user_id, decrypted secret)`.
    ///
    /// Used only by the SigV4 verification path.
    pub async fn lookup(
        &self,
        db: &Database,
        access_key_id: &str,
    ) -> Result<Option<(Uuid, String)>, CredentialError> {
        let cipher = self.cipher()?;
        if !is_valid_access_key_id(access_key_id) {
            return Ok(None);
        }
        match store::fetch_by_access_key(db, access_key_id).await? {
            Some(row) => {
                let secret = cipher.decrypt(&row.access_key_id, &row.encrypted_secret_key)?;
                Ok(Some((row.user_id, secret)))
            }
            None => Ok(None),
        }
    }

    /// Replace the user's credentials; the old access key id stops resolving
    /// in the same transaction that persists the new pair.
    pub async fn rotate(
        &self,
        db: &Database,
        user_id: Uuid,
    ) -> Result<IssuedCredentials, CredentialError> {
        let cipher = self.cipher()?;

        let access_key_id = generate_access_key_id();
        let secret_access_key = generate_secret_key();
        let encrypted = cipher.encrypt(&access_key_id, &secret_access_key)?;

        store::replace(db, user_id, &access_key_id, &encrypted).await?;
        tracing::info!(user_id = %user_id, access_key_id = %access_key_id, "Rotated storage credentials");

        Ok(IssuedCredentials {
            access_key_id,
            secret_access_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_key_id_shape() {
        for _ in 0..32 {
            let id = generate_access_key_id();
            assert!(is_valid_access_key_id(&id), "bad id: {id}");
        }
    }

    #[test]
    fn test_access_key_id_validation() {
        assert!(is_valid_access_key_id("HAEXABCDEFGH12345678"));
        assert!(!is_valid_access_key_id("AKIAABCDEFGH12345678"));
        assert!(!is_valid_access_key_id("HAEXabcdefgh12345678"));
        assert!(!is_valid_access_key_id("HAEXABCDEFGH1234567"));
        assert!(!is_valid_access_key_id("HAEXABCDEFGH123456789"));
        assert!(!is_valid_access_key_id(""));
    }

    #[test]
    fn test_secret_key_shape() {
        for _ in 0..32 {
            let secret = generate_secret_key();
            assert_eq!(secret.len(), 40);
            assert!(secret.bytes().all(|b| SECRET_KEY_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_generation_is_not_constant() {
        assert_ne!(generate_access_key_id(), generate_access_key_id());
        assert_ne!(generate_secret_key(), generate_secret_key());
    }

    #[test]
    fn test_cipher_roundtrip() {
        let cipher = SecretCipher::from_key_string("test-process-key");
        let encrypted = cipher.encrypt("HAEXABCDEFGH12345678", "super-secret").unwrap();
        assert_ne!(encrypted, "super-secret");
        let decrypted = cipher.decrypt("HAEXABCDEFGH12345678", &encrypted).unwrap();
        assert_eq!(decrypted, "super-secret");
    }

    #[test]
    fn test_cipher_binds_access_key_id() {
        // A ciphertext minted for one key id must not decrypt under another.
        let cipher = SecretCipher::from_key_string("test-process-key");
        let encrypted = cipher.encrypt("HAEXABCDEFGH12345678", "super-secret").unwrap();
        assert!(cipher.decrypt("HAEXZZZZZZZZ99999999", &encrypted).is_err());
    }

    #[test]
    fn test_cipher_rejects_wrong_process_key() {
        let encrypted = SecretCipher::from_key_string("key-one")
            .encrypt("HAEXABCDEFGH12345678", "super-secret")
            .unwrap();
        assert!(SecretCipher::from_key_string("key-two")
            .decrypt("HAEXABCDEFGH12345678", &encrypted)
            .is_err());
    }

    #[test]
    fn test_cipher_rejects_garbage() {
        let cipher = SecretCipher::from_key_string("test-process-key");
        assert!(cipher.decrypt("HAEXABCDEFGH12345678", "not base64!!!").is_err());
        assert!(cipher.decrypt("HAEXABCDEFGH12345678", "AAAA").is_err());
    }

    #[test]
    fn test_service_unavailable_without_key() {
        let service = CredentialService::new(None);
        assert!(!service.available());
        assert!(matches!(
            service.cipher().unwrap_err(),
            CredentialError::KeyUnavailable
        ));
    }
}
