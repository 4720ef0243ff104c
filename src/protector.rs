//! Platform encryption facilities used by the credential vault.
//!
//! A [`SecretProtector`] turns a plaintext blob into an opaque ciphertext blob
//! and back. The blob layout for the AES implementations is `nonce || ciphertext`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use crate::error::ProtectorError;

pub const KEY_BYTES: usize = 32;
const IV_BYTES: usize = 12;
const KEYCHAIN_SERVICE: &str = "com.bucketlens.credentials";
const KEYCHAIN_ACCOUNT: &str = "encryption-key";

pub trait SecretProtector: Send + Sync {
    /// Whether the facility can be used right now.
    fn is_available(&self) -> bool;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectorError>;

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, ProtectorError>;
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn seal(key: &[u8; KEY_BYTES], plaintext: &[u8]) -> Result<Vec<u8>, ProtectorError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|err| ProtectorError::Encrypt(format!("Invalid encryption key: {err}")))?;
    let iv = random_bytes::<IV_BYTES>();
    let nonce = Nonce::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| ProtectorError::Encrypt("AES-GCM encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(IV_BYTES + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn open(key: &[u8; KEY_BYTES], blob: &[u8]) -> Result<Vec<u8>, ProtectorError> {
    if blob.len() <= IV_BYTES {
        return Err(ProtectorError::Decrypt("Ciphertext is truncated".to_string()));
    }

    let (iv, ciphertext) = blob.split_at(IV_BYTES);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|err| ProtectorError::Decrypt(format!("Invalid encryption key: {err}")))?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| ProtectorError::Decrypt("Ciphertext failed authentication".to_string()))
}

/// AES-256-GCM with a random key kept in the OS keychain.
///
/// The key is created on first encryption. Ciphertext written by one login
/// session can only be read back where the same keychain entry is reachable.
#[derive(Debug, Clone)]
pub struct KeyringProtector {
    service: String,
    account: String,
}

impl Default for KeyringProtector {
    fn default() -> Self {
        Self::new(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT)
    }
}

impl KeyringProtector {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn key_for_encrypt(&self) -> Result<[u8; KEY_BYTES], ProtectorError> {
        if let Some(key) = keychain::read_key(&self.service, &self.account)? {
            return Ok(key);
        }

        let key = random_bytes::<KEY_BYTES>();
        keychain::store_key(&self.service, &self.account, &key)?;
        tracing::info!(service = %self.service, "Created credential encryption key in OS keychain");
        Ok(key)
    }
}

impl SecretProtector for KeyringProtector {
    fn is_available(&self) -> bool {
        match keychain::read_key(&self.service, &self.account) {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!("OS keychain unavailable: {err}");
                false
            }
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectorError> {
        let key = self.key_for_encrypt()?;
        seal(&key, plaintext)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, ProtectorError> {
        let key = keychain::read_key(&self.service, &self.account)?.ok_or_else(|| {
            ProtectorError::Decrypt("Encryption key is missing from the OS keychain".to_string())
        })?;
        open(&key, blob)
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
mod keychain {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use keyring::Entry;

    use super::KEY_BYTES;
    use crate::error::ProtectorError;

    fn entry(service: &str, account: &str) -> Result<Entry, ProtectorError> {
        Entry::new(service, account)
            .map_err(|err| ProtectorError::Unavailable(format!("OS keychain unavailable: {err}")))
    }

    pub(super) fn read_key(
        service: &str,
        account: &str,
    ) -> Result<Option<[u8; KEY_BYTES]>, ProtectorError> {
        let encoded = match entry(service, account)?.get_password() {
            Ok(encoded) => encoded,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(err) => {
                return Err(ProtectorError::Unavailable(format!(
                    "OS keychain read failed: {err}"
                )))
            }
        };

        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|err| ProtectorError::Decrypt(format!("Keychain key is not base64: {err}")))?;
        let key: [u8; KEY_BYTES] = bytes.try_into().map_err(|_| {
            ProtectorError::Decrypt("Keychain key has the wrong length".to_string())
        })?;
        Ok(Some(key))
    }

    pub(super) fn store_key(
        service: &str,
        account: &str,
        key: &[u8; KEY_BYTES],
    ) -> Result<(), ProtectorError> {
        entry(service, account)?
            .set_password(&BASE64.encode(key))
            .map_err(|err| {
                ProtectorError::Encrypt(format!("Failed to save key in OS keychain: {err}"))
            })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
mod keychain {
    use super::KEY_BYTES;
    use crate::error::ProtectorError;

    pub(super) fn read_key(
        _service: &str,
        _account: &str,
    ) -> Result<Option<[u8; KEY_BYTES]>, ProtectorError> {
        Err(ProtectorError::Unavailable(
            "No OS keychain on this platform".to_string(),
        ))
    }

    pub(super) fn store_key(
        _service: &str,
        _account: &str,
        _key: &[u8; KEY_BYTES],
    ) -> Result<(), ProtectorError> {
        Err(ProtectorError::Unavailable(
            "No OS keychain on this platform".to_string(),
        ))
    }
}

/// AES-256-GCM with a key supplied by the caller, for headless hosts that
/// manage their own key material.
#[derive(Clone)]
pub struct StaticKeyProtector {
    key: [u8; KEY_BYTES],
}

impl StaticKeyProtector {
    pub fn new(key: [u8; KEY_BYTES]) -> Self {
        Self { key }
    }

    pub fn random() -> Self {
        Self::new(random_bytes::<KEY_BYTES>())
    }
}

impl SecretProtector for StaticKeyProtector {
    fn is_available(&self) -> bool {
        true
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectorError> {
        seal(&self.key, plaintext)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, ProtectorError> {
        open(&self.key, blob)
    }
}

/// A platform without an encryption facility. Records are stored in plain form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableProtector;

impl SecretProtector for UnavailableProtector {
    fn is_available(&self) -> bool {
        false
    }

    fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>, ProtectorError> {
        Err(ProtectorError::Unavailable(
            "Platform encryption is not available".to_string(),
        ))
    }

    fn decrypt(&self, _blob: &[u8]) -> Result<Vec<u8>, ProtectorError> {
        Err(ProtectorError::Unavailable(
            "Platform encryption is not available".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_key_round_trip() {
        let protector = StaticKeyProtector::random();
        let blob = protector.encrypt(b"top secret").unwrap();

        assert_ne!(&blob[IV_BYTES..], b"top secret");
        assert_eq!(protector.decrypt(&blob).unwrap(), b"top secret");
    }

    #[test]
    fn test_nonce_differs_per_encryption() {
        let protector = StaticKeyProtector::random();
        let first = protector.encrypt(b"same").unwrap();
        let second = protector.encrypt(b"same").unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let blob = StaticKeyProtector::new([1u8; KEY_BYTES])
            .encrypt(b"payload")
            .unwrap();
        let result = StaticKeyProtector::new([2u8; KEY_BYTES]).decrypt(&blob);

        assert!(matches!(result, Err(ProtectorError::Decrypt(_))));
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let protector = StaticKeyProtector::random();
        assert!(matches!(
            protector.decrypt(&[0u8; IV_BYTES]),
            Err(ProtectorError::Decrypt(_))
        ));
    }

    #[test]
    fn test_unavailable_protector() {
        let protector = UnavailableProtector;
        assert!(!protector.is_available());
        assert!(matches!(
            protector.encrypt(b"x"),
            Err(ProtectorError::Unavailable(_))
        ));
    }
}
