//! Persistent storage for the single credential record.
//!
//! The record lives in one JSON file. When the platform encryption facility
//! is available the key pair is encrypted as one unit and only region and
//! bucket stay readable; otherwise the record is stored as-is.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config_paths::credentials_path;
use crate::credentials::CredentialRecord;
use crate::error::{ProtectorError, VaultError};
use crate::protector::SecretProtector;

const CURRENT_FILE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedCredentials {
    /// Base64 ciphertext of the `{accessKeyId, secretAccessKey}` JSON.
    pub encrypted: String,
    pub region: String,
    pub bucket: String,
}

/// The persisted form of a [`CredentialRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoredCredentials {
    Plain(CredentialRecord),
    Encrypted(EncryptedCredentials),
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialsFile {
    version: u8,
    #[serde(flatten)]
    data: StoredCredentials,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyPair {
    access_key_id: String,
    secret_access_key: String,
}

/// Owns the credential file. Construct one per application and share it.
///
/// Every write to the file (save, delete, migration) holds `write_lock`, so
/// concurrent callers replace the record one at a time.
pub struct CredentialVault {
    path: PathBuf,
    protector: Arc<dyn SecretProtector>,
    write_lock: Mutex<()>,
}

impl CredentialVault {
    pub fn new(path: impl Into<PathBuf>, protector: Arc<dyn SecretProtector>) -> Self {
        Self {
            path: path.into(),
            protector,
            write_lock: Mutex::new(()),
        }
    }

    /// A vault at the standard location inside the application data directory.
    pub fn open_default(protector: Arc<dyn SecretProtector>) -> Result<Self, VaultError> {
        Ok(Self::new(credentials_path()?, protector))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `record`, replacing whatever was stored before.
    ///
    /// The record is not validated here.
    pub async fn save(&self, record: &CredentialRecord) -> Result<(), VaultError> {
        let data = self.seal(record)?;
        let _guard = self.write_lock.lock().await;
        self.write_file(&data).await?;
        info!(
            path = %self.path.display(),
            encrypted = matches!(data, StoredCredentials::Encrypted(_)),
            "Saved credentials"
        );
        Ok(())
    }

    /// Read the stored record, `None` if nothing has been saved.
    pub async fn load(&self) -> Result<Option<CredentialRecord>, VaultError> {
        let Some(stored) = self.read_file().await? else {
            return Ok(None);
        };

        match stored {
            StoredCredentials::Encrypted(encrypted) => self.unseal(encrypted).map(Some),
            StoredCredentials::Plain(record) => {
                check_plain_shape(&record)?;
                if self.protector.is_available() {
                    self.migrate_to_encrypted(&record).await;
                }
                Ok(Some(record))
            }
        }
    }

    /// Remove the stored record. Succeeds when nothing is stored.
    pub async fn delete(&self) -> Result<(), VaultError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Deleted credentials");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(VaultError::Persistence(format!(
                "Failed to delete {}: {err}",
                self.path.display()
            ))),
        }
    }

    /// Whether a record of either form is stored. Never decrypts.
    pub async fn has(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    fn seal(&self, record: &CredentialRecord) -> Result<StoredCredentials, VaultError> {
        if !self.protector.is_available() {
            warn!("Platform encryption unavailable, storing credentials without encryption");
            return Ok(StoredCredentials::Plain(record.clone()));
        }

        let pair = KeyPair {
            access_key_id: record.access_key_id.clone(),
            secret_access_key: record.secret_access_key.clone(),
        };
        let plaintext = serde_json::to_vec(&pair)
            .map_err(|err| VaultError::Persistence(format!("Failed to serialize credentials: {err}")))?;
        let blob = self
            .protector
            .encrypt(&plaintext)
            .map_err(|err| VaultError::Persistence(err.to_string()))?;

        Ok(StoredCredentials::Encrypted(EncryptedCredentials {
            encrypted: BASE64.encode(blob),
            region: record.region.clone(),
            bucket: record.bucket.clone(),
        }))
    }

    fn unseal(&self, stored: EncryptedCredentials) -> Result<CredentialRecord, VaultError> {
        if !self.protector.is_available() {
            return Err(VaultError::DecryptionUnavailable);
        }

        let blob = BASE64
            .decode(stored.encrypted.as_bytes())
            .map_err(|err| VaultError::CorruptData(format!("Ciphertext is not base64: {err}")))?;
        let plaintext = self.protector.decrypt(&blob).map_err(|err| match err {
            ProtectorError::Unavailable(_) => VaultError::DecryptionUnavailable,
            other => VaultError::CorruptData(other.to_string()),
        })?;
        let pair: KeyPair = serde_json::from_slice(&plaintext).map_err(|err| {
            VaultError::CorruptData(format!("Decrypted payload is missing fields: {err}"))
        })?;

        let record = CredentialRecord {
            access_key_id: pair.access_key_id,
            secret_access_key: pair.secret_access_key,
            region: stored.region,
            bucket: stored.bucket,
        };
        check_plain_shape(&record)?;
        Ok(record)
    }

    async fn migrate_to_encrypted(&self, record: &CredentialRecord) {
        match self.reseal_if_unchanged(record).await {
            Ok(true) => info!("Migrated plain credentials to encrypted storage"),
            Ok(false) => debug!("Credentials changed before migration, skipping"),
            Err(err) => warn!("Failed to migrate credentials to encrypted storage: {err}"),
        }
    }

    /// Re-save `record` sealed, unless the file no longer holds it in plain
    /// form. Returns whether the file was rewritten.
    async fn reseal_if_unchanged(&self, record: &CredentialRecord) -> Result<bool, VaultError> {
        let data = self.seal(record)?;
        let _guard = self.write_lock.lock().await;
        match self.read_file().await? {
            Some(StoredCredentials::Plain(current)) if current == *record => {
                self.write_file(&data).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read_file(&self) -> Result<Option<StoredCredentials>, VaultError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(VaultError::Persistence(format!(
                    "Failed to read {}: {err}",
                    self.path.display()
                )))
            }
        };

        parse_stored(&raw).map(Some)
    }

    async fn write_file(&self, data: &StoredCredentials) -> Result<(), VaultError> {
        let file = CredentialsFile {
            version: CURRENT_FILE_VERSION,
            data: data.clone(),
        };
        let serialized = serde_json::to_string_pretty(&file)
            .map_err(|err| VaultError::Persistence(format!("Failed to serialize credentials: {err}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                VaultError::Persistence(format!("Failed to create {}: {err}", parent.display()))
            })?;
        }

        let tmp_path = self
            .path
            .with_extension(format!("json.{:016x}.tmp", rand::random::<u64>()));
        if let Err(err) = fs::write(&tmp_path, serialized).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(VaultError::Persistence(format!(
                "Failed to write {}: {err}",
                tmp_path.display()
            )));
        }
        restrict_permissions(&tmp_path).await;
        if let Err(err) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(VaultError::Persistence(format!(
                "Failed to replace {}: {err}",
                self.path.display()
            )));
        }

        debug!(path = %self.path.display(), "Wrote credentials file");
        Ok(())
    }
}

/// Decode the file contents, accepting both the tagged layout and the older
/// untagged one where an `encrypted` string field marks the encrypted form.
fn parse_stored(raw: &str) -> Result<StoredCredentials, VaultError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| VaultError::CorruptData(format!("Invalid credentials JSON: {err}")))?;
    if !value.is_object() {
        return Err(VaultError::CorruptData(
            "Credentials file is not a JSON object".to_string(),
        ));
    }

    if value.get("kind").is_some() {
        return serde_json::from_value::<CredentialsFile>(value)
            .map(|file| file.data)
            .map_err(|err| VaultError::CorruptData(format!("Unrecognized credentials file: {err}")));
    }

    if value.get("encrypted").is_some_and(Value::is_string) {
        serde_json::from_value::<EncryptedCredentials>(value)
            .map(StoredCredentials::Encrypted)
            .map_err(|err| VaultError::CorruptData(format!("Invalid encrypted credentials: {err}")))
    } else {
        serde_json::from_value::<CredentialRecord>(value)
            .map(StoredCredentials::Plain)
            .map_err(|err| VaultError::CorruptData(format!("Invalid plain credentials: {err}")))
    }
}

fn check_plain_shape(record: &CredentialRecord) -> Result<(), VaultError> {
    if record.access_key_id.trim().is_empty() || record.secret_access_key.trim().is_empty() {
        return Err(VaultError::CorruptData(
            "Stored credentials are missing the key pair".to_string(),
        ));
    }
    if record.bucket.trim().is_empty() {
        return Err(VaultError::CorruptData(
            "Stored credentials are missing the bucket".to_string(),
        ));
    }
    Ok(())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(err) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        warn!(path = %path.display(), "Failed to restrict credentials file permissions: {err}");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
