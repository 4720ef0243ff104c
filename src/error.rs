//! Error types shared by the vault, the catalog client and the session.

use thiserror::Error;

/// A credential field failed validation. Raised before anything reaches the vault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Access key ID must be 20 uppercase letters or digits")]
    AccessKeyId,

    #[error("Secret access key must be at least 40 characters")]
    SecretAccessKey,

    #[error("Unsupported region: {0}")]
    Region(String),

    #[error("Bucket name must be 3-63 characters of lowercase letters, digits, '.' or '-'")]
    Bucket,
}

/// Failures of the platform encryption facility.
#[derive(Debug, Error)]
pub enum ProtectorError {
    #[error("Platform encryption unavailable: {0}")]
    Unavailable(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Credential vault failures.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Reading or writing the backing file failed, or encryption threw while saving.
    #[error("Credential storage failed: {0}")]
    Persistence(String),

    /// An encrypted record exists but the platform facility that wrote it is missing.
    #[error("Stored credentials are encrypted but platform encryption is unavailable")]
    DecryptionUnavailable,

    /// The stored record has an unrecognized shape.
    #[error("Stored credentials are corrupt: {0}")]
    CorruptData(String),
}

/// Remote-call failures of the object catalog client.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to list objects: {0}")]
    Listing(String),

    #[error("Failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Failed to copy {source_key} to {destination_key}: {message}")]
    Copy {
        source_key: String,
        destination_key: String,
        message: String,
    },

    #[error("Failed to delete {key}: {message}")]
    Delete { key: String, message: String },

    #[error("Failed to stat {key}: {message}")]
    Stat { key: String, message: String },

    #[error("Failed to presign download URL for {key}: {message}")]
    Presign { key: String, message: String },

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Prefix must not begin with '/': {0}")]
    InvalidPrefix(String),

    #[error("Download URL expiry must be between 1 and {max} seconds, got {got}")]
    InvalidExpiry { got: u64, max: u64 },

    #[error("{failed} of {total} uploads failed")]
    BatchUpload { failed: usize, total: usize },

    #[error("{failed} of {total} deletes failed")]
    BatchDelete { failed: usize, total: usize },
}

/// Top-level error surfaced to the application shell.
#[derive(Debug, Error)]
pub enum Error {
    /// No catalog handle exists yet; the caller should prompt for credentials.
    #[error("Storage client is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl Error {
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, Error::NotInitialized)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
