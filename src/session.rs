//! Application state: the credential vault plus the one live catalog handle.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::catalog::CatalogClient;
use crate::config::AppConfig;
use crate::credentials::{CredentialPatch, CredentialRecord};
use crate::error::{Error, Result};
use crate::store::{ObjectStore, S3Store};
use crate::vault::CredentialVault;

/// Builds the remote store for a credential record.
pub type StoreFactory =
    Arc<dyn Fn(&CredentialRecord, &AppConfig) -> Arc<dyn ObjectStore> + Send + Sync>;

pub struct Session {
    vault: CredentialVault,
    config: AppConfig,
    store_factory: StoreFactory,
    catalog: RwLock<Option<Arc<CatalogClient>>>,
}

impl Session {
    /// A session whose catalog talks to S3.
    pub fn new(vault: CredentialVault, config: AppConfig) -> Self {
        Self::with_store_factory(
            vault,
            config,
            Arc::new(|record: &CredentialRecord, config: &AppConfig| {
                Arc::new(S3Store::new(record, config)) as Arc<dyn ObjectStore>
            }),
        )
    }

    pub fn with_store_factory(
        vault: CredentialVault,
        config: AppConfig,
        store_factory: StoreFactory,
    ) -> Self {
        Self {
            vault,
            config,
            store_factory,
            catalog: RwLock::new(None),
        }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// Connect with the stored record, if there is one. Returns whether a
    /// record was found.
    pub async fn init(&self) -> Result<bool> {
        match self.vault.load().await? {
            Some(record) => {
                self.connect(&record).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the catalog handle with one built for `record`.
    ///
    /// The previous handle is released before the new one is created.
    pub async fn connect(&self, record: &CredentialRecord) {
        let mut slot = self.catalog.write().await;
        if let Some(previous) = slot.take() {
            info!(bucket = %previous.bucket(), "Released storage client");
            drop(previous);
        }

        let store = (self.store_factory)(record, &self.config);
        *slot = Some(Arc::new(CatalogClient::new(store, &self.config)));
        info!(bucket = %record.bucket, region = %record.region, "Storage client initialized");
    }

    /// Validate, persist and connect with `record`.
    pub async fn save_credentials(&self, record: &CredentialRecord) -> Result<()> {
        record.validate()?;
        self.vault.save(record).await?;
        self.connect(record).await;
        Ok(())
    }

    /// Apply `patch` to the stored record, then persist and reconnect.
    pub async fn update_credentials(&self, patch: CredentialPatch) -> Result<CredentialRecord> {
        let current = self.vault.load().await?.ok_or(Error::NotInitialized)?;
        let updated = patch.apply(&current);
        if updated != current {
            self.save_credentials(&updated).await?;
        }
        Ok(updated)
    }

    /// Delete the stored record and drop the catalog handle.
    pub async fn clear_credentials(&self) -> Result<()> {
        self.vault.delete().await?;
        self.disconnect().await;
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(previous) = self.catalog.write().await.take() {
            info!(bucket = %previous.bucket(), "Released storage client");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.catalog.read().await.is_some()
    }

    /// The live catalog handle, or [`Error::NotInitialized`].
    pub async fn catalog(&self) -> Result<Arc<CatalogClient>> {
        self.catalog
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(Error::NotInitialized)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::credentials::sample_record;
    use crate::error::{ValidationError, VaultError};
    use crate::protector::{StaticKeyProtector, UnavailableProtector};
    use crate::store::MemoryStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// A session backed by memory stores; every store it creates is recorded.
    pub(crate) fn memory_session(temp: &TempDir) -> (Session, Arc<Mutex<Vec<Arc<MemoryStore>>>>) {
        let created: Arc<Mutex<Vec<Arc<MemoryStore>>>> = Arc::default();
        let factory_created = created.clone();
        let factory: StoreFactory = Arc::new(move |record: &CredentialRecord, _config: &AppConfig| {
            let store = Arc::new(MemoryStore::new(record.bucket.clone()));
            factory_created.lock().unwrap().push(store.clone());
            store as Arc<dyn ObjectStore>
        });
        let vault = CredentialVault::new(
            temp.path().join("credentials.json"),
            Arc::new(StaticKeyProtector::random()),
        );
        (
            Session::with_store_factory(vault, AppConfig::default(), factory),
            created,
        )
    }

    #[tokio::test]
    async fn test_catalog_before_init_is_not_initialized() {
        let temp = TempDir::new().unwrap();
        let (session, _) = memory_session(&temp);

        assert!(!session.init().await.unwrap());
        let err = session.catalog().await.unwrap_err();
        assert!(err.is_not_initialized());
    }

    #[tokio::test]
    async fn test_save_connects_and_init_reconnects() {
        let temp = TempDir::new().unwrap();
        let (session, created) = memory_session(&temp);

        session.save_credentials(&sample_record()).await.unwrap();
        assert_eq!(session.catalog().await.unwrap().bucket(), "my-photos.archive");

        assert!(session.init().await.unwrap());
        assert_eq!(created.lock().unwrap().len(), 2);
        assert!(session.is_connected().await);
    }

    #[tokio::test]
    async fn test_reconnect_releases_previous_handle() {
        let temp = TempDir::new().unwrap();
        let (session, created) = memory_session(&temp);

        session.connect(&sample_record()).await;
        let mut other = sample_record();
        other.bucket = "other-bucket".to_string();
        session.connect(&other).await;

        assert_eq!(session.catalog().await.unwrap().bucket(), "other-bucket");
        // The first store is now only referenced by the test's list.
        assert_eq!(Arc::strong_count(&created.lock().unwrap()[0]), 1);
    }

    #[tokio::test]
    async fn test_invalid_record_never_reaches_vault() {
        let temp = TempDir::new().unwrap();
        let (session, _) = memory_session(&temp);
        let mut record = sample_record();
        record.access_key_id = "short".to_string();

        let err = session.save_credentials(&record).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::AccessKeyId)));
        assert!(!session.vault().has().await);
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn test_update_credentials_patches_stored_record() {
        let temp = TempDir::new().unwrap();
        let (session, _) = memory_session(&temp);

        assert!(session
            .update_credentials(CredentialPatch::new().with_bucket("next-bucket"))
            .await
            .unwrap_err()
            .is_not_initialized());

        session.save_credentials(&sample_record()).await.unwrap();
        let updated = session
            .update_credentials(CredentialPatch::new().with_bucket("next-bucket"))
            .await
            .unwrap();

        assert_eq!(updated.bucket, "next-bucket");
        assert_eq!(session.vault().load().await.unwrap(), Some(updated));
        assert_eq!(session.catalog().await.unwrap().bucket(), "next-bucket");
    }

    #[tokio::test]
    async fn test_clear_credentials_disconnects() {
        let temp = TempDir::new().unwrap();
        let (session, _) = memory_session(&temp);

        session.save_credentials(&sample_record()).await.unwrap();
        session.clear_credentials().await.unwrap();

        assert!(!session.vault().has().await);
        assert!(session.catalog().await.unwrap_err().is_not_initialized());
        session.clear_credentials().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_surfaces_unusable_record() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("credentials.json");
        CredentialVault::new(&path, Arc::new(StaticKeyProtector::random()))
            .save(&sample_record())
            .await
            .unwrap();

        let session = Session::new(
            CredentialVault::new(&path, Arc::new(UnavailableProtector)),
            AppConfig::default(),
        );
        let err = session.init().await.unwrap_err();
        assert!(matches!(err, Error::Vault(VaultError::DecryptionUnavailable)));
        assert!(!session.is_connected().await);
    }
}
