//! One [`FileSystem`] per account profile.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::api::DocumentService;
use crate::config::FsConfig;
use crate::filesystem::FileSystem;

/// The account a file system instance belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountContext {
    pub account_id: String,
    /// Per-account profile directory; the cache lives below it.
    pub profile_dir: PathBuf,
}

impl AccountContext {
    pub fn new(account_id: impl Into<String>, profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            account_id: account_id.into(),
            profile_dir: profile_dir.into(),
        }
    }

    /// `<profile>/GCache/v1`
    pub fn cache_root(&self) -> PathBuf {
        self.profile_dir.join("GCache").join("v1")
    }
}

/// Builds the service a new instance talks to.
pub type ServiceFactory = Box<dyn Fn(&AccountContext) -> Arc<dyn DocumentService> + Send + Sync>;

/// Hands out a shared [`FileSystem`] per account, creating it on first use.
pub struct FileSystemRegistry {
    base_config: FsConfig,
    factory: ServiceFactory,
    instances: Mutex<HashMap<AccountContext, FileSystem>>,
}

impl FileSystemRegistry {
    /// `base_config` applies to every instance, with the cache root replaced
    /// by the account's.
    pub fn new(base_config: FsConfig, factory: ServiceFactory) -> Self {
        Self {
            base_config,
            factory,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// The instance for `account`. Must be called inside a tokio runtime.
    pub fn get_or_create(&self, account: &AccountContext) -> FileSystem {
        let mut instances = self.instances.lock();
        if let Some(fs) = instances.get(account) {
            return fs.clone();
        }
        let config = FsConfig {
            cache_root: account.cache_root(),
            ..self.base_config.clone()
        };
        let fs = FileSystem::new((self.factory)(account), config);
        info!(account = %account.account_id, "created file system instance");
        instances.insert(account.clone(), fs.clone());
        fs
    }

    pub fn find(&self, account: &AccountContext) -> Option<FileSystem> {
        self.instances.lock().get(account).cloned()
    }

    /// Stop and forget the instance for `account`. Returns whether one existed.
    pub async fn shutdown(&self, account: &AccountContext) -> bool {
        let removed = self.instances.lock().remove(account);
        match removed {
            Some(fs) => {
                fs.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        let all: Vec<FileSystem> = self.instances.lock().drain().map(|(_, fs)| fs).collect();
        futures::future::join_all(all.iter().map(|fs| fs.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryDocumentService;
    use crate::error::FsError;

    fn registry() -> FileSystemRegistry {
        FileSystemRegistry::new(
            FsConfig::default(),
            Box::new(|_account: &AccountContext| {
                let service = Arc::new(MemoryDocumentService::new());
                service.add_folder("folder:1", "Docs", None);
                service as Arc<dyn DocumentService>
            }),
        )
    }

    #[tokio::test]
    async fn test_one_instance_per_account() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let alice = AccountContext::new("alice", dir.path().join("alice"));
        let bob = AccountContext::new("bob", dir.path().join("bob"));

        let a1 = registry.get_or_create(&alice);
        let a2 = registry.get_or_create(&alice);
        let b = registry.get_or_create(&bob);

        assert_eq!(a1.config().cache_root, alice.cache_root());
        assert_eq!(b.config().cache_root, dir.path().join("bob").join("GCache").join("v1"));

        a1.create_directory("/Docs/Mine", true, false).await.unwrap();
        assert!(a2.find_entry_by_path("/Docs/Mine").await.is_ok());
        assert!(matches!(
            b.find_entry_by_path("/Docs/Mine").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_forgets_instance() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let alice = AccountContext::new("alice", dir.path());

        let fs = registry.get_or_create(&alice);
        assert!(registry.shutdown(&alice).await);
        assert!(fs.is_stopped());
        assert!(registry.find(&alice).is_none());
        assert!(!registry.shutdown(&alice).await);

        let fresh = registry.get_or_create(&alice);
        assert!(!fresh.is_stopped());
        registry.shutdown_all().await;
        assert!(fresh.is_stopped());
    }
}
