//! Enclave data directory

use enclave_common::{EnclaveResult, ServiceGuid};
use std::path::{Path, PathBuf};

const SERVICES_DIRNAME: &str = "services";

/// Host-side root of the enclave's shared data
#[derive(Debug, Clone)]
pub struct EnclaveDataDir {
    root: PathBuf,
}

impl EnclaveDataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (if needed) the directory of one service registration
    pub async fn service_directory(&self, guid: &ServiceGuid) -> EnclaveResult<ServiceDirectory> {
        let relative = format!("{}/{}", SERVICES_DIRNAME, guid);
        let absolute = self.root.join(SERVICES_DIRNAME).join(guid.as_str());
        tokio::fs::create_dir_all(&absolute).await?;
        Ok(ServiceDirectory { absolute, relative })
    }
}

/// A service's directory inside the data dir
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDirectory {
    absolute: PathBuf,
    relative: String,
}

impl ServiceDirectory {
    pub fn absolute_path(&self) -> &Path {
        &self.absolute
    }

    /// Path relative to the data dir root, as seen from inside containers
    pub fn relative_dirpath(&self) -> &str {
        &self.relative
    }

    /// Delete the directory and everything in it
    pub async fn remove(&self) -> EnclaveResult<()> {
        tokio::fs::remove_dir_all(&self.absolute).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_common::ServiceId;

    #[tokio::test]
    async fn test_service_directory_created() {
        let root = std::env::temp_dir().join(format!("enclave-data-{}", uuid::Uuid::new_v4()));
        let data_dir = EnclaveDataDir::new(&root);
        let guid = ServiceGuid::generate(&ServiceId::new("db"));

        let dir = data_dir.service_directory(&guid).await.unwrap();
        assert!(dir.absolute_path().is_dir());
        assert_eq!(dir.relative_dirpath(), format!("services/{}", guid));

        let again = data_dir.service_directory(&guid).await.unwrap();
        assert_eq!(dir, again);

        dir.remove().await.unwrap();
        assert!(!dir.absolute_path().exists());
        std::fs::remove_dir_all(&root).ok();
    }
}
