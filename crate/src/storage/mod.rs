use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::error::{ImagerError, Result};

mod cache;
mod local;
mod rackspace;
#[cfg(feature = "s3")]
mod s3;

pub use cache::ResourceCache;
pub use local::LocalStorageBackend;
pub use rackspace::{CloudFilesClient, Container, ContainerClient, RackspaceStorageBackend};
#[cfg(feature = "s3")]
pub use s3::S3StorageBackend;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Failures reported by a storage backend.
///
/// Cloneable so a failed container acquisition can be handed to every caller
/// that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("client error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Client {
        status: Option<u16>,
        message: String,
    },

    #[error("misconfigured backend: {0}")]
    Configuration(String),
}

impl StorageError {
    pub fn client(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Client {
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(self, Self::Client { status: Some(404), .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(err.to_string())
        } else {
            Self::Io(err.to_string())
        }
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store the file at `local_path` under `remote_name`. Returns the stored
    /// name, or `None` when the backend accepted the request without storing
    /// anything.
    async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        content_type: &str,
    ) -> StorageResult<Option<String>>;

    async fn remove(&self, remote_name: &str) -> StorageResult<()>;

    fn base_uri(&self) -> Option<String>;
}

/// Join the shared upload directory and an object name with a single `/`.
pub(crate) fn object_key(directory: Option<&str>, object: &str) -> String {
    match directory {
        Some(prefix) if !prefix.trim_matches('/').is_empty() => {
            format!("{}/{}", prefix.trim_matches('/'), object)
        }
        _ => object.to_string(),
    }
}

/// Build every backend listed in `config.backends`, in the listed order.
pub async fn create_storage_backends(config: &StorageConfig) -> Result<Vec<Arc<dyn StorageBackend>>> {
    if config.backends.is_empty() {
        return Err(ImagerError::configuration("no storage backend configured"));
    }
    let directory = config
        .upload_directory
        .clone()
        .filter(|value| !value.trim().is_empty());

    let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::with_capacity(config.backends.len());
    for backend in &config.backends {
        match backend.trim().to_lowercase().as_str() {
            "local" => {
                let local = config.local.clone().ok_or_else(|| {
                    ImagerError::configuration("storage.local must be set for the local backend")
                })?;
                backends.push(Arc::new(LocalStorageBackend::new(local, directory.clone())));
            }
            #[cfg(feature = "s3")]
            "s3" => {
                let s3 = config.s3.clone().ok_or_else(|| {
                    ImagerError::configuration("storage.s3 must be set for the s3 backend")
                })?;
                if s3.bucket.trim().is_empty() {
                    return Err(ImagerError::configuration("storage.s3.bucket must not be empty"));
                }
                backends.push(Arc::new(S3StorageBackend::new(s3, directory.clone()).await));
            }
            "rackspace" => {
                let rackspace = config.rackspace.clone().ok_or_else(|| {
                    ImagerError::configuration("storage.rackspace must be set for the rackspace backend")
                })?;
                let client = CloudFilesClient::new(&rackspace)
                    .map_err(|err| ImagerError::configuration(err.to_string()))?;
                backends.push(Arc::new(RackspaceStorageBackend::new(
                    Arc::new(client),
                    rackspace.container,
                    directory.clone(),
                )));
            }
            other => {
                return Err(ImagerError::configuration(format!(
                    "unsupported storage backend: {other}"
                )))
            }
        }
    }
    Ok(backends)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::LocalConfig;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RecordedCall {
        Upload { remote_name: String, content_type: String },
        Remove(String),
    }

    /// Backend that records calls and tracks which names it currently holds.
    pub struct MockBackend {
        pub label: &'static str,
        pub uri: Option<String>,
        pub calls: Mutex<Vec<RecordedCall>>,
        pub stored: Mutex<Vec<String>>,
        pub fail_uploads: bool,
        pub seen_sources: Mutex<Vec<std::path::PathBuf>>,
    }

    impl MockBackend {
        pub fn new(label: &'static str) -> Self {
            Self {
                label,
                uri: None,
                calls: Mutex::new(Vec::new()),
                stored: Mutex::new(Vec::new()),
                fail_uploads: false,
                seen_sources: Mutex::new(Vec::new()),
            }
        }

        pub fn with_uri(mut self, uri: &str) -> Self {
            self.uri = Some(uri.to_string());
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail_uploads = true;
            self
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn removed(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    RecordedCall::Remove(name) => Some(name),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl StorageBackend for MockBackend {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn upload(
            &self,
            local_path: &Path,
            remote_name: &str,
            content_type: &str,
        ) -> StorageResult<Option<String>> {
            self.calls.lock().unwrap().push(RecordedCall::Upload {
                remote_name: remote_name.to_string(),
                content_type: content_type.to_string(),
            });
            self.seen_sources
                .lock()
                .unwrap()
                .push(local_path.to_path_buf());
            if !local_path.exists() {
                return Err(StorageError::NotFound(local_path.display().to_string()));
            }
            if self.fail_uploads {
                return Err(StorageError::client(Some(500), "upload rejected"));
            }
            self.stored.lock().unwrap().push(remote_name.to_string());
            Ok(Some(remote_name.to_string()))
        }

        async fn remove(&self, remote_name: &str) -> StorageResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(RecordedCall::Remove(remote_name.to_string()));
            let mut stored = self.stored.lock().unwrap();
            match stored.iter().position(|name| name == remote_name) {
                Some(position) => {
                    stored.remove(position);
                    Ok(())
                }
                None => Err(StorageError::NotFound(remote_name.to_string())),
            }
        }

        fn base_uri(&self) -> Option<String> {
            self.uri.clone()
        }
    }

    #[test]
    fn object_key_joins_directory_once() {
        assert_eq!(object_key(None, "thumb_a.jpg"), "thumb_a.jpg");
        assert_eq!(object_key(Some(""), "thumb_a.jpg"), "thumb_a.jpg");
        assert_eq!(object_key(Some("uploads/"), "thumb_a.jpg"), "uploads/thumb_a.jpg");
        assert_eq!(object_key(Some("/a/b"), "thumb_a.jpg"), "a/b/thumb_a.jpg");
    }

    #[test]
    fn not_found_covers_http_404() {
        assert!(StorageError::client(Some(404), "gone").is_not_found());
        assert!(!StorageError::client(Some(500), "boom").is_not_found());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(StorageError::from(io).is_not_found());
    }

    #[tokio::test]
    async fn registry_rejects_unknown_and_incomplete_backends() {
        let empty = StorageConfig::default();
        assert!(matches!(
            create_storage_backends(&empty).await,
            Err(ImagerError::Configuration(_))
        ));

        let unknown = StorageConfig {
            backends: vec!["ftp".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            create_storage_backends(&unknown).await,
            Err(ImagerError::Configuration(_))
        ));

        let missing_local = StorageConfig {
            backends: vec!["local".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            create_storage_backends(&missing_local).await,
            Err(ImagerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn registry_builds_backends_in_listed_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig {
            backends: vec!["Local".to_string()],
            upload_directory: Some("uploads".to_string()),
            local: Some(LocalConfig {
                path: dir.path().to_path_buf(),
                base_uri: Some("http://localhost/images".to_string()),
                mode: None,
            }),
            ..Default::default()
        };
        let backends = create_storage_backends(&config).await.expect("backends");
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].name(), "local");
        assert_eq!(
            backends[0].base_uri().as_deref(),
            Some("http://localhost/images")
        );
    }
}
