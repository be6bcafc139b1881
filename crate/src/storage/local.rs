use super::{StorageBackend, StorageResult};
use crate::config::LocalConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

pub struct LocalStorageBackend {
    root: PathBuf,
    directory: Option<String>,
    base_uri: Option<String>,
    mode: Option<u32>,
}

impl LocalStorageBackend {
    pub fn new(config: LocalConfig, directory: Option<String>) -> Self {
        Self {
            root: config.path,
            directory,
            base_uri: config.base_uri,
            mode: config.mode,
        }
    }

    fn resolve_path(&self, object: &str) -> PathBuf {
        match &self.directory {
            Some(directory) => self.root.join(directory.trim_matches('/')).join(object),
            None => self.root.join(object),
        }
    }

    #[cfg(unix)]
    async fn apply_mode(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = self.mode {
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn apply_mode(&self, _path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    #[cfg_attr(feature = "instrumentation", tracing::instrument(skip(self)))]
    async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        _content_type: &str,
    ) -> StorageResult<Option<String>> {
        let path = self.resolve_path(remote_name);
        if let Some(parent) = path.parent() {
            // create_dir_all tolerates segments created concurrently by another upload.
            fs::create_dir_all(parent).await?;
        }
        fs::copy(local_path, &path).await?;
        self.apply_mode(&path).await?;
        info!("Wrote {} to local storage at {}", remote_name, path.display());
        Ok(Some(remote_name.to_string()))
    }

    #[cfg_attr(feature = "instrumentation", tracing::instrument(skip(self)))]
    async fn remove(&self, remote_name: &str) -> StorageResult<()> {
        let path = self.resolve_path(remote_name);
        fs::remove_file(&path).await?;
        info!("Removed {} from local storage", remote_name);
        Ok(())
    }

    fn base_uri(&self) -> Option<String> {
        self.base_uri
            .clone()
            .or_else(|| Some(self.root.to_string_lossy().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend(root: &Path, directory: Option<&str>) -> LocalStorageBackend {
        LocalStorageBackend::new(
            LocalConfig {
                path: root.to_path_buf(),
                base_uri: None,
                mode: None,
            },
            directory.map(str::to_string),
        )
    }

    fn source_file(dir: &TempDir) -> PathBuf {
        let source = dir.path().join("source.jpg");
        std::fs::write(&source, b"jpeg bytes").expect("write source");
        source
    }

    #[tokio::test]
    async fn upload_creates_missing_directories() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let root = tempfile::tempdir().expect("tempdir");
        let source = source_file(&scratch);
        let backend = backend(&root.path().join("nested"), Some("uploads/2024"));

        let stored = backend
            .upload(&source, "thumb_photo.jpg", "image/jpeg")
            .await
            .expect("upload");
        assert_eq!(stored.as_deref(), Some("thumb_photo.jpg"));

        let written = root.path().join("nested/uploads/2024/thumb_photo.jpg");
        assert_eq!(std::fs::read(written).expect("read"), b"jpeg bytes");
    }

    #[tokio::test]
    async fn concurrent_uploads_share_directory_creation() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let root = tempfile::tempdir().expect("tempdir");
        let source = source_file(&scratch);
        let backend = backend(root.path(), Some("deep/tree"));

        let names: Vec<String> = (0..8).map(|i| format!("p{i}_photo.jpg")).collect();
        let results = futures::future::join_all(
            names
                .iter()
                .map(|name| backend.upload(&source, name, "image/jpeg")),
        )
        .await;
        assert!(results.iter().all(|result| result.is_ok()));
        for name in &names {
            assert!(root.path().join("deep/tree").join(name).exists());
        }
    }

    #[tokio::test]
    async fn remove_reports_missing_files() {
        let root = tempfile::tempdir().expect("tempdir");
        let backend = backend(root.path(), None);
        let err = backend.remove("thumb_missing.jpg").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn remove_deletes_uploaded_file() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let root = tempfile::tempdir().expect("tempdir");
        let source = source_file(&scratch);
        let backend = backend(root.path(), None);

        backend
            .upload(&source, "square_photo.jpg", "image/jpeg")
            .await
            .expect("upload");
        backend.remove("square_photo.jpg").await.expect("remove");
        assert!(!root.path().join("square_photo.jpg").exists());
    }

    #[test]
    fn base_uri_falls_back_to_root() {
        let backend = backend(Path::new("/srv/images"), None);
        assert_eq!(backend.base_uri().as_deref(), Some("/srv/images"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn upload_applies_configured_mode() {
        use std::os::unix::fs::PermissionsExt;

        let scratch = tempfile::tempdir().expect("tempdir");
        let root = tempfile::tempdir().expect("tempdir");
        let source = source_file(&scratch);
        let backend = LocalStorageBackend::new(
            LocalConfig {
                path: root.path().to_path_buf(),
                base_uri: None,
                mode: Some(0o640),
            },
            None,
        );
        backend
            .upload(&source, "full_photo.jpg", "image/jpeg")
            .await
            .expect("upload");
        let mode = std::fs::metadata(root.path().join("full_photo.jpg"))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }
}
