use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{ImagerError, Result};
use crate::plan::{Transform, VariantOperation};
use crate::source::{extension_for, SourceFile};
use crate::storage::StorageBackend;
use crate::transform::{ImageTransformer, TransformRequest};

/// A file ready to be pushed to the backends. Temporary artifacts are removed
/// by [`DerivedArtifact::discard`], or on drop if the upload was abandoned.
#[derive(Debug)]
pub struct DerivedArtifact {
    pub local_path: PathBuf,
    pub remote_name: String,
    pub content_type: String,
    temporary: bool,
}

impl DerivedArtifact {
    fn original(source: &SourceFile, remote_name: String) -> Self {
        Self {
            local_path: source.local_path.clone(),
            remote_name,
            content_type: source.content_type.clone(),
            temporary: false,
        }
    }

    fn temporary(local_path: PathBuf, remote_name: String, content_type: String) -> Self {
        Self {
            local_path,
            remote_name,
            content_type,
            temporary: true,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub async fn discard(mut self) {
        if !self.temporary {
            return;
        }
        self.temporary = false;
        match tokio::fs::remove_file(&self.local_path).await {
            Ok(()) => debug!("Removed temporary file {}", self.local_path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "Failed to remove temporary file {}: {}",
                self.local_path.display(),
                err
            ),
        }
    }
}

impl Drop for DerivedArtifact {
    fn drop(&mut self) {
        if !self.temporary {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.local_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove temporary file {}: {}",
                    self.local_path.display(),
                    err
                );
            }
        }
    }
}

/// Produces one variant of a source file and pushes it to every backend.
pub struct VariantExecutor<'a> {
    backends: &'a [Arc<dyn StorageBackend>],
    transformer: Arc<dyn ImageTransformer>,
    temp_dir: &'a Path,
}

impl<'a> VariantExecutor<'a> {
    pub fn new(
        backends: &'a [Arc<dyn StorageBackend>],
        transformer: Arc<dyn ImageTransformer>,
        temp_dir: &'a Path,
    ) -> Self {
        Self {
            backends,
            transformer,
            temp_dir,
        }
    }

    /// Returns the stored remote name, or `None` when nothing was stored
    /// (empty source, or no backend kept the object).
    pub async fn execute(
        &self,
        source: &SourceFile,
        operation: &VariantOperation,
        filename: &str,
    ) -> Result<Option<String>> {
        if source.size == 0 {
            debug!("Skipping {} for empty source {}", operation.preset_name, source.original_name);
            return Ok(None);
        }
        let remote_name = operation.remote_name(filename);
        let artifact = self.produce(source, operation, remote_name).await?;
        let outcome = self.fan_out(&artifact).await;
        artifact.discard().await;
        outcome
    }

    async fn produce(
        &self,
        source: &SourceFile,
        operation: &VariantOperation,
        remote_name: String,
    ) -> Result<DerivedArtifact> {
        if operation.transform == Transform::None {
            return Ok(DerivedArtifact::original(source, remote_name));
        }

        let output = self.temp_path(&source.content_type)?;
        let artifact = DerivedArtifact::temporary(output.clone(), remote_name, source.content_type.clone());
        let request = TransformRequest {
            source: source.local_path.clone(),
            output,
            transform: operation.transform,
        };
        let transformer = self.transformer.clone();
        let result = tokio::task::spawn_blocking(move || transformer.transform(&request)).await;
        let failure = match result {
            Ok(Ok(())) => return Ok(artifact),
            Ok(Err(err)) => err.to_string(),
            Err(err) => format!("transform task failed: {err}"),
        };
        artifact.discard().await;
        Err(ImagerError::Transform(format!(
            "{} for preset {}: {}",
            source.original_name, operation.preset_name, failure
        )))
    }

    /// Unique per operation so concurrent variants never share a file.
    fn temp_path(&self, content_type: &str) -> Result<PathBuf> {
        let extension = extension_for(content_type)?;
        Ok(self.temp_dir.join(format!(
            "imager_{}_{}{}",
            Utc::now().timestamp_millis(),
            rand::random::<u32>(),
            extension
        )))
    }

    /// Every backend is awaited; the first failure in backend order wins.
    async fn fan_out(&self, artifact: &DerivedArtifact) -> Result<Option<String>> {
        let uploads = self.backends.iter().map(|backend| async move {
            backend
                .upload(&artifact.local_path, &artifact.remote_name, &artifact.content_type)
                .await
                .map_err(|err| ImagerError::backend(backend.name(), err))
        });
        let mut stored = false;
        for result in join_all(uploads).await {
            stored |= result?.is_some();
        }
        if stored {
            info!("Stored variant {}", artifact.remote_name);
            Ok(Some(artifact.remote_name.clone()))
        } else {
            Ok(None)
        }
    }
}
