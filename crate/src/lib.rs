use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

pub mod config;
pub mod error;
pub mod executor;
pub mod plan;
pub mod source;
pub mod storage;
pub mod transform;

pub use config::ImagerConfig;
pub use error::{ImagerError, Result};
pub use source::{SourceFile, TimestampSequence, UploadDescriptor, UploadInput};
pub use storage::{create_storage_backends, StorageBackend, StorageError};
pub use transform::{ImageTransformer, RustTransformer};

use executor::VariantExecutor;

/// Outcome of one `upload` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    /// First non-empty base URI exposed by a backend, in registration order;
    /// empty when none exposes one.
    pub base_uri: String,
    /// Stored remote names, in variant order, without duplicates.
    pub files: Vec<String>,
}

/// Derives the configured variants of uploaded images and stores them on
/// every configured backend.
pub struct Imager {
    config: ImagerConfig,
    backends: Vec<Arc<dyn StorageBackend>>,
    transformer: Arc<dyn ImageTransformer>,
    temp_dir: PathBuf,
    upload_root: Option<PathBuf>,
    stamps: TimestampSequence,
}

impl Imager {
    pub async fn new(config: ImagerConfig) -> Result<Self> {
        let backends = create_storage_backends(&config.storage).await?;
        Ok(Self::with_backends(config, backends))
    }

    pub fn with_backends(config: ImagerConfig, backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        Self {
            config,
            backends,
            transformer: Arc::new(RustTransformer::new()),
            temp_dir: std::env::temp_dir(),
            upload_root: None,
            stamps: TimestampSequence::new(),
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn ImageTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Directory temporary variant files are written to before upload.
    pub fn with_temp_dir(mut self, temp_dir: PathBuf) -> Self {
        self.temp_dir = temp_dir;
        self
    }

    /// Only accept inputs whose resolved path lies under `root`.
    pub fn with_upload_root(mut self, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = std::fs::canonicalize(root).map_err(|err| {
            ImagerError::configuration(format!("upload root {}: {err}", root.display()))
        })?;
        self.upload_root = Some(canonical);
        Ok(self)
    }

    pub fn config(&self) -> &ImagerConfig {
        &self.config
    }

    pub fn backends(&self) -> &[Arc<dyn StorageBackend>] {
        &self.backends
    }

    pub fn base_uri(&self) -> String {
        self.backends
            .iter()
            .find_map(|backend| backend.base_uri().filter(|uri| !uri.is_empty()))
            .unwrap_or_default()
    }

    /// Produce and store every variant of each input.
    ///
    /// Inputs are handled one after another; the variants of a single input
    /// run concurrently. The first error stops processing of later inputs,
    /// and variants already stored stay in place.
    #[cfg_attr(feature = "instrumentation", tracing::instrument(skip(self, inputs)))]
    pub async fn upload<I>(&self, inputs: I, variant: Option<&str>) -> Result<UploadResult>
    where
        I: IntoIterator,
        I::Item: Into<UploadInput>,
    {
        let (variant_name, set) = plan::variant_set(&self.config, variant)?;
        let inputs: Vec<UploadInput> = inputs.into_iter().map(Into::into).collect();
        if inputs.is_empty() {
            return Err(ImagerError::input("no files to upload"));
        }

        let executor = VariantExecutor::new(&self.backends, self.transformer.clone(), &self.temp_dir);
        let mut files: Vec<String> = Vec::new();
        for input in inputs {
            let input = match &self.upload_root {
                Some(root) => input.confine(root).await?,
                None => input,
            };
            let source = SourceFile::resolve(input).await?;
            if source.size == 0 {
                info!("Skipping empty upload {}", source.original_name);
                continue;
            }
            let filename = source.canonical_filename(set.keep_names, &self.stamps)?;
            let operations = plan::plan(set)?;
            info!(
                "Uploading {} as {} with {} {} variants",
                source.original_name,
                filename,
                operations.len(),
                variant_name
            );

            let results = join_all(
                operations
                    .iter()
                    .map(|operation| executor.execute(&source, operation, &filename)),
            )
            .await;
            for result in results {
                if let Some(name) = result? {
                    if !files.contains(&name) {
                        files.push(name);
                    }
                }
            }
        }

        Ok(UploadResult {
            base_uri: self.base_uri(),
            files,
        })
    }

    /// Remove every variant of each named file from every backend.
    ///
    /// Names are the canonical file names returned without their preset
    /// prefix (e.g. `1700000000000.jpg`). Objects already gone count as
    /// removed.
    #[cfg_attr(feature = "instrumentation", tracing::instrument(skip(self, files)))]
    pub async fn remove<I>(&self, files: I, variant: Option<&str>) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let (_, set) = plan::variant_set(&self.config, variant)?;
        let operations = plan::plan(set)?;
        let files: Vec<String> = files
            .into_iter()
            .map(|file| file.as_ref().to_string())
            .collect();
        if files.is_empty() {
            return Err(ImagerError::input("no files to remove"));
        }

        let mut removals = Vec::with_capacity(files.len() * operations.len() * self.backends.len());
        for file in &files {
            for operation in &operations {
                let remote_name = operation.remote_name(file);
                for backend in &self.backends {
                    removals.push(remove_from(backend.as_ref(), remote_name.clone()));
                }
            }
        }
        join_all(removals)
            .await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        info!("Removed {} file(s) from {} backend(s)", files.len(), self.backends.len());
        Ok(())
    }
}

async fn remove_from(backend: &dyn StorageBackend, remote_name: String) -> Result<()> {
    match backend.remove(&remote_name).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => {
            warn!("{} not found on {} backend, treating as removed", remote_name, backend.name());
            Ok(())
        }
        Err(err) => Err(ImagerError::backend(backend.name(), err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalConfig, StorageConfig, VariantSet, DEFAULT_VARIANT};
    use crate::storage::tests::{MockBackend, RecordedCall};
    use crate::storage::LocalStorageBackend;
    use crate::transform::{TransformError, TransformRequest};
    use image::{GenericImageView, Rgb, RgbImage};
    use serde::de::IgnoredAny;
    use tempfile::TempDir;

    fn scenario_config() -> ImagerConfig {
        let mut set = VariantSet::default();
        set.resize.insert("thumb".to_string(), "100x100".to_string());
        set.crop.insert("square".to_string(), "50x50".to_string());
        let mut config = ImagerConfig::default();
        config.variants.insert(DEFAULT_VARIANT.to_string(), set);
        config
    }

    fn write_jpeg(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 64]))
            .save(&path)
            .expect("save jpeg");
        path
    }

    fn mocks<const N: usize>(backends: [Arc<MockBackend>; N]) -> Vec<Arc<dyn StorageBackend>> {
        backends
            .into_iter()
            .map(|backend| backend as Arc<dyn StorageBackend>)
            .collect()
    }

    fn temp_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).expect("read temp dir").count()
    }

    struct BrokenTransformer;

    impl ImageTransformer for BrokenTransformer {
        fn transform(&self, request: &TransformRequest) -> std::result::Result<(), TransformError> {
            std::fs::write(&request.output, b"partial")?;
            Err(TransformError::Io(std::io::Error::other("out of memory")))
        }
    }

    #[tokio::test]
    async fn upload_scenario_with_local_backend() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let root = tempfile::tempdir().expect("tempdir");
        let temp = tempfile::tempdir().expect("tempdir");
        let source = write_jpeg(inputs.path(), "photo.jpg", 500, 500);

        let mut config = scenario_config();
        config.storage = StorageConfig {
            backends: vec!["local".to_string()],
            local: Some(LocalConfig {
                path: root.path().to_path_buf(),
                base_uri: None,
                mode: None,
            }),
            ..Default::default()
        };
        let imager = Imager::new(config)
            .await
            .expect("imager")
            .with_temp_dir(temp.path().to_path_buf());

        let result = imager.upload([source.as_path()], None).await.expect("upload");
        assert_eq!(result.base_uri, root.path().to_string_lossy());
        assert_eq!(result.files.len(), 2);

        let thumb = &result.files[0];
        let square = &result.files[1];
        let stamp = thumb
            .strip_prefix("thumb_")
            .and_then(|rest| rest.strip_suffix(".jpg"))
            .expect("thumb name");
        assert!(stamp.parse::<i64>().is_ok());
        assert_eq!(square, &format!("square_{stamp}.jpg"));

        let thumb_image = image::open(root.path().join(thumb)).expect("thumb");
        assert_eq!(thumb_image.dimensions(), (100, 100));
        let square_image = image::open(root.path().join(square)).expect("square");
        assert_eq!(square_image.dimensions(), (50, 50));
        assert_eq!(temp_files(&temp), 0);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn resize_and_crop_scenario() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let root = tempfile::tempdir().expect("tempdir");
        let source = write_jpeg(inputs.path(), "wide.jpg", 1600, 1200);

        let mut set = VariantSet::default();
        set.resize_and_crop.insert(
            "banner".to_string(),
            crate::config::ResizeAndCropPreset {
                resize: "800x600".to_string(),
                crop: "800x200".to_string(),
            },
        );
        set.keep_names = true;
        let mut config = ImagerConfig::default();
        config.variants.insert("hero".to_string(), set);
        let local: Arc<dyn StorageBackend> = Arc::new(LocalStorageBackend::new(
            LocalConfig {
                path: root.path().to_path_buf(),
                base_uri: Some("https://img.example.com".to_string()),
                mode: None,
            },
            Some("uploads".to_string()),
        ));
        let imager = Imager::with_backends(config, vec![local]);

        let result = imager.upload([source.as_path()], Some("hero")).await.expect("upload");
        assert_eq!(
            result,
            UploadResult {
                base_uri: "https://img.example.com".to_string(),
                files: vec!["banner_wide.jpg".to_string()],
            }
        );
        let banner = image::open(root.path().join("uploads/banner_wide.jpg")).expect("banner");
        assert_eq!(banner.dimensions(), (800, 200));
    }

    #[tokio::test]
    async fn every_backend_receives_every_variant() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let source = write_jpeg(inputs.path(), "photo.jpg", 200, 200);
        let first = Arc::new(MockBackend::new("first"));
        let second = Arc::new(MockBackend::new("second").with_uri("https://cdn.example.com"));
        let imager = Imager::with_backends(scenario_config(), mocks([first.clone(), second.clone()]));

        let result = imager.upload([source.as_path()], None).await.expect("upload");
        assert_eq!(result.base_uri, "https://cdn.example.com");
        for backend in [&first, &second] {
            let mut stored = backend.stored.lock().unwrap().clone();
            stored.sort();
            let mut expected = result.files.clone();
            expected.sort();
            assert_eq!(stored, expected);
        }
    }

    #[tokio::test]
    async fn base_uri_is_empty_when_no_backend_exposes_one() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let source = write_jpeg(inputs.path(), "photo.jpg", 60, 60);
        let imager = Imager::with_backends(scenario_config(), mocks([Arc::new(MockBackend::new("mock"))]));
        let result = imager.upload([source.as_path()], None).await.expect("upload");
        assert_eq!(result.base_uri, "");
    }

    #[tokio::test]
    async fn empty_inputs_produce_nothing() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let empty = inputs.path().join("empty.jpg");
        std::fs::write(&empty, b"").expect("write");
        let backend = Arc::new(MockBackend::new("mock"));
        let imager = Imager::with_backends(scenario_config(), mocks([backend.clone()]));

        let result = imager.upload([empty.as_path()], None).await.expect("upload");
        assert!(result.files.is_empty());
        assert!(backend.calls().is_empty());
    }

    fn originals_config() -> ImagerConfig {
        let mut set = VariantSet::default();
        set.original.insert("full".to_string(), IgnoredAny);
        let mut config = ImagerConfig::default();
        config.variants.insert(DEFAULT_VARIANT.to_string(), set);
        config
    }

    #[tokio::test]
    async fn generated_names_are_unique_across_inputs() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let paths: Vec<PathBuf> = ["a.jpg", "b.jpg", "c.jpg"]
            .iter()
            .map(|name| {
                let path = inputs.path().join(name);
                std::fs::write(&path, b"1234").expect("write");
                path
            })
            .collect();
        let backend = Arc::new(MockBackend::new("mock"));
        let imager = Imager::with_backends(originals_config(), mocks([backend.clone()]));

        let result = imager.upload(paths, None).await.expect("upload");
        assert_eq!(result.files.len(), 3);
        let mut stored = backend.stored.lock().unwrap().clone();
        stored.sort();
        stored.dedup();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn descriptors_without_size_are_skipped() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let path = inputs.path().join("upload_1");
        std::fs::write(&path, b"1234").expect("write");
        let backend = Arc::new(MockBackend::new("mock"));
        let imager = Imager::with_backends(originals_config(), mocks([backend.clone()]));

        let descriptor = UploadDescriptor {
            path,
            name: "photo.jpg".to_string(),
            ..Default::default()
        };
        let result = imager.upload([descriptor], None).await.expect("upload");
        assert!(result.files.is_empty());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn inputs_outside_the_upload_root_are_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("tempdir");
        let allowed = root.path().join("photo.jpg");
        std::fs::write(&allowed, b"1234").expect("write");
        let stray = outside.path().join("secret.jpg");
        std::fs::write(&stray, b"1234").expect("write");
        let backend = Arc::new(MockBackend::new("mock"));
        let imager = Imager::with_backends(originals_config(), mocks([backend.clone()]))
            .with_upload_root(root.path())
            .expect("upload root");

        let err = imager.upload([stray.as_path()], None).await.unwrap_err();
        assert!(matches!(err, ImagerError::Input(_)));
        assert!(backend.calls().is_empty());

        let result = imager.upload([allowed.as_path()], None).await.expect("upload");
        assert_eq!(result.files.len(), 1);

        assert!(matches!(
            Imager::with_backends(originals_config(), Vec::new()).with_upload_root("/nonexistent/uploads"),
            Err(ImagerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn kept_names_are_deduplicated_across_inputs() {
        let first_dir = tempfile::tempdir().expect("tempdir");
        let second_dir = tempfile::tempdir().expect("tempdir");
        let first = write_jpeg(first_dir.path(), "photo.jpg", 120, 120);
        let second = write_jpeg(second_dir.path(), "photo.jpg", 120, 120);
        let mut config = scenario_config();
        if let Some(set) = config.variants.get_mut(DEFAULT_VARIANT) {
            set.keep_names = true;
        }
        let imager = Imager::with_backends(config, mocks([Arc::new(MockBackend::new("mock"))]));

        let result = imager.upload(vec![first, second], None).await.expect("upload");
        assert_eq!(result.files, vec!["thumb_photo.jpg", "square_photo.jpg"]);
    }

    #[tokio::test]
    async fn transform_failures_surface_and_clean_up() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let temp = tempfile::tempdir().expect("tempdir");
        let source = write_jpeg(inputs.path(), "photo.jpg", 60, 60);
        let backend = Arc::new(MockBackend::new("mock"));
        let imager = Imager::with_backends(scenario_config(), mocks([backend.clone()]))
            .with_transformer(Arc::new(BrokenTransformer))
            .with_temp_dir(temp.path().to_path_buf());

        let err = imager.upload([source.as_path()], None).await.unwrap_err();
        assert!(matches!(err, ImagerError::Transform(_)));
        assert!(backend.calls().is_empty());
        assert_eq!(temp_files(&temp), 0);
    }

    #[tokio::test]
    async fn backend_failures_stop_later_inputs() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let temp = tempfile::tempdir().expect("tempdir");
        let first = write_jpeg(inputs.path(), "a.jpg", 60, 60);
        let second = write_jpeg(inputs.path(), "b.jpg", 60, 60);
        let broken = Arc::new(MockBackend::new("broken").failing());
        let imager = Imager::with_backends(scenario_config(), mocks([broken.clone()]))
            .with_temp_dir(temp.path().to_path_buf());

        let err = imager.upload(vec![first, second], None).await.unwrap_err();
        assert!(matches!(err, ImagerError::Backend { backend: "broken", .. }));
        // Both variants of the first input were attempted, nothing of the second.
        assert_eq!(broken.calls().len(), 2);
        assert_eq!(temp_files(&temp), 0);
    }

    #[tokio::test]
    async fn configuration_and_input_errors() {
        let imager = Imager::with_backends(scenario_config(), mocks([Arc::new(MockBackend::new("mock"))]));
        let none: Vec<PathBuf> = Vec::new();
        assert!(matches!(
            imager.upload(none, None).await,
            Err(ImagerError::Input(_))
        ));
        assert!(matches!(
            imager.upload(["/tmp/x.jpg"], Some("missing")).await,
            Err(ImagerError::Configuration(_))
        ));
        assert!(matches!(
            imager.upload(["/nonexistent/x.jpg"], None).await,
            Err(ImagerError::Input(_))
        ));

        let no_default = Imager::with_backends(ImagerConfig::default(), Vec::new());
        assert!(matches!(
            no_default.remove(["1.jpg"], None).await,
            Err(ImagerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn remove_issues_one_call_per_variant_and_backend() {
        let first = Arc::new(MockBackend::new("first"));
        let second = Arc::new(MockBackend::new("second"));
        let imager = Imager::with_backends(scenario_config(), mocks([first.clone(), second.clone()]));

        imager.remove(["photo.jpg"], None).await.expect("remove");
        for backend in [&first, &second] {
            let mut removed = backend.removed();
            removed.sort();
            assert_eq!(removed, vec!["square_photo.jpg", "thumb_photo.jpg"]);
        }
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let inputs = tempfile::tempdir().expect("tempdir");
        let source = write_jpeg(inputs.path(), "photo.jpg", 80, 80);
        let backend = Arc::new(MockBackend::new("mock"));
        let imager = Imager::with_backends(scenario_config(), mocks([backend.clone()]));

        let result = imager.upload([source.as_path()], None).await.expect("upload");
        let filename = result.files[0].trim_start_matches("thumb_").to_string();

        imager.remove([filename.as_str()], None).await.expect("first remove");
        assert!(backend.stored.lock().unwrap().is_empty());
        imager.remove([filename.as_str()], None).await.expect("second remove");

        let removals = backend
            .calls()
            .into_iter()
            .filter(|call| matches!(call, RecordedCall::Remove(_)))
            .count();
        assert_eq!(removals, 4);
    }
}
