//! Input files and the names their variants are stored under.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::Deserialize;

use crate::error::{ImagerError, Result};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Content types variants can be produced for, with the extension they are stored under.
const CONTENT_TYPE_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", ".jpg"),
    ("image/jpg", ".jpg"),
    ("image/png", ".png"),
    ("image/gif", ".gif"),
];

/// Parameters such as `; charset=binary` are ignored.
pub fn extension_for(content_type: &str) -> Result<&'static str> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    CONTENT_TYPE_EXTENSIONS
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(essence))
        .map(|(_, extension)| *extension)
        .ok_or_else(|| ImagerError::UnsupportedType(content_type.to_string()))
}

/// An upload that has already been written to local disk by a transport layer.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UploadDescriptor {
    pub path: PathBuf,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, alias = "type")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UploadInput {
    Path(PathBuf),
    Descriptor(UploadDescriptor),
}

impl UploadInput {
    pub fn local_path(&self) -> &Path {
        match self {
            Self::Path(path) => path,
            Self::Descriptor(descriptor) => &descriptor.path,
        }
    }

    /// Resolve the local path and reject it unless it lies under `root`,
    /// which must already be canonical.
    pub async fn confine(self, root: &Path) -> Result<Self> {
        let requested = self.local_path();
        let canonical = tokio::fs::canonicalize(requested)
            .await
            .map_err(|err| ImagerError::input(format!("cannot read {}: {err}", requested.display())))?;
        if !canonical.starts_with(root) {
            return Err(ImagerError::input(format!(
                "{} is outside the upload root",
                requested.display()
            )));
        }
        Ok(match self {
            Self::Path(_) => Self::Path(canonical),
            Self::Descriptor(descriptor) => Self::Descriptor(UploadDescriptor {
                path: canonical,
                ..descriptor
            }),
        })
    }
}

/// Hands out millisecond timestamps for generated file names, strictly
/// increasing so inputs handled within the same millisecond never share one.
#[derive(Debug, Default)]
pub struct TimestampSequence {
    last: AtomicI64,
}

impl TimestampSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }
}

impl From<PathBuf> for UploadInput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for UploadInput {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<&str> for UploadInput {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<UploadDescriptor> for UploadInput {
    fn from(descriptor: UploadDescriptor) -> Self {
        Self::Descriptor(descriptor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub size: u64,
    pub content_type: String,
    pub original_name: String,
    pub local_path: PathBuf,
}

impl SourceFile {
    pub async fn resolve(input: UploadInput) -> Result<Self> {
        match input {
            UploadInput::Path(path) => {
                let size = file_size(&path).await?;
                let original_name = basename(&path.to_string_lossy());
                let content_type = guess_content_type(&path);
                Ok(Self {
                    size,
                    content_type,
                    original_name,
                    local_path: path,
                })
            }
            UploadInput::Descriptor(descriptor) => {
                // A descriptor without a size is a placeholder and gets skipped.
                let size = descriptor.size.unwrap_or(0);
                let header_type = descriptor
                    .headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                    .map(|(_, value)| value.clone());
                let content_type = descriptor
                    .content_type
                    .filter(|value| !value.trim().is_empty())
                    .or(header_type)
                    .unwrap_or_else(|| {
                        let by_name = guess_content_type(Path::new(&descriptor.name));
                        if by_name == FALLBACK_CONTENT_TYPE {
                            guess_content_type(&descriptor.path)
                        } else {
                            by_name
                        }
                    });
                let original_name = if descriptor.name.trim().is_empty() {
                    basename(&descriptor.path.to_string_lossy())
                } else {
                    descriptor.name
                };
                Ok(Self {
                    size,
                    content_type,
                    original_name,
                    local_path: descriptor.path,
                })
            }
        }
    }

    /// Name shared by every variant of this file: the sanitized original name
    /// when `keep_names` is set, otherwise a millisecond timestamp plus the
    /// extension for the content type.
    pub fn canonical_filename(&self, keep_names: bool, stamps: &TimestampSequence) -> Result<String> {
        if keep_names {
            let name = sanitize(&basename(&self.original_name));
            if name.is_empty() {
                return Err(ImagerError::input(format!(
                    "cannot derive a file name from {:?}",
                    self.original_name
                )));
            }
            return Ok(name);
        }
        let extension = extension_for(&self.content_type)?;
        Ok(format!("{}{}", stamps.next(), extension))
    }
}

async fn file_size(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|err| ImagerError::input(format!("cannot read {}: {err}", path.display())))?;
    if !metadata.is_file() {
        return Err(ImagerError::input(format!("{} is not a file", path.display())));
    }
    Ok(metadata.len())
}

fn guess_content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}

fn basename(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or_default().to_string()
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}
