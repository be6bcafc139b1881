use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::de::IgnoredAny;
use serde::Deserialize;

pub const DEFAULT_SEPARATOR: &str = "_";
pub const DEFAULT_VARIANT: &str = "default";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ImagerConfig {
    #[serde(default)]
    pub variants: BTreeMap<String, VariantSet>,
    #[serde(default, alias = "defaultVariant")]
    pub default_variant: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ImagerConfig {
    /// Layer the given files (missing ones are skipped) and `IMAGER__*`
    /// environment variables on top of an empty configuration.
    pub fn load(files: &[String]) -> Result<Self> {
        let mut builder = Config::builder();
        for file in files {
            builder = builder.add_source(File::with_name(file).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix("IMAGER")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("storage.backends")
                    .try_parsing(true),
            )
            .build()
            .context("building imager configuration")?
            .try_deserialize()
            .context("deserializing imager configuration")
    }

    pub fn resolve_variant_name<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        match requested {
            Some(name) => Some(name),
            None => self
                .default_variant
                .as_deref()
                .or_else(|| self.variants.contains_key(DEFAULT_VARIANT).then_some(DEFAULT_VARIANT)),
        }
    }
}

/// Presets for one named variant set, grouped by operation kind.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct VariantSet {
    /// Presets stored untouched; the preset value is not interpreted.
    #[serde(default)]
    pub original: BTreeMap<String, IgnoredAny>,
    #[serde(default)]
    pub resize: BTreeMap<String, String>,
    #[serde(default)]
    pub crop: BTreeMap<String, String>,
    #[serde(default, alias = "resizeAndCrop")]
    pub resize_and_crop: BTreeMap<String, ResizeAndCropPreset>,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default, alias = "keepNames")]
    pub keep_names: bool,
}

impl VariantSet {
    pub fn separator(&self) -> &str {
        self.separator.as_deref().unwrap_or(DEFAULT_SEPARATOR)
    }

    pub fn preset_count(&self) -> usize {
        self.original.len() + self.resize.len() + self.crop.len() + self.resize_and_crop.len()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ResizeAndCropPreset {
    pub resize: String,
    pub crop: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default, alias = "uploadDirectory")]
    pub upload_directory: Option<String>,
    #[serde(default, alias = "Local")]
    pub local: Option<LocalConfig>,
    #[serde(default, alias = "S3")]
    pub s3: Option<S3Config>,
    #[serde(default, alias = "Rackspace")]
    pub rackspace: Option<RackspaceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub base_uri: Option<String>,
    /// Unix permission bits applied to written files.
    #[serde(default)]
    pub mode: Option<u32>,
}

#[derive(Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, alias = "key")]
    pub access_key_id: Option<String>,
    #[serde(default, alias = "secret")]
    pub secret_access_key: Option<String>,
    #[serde(default, alias = "storageClass")]
    pub storage_class: Option<String>,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("storage_class", &self.storage_class)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize)]
pub struct RackspaceConfig {
    pub username: String,
    #[serde(alias = "apiKey")]
    pub api_key: String,
    #[serde(default = "default_rackspace_auth_url", alias = "authUrl", alias = "host")]
    pub auth_url: String,
    #[serde(default)]
    pub region: Option<String>,
    pub container: String,
}

fn default_rackspace_auth_url() -> String {
    "https://identity.api.rackspacecloud.com".to_string()
}

impl std::fmt::Debug for RackspaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RackspaceConfig")
            .field("username", &self.username)
            .field("auth_url", &self.auth_url)
            .field("region", &self.region)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}
