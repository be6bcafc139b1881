use std::fmt;
use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use imager::ImagerConfig;
use serde::Deserialize;

#[derive(Clone, Deserialize)]
pub struct Conf {
    pub id: String,
    /// "json" or "full"
    pub log_format: String,
    pub rest_server_port: u16,
    pub rest_server_max_body_size: usize,
    /// Required in the `x-api-key` header of mutating requests. No default;
    /// startup fails when it is missing or blank.
    pub api_key: String,
    /// Uploaded paths must resolve under this directory.
    pub upload_root: PathBuf,
    #[serde(default)]
    pub imager: ImagerConfig,
}

impl fmt::Debug for Conf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conf")
            .field("id", &self.id)
            .field("log_format", &self.log_format)
            .field("rest_server_port", &self.rest_server_port)
            .field("rest_server_max_body_size", &self.rest_server_max_body_size)
            .field("upload_root", &self.upload_root)
            .field("imager", &self.imager)
            .finish_non_exhaustive()
    }
}

impl Conf {
    pub fn new(config_files: Vec<String>) -> Result<Self, anyhow::Error> {
        let mut s = Config::builder().add_source(File::from_str(
            include_str!("conf_defaults.toml"),
            FileFormat::Toml,
        ));
        // Priority order: config file, then environment variables
        for config_file in config_files {
            s = s.add_source(File::with_name(&config_file).required(false));
        }
        let conf: Self = s
            .add_source(
                Environment::with_prefix("IMAGER")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("imager.storage.backends")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        if conf.api_key.trim().is_empty() {
            anyhow::bail!("api_key must not be empty");
        }
        Ok(conf)
    }
}
