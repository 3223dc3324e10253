use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the environment variable that overrides the file's `token`.
pub const TOKEN_ENV_VAR: &str = "WEBP_SERVER_TOKEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the on-disk layout; originals live under `images/`,
    /// derivatives under `caches/`. Must be absolute.
    pub data_directory: PathBuf,
    pub default_image_quality: u32,
    /// `host:port` for TCP, or `unix:<path>` for a Unix domain socket.
    pub server_address: String,
    /// Shared token required for upload and delete when non-empty.
    pub token: String,
    pub valid_image_sizes: Vec<String>,
    pub valid_image_qualities: Vec<u32>,
    /// Upload body limit in megabytes.
    pub max_uploaded_image_size: usize,
    /// Seconds for the `Cache-Control` max-age; 0 disables public caching.
    pub http_cache_ttl: u64,
    pub log_path: Option<PathBuf>,
    /// Bypasses size/quality validation entirely.
    pub debug: bool,
    /// Size of the conversion worker pool.
    pub convert_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::new(),
            default_image_quality: 95,
            server_address: "127.0.0.1:8080".to_string(),
            token: String::new(),
            valid_image_sizes: vec!["300x300".to_string(), "500x500".to_string()],
            valid_image_qualities: Vec::new(),
            max_uploaded_image_size: 4,
            http_cache_ttl: 2_592_000,
            log_path: None,
            debug: false,
            convert_concurrency: num_cpus::get(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid Config File: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Set data_directory in your config file.")]
    MissingDataDir,
    #[error("Absolute path for data_dir needed but got: {0}")]
    RelativeDataDir(String),
    #[error("Absolute path for log_path needed but got: {0}")]
    RelativeLogPath(String),
    #[error("Image size {0} is not valid. Try use WIDTHxHEIGHT format.")]
    InvalidSize(String),
    #[error("Default image quality should be 10 < q < 100.")]
    InvalidDefaultQuality,
    #[error("Convert Concurrency should be greater than zero")]
    InvalidConcurrency,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Config {
    /// Reads and validates the YAML configuration file. The data directory
    /// is created here so the server never starts against a missing root.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Config::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Config, ConfigError> {
        let mut config: Config = serde_yaml::from_str(raw)?;

        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            if !token.is_empty() {
                config.token = token;
            }
        }

        config.validate()?;
        std::fs::create_dir_all(&config.data_directory)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_directory.as_os_str().is_empty() {
            return Err(ConfigError::MissingDataDir);
        }
        if !self.data_directory.is_absolute() {
            return Err(ConfigError::RelativeDataDir(
                self.data_directory.display().to_string(),
            ));
        }
        if let Some(log_path) = &self.log_path {
            if !log_path.is_absolute() {
                return Err(ConfigError::RelativeLogPath(
                    log_path.display().to_string(),
                ));
            }
        }
        for size in &self.valid_image_sizes {
            if !is_size_entry(size) {
                return Err(ConfigError::InvalidSize(size.clone()));
            }
        }
        if self.default_image_quality <= 10 || self.default_image_quality >= 100 {
            return Err(ConfigError::InvalidDefaultQuality);
        }
        if self.convert_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        Ok(())
    }

    /// The `Cache-Control` value attached to derivative responses.
    pub fn cache_control(&self) -> String {
        if self.http_cache_ttl == 0 {
            "private, no-cache, no-store, must-revalidate".to_string()
        } else {
            format!("max-age={}", self.http_cache_ttl)
        }
    }
}

// Entries must look like 300x300: one to four digits on each side.
fn is_size_entry(entry: &str) -> bool {
    let Some((width, height)) = entry.split_once('x') else {
        return false;
    };
    let digits =
        |part: &str| (1..=4).contains(&part.len()) && part.bytes().all(|b| b.is_ascii_digit());
    digits(width) && digits(height)
}
