use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where downloads may come from and what they may be.
///
/// Both lists are a security boundary: they are only ever read from the
/// deployment's config file, never from a request.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SourcesConfig {
    #[serde(default = "default_trusted_origins")]
    pub trusted_origins: Vec<String>,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct StorageConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    #[serde(default)]
    pub category_dirs: BTreeMap<String, PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct TransferConfig {
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: usize,
    #[serde(default = "default_progress_step_percent")]
    pub progress_step_percent: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest wait for the next body chunk; 0 waits forever
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ServerConfig {
    pub socket_path: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_trusted_origins() -> Vec<String> {
    vec![
        "https://huggingface.co/".to_string(),
        "https://civitai.com/".to_string(),
        "https://raw.githubusercontent.com/".to_string(),
    ]
}
fn default_allowed_extensions() -> Vec<String> {
    [
        ".safetensors",
        ".sft",
        ".ckpt",
        ".pt",
        ".pth",
        ".bin",
        ".onnx",
        ".yaml",
        ".json",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("modelfetch/models")
}
fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("modelfetch")
}
fn default_categories() -> Vec<String> {
    [
        "checkpoints",
        "clip",
        "clip_vision",
        "controlnet",
        "diffusion_models",
        "embeddings",
        "loras",
        "text_encoders",
        "unet",
        "upscale_models",
        "vae",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
const fn default_max_size_bytes() -> u64 {
    50 * 1024 * 1024 * 1024
}
const fn default_chunk_size_bytes() -> usize {
    1024 * 1024
}
const fn default_progress_step_percent() -> f64 {
    5.0
}
const fn default_max_concurrent() -> usize {
    4
}
const fn default_connect_timeout_secs() -> u64 {
    30
}
const fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            trusted_origins: default_trusted_origins(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            scratch_dir: default_scratch_dir(),
            categories: default_categories(),
            category_dirs: BTreeMap::new(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            chunk_size_bytes: default_chunk_size_bytes(),
            progress_step_percent: default_progress_step_percent(),
            max_concurrent: default_max_concurrent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load config from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            FetchError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;

        Ok(config)
    }

    /// Reject settings the download manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sources.trusted_origins.is_empty() {
            return Err(FetchError::Config(
                "sources.trusted_origins must list at least one origin".to_string(),
            ));
        }
        if self.transfer.chunk_size_bytes == 0 {
            return Err(FetchError::Config(
                "transfer.chunk_size_bytes must be greater than 0".to_string(),
            ));
        }
        if self.transfer.max_concurrent == 0 {
            return Err(FetchError::Config(
                "transfer.max_concurrent must be greater than 0".to_string(),
            ));
        }
        let step = self.transfer.progress_step_percent;
        if !(step > 0.0 && step <= 100.0) {
            return Err(FetchError::Config(format!(
                "transfer.progress_step_percent must be in (0, 100], got {step}"
            )));
        }
        Ok(())
    }

    /// Socket the daemon listens on
    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.server.socket_path {
            Some(path) => Ok(path.clone()),
            None => default_socket_path(),
        }
    }
}

/// `$XDG_CONFIG_HOME/modelfetch/config.toml` or `~/.config/modelfetch/config.toml`
pub fn config_path() -> Result<PathBuf> {
    let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config)
    } else {
        let home = std::env::var("HOME")
            .map_err(|_| FetchError::Config("HOME env var not set".to_string()))?;
        PathBuf::from(home).join(".config")
    };

    Ok(config_dir.join("modelfetch").join("config.toml"))
}

/// Socket path from `XDG_RUNTIME_DIR`
fn default_socket_path() -> Result<PathBuf> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .or_else(|_| -> std::result::Result<String, std::env::VarError> {
            #[cfg(target_os = "linux")]
            {
                let uid = nix::unistd::getuid();
                Ok(format!("/run/user/{uid}"))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(std::env::VarError::NotPresent)
            }
        })
        .map_err(|_| FetchError::Ipc("XDG_RUNTIME_DIR not set".to_string()))?;

    Ok(PathBuf::from(runtime_dir).join("modelfetch.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.transfer.max_size_bytes, 53_687_091_200);
        assert_eq!(config.transfer.chunk_size_bytes, 1_048_576);
        assert!((config.transfer.progress_step_percent - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.sources.trusted_origins.len(), 3);
        assert!(config
            .sources
            .allowed_extensions
            .contains(&".safetensors".to_string()));
        assert!(config.storage.categories.contains(&"loras".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[storage]
models_dir = "/srv/models"

[transfer]
max_concurrent = 2
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.transfer.max_concurrent, 2);
        assert_eq!(config.transfer.chunk_size_bytes, 1_048_576);
        assert_eq!(config.storage.categories.len(), 11);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_shipped_sample_parses() {
        let sample = include_str!("../../config/default.toml");
        let config: Config = toml::from_str(sample).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.sources.trusted_origins,
            Config::default().sources.trusted_origins
        );
        assert_eq!(config.transfer.max_size_bytes, 53_687_091_200);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(&temp_dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.transfer.max_concurrent, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[transfer]\nchunk_size_bytes = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::write(&path, "[sources]\ntrusted_origins = []\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::write(&path, "[transfer]\nprogress_step_percent = 0.0\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::write(&path, "not = [valid").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    #[serial]
    fn test_config_path_honours_xdg() {
        let original = std::env::var("XDG_CONFIG_HOME").ok();
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg-test");

        let path = config_path().unwrap();
        assert_eq!(path, PathBuf::from("/tmp/xdg-test/modelfetch/config.toml"));

        match original {
            Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
    }

    #[test]
    fn test_explicit_socket_path() {
        let mut config = Config::default();
        config.server.socket_path = Some(PathBuf::from("/tmp/custom.sock"));
        assert_eq!(
            config.socket_path().unwrap(),
            PathBuf::from("/tmp/custom.sock")
        );
    }
}
