//! Configuration module for modelfetch
//!
//! Loads config from `$XDG_CONFIG_HOME/modelfetch/config.toml` or `~/.config/modelfetch/config.toml`.
//! Falls back to embedded defaults if file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! # Example
//!
//! ```no_run
//! use modelfetch::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Models dir: {}", config.storage.models_dir.display());
//! println!("Max size: {} bytes", config.transfer.max_size_bytes);
//! ```

pub mod schema;

pub use schema::Config;
