#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod downloads;
pub mod error;
pub mod ipc;
pub mod logging;

pub use error::{FetchError, Result};
