//! Error types for the autoloc engine

use std::io;
use thiserror::Error;

/// Result type for fallible setup operations
pub type Result<T> = std::result::Result<T, AutolocError>;

/// Errors raised while configuring or feeding the engine from files.
///
/// Routine per-pick rejections are not errors; they are reported through the
/// `bool` returned by the `feed_*` methods.
#[derive(Error, Debug)]
pub enum AutolocError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or inconsistent configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Grid definition file could not be used
    #[error("grid file error: {0}")]
    GridFile(String),

    /// Station configuration file could not be used
    #[error("station config error: {0}")]
    StationConfig(String),

    /// Station inventory could not be parsed
    #[error("inventory error: {0}")]
    Inventory(String),
}

/// Log and abort on a broken internal invariant.
///
/// Reaching this means the engine state is corrupt and any further
/// published origin would be untrustworthy.
pub fn invariant_violation(msg: &str) -> ! {
    log::error!("internal consistency error: {}", msg);
    std::process::abort()
}
