//! Error types for the netwatch-scan crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid network range: {range}")]
    InvalidRange { range: String },

    #[error("Discovery of {range} incomplete: {failed} probe task(s) failed")]
    DiscoveryFailed { range: String, failed: usize },

    #[error("Scan already running for {ip}")]
    ScanAlreadyRunning { ip: String },

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Vulnerability rules error: {0}")]
    Rules(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store error: {0}")]
    Store(#[from] netwatch_store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScanError>;
