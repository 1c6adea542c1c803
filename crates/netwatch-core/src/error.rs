use thiserror::Error;

/// Top-level error type for the netwatch platform.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NetwatchError {
    #[error("Unknown notification channel: {0}")]
    UnknownChannel(String),
}
