//! Error types for the netwatch-notify crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification queue is full")]
    QueueFull,

    #[error("Notification dispatcher has shut down")]
    Closed,

    #[error("Store error: {0}")]
    Store(#[from] netwatch_store::StoreError),
}

/// A single channel failed to deliver one notification.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Webhook URL not configured")]
    MissingWebhookUrl,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned status {0}")]
    Status(u16),

    #[error("Desktop notifications unsupported on {0}")]
    UnsupportedPlatform(&'static str),

    #[error("Notifier command exited with {0}")]
    Command(std::process::ExitStatus),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NotifyError>;
