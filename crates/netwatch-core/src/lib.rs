//! netwatch-core: Shared types and error handling for the netwatch platform.
//!
//! This crate provides the foundational types used across all netwatch components:
//! - Device records produced by discovery and enrichment
//! - Change events emitted by the state differ
//! - Notifications and their delivery configuration
//! - History, statistics, and scan progress records
//! - Common error types

pub mod error;
pub mod events;
pub mod types;

pub use error::NetwatchError;
pub use events::{ChangeEvent, ChangeKind};
pub use types::{
    ChannelKind, Device, DeviceHistory, DeviceType, HistoryChange, NetworkStats, Notification,
    NotificationConfig, NotificationKind, ScanProgress, ScanStatus, Severity, VulnSeverity,
    Vulnerability,
};
