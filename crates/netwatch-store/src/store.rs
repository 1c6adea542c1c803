//! Storage traits consumed by the scan pipeline.
//!
//! Both traits are synchronous and object safe so that callers can hold an
//! `Arc<dyn DeviceStore>` across tasks. Every failure is reported as a
//! [`StoreError`]; the pipeline logs these and keeps going.

use chrono::{DateTime, NaiveDate, Utc};

use netwatch_core::{
    Device, DeviceHistory, HistoryChange, NetworkStats, Notification, NotificationConfig,
};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Query parameters for listing device history.
#[derive(Debug, Default)]
pub struct HistoryQuery {
    /// Filter by hardware address.
    pub mac: Option<String>,
    /// Only include entries recorded at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only include entries recorded at or before this time.
    pub to: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    pub fn matches(&self, entry: &DeviceHistory) -> bool {
        if let Some(mac) = &self.mac {
            if &entry.mac != mac {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if &entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if &entry.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// Durable device, vendor, and notification state.
pub trait DeviceStore: Send + Sync {
    /// Insert or update a device keyed by MAC. An existing record keeps its
    /// `first_seen`; every other field is replaced.
    fn upsert_device(&self, device: &Device) -> Result<(), StoreError>;

    /// Upsert a batch. The default writes one device at a time; backends
    /// that can commit the batch at once should override it.
    fn upsert_devices(&self, devices: &[Device]) -> Result<(), StoreError> {
        devices.iter().try_for_each(|d| self.upsert_device(d))
    }

    /// All known devices, most recently seen first.
    fn all_devices(&self) -> Result<Vec<Device>, StoreError>;

    /// Look up the known device currently holding `ip`.
    fn device_by_ip(&self, ip: &str) -> Result<Option<Device>, StoreError>;

    fn cached_vendor(&self, mac: &str) -> Result<Option<String>, StoreError>;

    fn save_vendor(&self, mac: &str, vendor: &str) -> Result<(), StoreError>;

    /// Persist a notification and return the id assigned to it.
    fn save_notification(&self, notification: &Notification) -> Result<u64, StoreError>;

    /// All stored notifications, newest first.
    fn notifications(&self) -> Result<Vec<Notification>, StoreError>;

    /// Drop notifications older than `days`. Returns how many were removed.
    fn delete_old_notifications(&self, days: u32) -> Result<usize, StoreError>;

    /// The stored notification config, creating the default on first use.
    fn notification_config(&self) -> Result<NotificationConfig, StoreError>;

    fn save_notification_config(&self, config: &NotificationConfig) -> Result<(), StoreError>;
}

/// Time-series history of device states.
pub trait HistoryStore: Send + Sync {
    fn record_device_state(&self, device: &Device, change: HistoryChange)
        -> Result<(), StoreError>;

    /// Record several changes at once.
    fn record_changes(&self, changes: &[(Device, HistoryChange)]) -> Result<(), StoreError> {
        changes
            .iter()
            .try_for_each(|(device, change)| self.record_device_state(device, *change))
    }

    /// Record every device with change type `snapshot`.
    fn record_snapshot(&self, devices: &[Device]) -> Result<(), StoreError>;

    /// History entries matching the query, newest first.
    fn device_history(&self, query: &HistoryQuery) -> Result<Vec<DeviceHistory>, StoreError>;

    /// Compute, store, and return aggregate counts for `day` (UTC).
    fn calculate_daily_stats(&self, day: NaiveDate) -> Result<NetworkStats, StoreError>;

    /// Drop history older than `days`. Returns how many entries were removed.
    fn clean_old_history(&self, days: u32) -> Result<usize, StoreError>;
}
