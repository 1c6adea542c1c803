//! Change events produced by comparing two consecutive snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Device, HistoryChange, Notification, NotificationKind, Severity};

/// The kind of difference detected for one device identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Present now, absent from the previous snapshot.
    NewDevice,
    /// Present previously, absent now.
    Disconnected,
    /// Present in both with a different open-port set.
    PortChange,
}

impl ChangeKind {
    pub fn notification_kind(&self) -> NotificationKind {
        match self {
            Self::NewDevice => NotificationKind::NewDevice,
            Self::Disconnected => NotificationKind::Disconnected,
            Self::PortChange => NotificationKind::PortChange,
        }
    }

    pub fn history_change(&self) -> HistoryChange {
        match self {
            Self::NewDevice => HistoryChange::New,
            Self::Disconnected => HistoryChange::Disconnect,
            Self::PortChange => HistoryChange::Update,
        }
    }
}

/// A detected difference between two snapshots for one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// The current snapshot, or the last known one for a departure.
    pub device: Device,
    /// The prior snapshot, set only for port changes.
    pub previous: Option<Device>,
    /// Symmetric difference of old and new ports; empty unless `PortChange`.
    pub changed_ports: Vec<u16>,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn arrival(device: Device) -> Self {
        Self {
            kind: ChangeKind::NewDevice,
            message: format!("New device detected: {} ({})", device.ip, device.vendor),
            device,
            previous: None,
            changed_ports: Vec::new(),
            severity: Severity::Info,
            timestamp: Utc::now(),
        }
    }

    pub fn departure(device: Device) -> Self {
        Self {
            kind: ChangeKind::Disconnected,
            message: format!("Device disconnected: {} ({})", device.ip, device.vendor),
            device,
            previous: None,
            changed_ports: Vec::new(),
            severity: Severity::Warning,
            timestamp: Utc::now(),
        }
    }

    /// `changed_ports` must be the non-empty symmetric difference.
    pub fn port_change(previous: Device, device: Device, changed_ports: Vec<u16>) -> Self {
        debug_assert!(!changed_ports.is_empty());
        Self {
            kind: ChangeKind::PortChange,
            message: format!(
                "Port changes detected on {}: {:?}",
                device.ip, changed_ports
            ),
            device,
            previous: Some(previous),
            changed_ports,
            severity: Severity::Warning,
            timestamp: Utc::now(),
        }
    }

    pub fn mac(&self) -> &str {
        &self.device.mac
    }
}

impl From<&ChangeEvent> for Notification {
    fn from(change: &ChangeEvent) -> Self {
        let mut notification = Notification::new(
            change.kind.notification_kind(),
            &change.device,
            change.message.clone(),
            change.severity,
        );
        notification.timestamp = Some(change.timestamp);
        notification
    }
}
