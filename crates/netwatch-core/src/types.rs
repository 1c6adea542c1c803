//! Core domain types for netwatch.
//!
//! A [`Device`] is keyed by its hardware address; everything else in the
//! pipeline (change events, notifications, history rows) refers back to it.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetwatchError;

// ── Device ────────────────────────────────────────────────────────

/// Coarse device category inferred from open ports.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceType {
    #[serde(rename = "Node Exporter")]
    NodeExporter,
    #[serde(rename = "Windows PC")]
    WindowsPc,
    #[serde(rename = "Linux Server")]
    LinuxServer,
    #[serde(rename = "Windows/Samba")]
    WindowsSamba,
    #[serde(rename = "Web Server")]
    WebServer,
    #[serde(rename = "MQTT Broker")]
    MqttBroker,
    #[default]
    Unknown,
}

impl DeviceType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NodeExporter => "Node Exporter",
            Self::WindowsPc => "Windows PC",
            Self::LinuxServer => "Linux Server",
            Self::WindowsSamba => "Windows/Samba",
            Self::WebServer => "Web Server",
            Self::MqttBroker => "MQTT Broker",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A host seen on the network.
///
/// `mac` is the identity key. It stays stable across DHCP reassignment,
/// while `ip` is only unique within a single snapshot. Hosts whose hardware
/// address could not be resolved carry a synthetic `unknown_<ip>` key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub mac: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub vendor: String,
    #[serde(default, rename = "type")]
    pub device_type: DeviceType,
    /// Open TCP ports, deduplicated and sorted ascending.
    #[serde(default)]
    pub open_ports: Vec<u16>,
    #[serde(default)]
    pub metrics_urls: Vec<String>,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// A bare record for a host that just answered a liveness probe.
    pub fn new(mac: impl Into<String>, ip: IpAddr) -> Self {
        let now = Utc::now();
        Self {
            mac: mac.into(),
            ip,
            vendor: String::new(),
            device_type: DeviceType::Unknown,
            open_ports: Vec::new(),
            metrics_urls: Vec::new(),
            vulnerabilities: Vec::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Builder-style port assignment, mostly for fixtures.
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.set_open_ports(ports);
        self
    }

    /// Replace the open-port list, normalising to a sorted unique set.
    pub fn set_open_ports(&mut self, ports: impl IntoIterator<Item = u16>) {
        let set: BTreeSet<u16> = ports.into_iter().collect();
        self.open_ports = set.into_iter().collect();
    }

    /// Union previously known ports into this record.
    pub fn merge_ports(&mut self, known: &[u16]) {
        if known.is_empty() {
            return;
        }
        let merged: Vec<u16> = self.open_ports.iter().chain(known).copied().collect();
        self.set_open_ports(merged);
    }
}

// ── Vulnerabilities ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VulnSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl VulnSeverity {
    /// High and critical findings raise a security alert.
    pub fn is_alert(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for VulnSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A security finding attached to a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vulnerability {
    pub rule_id: String,
    pub name: String,
    pub severity: VulnSeverity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub solution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

// ── Notifications ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<VulnSeverity> for Severity {
    fn from(v: VulnSeverity) -> Self {
        match v {
            VulnSeverity::Low => Self::Info,
            VulnSeverity::Medium => Self::Warning,
            VulnSeverity::High | VulnSeverity::Critical => Self::Critical,
        }
    }
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewDevice,
    Disconnected,
    PortChange,
    SecurityAlert,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewDevice => "new_device",
            Self::Disconnected => "disconnected",
            Self::PortChange => "port_change",
            Self::SecurityAlert => "security_alert",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-facing notification.
///
/// `id` is assigned by the persistence layer; `timestamp` is stamped by the
/// dispatcher when the producer leaves it empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub device_ip: String,
    pub device_mac: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        device: &Device,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            id: None,
            kind,
            device_ip: device.ip.to_string(),
            device_mac: device.mac.clone(),
            message: message.into(),
            severity,
            timestamp: None,
            read: false,
        }
    }

    /// Key used to suppress repeats of the same notification about the same device.
    pub fn rate_limit_key(&self) -> String {
        format!("{}:{}", self.kind, self.device_mac)
    }
}

/// A built-in delivery mechanism.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Console,
    System,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::System => "system",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = NetwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "system" => Ok(Self::System),
            "webhook" => Ok(Self::Webhook),
            other => Err(NetwatchError::UnknownChannel(other.to_string())),
        }
    }
}

/// Which channels are enabled and where the webhook points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationConfig {
    #[serde(default = "default_channels")]
    pub enabled_channels: Vec<String>,
    #[serde(default)]
    pub webhook_url: String,
    pub updated_at: DateTime<Utc>,
}

fn default_channels() -> Vec<String> {
    vec![ChannelKind::Console.to_string()]
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled_channels: default_channels(),
            webhook_url: String::new(),
            updated_at: Utc::now(),
        }
    }
}

impl NotificationConfig {
    /// Parse the enabled channel names, reporting unknown names separately.
    pub fn channels(&self) -> (Vec<ChannelKind>, Vec<NetwatchError>) {
        let mut kinds = Vec::new();
        let mut unknown = Vec::new();
        for name in &self.enabled_channels {
            match name.parse::<ChannelKind>() {
                Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
                Ok(_) => {}
                Err(e) => unknown.push(e),
            }
        }
        (kinds, unknown)
    }

    pub fn is_enabled(&self, kind: ChannelKind) -> bool {
        self.channels().0.contains(&kind)
    }

    /// Enable a channel if it is not already listed.
    pub fn enable(&mut self, kind: ChannelKind) {
        if !self.is_enabled(kind) {
            self.enabled_channels.push(kind.to_string());
        }
    }
}

// ── History & statistics ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HistoryChange {
    New,
    Update,
    Disconnect,
    Snapshot,
}

/// A point-in-time record of one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceHistory {
    pub mac: String,
    pub ip: IpAddr,
    pub vendor: String,
    pub open_ports: Vec<u16>,
    pub timestamp: DateTime<Utc>,
    pub change: HistoryChange,
}

impl DeviceHistory {
    pub fn of(device: &Device, change: HistoryChange, timestamp: DateTime<Utc>) -> Self {
        Self {
            mac: device.mac.clone(),
            ip: device.ip,
            vendor: device.vendor.clone(),
            open_ports: device.open_ports.clone(),
            timestamp,
            change,
        }
    }
}

/// Aggregate counts for one calendar day.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkStats {
    pub date: NaiveDate,
    pub total_devices: u32,
    pub new_devices: u32,
    pub disconnected_devices: u32,
    pub total_ports: u32,
    pub active_devices: u32,
}

// ── Scan progress ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Complete,
    Error,
}

/// Live progress of a full-range port scan against one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanProgress {
    pub status: ScanStatus,
    /// Percent complete, 0–100.
    pub progress: u8,
    pub current_port: usize,
    pub total_ports: usize,
    pub open_ports: Vec<u16>,
    pub ports_found: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanProgress {
    pub fn started(total_ports: usize) -> Self {
        Self {
            status: ScanStatus::Running,
            progress: 0,
            current_port: 0,
            total_ports,
            open_ports: Vec::new(),
            ports_found: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ScanStatus::Running
    }

    /// Seconds since the scan started, frozen once it finishes.
    pub fn elapsed_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}
