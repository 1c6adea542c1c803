//! JSON-file backed store.
//!
//! ```text
//! {root}/
//!   netwatch.json    devices, vendors, notifications, config, stats
//!   history.jsonl    one device-history entry per line, append only
//! ```
//!
//! `netwatch.json` is rewritten via a temp file and a rename, so a crash
//! mid-write leaves the previous version intact. Every mutation is applied
//! to a copy of the document and only becomes visible once that copy is on
//! disk. History is appended; only retention rewrites the log.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{Days, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use netwatch_core::{
    Device, DeviceHistory, HistoryChange, NetworkStats, Notification, NotificationConfig,
};

use crate::store::{DeviceStore, HistoryQuery, HistoryStore, StoreError};

const STATE_FILE: &str = "netwatch.json";
const HISTORY_FILE: &str = "history.jsonl";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    devices: BTreeMap<String, Device>,
    #[serde(default)]
    vendors: BTreeMap<String, String>,
    #[serde(default)]
    notifications: Vec<Notification>,
    #[serde(default)]
    next_notification_id: u64,
    #[serde(default)]
    notification_config: Option<NotificationConfig>,
    #[serde(default)]
    stats: Vec<NetworkStats>,
}

/// File-system backed store implementing both storage traits.
pub struct FileStore {
    root: Option<PathBuf>,
    state: Mutex<StoreState>,
    history: Mutex<Vec<DeviceHistory>>,
}

impl FileStore {
    /// Open (or create) a store rooted at the given directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let path = root.join(STATE_FILE);
        let state = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            StoreState::default()
        };
        let history = load_history(&root.join(HISTORY_FILE))?;

        tracing::debug!(
            path = %root.display(),
            devices = state.devices.len(),
            history = history.len(),
            "Store opened"
        );

        Ok(Self {
            root: Some(root),
            state: Mutex::new(state),
            history: Mutex::new(history),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            state: Mutex::new(StoreState::default()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// The store directory, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn history(&self) -> MutexGuard<'_, Vec<DeviceHistory>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` to a copy of the document, write the copy, then
    /// swap it in. On a failed write the live state is untouched.
    fn commit<T>(&self, change: impl FnOnce(&mut StoreState) -> T) -> Result<T, StoreError> {
        let mut state = self.state();
        let mut next = state.clone();
        let out = change(&mut next);
        self.flush(&next)?;
        *state = next;
        Ok(out)
    }

    fn flush(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(root) = &self.root else {
            return Ok(());
        };

        let path = root.join(STATE_FILE);
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&path, json.as_bytes())?;

        tracing::debug!(path = %path.display(), "Store flushed");
        Ok(())
    }

    fn append_history(&self, entries: Vec<DeviceHistory>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut history = self.history();
        if let Some(root) = &self.root {
            let lines = encode_history(&entries)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(root.join(HISTORY_FILE))?;
            file.write_all(lines.as_bytes())?;
        }
        history.extend(entries);
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn encode_history(entries: &[DeviceHistory]) -> Result<String, StoreError> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    Ok(out)
}

/// Read the history log. A torn final line from an interrupted append is
/// skipped with a warning.
fn load_history(path: &Path) -> Result<Vec<DeviceHistory>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), line = n + 1, error = %e, "Skipping unreadable history entry");
            }
        }
    }
    Ok(entries)
}

fn upsert_into(state: &mut StoreState, device: &Device) {
    let mut record = device.clone();
    if let Some(existing) = state.devices.get(&device.mac) {
        record.first_seen = existing.first_seen;
    }
    state.devices.insert(record.mac.clone(), record);
}

impl DeviceStore for FileStore {
    fn upsert_device(&self, device: &Device) -> Result<(), StoreError> {
        self.commit(|state| upsert_into(state, device))
    }

    fn upsert_devices(&self, devices: &[Device]) -> Result<(), StoreError> {
        if devices.is_empty() {
            return Ok(());
        }
        self.commit(|state| {
            for device in devices {
                upsert_into(state, device);
            }
        })
    }

    fn all_devices(&self) -> Result<Vec<Device>, StoreError> {
        let mut devices: Vec<Device> = self.state().devices.values().cloned().collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(devices)
    }

    fn device_by_ip(&self, ip: &str) -> Result<Option<Device>, StoreError> {
        let state = self.state();
        Ok(state
            .devices
            .values()
            .filter(|d| d.ip.to_string() == ip)
            .max_by_key(|d| d.last_seen)
            .cloned())
    }

    fn cached_vendor(&self, mac: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state().vendors.get(mac).cloned())
    }

    fn save_vendor(&self, mac: &str, vendor: &str) -> Result<(), StoreError> {
        self.commit(|state| {
            state.vendors.insert(mac.to_string(), vendor.to_string());
        })
    }

    fn save_notification(&self, notification: &Notification) -> Result<u64, StoreError> {
        self.commit(|state| {
            state.next_notification_id += 1;
            let id = state.next_notification_id;

            let mut record = notification.clone();
            record.id = Some(id);
            record.timestamp.get_or_insert_with(Utc::now);
            state.notifications.push(record);
            id
        })
    }

    fn notifications(&self) -> Result<Vec<Notification>, StoreError> {
        let mut all = self.state().notifications.clone();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(all)
    }

    fn delete_old_notifications(&self, days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - TimeDelta::days(i64::from(days));
        let expired = |n: &Notification| n.timestamp.is_some_and(|ts| ts < cutoff);
        if !self.state().notifications.iter().any(|n| expired(n)) {
            return Ok(0);
        }
        self.commit(|state| {
            let before = state.notifications.len();
            state.notifications.retain(|n| !expired(n));
            before - state.notifications.len()
        })
    }

    fn notification_config(&self) -> Result<NotificationConfig, StoreError> {
        if let Some(config) = &self.state().notification_config {
            return Ok(config.clone());
        }
        self.commit(|state| {
            state
                .notification_config
                .get_or_insert_with(NotificationConfig::default)
                .clone()
        })
    }

    fn save_notification_config(&self, config: &NotificationConfig) -> Result<(), StoreError> {
        let mut record = config.clone();
        record.updated_at = Utc::now();
        self.commit(|state| {
            state.notification_config = Some(record);
        })
    }
}

impl HistoryStore for FileStore {
    fn record_device_state(
        &self,
        device: &Device,
        change: HistoryChange,
    ) -> Result<(), StoreError> {
        self.append_history(vec![DeviceHistory::of(device, change, Utc::now())])
    }

    fn record_changes(&self, changes: &[(Device, HistoryChange)]) -> Result<(), StoreError> {
        let now = Utc::now();
        self.append_history(
            changes
                .iter()
                .map(|(device, change)| DeviceHistory::of(device, *change, now))
                .collect(),
        )
    }

    fn record_snapshot(&self, devices: &[Device]) -> Result<(), StoreError> {
        let now = Utc::now();
        self.append_history(
            devices
                .iter()
                .map(|d| DeviceHistory::of(d, HistoryChange::Snapshot, now))
                .collect(),
        )
    }

    fn device_history(&self, query: &HistoryQuery) -> Result<Vec<DeviceHistory>, StoreError> {
        let mut results: Vec<DeviceHistory> = self
            .history()
            .iter()
            .filter(|h| query.matches(h))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(results)
    }

    fn calculate_daily_stats(&self, day: NaiveDate) -> Result<NetworkStats, StoreError> {
        let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
        let end = day
            .checked_add_days(Days::new(1))
            .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
            .unwrap_or(start);

        let (total, new, gone) = {
            let history = self.history();
            let mut seen = HashSet::new();
            let mut new = HashSet::new();
            let mut gone = HashSet::new();
            for entry in history
                .iter()
                .filter(|h| h.timestamp >= start && h.timestamp < end)
            {
                seen.insert(entry.mac.as_str());
                match entry.change {
                    HistoryChange::New => {
                        new.insert(entry.mac.as_str());
                    }
                    HistoryChange::Disconnect => {
                        gone.insert(entry.mac.as_str());
                    }
                    HistoryChange::Update | HistoryChange::Snapshot => {}
                }
            }
            (seen.len() as u32, new.len() as u32, gone.len() as u32)
        };

        self.commit(|state| {
            let stats = NetworkStats {
                date: day,
                total_devices: total,
                new_devices: new,
                disconnected_devices: gone,
                total_ports: state
                    .devices
                    .values()
                    .map(|d| d.open_ports.len() as u32)
                    .sum(),
                active_devices: state.devices.len() as u32,
            };
            state.stats.retain(|s| s.date != day);
            state.stats.push(stats.clone());
            stats
        })
    }

    fn clean_old_history(&self, days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - TimeDelta::days(i64::from(days));
        let mut history = self.history();
        let kept: Vec<DeviceHistory> = history
            .iter()
            .filter(|h| h.timestamp >= cutoff)
            .cloned()
            .collect();
        let removed = history.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        if let Some(root) = &self.root {
            write_atomic(&root.join(HISTORY_FILE), encode_history(&kept)?.as_bytes())?;
        }
        *history = kept;
        tracing::info!(removed, retention_days = days, "Cleaned old history");
        Ok(removed)
    }
}
