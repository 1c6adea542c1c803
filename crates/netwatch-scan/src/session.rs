//! Progress tracking for full-range port scans, keyed by target IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use netwatch_core::{ScanProgress, ScanStatus};

use crate::error::{Result, ScanError};

/// At most one running scan per IP. Finished sessions stay readable until
/// replaced by a new scan of the same host or removed.
#[derive(Default)]
pub struct ScanSessionRegistry {
    sessions: Mutex<HashMap<IpAddr, ScanProgress>>,
}

impl ScanSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<IpAddr, ScanProgress>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a running scan, or fail if one is already running for `ip`.
    pub fn begin(&self, ip: IpAddr, total_ports: usize) -> Result<()> {
        let mut sessions = self.sessions();
        if sessions.get(&ip).is_some_and(ScanProgress::is_running) {
            return Err(ScanError::ScanAlreadyRunning { ip: ip.to_string() });
        }
        sessions.insert(ip, ScanProgress::started(total_ports));
        Ok(())
    }

    pub fn update(&self, ip: IpAddr, scanned: usize, total: usize, open: &[u16]) {
        if let Some(progress) = self.sessions().get_mut(&ip) {
            progress.current_port = scanned;
            progress.total_ports = total;
            progress.progress = percent(scanned, total);
            progress.open_ports = open.to_vec();
            progress.ports_found = open.len();
        }
    }

    pub fn complete(&self, ip: IpAddr, open: &[u16]) {
        if let Some(progress) = self.sessions().get_mut(&ip) {
            progress.status = ScanStatus::Complete;
            progress.progress = 100;
            progress.current_port = progress.total_ports;
            progress.open_ports = open.to_vec();
            progress.ports_found = open.len();
            progress.finished_at = Some(Utc::now());
        }
    }

    pub fn fail(&self, ip: IpAddr, error: impl Into<String>) {
        if let Some(progress) = self.sessions().get_mut(&ip) {
            progress.status = ScanStatus::Error;
            progress.error = Some(error.into());
            progress.finished_at = Some(Utc::now());
        }
    }

    pub fn get(&self, ip: IpAddr) -> Option<ScanProgress> {
        self.sessions().get(&ip).cloned()
    }

    /// Every tracked session, ordered by IP.
    pub fn all(&self) -> Vec<(IpAddr, ScanProgress)> {
        let mut all: Vec<(IpAddr, ScanProgress)> = self
            .sessions()
            .iter()
            .map(|(ip, p)| (*ip, p.clone()))
            .collect();
        all.sort_by_key(|(ip, _)| *ip);
        all
    }

    pub fn remove(&self, ip: IpAddr) -> Option<ScanProgress> {
        self.sessions().remove(&ip)
    }
}

fn percent(scanned: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (scanned.min(total) * 100 / total) as u8
}
