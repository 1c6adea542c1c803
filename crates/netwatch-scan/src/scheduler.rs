//! Scan orchestration.
//!
//! One cycle: discover → enrich every host (bounded) → diff against the
//! previous snapshot → notify → record history → replace the baseline.
//! Storage and delivery failures are logged and never end the loop. A cycle
//! interrupted by cancellation or a failed sweep changes nothing.
//!
//! Store calls made by the cycle are batched and run on the blocking pool.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use ipnet::Ipv4Net;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use netwatch_core::{ChangeKind, Device, Notification, NotificationKind, Severity, Vulnerability};
use netwatch_notify::{Dispatch, Dispatcher};
use netwatch_store::{DeviceStore, HistoryStore, StoreError};

use crate::classify::{classify, MetricsProbe};
use crate::config::WatchConfig;
use crate::diff::StateDiffer;
use crate::discovery::{local_network, HostDiscoverer, HostProbe};
use crate::error::{Result, ScanError};
use crate::prober::PortProber;
use crate::session::ScanSessionRegistry;
use crate::vuln::VulnerabilityChecker;

const VENDOR_UNKNOWN: &str = "Unknown";

/// Counts from one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub devices: usize,
    pub new_devices: usize,
    pub disconnected: usize,
    pub port_changes: usize,
    pub queued: usize,
    pub suppressed: usize,
}

impl CycleSummary {
    fn count(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::NewDevice => self.new_devices += 1,
            ChangeKind::Disconnected => self.disconnected += 1,
            ChangeKind::PortChange => self.port_changes += 1,
        }
    }
}

#[derive(Default)]
struct Housekeeping {
    last_snapshot: Option<DateTime<Utc>>,
    stats_day: Option<NaiveDate>,
}

/// Per-host enrichment, cloned into each worker task.
#[derive(Clone)]
struct Enricher {
    devices: Arc<dyn DeviceStore>,
    prober: Arc<PortProber>,
    metrics: MetricsProbe,
    checker: Arc<dyn VulnerabilityChecker>,
}

impl Enricher {
    /// Vendor, ports, type, metrics, merged history, vulnerabilities.
    async fn enrich(&self, mut device: Device, known: Option<Device>) -> Device {
        device.vendor = match self.devices.cached_vendor(&device.mac) {
            Ok(Some(vendor)) => vendor,
            Ok(None) => VENDOR_UNKNOWN.to_string(),
            Err(e) => {
                tracing::warn!(mac = %device.mac, error = %e, "Vendor cache lookup failed");
                VENDOR_UNKNOWN.to_string()
            }
        };

        let open = self.prober.scan_common_ports(device.ip).await;
        device.device_type = classify(&open);
        device.set_open_ports(open);

        device.metrics_urls = self.metrics.discover(device.ip).await;
        if !device.metrics_urls.is_empty() {
            tracing::info!(ip = %device.ip, urls = ?device.metrics_urls, "Found metrics endpoints");
        }

        if let Some(known) = known {
            device.merge_ports(&known.open_ports);
            device.first_seen = known.first_seen;
        }

        device.vulnerabilities = self
            .checker
            .check_device(&device.open_ports, device.device_type);
        device.last_seen = Utc::now();
        device
    }
}

/// Run a blocking store call on the blocking thread pool.
async fn off_runtime<T, F>(call: F) -> std::result::Result<T, StoreError>
where
    F: FnOnce() -> std::result::Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

/// The long-running scan loop and its collaborators.
pub struct Watcher {
    config: WatchConfig,
    range: String,
    devices: Arc<dyn DeviceStore>,
    history: Arc<dyn HistoryStore>,
    dispatcher: Dispatcher,
    differ: StateDiffer,
    discoverer: HostDiscoverer,
    enricher: Enricher,
    enrich_limit: Arc<Semaphore>,
    sessions: Arc<ScanSessionRegistry>,
    housekeeping: Mutex<Housekeeping>,
    cancel: CancellationToken,
}

impl Watcher {
    /// Build a watcher and seed its baseline from the stored devices.
    ///
    /// An empty `config.range` is replaced by the local /24.
    pub fn new<S>(
        config: WatchConfig,
        store: Arc<S>,
        dispatcher: Dispatcher,
        checker: Arc<dyn VulnerabilityChecker>,
        cancel: CancellationToken,
    ) -> Result<Self>
    where
        S: DeviceStore + HistoryStore + 'static,
    {
        let range = if config.range.trim().is_empty() {
            local_network()
        } else {
            config.range.trim().to_string()
        };
        range
            .parse::<Ipv4Net>()
            .map_err(|_| ScanError::InvalidRange {
                range: range.clone(),
            })?;

        let devices: Arc<dyn DeviceStore> = store.clone();
        let history: Arc<dyn HistoryStore> = store;

        let differ = match devices.all_devices() {
            Ok(known) => {
                tracing::info!(count = known.len(), "Seeded change detector from store");
                StateDiffer::seeded(&known)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load known devices, starting empty");
                StateDiffer::new()
            }
        };

        let discoverer = HostDiscoverer::new(cancel.child_token())
            .with_concurrency(config.discovery_concurrency)
            .with_ping_timeout(config.ping_timeout());

        let enricher = Enricher {
            devices: devices.clone(),
            prober: Arc::new(PortProber::new(cancel.child_token())),
            metrics: MetricsProbe::new()?,
            checker,
        };

        Ok(Self {
            enrich_limit: Arc::new(Semaphore::new(config.max_concurrent_enrichments.max(1))),
            config,
            range,
            devices,
            history,
            dispatcher,
            differ,
            discoverer,
            enricher,
            sessions: Arc::new(ScanSessionRegistry::new()),
            housekeeping: Mutex::new(Housekeeping::default()),
            cancel,
        })
    }

    /// Replace the liveness probe used by discovery.
    pub fn with_host_probe(self, probe: Arc<dyn HostProbe>) -> Self {
        Self {
            discoverer: self.discoverer.with_probe(probe),
            ..self
        }
    }

    pub fn range(&self) -> &str {
        &self.range
    }

    pub fn sessions(&self) -> &Arc<ScanSessionRegistry> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Devices in the current baseline.
    pub fn known_devices(&self) -> Vec<Device> {
        self.differ.previous_devices()
    }

    /// Run cycles every `interval_secs` until cancelled.
    pub async fn run(&self) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            range = %self.range,
            interval_secs = self.config.interval_secs,
            "Watcher started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(_) | Err(ScanError::Cancelled) => {}
                Err(e) => tracing::error!(range = %self.range, error = %e, "Scan cycle failed"),
            }
        }

        self.dispatcher.shutdown();
        tracing::info!("Watcher stopped");
    }

    /// Execute a single cycle: discover → enrich → reconcile → housekeeping.
    ///
    /// Returns [`ScanError::Cancelled`] without touching the baseline if the
    /// token fires before reconciliation.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let scan_id = Uuid::new_v4();
        let start = Instant::now();
        tracing::info!(scan_id = %scan_id, range = %self.range, "Starting network scan");

        let discovered = self.discoverer.discover(&self.range).await?;
        if self.cancel.is_cancelled() {
            tracing::info!(
                scan_id = %scan_id,
                hosts = discovered.len(),
                "Scan cycle cancelled during discovery"
            );
            return Err(ScanError::Cancelled);
        }

        let enriched = self.enrich_all(discovered).await;
        if self.cancel.is_cancelled() {
            tracing::info!(
                scan_id = %scan_id,
                hosts = enriched.len(),
                "Scan cycle cancelled during enrichment"
            );
            return Err(ScanError::Cancelled);
        }

        let summary = self.reconcile(&enriched).await;
        self.housekeeping(&enriched, Utc::now()).await;

        tracing::info!(
            scan_id = %scan_id,
            devices = summary.devices,
            new = summary.new_devices,
            disconnected = summary.disconnected,
            port_changes = summary.port_changes,
            queued = summary.queued,
            suppressed = summary.suppressed,
            duration_ms = start.elapsed().as_millis(),
            "Scan cycle complete"
        );

        Ok(summary)
    }

    /// Enrich every device concurrently, at most
    /// `max_concurrent_enrichments` at a time, then save them in one batch.
    /// Returns once all finish. Nothing is saved once cancelled; a failed
    /// save still returns the devices.
    pub async fn enrich_all(&self, discovered: Vec<Device>) -> Vec<Device> {
        let devices = self.devices.clone();
        let stored = off_runtime(move || devices.all_devices()).await;
        let mut known: HashMap<String, Device> = match stored {
            Ok(all) => all.into_iter().map(|d| (d.mac.clone(), d)).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load stored devices for port merge");
                HashMap::new()
            }
        };

        let mut tasks = JoinSet::new();
        for device in discovered {
            let previous = known.remove(&device.mac);
            let enricher = self.enricher.clone();
            let limit = self.enrich_limit.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                enricher.enrich(device, previous).await
            });
        }

        let mut enriched = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(device) => enriched.push(device),
                Err(e) => tracing::error!(error = %e, "Enrichment task failed"),
            }
        }
        enriched.sort_by_key(|d| d.ip);
        if self.cancel.is_cancelled() {
            return enriched;
        }

        let devices = self.devices.clone();
        let batch = enriched.clone();
        if let Err(e) = off_runtime(move || devices.upsert_devices(&batch)).await {
            tracing::warn!(count = enriched.len(), error = %e, "Failed to save enriched devices");
        }
        enriched
    }

    /// Diff an enriched snapshot, forward allowed changes, record history,
    /// then make the snapshot the new baseline.
    pub async fn reconcile(&self, current: &[Device]) -> CycleSummary {
        let changes = self.differ.detect(current);
        let mut summary = CycleSummary {
            devices: current.len(),
            ..Default::default()
        };
        let mut records = Vec::with_capacity(changes.len());

        for change in &changes {
            summary.count(change.kind);

            if self.config.notify.allows(change.kind) {
                match self.dispatcher.notify_change(change) {
                    Ok(Dispatch::Queued) => summary.queued += 1,
                    Ok(Dispatch::Suppressed) => summary.suppressed += 1,
                    Err(e) => {
                        tracing::warn!(mac = %change.mac(), error = %e, "Failed to queue notification");
                    }
                }
            }

            records.push((change.device.clone(), change.kind.history_change()));
        }

        if !records.is_empty() {
            let history = self.history.clone();
            let count = records.len();
            if let Err(e) = off_runtime(move || history.record_changes(&records)).await {
                tracing::warn!(changes = count, error = %e, "Failed to record device changes");
            }
        }

        self.differ.update_state(current);
        summary
    }

    /// Hourly snapshot, then once per calendar day: stats and retention.
    /// Finally drop stale rate-limit keys.
    pub async fn housekeeping(&self, current: &[Device], now: DateTime<Utc>) {
        let today = now.date_naive();
        let (snapshot_due, daily_due) = {
            let state = self.housekeeping_state();
            let snapshot_due = state
                .last_snapshot
                .map_or(true, |last| now - last >= ChronoDuration::hours(1));
            (snapshot_due, state.stats_day != Some(today))
        };

        if snapshot_due {
            let history = self.history.clone();
            let devices = current.to_vec();
            match off_runtime(move || history.record_snapshot(&devices)).await {
                Ok(()) => {
                    tracing::info!(devices = current.len(), "Recorded network snapshot");
                    self.housekeeping_state().last_snapshot = Some(now);
                }
                Err(e) => tracing::warn!(error = %e, "Failed to record network snapshot"),
            }
        }

        if daily_due {
            let history = self.history.clone();
            match off_runtime(move || history.calculate_daily_stats(today)).await {
                Ok(stats) => {
                    tracing::info!(
                        day = %today,
                        total = stats.total_devices,
                        new = stats.new_devices,
                        disconnected = stats.disconnected_devices,
                        "Calculated daily statistics"
                    );
                    self.housekeeping_state().stats_day = Some(today);
                }
                Err(e) => tracing::warn!(day = %today, error = %e, "Failed to calculate daily stats"),
            }

            let history = self.history.clone();
            let days = self.config.history_retention_days;
            match off_runtime(move || history.clean_old_history(days)).await {
                Ok(removed) => tracing::info!(removed, "Cleaned old history"),
                Err(e) => tracing::warn!(error = %e, "Failed to clean old history"),
            }

            let devices = self.devices.clone();
            let days = self.config.notification_retention_days;
            match off_runtime(move || devices.delete_old_notifications(days)).await {
                Ok(removed) => tracing::info!(removed, "Cleaned old notifications"),
                Err(e) => tracing::warn!(error = %e, "Failed to clean old notifications"),
            }
        }

        let pruned = self.dispatcher.prune_rate_limits();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned rate-limit keys");
        }
    }

    fn housekeeping_state(&self) -> MutexGuard<'_, Housekeeping> {
        self.housekeeping
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ── Full port scan ────────────────────────────────────────────────

    /// Scan all 65535 ports of `ip` in the background. The session is
    /// registered before returning, so a second scan of `ip` fails with
    /// [`ScanError::ScanAlreadyRunning`]. Progress is readable through
    /// [`Watcher::sessions`].
    pub fn spawn_full_port_scan(self: &Arc<Self>, ip: IpAddr) -> Result<JoinHandle<()>> {
        self.sessions.begin(ip, usize::from(u16::MAX))?;
        let watcher = self.clone();
        Ok(tokio::spawn(async move {
            match watcher.scan_registered(ip, 1, u16::MAX).await {
                Ok(_) | Err(ScanError::Cancelled) => {}
                Err(e) => tracing::error!(ip = %ip, error = %e, "Full port scan failed"),
            }
        }))
    }

    /// A session-tracked scan of `first..=last`.
    pub async fn port_scan_session(&self, ip: IpAddr, first: u16, last: u16) -> Result<Vec<u16>> {
        let total = usize::from(last.saturating_sub(first)) + 1;
        self.sessions.begin(ip, total)?;
        self.scan_registered(ip, first, last).await
    }

    async fn scan_registered(&self, ip: IpAddr, first: u16, last: u16) -> Result<Vec<u16>> {
        tracing::info!(ip = %ip, first, last, "Starting full port scan");

        let sessions = self.sessions.clone();
        let open = self
            .enricher
            .prober
            .scan_range(ip, first, last, |scanned, total, so_far| {
                sessions.update(ip, scanned, total, so_far);
            })
            .await;

        if self.cancel.is_cancelled() {
            self.sessions.fail(ip, "scan cancelled");
            return Err(ScanError::Cancelled);
        }
        self.sessions.complete(ip, &open);
        tracing::info!(ip = %ip, open = open.len(), "Full port scan complete");

        let devices = self.devices.clone();
        let key = ip.to_string();
        let mut device = match off_runtime(move || devices.device_by_ip(&key)).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                tracing::info!(ip = %ip, "Scanned host is not a known device");
                return Ok(open);
            }
            Err(e) => {
                tracing::warn!(ip = %ip, error = %e, "Failed to load scanned device");
                return Ok(open);
            }
        };

        device.set_open_ports(open.iter().copied());
        device.vulnerabilities = self
            .enricher
            .checker
            .check_device(&device.open_ports, device.device_type);
        let devices = self.devices.clone();
        let record = device.clone();
        off_runtime(move || devices.upsert_device(&record)).await?;

        if let Some(alert) = security_alert(&device) {
            match self.dispatcher.notify(alert) {
                Ok(Dispatch::Queued) => {
                    tracing::warn!(ip = %ip, mac = %device.mac, "Security alert raised");
                }
                Ok(Dispatch::Suppressed) => {}
                Err(e) => tracing::warn!(ip = %ip, error = %e, "Failed to queue security alert"),
            }
        }

        Ok(open)
    }
}

/// One alert covering every high or critical finding on `device`.
fn security_alert(device: &Device) -> Option<Notification> {
    let alerts: Vec<&Vulnerability> = device
        .vulnerabilities
        .iter()
        .filter(|v| v.severity.is_alert())
        .collect();
    let worst = alerts.iter().map(|v| v.severity).max()?;

    let message = alerts
        .iter()
        .map(|v| format!("Security Risk: {} detected on {}", v.name, v.severity))
        .collect::<Vec<_>>()
        .join("; ");

    Some(Notification::new(
        NotificationKind::SecurityAlert,
        device,
        message,
        Severity::from(worst),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use netwatch_core::{HistoryChange, NotificationConfig, ScanStatus};
    use netwatch_notify::{Channel, DeliveryError, DispatcherSettings};
    use netwatch_store::{FileStore, HistoryQuery};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use crate::vuln::RuleSet;

    struct Recording(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl Channel for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, n: &Notification) -> std::result::Result<(), DeliveryError> {
            let _ = self.0.send(n.clone());
            Ok(())
        }
    }

    fn watcher(
        store: Arc<FileStore>,
        rules: RuleSet,
    ) -> (Watcher, mpsc::UnboundedReceiver<Notification>) {
        watcher_with_cancel(store, rules, CancellationToken::new())
    }

    fn watcher_with_cancel(
        store: Arc<FileStore>,
        rules: RuleSet,
        cancel: CancellationToken,
    ) -> (Watcher, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::start_with_channels(
            store.clone(),
            DispatcherSettings::default(),
            NotificationConfig::default(),
            vec![Arc::new(Recording(tx)) as Arc<dyn Channel>],
        );
        let config = WatchConfig {
            range: "127.0.0.0/30".to_string(),
            ..Default::default()
        };
        let watcher = Watcher::new(
            config,
            store,
            dispatcher,
            Arc::new(rules),
            cancel,
        )
        .unwrap();
        (watcher, rx)
    }

    fn device(mac: &str, ip: &str, ports: &[u16]) -> Device {
        Device::new(mac, ip.parse().unwrap()).with_ports(ports.iter().copied())
    }

    #[test]
    fn test_security_alert_lists_alerting_findings() {
        let mut d = device("m1", "10.0.0.5", &[21, 23, 80]);
        d.vulnerabilities = RuleSet::builtin().check_device(&d.open_ports, d.device_type);

        let alert = security_alert(&d).unwrap();
        assert_eq!(alert.kind, NotificationKind::SecurityAlert);
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert
            .message
            .contains("Security Risk: Telnet Enabled detected on critical"));
        assert!(alert.message.contains("FTP Enabled detected on high"));
        assert!(!alert.message.contains("Unencrypted HTTP"));

        let quiet = device("m2", "10.0.0.6", &[443]);
        assert!(security_alert(&quiet).is_none());
    }

    #[tokio::test]
    async fn test_invalid_range_is_rejected_up_front() {
        let store = Arc::new(FileStore::in_memory());
        let dispatcher = Dispatcher::start_with_channels(
            store.clone(),
            DispatcherSettings::default(),
            NotificationConfig::default(),
            Vec::new(),
        );
        let config = WatchConfig {
            range: "10.0.0.0/33".to_string(),
            ..Default::default()
        };
        let result = Watcher::new(
            config,
            store,
            dispatcher,
            Arc::new(RuleSet::builtin()),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(ScanError::InvalidRange { .. })));
    }

    #[tokio::test]
    async fn test_housekeeping_runs_daily_work_once_per_day() {
        let store = Arc::new(FileStore::in_memory());
        let (watcher, _rx) = watcher(store.clone(), RuleSet::builtin());
        let devices = vec![device("m1", "10.0.0.5", &[22])];
        let t0 = Utc::now();

        watcher.housekeeping(&devices, t0).await;
        watcher
            .housekeeping(&devices, t0 + ChronoDuration::minutes(10))
            .await;
        watcher
            .housekeeping(&devices, t0 + ChronoDuration::minutes(61))
            .await;

        let snapshots = store
            .device_history(&HistoryQuery::default())
            .unwrap()
            .into_iter()
            .filter(|h| h.change == HistoryChange::Snapshot)
            .count();
        assert_eq!(snapshots, 2);
    }

    #[tokio::test]
    async fn test_enrich_merges_known_ports_and_keeps_first_seen() {
        let store = Arc::new(FileStore::in_memory());
        let mut known = device("m1", "127.0.0.1", &[1]);
        known.first_seen = Utc::now() - ChronoDuration::days(3);
        store.upsert_device(&known).unwrap();
        store.save_vendor("m1", "Acme").unwrap();

        let (watcher, _rx) = watcher(store.clone(), RuleSet::builtin());
        let enriched = watcher
            .enrich_all(vec![Device::new("m1", "127.0.0.1".parse().unwrap())])
            .await;

        assert_eq!(enriched.len(), 1);
        let d = &enriched[0];
        assert_eq!(d.vendor, "Acme");
        assert!(d.open_ports.contains(&1));
        assert!(d.open_ports.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(d.first_seen, known.first_seen);

        let stored = store.device_by_ip("127.0.0.1").unwrap().unwrap();
        assert_eq!(stored.open_ports, d.open_ports);
    }

    #[tokio::test]
    async fn test_port_scan_session_raises_security_alert() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let rules = RuleSet::from_json(&format!(
            r#"[{{"id": "T-1", "name": "Test Service", "severity": "high", "ports": [{port}]}}]"#
        ))
        .unwrap();

        let store = Arc::new(FileStore::in_memory());
        store.upsert_device(&device("m1", "127.0.0.1", &[])).unwrap();
        let (watcher, mut rx) = watcher(store.clone(), rules);

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let open = watcher.port_scan_session(ip, port, port).await.unwrap();
        assert_eq!(open, vec![port]);

        let session = watcher.sessions().get(ip).unwrap();
        assert_eq!(session.status, ScanStatus::Complete);
        assert_eq!(session.ports_found, 1);

        let stored = store.device_by_ip("127.0.0.1").unwrap().unwrap();
        assert_eq!(stored.open_ports, vec![port]);
        assert_eq!(stored.vulnerabilities.len(), 1);

        let alert = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.kind, NotificationKind::SecurityAlert);
        assert_eq!(alert.message, "Security Risk: Test Service detected on high");
    }

    #[tokio::test]
    async fn test_spawned_full_scan_holds_session_until_cancelled() {
        let store = Arc::new(FileStore::in_memory());
        let cancel = CancellationToken::new();
        let (watcher, _rx) = watcher_with_cancel(store, RuleSet::builtin(), cancel.clone());
        let watcher = Arc::new(watcher);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        let scan = watcher.spawn_full_port_scan(ip).unwrap();
        assert!(watcher.sessions().get(ip).unwrap().is_running());

        let err = watcher.port_scan_session(ip, 1, 10).await.unwrap_err();
        assert!(matches!(err, ScanError::ScanAlreadyRunning { .. }));

        cancel.cancel();
        scan.await.unwrap();

        let session = watcher.sessions().get(ip).unwrap();
        assert_eq!(session.status, ScanStatus::Error);
        assert_eq!(session.error.as_deref(), Some("scan cancelled"));
    }

    #[tokio::test]
    async fn test_enrich_all_saves_in_one_pass() {
        let store = Arc::new(FileStore::in_memory());
        let (watcher, _rx) = watcher(store.clone(), RuleSet::builtin());
        let enriched = watcher
            .enrich_all(vec![
                Device::new("m1", "127.0.0.2".parse().unwrap()),
                Device::new("m2", "127.0.0.3".parse().unwrap()),
            ])
            .await;

        assert_eq!(enriched.len(), 2);
        let stored = store.all_devices().unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|d| d.vendor == VENDOR_UNKNOWN));
    }
}
