//! Host discovery: ping sweep plus neighbor-cache lookup.
//!
//! Liveness uses the system `ping` binary (one echo request), so no raw
//! socket privileges are needed. Hardware addresses come from the kernel
//! neighbor table after the ping has populated it.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use netwatch_core::Device;

use crate::error::{Result, ScanError};

pub const DEFAULT_CONCURRENCY: usize = 256;
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Range used when the local address cannot be determined.
pub const FALLBACK_NETWORK: &str = "192.168.1.0/24";

/// Liveness and identity check for a single address.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// A bare device if `ip` is up, otherwise `None`.
    async fn probe(&self, ip: Ipv4Addr) -> Option<Device>;
}

/// System `ping` followed by a neighbor-cache lookup.
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HostProbe for PingProbe {
    async fn probe(&self, ip: Ipv4Addr) -> Option<Device> {
        probe_host(ip, self.timeout).await
    }
}

pub struct HostDiscoverer {
    concurrency: usize,
    probe: Arc<dyn HostProbe>,
    cancel: CancellationToken,
}

impl HostDiscoverer {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            probe: Arc::new(PingProbe::new(DEFAULT_PING_TIMEOUT)),
            cancel,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.probe = Arc::new(PingProbe::new(timeout));
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Return a bare device for every host in `range` that the configured
    /// probe reports as up.
    pub async fn discover(&self, range: &str) -> Result<Vec<Device>> {
        let probe = self.probe.clone();
        self.discover_with(range, move |ip| {
            let probe = probe.clone();
            async move { probe.probe(ip).await }
        })
        .await
    }

    /// Sweep `range` with a caller-supplied host probe.
    ///
    /// Network and broadcast addresses are skipped. Once cancelled, no new
    /// probes start and the hosts found so far are returned. If any probe
    /// task fails the sweep is incomplete and nothing is returned.
    pub async fn discover_with<F, Fut>(&self, range: &str, probe: F) -> Result<Vec<Device>>
    where
        F: Fn(Ipv4Addr) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Option<Device>> + Send + 'static,
    {
        let net: Ipv4Net = range.trim().parse().map_err(|_| ScanError::InvalidRange {
            range: range.to_string(),
        })?;

        let start = Instant::now();
        tracing::info!(range = %net, concurrency = self.concurrency, "Starting host discovery");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for ip in net.hosts() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let probe = probe.clone();
            tasks.spawn(async move {
                let _permit = permit;
                probe(ip).await
            });
        }

        let mut devices = Vec::new();
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Discovery task failed");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(ScanError::DiscoveryFailed {
                range: net.to_string(),
                failed,
            });
        }
        devices.sort_by_key(|d| d.ip);

        tracing::info!(
            range = %net,
            hosts_up = devices.len(),
            cancelled = self.cancel.is_cancelled(),
            duration_ms = start.elapsed().as_millis(),
            "Host discovery complete"
        );

        Ok(devices)
    }
}

/// Ping `ip` and, if it answers, resolve its hardware address.
pub async fn probe_host(ip: Ipv4Addr, timeout: Duration) -> Option<Device> {
    if !ping(ip, timeout).await {
        return None;
    }
    let mac = match resolve_mac(ip).await {
        Some(mac) => mac,
        None => {
            tracing::debug!(ip = %ip, "Hardware address unresolved");
            format!("unknown_{ip}")
        }
    };
    Some(Device::new(mac, IpAddr::V4(ip)))
}

async fn ping(ip: Ipv4Addr, timeout: Duration) -> bool {
    let mut cmd = Command::new("ping");

    #[cfg(target_os = "windows")]
    cmd.args(["-n", "1", "-w", &timeout.as_millis().to_string()]);

    #[cfg(target_os = "macos")]
    cmd.args(["-c", "1", "-W", &timeout.as_millis().to_string()]);

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    cmd.args(["-c", "1", "-W", &timeout.as_secs().max(1).to_string()]);

    cmd.arg(ip.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // ping enforces its own deadline; this only guards against a hung child.
    let guard = timeout + Duration::from_secs(1);
    matches!(
        tokio::time::timeout(guard, cmd.status()).await,
        Ok(Ok(status)) if status.success()
    )
}

/// Look up `ip` in the neighbor cache.
pub async fn resolve_mac(ip: Ipv4Addr) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(table) = tokio::fs::read_to_string("/proc/net/arp").await {
            if let Some(mac) = parse_proc_arp(&table, ip) {
                return Some(mac);
            }
        }
    }

    let mut cmd = Command::new("arp");
    #[cfg(target_os = "windows")]
    cmd.args(["-a", &ip.to_string()]);
    #[cfg(not(target_os = "windows"))]
    cmd.args(["-n", &ip.to_string()]);

    let output = cmd.stderr(Stdio::null()).output().await.ok()?;
    parse_arp_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the Linux `/proc/net/arp` table.
///
/// Columns: IP address, HW type, Flags, HW address, Mask, Device.
/// Entries with flags `0x0` are incomplete.
pub fn parse_proc_arp(table: &str, ip: Ipv4Addr) -> Option<String> {
    let wanted = ip.to_string();
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != wanted || fields[2] == "0x0" {
            return None;
        }
        normalize_mac(fields[3])
    })
}

/// Pull the first hardware address out of `arp` command output.
pub fn parse_arp_output(output: &str) -> Option<String> {
    output
        .lines()
        .flat_map(str::split_whitespace)
        .find_map(normalize_mac)
}

/// Canonical lowercase colon form, or `None` if `field` is not a MAC.
///
/// Accepts dash separators and single-digit octets as printed by macOS.
pub fn normalize_mac(field: &str) -> Option<String> {
    let candidate = field.replace('-', ":");
    let octets: Vec<&str> = candidate.split(':').collect();
    if octets.len() != 6 {
        return None;
    }

    let mut bytes = [0u8; 6];
    for (slot, octet) in bytes.iter_mut().zip(&octets) {
        if octet.is_empty() || octet.len() > 2 {
            return None;
        }
        *slot = u8::from_str_radix(octet, 16).ok()?;
    }
    if bytes == [0; 6] {
        return None;
    }

    Some(
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// The /24 around this host's outbound address.
///
/// Connecting a UDP socket sends no packets; it only selects a route.
pub fn local_network() -> String {
    match local_ipv4() {
        Some(ip) => {
            let [a, b, c, _] = ip.octets();
            format!("{a}.{b}.{c}.0/24")
        }
        None => {
            tracing::warn!(fallback = FALLBACK_NETWORK, "Could not determine local network");
            FALLBACK_NETWORK.to_string()
        }
    }
}

fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}
