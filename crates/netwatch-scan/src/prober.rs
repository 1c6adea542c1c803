//! TCP connect port prober.
//!
//! Each call owns its own semaphore, so two hosts probed at once can have
//! twice the attempts in flight. Callers cap that with an outer bound.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Ports probed on every scan cycle.
pub const COMMON_PORTS: [u16; 29] = [
    21, 22, 23, 25, 53, 80, 110, 143, 443, 445, 3306, 3389, 5432, 5900, 8080, 8090, 8443, 9100,
    1883, 8883, 3000, 5000, 5001, 8000, 8008, 8081, 8888, 9000, 9090,
];

/// Connection attempts in flight per call.
pub const PROBE_CONCURRENCY: usize = 100;

pub const COMMON_PORT_TIMEOUT: Duration = Duration::from_millis(300);
pub const FULL_SCAN_TIMEOUT: Duration = Duration::from_millis(100);

/// Ports per progress report during a full scan.
pub const FULL_SCAN_CHUNK: u16 = 1000;

pub struct PortProber {
    concurrency: usize,
    cancel: CancellationToken,
}

impl PortProber {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            concurrency: PROBE_CONCURRENCY,
            cancel,
        }
    }

    /// Return the subset of `ports` accepting a TCP connection, ascending.
    pub async fn scan_ports(&self, ip: IpAddr, ports: &[u16], timeout: Duration) -> Vec<u16> {
        probe_bounded(ports, self.concurrency, &self.cancel, move |port| {
            tcp_connect(ip, port, timeout)
        })
        .await
    }

    pub async fn scan_common_ports(&self, ip: IpAddr) -> Vec<u16> {
        self.scan_ports(ip, &COMMON_PORTS, COMMON_PORT_TIMEOUT).await
    }

    /// Probe every TCP port, reporting `(scanned, total, open_so_far)` after
    /// each chunk.
    pub async fn scan_all_ports<F>(&self, ip: IpAddr, progress: F) -> Vec<u16>
    where
        F: FnMut(usize, usize, &[u16]),
    {
        self.scan_range(ip, 1, u16::MAX, progress).await
    }

    /// Probe `first..=last` in chunks of [`FULL_SCAN_CHUNK`].
    pub async fn scan_range<F>(&self, ip: IpAddr, first: u16, last: u16, mut progress: F) -> Vec<u16>
    where
        F: FnMut(usize, usize, &[u16]),
    {
        let total = usize::from(last.saturating_sub(first)) + 1;
        let mut open = Vec::new();
        let mut start = u32::from(first);

        while start <= u32::from(last) && !self.cancel.is_cancelled() {
            let end = (start + u32::from(FULL_SCAN_CHUNK) - 1).min(u32::from(last));
            let chunk: Vec<u16> = (start..=end).filter_map(|p| u16::try_from(p).ok()).collect();

            open.extend(self.scan_ports(ip, &chunk, FULL_SCAN_TIMEOUT).await);

            let scanned = (end - u32::from(first) + 1) as usize;
            progress(scanned, total, &open);
            start = end + 1;
        }

        if self.cancel.is_cancelled() {
            tracing::info!(ip = %ip, open = open.len(), "Port scan cancelled");
        }
        open
    }
}

async fn tcp_connect(ip: IpAddr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::new(ip, port);
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Run `probe` over `ports` with at most `limit` attempts outstanding.
///
/// Stops launching new attempts once `cancel` fires; attempts already
/// running are still collected. Returns the ports whose probe succeeded,
/// sorted ascending.
pub async fn probe_bounded<F, Fut>(
    ports: &[u16],
    limit: usize,
    cancel: &CancellationToken,
    probe: F,
) -> Vec<u16>
where
    F: Fn(u16) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();

    for &port in ports {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let probe = probe.clone();
        tasks.spawn(async move {
            let _permit = permit;
            probe(port).await.then_some(port)
        });
    }

    let mut open = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(port)) => open.push(port),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Port probe task failed"),
        }
    }
    open.sort_unstable();
    open
}
