//! Device classification from open ports, plus metrics endpoint discovery.

use std::net::IpAddr;
use std::time::Duration;

use netwatch_core::DeviceType;

use crate::error::Result;

/// Ports checked for a Prometheus-style `/metrics` endpoint, in order.
pub const METRICS_PORTS: [u16; 6] = [9100, 8080, 80, 3000, 8090, 9090];

pub const METRICS_TIMEOUT: Duration = Duration::from_secs(1);

/// Map an open-port set to a device type. First matching rule wins.
pub fn classify(ports: &[u16]) -> DeviceType {
    let has = |p: u16| ports.contains(&p);

    if has(9100) {
        DeviceType::NodeExporter
    } else if has(3389) {
        DeviceType::WindowsPc
    } else if has(22) && !has(80) {
        DeviceType::LinuxServer
    } else if has(445) {
        DeviceType::WindowsSamba
    } else if has(80) || has(443) {
        DeviceType::WebServer
    } else if has(1883) || has(8883) {
        DeviceType::MqttBroker
    } else {
        DeviceType::Unknown
    }
}

/// Whether a response body looks like Prometheus exposition format.
fn is_metrics_body(body: &str) -> bool {
    body.contains("# HELP") || body.contains("# TYPE")
}

/// HTTP client for `/metrics` probing.
#[derive(Clone)]
pub struct MetricsProbe {
    client: reqwest::Client,
}

impl MetricsProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(METRICS_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    pub async fn discover(&self, ip: IpAddr) -> Vec<String> {
        self.discover_on(ip, &METRICS_PORTS).await
    }

    /// Try every port; a 200 carrying exposition markers counts.
    pub async fn discover_on(&self, ip: IpAddr, ports: &[u16]) -> Vec<String> {
        let mut urls = Vec::new();
        for &port in ports {
            let url = match ip {
                IpAddr::V4(v4) => format!("http://{v4}:{port}/metrics"),
                IpAddr::V6(v6) => format!("http://[{v6}]:{port}/metrics"),
            };
            if self.is_metrics_endpoint(&url).await {
                tracing::debug!(url = %url, "Metrics endpoint found");
                urls.push(url);
            }
        }
        urls
    }

    async fn is_metrics_endpoint(&self, url: &str) -> bool {
        let response = match self.client.get(url).send().await {
            Ok(r) if r.status() == reqwest::StatusCode::OK => r,
            _ => return false,
        };
        match response.text().await {
            Ok(body) => is_metrics_body(&body),
            Err(_) => false,
        }
    }
}
