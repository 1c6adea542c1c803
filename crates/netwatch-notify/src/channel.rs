//! Delivery channels.
//!
//! Each channel delivers one notification independently; a failure in one
//! never affects the others.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::process::Command;

use netwatch_core::{ChannelKind, Notification, NotificationConfig, Severity};

use crate::error::DeliveryError;

/// Hard cap on a single webhook POST.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("netwatch/", env!("CARGO_PKG_VERSION"));

/// A notification delivery mechanism.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Build the channel list described by `config`.
///
/// Unknown channel names and a webhook without a URL are logged and skipped.
pub fn build_channels(config: &NotificationConfig) -> Vec<Arc<dyn Channel>> {
    let (kinds, unknown) = config.channels();
    for e in unknown {
        tracing::warn!(error = %e, "Ignoring notification channel");
    }

    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    for kind in kinds {
        match kind {
            ChannelKind::Console => channels.push(Arc::new(ConsoleChannel)),
            ChannelKind::System => channels.push(Arc::new(SystemChannel)),
            ChannelKind::Webhook if config.webhook_url.is_empty() => {
                tracing::warn!("Webhook channel enabled without a URL, skipping");
            }
            ChannelKind::Webhook => match WebhookChannel::new(&config.webhook_url) {
                Ok(webhook) => channels.push(Arc::new(webhook)),
                Err(e) => tracing::warn!(error = %e, "Failed to build webhook channel"),
            },
        }
    }
    channels
}

// ── Console ───────────────────────────────────────────────────────

/// Writes notifications to the log at a level matching their severity.
pub struct ConsoleChannel;

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &str {
        ChannelKind::Console.as_str()
    }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        match n.severity {
            Severity::Info => tracing::info!(
                kind = %n.kind,
                device_ip = %n.device_ip,
                device_mac = %n.device_mac,
                "{}",
                n.message
            ),
            Severity::Warning => tracing::warn!(
                kind = %n.kind,
                device_ip = %n.device_ip,
                device_mac = %n.device_mac,
                "{}",
                n.message
            ),
            Severity::Critical => tracing::error!(
                kind = %n.kind,
                device_ip = %n.device_ip,
                device_mac = %n.device_mac,
                "{}",
                n.message
            ),
        }
        Ok(())
    }
}

// ── Desktop ───────────────────────────────────────────────────────

/// Native desktop notification via the platform's notifier binary.
pub struct SystemChannel;

impl SystemChannel {
    fn title(n: &Notification) -> String {
        format!("netwatch: {}", n.kind)
    }

    #[cfg(target_os = "linux")]
    fn command(n: &Notification) -> Result<Command, DeliveryError> {
        let mut cmd = Command::new("notify-send");
        cmd.arg(Self::title(n)).arg(&n.message);
        Ok(cmd)
    }

    #[cfg(target_os = "macos")]
    fn command(n: &Notification) -> Result<Command, DeliveryError> {
        let script = format!(
            "display notification \"{}\" with title \"{}\"",
            applescript_escape(&n.message),
            applescript_escape(&Self::title(n)),
        );
        let mut cmd = Command::new("osascript");
        cmd.arg("-e").arg(script);
        Ok(cmd)
    }

    #[cfg(target_os = "windows")]
    fn command(n: &Notification) -> Result<Command, DeliveryError> {
        let script = format!(
            r#"[Windows.UI.Notifications.ToastNotificationManager, Windows.UI.Notifications, ContentType = WindowsRuntime] | Out-Null
[Windows.Data.Xml.Dom.XmlDocument, Windows.Data.Xml.Dom.XmlDocument, ContentType = WindowsRuntime] | Out-Null
$template = @"
<toast><visual><binding template="ToastText02"><text id="1">{}</text><text id="2">{}</text></binding></visual></toast>
"@
$xml = New-Object Windows.Data.Xml.Dom.XmlDocument
$xml.LoadXml($template)
$toast = New-Object Windows.UI.Notifications.ToastNotification $xml
[Windows.UI.Notifications.ToastNotificationManager]::CreateToastNotifier("netwatch").Show($toast)"#,
            xml_escape(&Self::title(n)),
            xml_escape(&n.message),
        );
        let mut cmd = Command::new("powershell");
        cmd.arg("-NoProfile").arg("-Command").arg(script);
        Ok(cmd)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    fn command(_n: &Notification) -> Result<Command, DeliveryError> {
        Err(DeliveryError::UnsupportedPlatform(std::env::consts::OS))
    }
}

#[cfg(target_os = "macos")]
fn applescript_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(target_os = "windows")]
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl Channel for SystemChannel {
    fn name(&self) -> &str {
        ChannelKind::System.as_str()
    }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        let status = Self::command(n)?.kill_on_drop(true).status().await?;
        if !status.success() {
            return Err(DeliveryError::Command(status));
        }
        Ok(())
    }
}

// ── Webhook ───────────────────────────────────────────────────────

/// POSTs a JSON document describing the notification.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: &str) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The wire payload: `{type, device_ip, device_mac, message, severity, timestamp}`.
    pub fn payload(n: &Notification) -> serde_json::Value {
        let timestamp = n
            .timestamp
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        serde_json::json!({
            "type": n.kind.as_str(),
            "device_ip": n.device_ip,
            "device_mac": n.device_mac,
            "message": n.message,
            "severity": n.severity.as_str(),
            "timestamp": timestamp,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        ChannelKind::Webhook.as_str()
    }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        if self.url.is_empty() {
            return Err(DeliveryError::MissingWebhookUrl);
        }

        let resp = self
            .client
            .post(&self.url)
            .json(&Self::payload(n))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }

        tracing::debug!(url = %self.url, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use netwatch_core::{Device, NotificationKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn sample() -> Notification {
        let device = Device::new("aa:bb:cc:dd:ee:ff", "10.0.0.5".parse().unwrap());
        let mut n = Notification::new(
            NotificationKind::NewDevice,
            &device,
            "New device detected: 10.0.0.5 ()",
            Severity::Info,
        );
        n.timestamp = Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        n
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let body_len = text[..head_end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Accept one HTTP request, answer with `status`, and return the raw request.
    async fn serve_once(status: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response =
                format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (format!("http://{addr}/hook"), handle)
    }

    #[test]
    fn test_payload_shape() {
        let payload = WebhookChannel::payload(&sample());
        assert_eq!(payload["type"], "new_device");
        assert_eq!(payload["device_ip"], "10.0.0.5");
        assert_eq!(payload["device_mac"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(payload["severity"], "info");
        assert_eq!(payload["timestamp"], "2024-03-01T12:00:00Z");
        assert_eq!(payload.as_object().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let (url, server) = serve_once("204 No Content").await;
        let webhook = WebhookChannel::new(&url).unwrap();

        webhook.send(&sample()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.to_lowercase().contains("content-type: application/json"));
        assert!(request.contains("\"device_mac\":\"aa:bb:cc:dd:ee:ff\""));
    }

    #[tokio::test]
    async fn test_webhook_non_2xx_is_error() {
        let (url, server) = serve_once("500 Internal Server Error").await;
        let webhook = WebhookChannel::new(&url).unwrap();

        let err = webhook.send(&sample()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Status(500)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_without_url_fails() {
        let webhook = WebhookChannel::new("").unwrap();
        let err = webhook.send(&sample()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::MissingWebhookUrl));
    }

    #[test]
    fn test_build_channels_from_config() {
        let config = NotificationConfig {
            enabled_channels: vec!["console".into(), "system".into(), "webhook".into()],
            webhook_url: "http://127.0.0.1:9/hook".into(),
            ..Default::default()
        };
        let names: Vec<String> = build_channels(&config)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["console", "system", "webhook"]);
    }

    #[test]
    fn test_webhook_skipped_without_url() {
        let config = NotificationConfig {
            enabled_channels: vec!["webhook".into(), "carrier-pigeon".into()],
            ..Default::default()
        };
        assert!(build_channels(&config).is_empty());
    }

    #[tokio::test]
    async fn test_console_never_fails() {
        let mut n = sample();
        for severity in [Severity::Info, Severity::Warning, Severity::Critical] {
            n.severity = severity;
            ConsoleChannel.send(&n).await.unwrap();
        }
    }
}
