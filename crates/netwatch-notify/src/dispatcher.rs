//! Notification dispatcher.
//!
//! Accepting side: rate limit → timestamp → persist → bounded queue.
//! Delivery side: one background consumer drains the queue in FIFO order
//! and spawns one detached delivery task per enabled channel. Those tasks
//! are never joined, so "queue drained" does not imply "delivered".

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use netwatch_core::{ChangeEvent, Notification, NotificationConfig};
use netwatch_store::DeviceStore;

use crate::channel::{build_channels, Channel};
use crate::error::{NotifyError, Result};
use crate::limiter::{RateLimiter, DEFAULT_MIN_INTERVAL};

/// Default bound of the delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Minimum gap between notifications with the same `type:mac` key.
    pub min_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Outcome of a successful [`Dispatcher::notify`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Persisted and queued for delivery.
    Queued,
    /// Dropped by the rate limiter; nothing persisted or delivered.
    Suppressed,
}

/// Config and the channels built from it, swapped together.
struct ChannelSet {
    config: NotificationConfig,
    channels: Vec<Arc<dyn Channel>>,
}

struct Shared {
    store: Arc<dyn DeviceStore>,
    limiter: RateLimiter,
    channels: RwLock<ChannelSet>,
}

impl Shared {
    fn channel_snapshot(&self) -> Vec<Arc<dyn Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .clone()
    }
}

/// Accepts notifications and fans them out to the enabled channels.
pub struct Dispatcher {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Notification>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Start a dispatcher using the channels described by the stored config.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(store: Arc<dyn DeviceStore>, settings: DispatcherSettings) -> Self {
        let config = match store.notification_config() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load notification config, using defaults");
                NotificationConfig::default()
            }
        };
        let channels = build_channels(&config);
        Self::start_with_channels(store, settings, config, channels)
    }

    /// Start a dispatcher with an explicit channel list.
    pub fn start_with_channels(
        store: Arc<dyn DeviceStore>,
        settings: DispatcherSettings,
        config: NotificationConfig,
        channels: Vec<Arc<dyn Channel>>,
    ) -> Self {
        log_channels(&channels);

        let shared = Arc::new(Shared {
            store,
            limiter: RateLimiter::new(settings.min_interval),
            channels: RwLock::new(ChannelSet { config, channels }),
        });
        let (queue, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let cancel = CancellationToken::new();

        tokio::spawn(run_consumer(shared.clone(), rx, cancel.clone()));

        Self {
            shared,
            queue,
            cancel,
        }
    }

    /// Accept a notification for delivery without blocking.
    ///
    /// A repeat of the same `type:mac` within the rate-limit interval is
    /// silently dropped. A persistence failure is logged and does not stop
    /// delivery. Returns [`NotifyError::QueueFull`] when the queue is at
    /// capacity.
    pub fn notify(&self, mut notification: Notification) -> Result<Dispatch> {
        let key = notification.rate_limit_key();
        if !self.shared.limiter.should_notify(&key) {
            tracing::debug!(key = %key, "Rate limited notification");
            return Ok(Dispatch::Suppressed);
        }

        notification.timestamp.get_or_insert_with(Utc::now);

        match self.shared.store.save_notification(&notification) {
            Ok(id) => notification.id = Some(id),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to save notification");
            }
        }

        match self.queue.try_send(notification) {
            Ok(()) => Ok(Dispatch::Queued),
            Err(TrySendError::Full(_)) => Err(NotifyError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(NotifyError::Closed),
        }
    }

    /// Build a notification from a detected change and dispatch it.
    pub fn notify_change(&self, change: &ChangeEvent) -> Result<Dispatch> {
        self.notify(Notification::from(change))
    }

    /// Swap in a new config and rebuild the channel list, then persist it.
    ///
    /// Notifications already handed to channels keep their old channel;
    /// the next notification drained sees the new set.
    pub fn update_config(&self, config: NotificationConfig) -> Result<()> {
        let channels = build_channels(&config);
        log_channels(&channels);
        {
            let mut set = self
                .shared
                .channels
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            set.config = config.clone();
            set.channels = channels;
        }
        self.shared.store.save_notification_config(&config)?;
        Ok(())
    }

    pub fn config(&self) -> NotificationConfig {
        self.shared
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .config
            .clone()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.shared
            .channel_snapshot()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Number of notifications waiting for the consumer.
    pub fn queue_len(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    /// Evict stale rate-limit keys. Returns the number removed.
    pub fn prune_rate_limits(&self) -> usize {
        self.shared.limiter.prune()
    }

    /// Stop the background consumer. In-flight sends are not awaited.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn log_channels(channels: &[Arc<dyn Channel>]) {
    let names: Vec<&str> = channels.iter().map(|c| c.name()).collect();
    tracing::info!(count = channels.len(), channels = ?names, "Notification channels initialized");
}

async fn run_consumer(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Notification>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(notification) => fan_out(&shared, notification),
                None => break,
            },
        }
    }
    tracing::debug!("Notification consumer stopped");
}

/// Broadcast one notification; delivery tasks are detached.
fn fan_out(shared: &Shared, notification: Notification) {
    let notification = Arc::new(notification);
    for channel in shared.channel_snapshot() {
        let notification = notification.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.send(&notification).await {
                tracing::warn!(
                    channel = channel.name(),
                    kind = %notification.kind,
                    error = %e,
                    "Failed to send notification"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use netwatch_core::{Device, NotificationKind, Severity};
    use netwatch_store::{FileStore, StoreError};
    use tokio::sync::mpsc::UnboundedSender;

    use crate::error::DeliveryError;

    struct Recording {
        name: &'static str,
        tx: UnboundedSender<(&'static str, Notification)>,
    }

    #[async_trait]
    impl Channel for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, n: &Notification) -> std::result::Result<(), DeliveryError> {
            let _ = self.tx.send((self.name, n.clone()));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Channel for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _n: &Notification) -> std::result::Result<(), DeliveryError> {
            Err(DeliveryError::MissingWebhookUrl)
        }
    }

    /// Delegates to an in-memory store but refuses to save notifications.
    struct BrokenStore(FileStore);

    impl DeviceStore for BrokenStore {
        fn upsert_device(&self, d: &Device) -> std::result::Result<(), StoreError> {
            self.0.upsert_device(d)
        }
        fn all_devices(&self) -> std::result::Result<Vec<Device>, StoreError> {
            self.0.all_devices()
        }
        fn device_by_ip(&self, ip: &str) -> std::result::Result<Option<Device>, StoreError> {
            self.0.device_by_ip(ip)
        }
        fn cached_vendor(&self, mac: &str) -> std::result::Result<Option<String>, StoreError> {
            self.0.cached_vendor(mac)
        }
        fn save_vendor(&self, mac: &str, vendor: &str) -> std::result::Result<(), StoreError> {
            self.0.save_vendor(mac, vendor)
        }
        fn save_notification(&self, _n: &Notification) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
        fn notifications(&self) -> std::result::Result<Vec<Notification>, StoreError> {
            self.0.notifications()
        }
        fn delete_old_notifications(&self, days: u32) -> std::result::Result<usize, StoreError> {
            self.0.delete_old_notifications(days)
        }
        fn notification_config(&self) -> std::result::Result<NotificationConfig, StoreError> {
            self.0.notification_config()
        }
        fn save_notification_config(
            &self,
            c: &NotificationConfig,
        ) -> std::result::Result<(), StoreError> {
            self.0.save_notification_config(c)
        }
    }

    fn notification(kind: NotificationKind, mac: &str) -> Notification {
        let device = Device::new(mac, "10.0.0.5".parse().unwrap());
        Notification::new(kind, &device, "test", Severity::Info)
    }

    fn recorder(
        name: &'static str,
    ) -> (
        Arc<dyn Channel>,
        mpsc::UnboundedReceiver<(&'static str, Notification)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recording { name, tx }), rx)
    }

    async fn recv(
        rx: &mut mpsc::UnboundedReceiver<(&'static str, Notification)>,
    ) -> (&'static str, Notification) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_delivers_to_every_channel() {
        let store = Arc::new(FileStore::in_memory());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channels: Vec<Arc<dyn Channel>> = vec![
            Arc::new(Recording { name: "a", tx: tx.clone() }),
            Arc::new(Failing),
            Arc::new(Recording { name: "b", tx }),
        ];
        let dispatcher = Dispatcher::start_with_channels(
            store.clone(),
            DispatcherSettings::default(),
            NotificationConfig::default(),
            channels,
        );

        let outcome = dispatcher
            .notify(notification(NotificationKind::NewDevice, "m1"))
            .unwrap();
        assert_eq!(outcome, Dispatch::Queued);

        let mut names = vec![recv(&mut rx).await.0, recv(&mut rx).await.0];
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        let saved = store.notifications().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, Some(1));
    }

    #[tokio::test]
    async fn test_repeat_within_interval_is_suppressed() {
        let store = Arc::new(FileStore::in_memory());
        let (channel, mut rx) = recorder("rec");
        let dispatcher = Dispatcher::start_with_channels(
            store.clone(),
            DispatcherSettings::default(),
            NotificationConfig::default(),
            vec![channel],
        );

        let first = dispatcher.notify(notification(NotificationKind::PortChange, "m1"));
        let second = dispatcher.notify(notification(NotificationKind::PortChange, "m1"));
        let other_kind = dispatcher.notify(notification(NotificationKind::Disconnected, "m1"));

        assert_eq!(first.unwrap(), Dispatch::Queued);
        assert_eq!(second.unwrap(), Dispatch::Suppressed);
        assert_eq!(other_kind.unwrap(), Dispatch::Queued);

        recv(&mut rx).await;
        recv(&mut rx).await;
        assert_eq!(store.notifications().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_timestamp_is_stamped() {
        let store = Arc::new(FileStore::in_memory());
        let (channel, mut rx) = recorder("rec");
        let dispatcher = Dispatcher::start_with_channels(
            store,
            DispatcherSettings::default(),
            NotificationConfig::default(),
            vec![channel],
        );

        let n = notification(NotificationKind::NewDevice, "m1");
        assert!(n.timestamp.is_none());
        dispatcher.notify(n).unwrap();

        let (_, delivered) = recv(&mut rx).await;
        assert!(delivered.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_queue_full_is_reported() {
        // The current-thread runtime does not poll the consumer until we yield.
        let store = Arc::new(FileStore::in_memory());
        let settings = DispatcherSettings {
            queue_capacity: 1,
            ..Default::default()
        };
        let dispatcher = Dispatcher::start_with_channels(
            store,
            settings,
            NotificationConfig::default(),
            Vec::new(),
        );

        let first = dispatcher.notify(notification(NotificationKind::NewDevice, "m1"));
        let second = dispatcher.notify(notification(NotificationKind::NewDevice, "m2"));

        assert_eq!(first.unwrap(), Dispatch::Queued);
        assert!(matches!(second, Err(NotifyError::QueueFull)));
        assert_eq!(dispatcher.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_still_delivers() {
        let store = Arc::new(BrokenStore(FileStore::in_memory()));
        let (channel, mut rx) = recorder("rec");
        let dispatcher = Dispatcher::start_with_channels(
            store,
            DispatcherSettings::default(),
            NotificationConfig::default(),
            vec![channel],
        );

        let outcome = dispatcher.notify(notification(NotificationKind::NewDevice, "m1"));
        assert_eq!(outcome.unwrap(), Dispatch::Queued);

        let (_, delivered) = recv(&mut rx).await;
        assert_eq!(delivered.id, None);
    }

    #[tokio::test]
    async fn test_update_config_swaps_channels() {
        let store = Arc::new(FileStore::in_memory());
        let dispatcher = Dispatcher::start(store.clone(), DispatcherSettings::default());
        assert_eq!(dispatcher.channel_names(), vec!["console"]);

        let mut config = dispatcher.config();
        config.enabled_channels = vec!["webhook".into()];
        config.webhook_url = "http://127.0.0.1:9/hook".into();
        dispatcher.update_config(config).unwrap();

        assert_eq!(dispatcher.channel_names(), vec!["webhook"]);
        assert_eq!(
            store.notification_config().unwrap().webhook_url,
            "http://127.0.0.1:9/hook"
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_queue() {
        let store = Arc::new(FileStore::in_memory());
        let dispatcher = Dispatcher::start_with_channels(
            store,
            DispatcherSettings::default(),
            NotificationConfig::default(),
            Vec::new(),
        );

        dispatcher.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = dispatcher.notify(notification(NotificationKind::NewDevice, "m1"));
        assert!(matches!(result, Err(NotifyError::Closed)));
    }
}
