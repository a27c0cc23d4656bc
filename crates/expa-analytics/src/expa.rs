//! The Expa integration.
//!
//! Buffers messages in an [`EventQueue`] and delivers them in batches to the
//! configured API URL. Delivery happens when the queue reaches `flush_at`,
//! on every tick of the flush timer, and whenever `flush` is called.
//!
//! Each request is announced on the [`SignalBroadcaster`]:
//!
//! ```text
//! DidSendRequest ──► RequestDidSucceed   (2xx: events removed)
//!                └─► RequestDidFail      (4xx: batch dropped, retained = false)
//!                                        (408/429/5xx/network: kept, retained = true)
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{AnalyticsConfig, RetryConfig};
use crate::error::{AnalyticsError, Result};
use crate::identity::IdentityStore;
use crate::integration::{AnalyticsIntegration, FlushOutcome, FlushReport};
use crate::queue::{EventQueue, FileQueue, MemoryQueue};
use crate::signals::{RequestInfo, RequestSignal, SignalBroadcaster};
use crate::transport::{HttpTransport, Transport};
use crate::types::{Batch, Identity, Message, Properties};

pub const INTEGRATION_NAME: &str = "Expa";

/// Batching knobs taken from [`AnalyticsConfig`]
#[derive(Debug, Clone)]
pub struct FlushSettings {
    pub flush_at: usize,
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryConfig,
}

impl From<&AnalyticsConfig> for FlushSettings {
    fn from(config: &AnalyticsConfig) -> Self {
        Self {
            flush_at: config.flush_at,
            max_batch_size: config.max_batch_size,
            flush_interval: config.flush_interval(),
            retry: config.retry.clone(),
        }
    }
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self::from(&AnalyticsConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Manual,
    Threshold,
    Timer,
}

#[derive(Debug, Default)]
struct Backoff {
    attempts: u32,
    next_attempt: Option<Instant>,
}

struct FlushTimer {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl FlushTimer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

struct Inner {
    anonymous_id: ArcSwapOption<String>,
    user_id: ArcSwapOption<String>,
    api_url: ArcSwapOption<Url>,
    identity_store: IdentityStore,
    queue: Arc<dyn EventQueue>,
    transport: Arc<dyn Transport>,
    signals: SignalBroadcaster,
    settings: FlushSettings,
    flush_lock: Mutex<()>,
    backoff: Mutex<Backoff>,
    timer: Mutex<Option<FlushTimer>>,
}

/// Builder for [`ExpaIntegration`]
pub struct ExpaIntegrationBuilder {
    config: AnalyticsConfig,
    queue: Option<Arc<dyn EventQueue>>,
    transport: Option<Arc<dyn Transport>>,
    signals: Option<SignalBroadcaster>,
}

impl ExpaIntegrationBuilder {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config,
            queue: None,
            transport: None,
            signals: None,
        }
    }

    /// Use this queue instead of the one derived from `storage_dir`
    pub fn with_queue(mut self, queue: Arc<dyn EventQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use this transport instead of HTTP
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Publish signals on an existing bus
    pub fn with_signals(mut self, signals: SignalBroadcaster) -> Self {
        self.signals = Some(signals);
        self
    }

    pub async fn build(self) -> Result<ExpaIntegration> {
        let config = self.config;
        config.validate()?;

        let queue: Arc<dyn EventQueue> = match (self.queue, config.queue_path()) {
            (Some(queue), _) => queue,
            (None, Some(path)) => Arc::new(FileQueue::open(path, config.max_queue_size).await?),
            (None, None) => Arc::new(MemoryQueue::new(config.max_queue_size)?),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.request_timeout())?),
        };

        let identity_store = IdentityStore::new(config.identity_path());
        let stored = identity_store.load().await;
        let anonymous_id = config
            .anonymous_id
            .clone()
            .or(stored.anonymous_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let inner = Inner {
            anonymous_id: ArcSwapOption::from_pointee(anonymous_id),
            user_id: ArcSwapOption::new(stored.user_id.map(Arc::new)),
            api_url: ArcSwapOption::new(config.api_url.clone().map(Arc::new)),
            identity_store,
            queue,
            transport,
            signals: self.signals.unwrap_or_default(),
            settings: FlushSettings::from(&config),
            flush_lock: Mutex::new(()),
            backoff: Mutex::new(Backoff::default()),
            timer: Mutex::new(None),
        };
        inner.persist_identity().await;

        Ok(ExpaIntegration {
            inner: Arc::new(inner),
        })
    }
}

/// Analytics integration delivering batches to the Expa API.
///
/// Cheap to clone; clones share queue, identity and signals.
#[derive(Clone)]
pub struct ExpaIntegration {
    inner: Arc<Inner>,
}

impl ExpaIntegration {
    pub fn builder(config: AnalyticsConfig) -> ExpaIntegrationBuilder {
        ExpaIntegrationBuilder::new(config)
    }

    pub async fn from_config(config: &AnalyticsConfig) -> Result<Self> {
        Self::builder(config.clone()).build().await
    }

    pub fn anonymous_id(&self) -> Option<String> {
        self.inner.anonymous_id.load_full().map(|id| id.as_ref().clone())
    }

    pub async fn set_anonymous_id(&self, anonymous_id: impl Into<String>) {
        self.inner
            .anonymous_id
            .store(Some(Arc::new(anonymous_id.into())));
        self.inner.persist_identity().await;
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.user_id.load_full().map(|id| id.as_ref().clone())
    }

    pub async fn set_user_id(&self, user_id: impl Into<String>) {
        self.inner.user_id.store(Some(Arc::new(user_id.into())));
        self.inner.persist_identity().await;
    }

    pub async fn clear_user_id(&self) {
        self.inner.user_id.store(None);
        self.inner.persist_identity().await;
    }

    pub fn api_url(&self) -> Option<Url> {
        self.inner.api_url.load_full().map(|url| url.as_ref().clone())
    }

    pub fn set_api_url(&self, api_url: Url) {
        self.inner.api_url.store(Some(Arc::new(api_url)));
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity()
    }

    pub fn signals(&self) -> &SignalBroadcaster {
        &self.inner.signals
    }

    pub fn settings(&self) -> &FlushSettings {
        &self.inner.settings
    }

    pub async fn queue_len(&self) -> Result<usize> {
        self.inner.queue.len().await
    }

    /// Time left before a scheduled flush may retry, if a backoff is active
    pub async fn retry_backoff(&self) -> Option<Duration> {
        self.inner.backoff_remaining().await
    }

    /// Whether the flush timer is running
    pub async fn is_running(&self) -> bool {
        self.inner.timer.lock().await.is_some()
    }
}

impl std::fmt::Debug for ExpaIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpaIntegration")
            .field("identity", &self.identity())
            .field("api_url", &self.api_url().map(|u| u.to_string()))
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Inner {
    fn identity(&self) -> Identity {
        Identity::new(
            self.anonymous_id.load_full().map(|id| id.as_ref().clone()),
            self.user_id.load_full().map(|id| id.as_ref().clone()),
        )
    }

    async fn persist_identity(&self) {
        if let Err(e) = self.identity_store.save(&self.identity()).await {
            warn!(error = %e, "Failed to persist analytics identity");
        }
    }

    async fn enqueue(self: &Arc<Self>, message: Message) -> Result<()> {
        let message_type = message.message_type;
        let len = self.queue.push(message).await?;
        debug!(%message_type, queue_len = len, "Queued analytics event");

        if len >= self.settings.flush_at {
            if self.api_url.load().is_none() {
                debug!(queue_len = len, "Flush threshold reached but no API URL set");
            } else {
                self.spawn_flush(FlushTrigger::Threshold);
            }
        }
        Ok(())
    }

    fn spawn_flush(self: &Arc<Self>, trigger: FlushTrigger) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.flush(trigger).await {
                error!(error = %e, ?trigger, "Background flush failed");
            }
        });
    }

    async fn flush(&self, trigger: FlushTrigger) -> Result<FlushOutcome> {
        // Background flushes coalesce; an explicit flush waits its turn
        let _guard = match trigger {
            FlushTrigger::Manual => self.flush_lock.lock().await,
            FlushTrigger::Threshold | FlushTrigger::Timer => match self.flush_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(?trigger, "Flush already in progress");
                    return Ok(FlushOutcome::InFlight);
                }
            },
        };

        if trigger != FlushTrigger::Manual
            && let Some(remaining) = self.backoff_remaining().await
        {
            debug!(
                ?trigger,
                remaining_ms = millis(remaining),
                "Flush deferred by retry backoff"
            );
            return Ok(FlushOutcome::Deferred);
        }

        let pending = self.queue.len().await?;
        if pending == 0 {
            return Ok(FlushOutcome::Empty);
        }
        let Some(url) = self.api_url.load_full() else {
            return Err(AnalyticsError::MissingApiUrl(pending));
        };

        // Events queued while this flush runs wait for the next one
        let rounds = pending.div_ceil(self.settings.max_batch_size);
        let mut report = FlushReport::default();

        for _ in 0..rounds {
            let messages = self.queue.peek(self.settings.max_batch_size).await?;
            if messages.is_empty() {
                break;
            }
            let batch = Batch::new(messages);
            let ids = batch.message_ids();
            let request = RequestInfo::new(url.as_str(), batch.len());

            report.requests += 1;
            self.signals.send(RequestSignal::did_send(&request));
            debug!(
                request_id = %request.request_id,
                batch_size = batch.len(),
                url = %url,
                ?trigger,
                "Sending analytics batch"
            );

            match self.transport.send(&url, &batch).await {
                Ok(result) if result.is_success() => {
                    let removed = self.queue.remove(&ids).await;
                    self.reset_backoff().await;
                    self.signals
                        .send(RequestSignal::did_succeed(&request, result.status));
                    report.delivered += removed?;
                    debug!(
                        request_id = %request.request_id,
                        status = result.status,
                        "Analytics batch delivered"
                    );
                }
                Ok(result) if result.is_retryable() => {
                    let message = format!("HTTP {}: {}", result.status, result.body);
                    self.fail_retryable(&request, &message, Some(result.status), &mut report)
                        .await?;
                    break;
                }
                Ok(result) => {
                    let message = format!("HTTP {}: {}", result.status, result.body);
                    let removed = self.queue.remove(&ids).await;
                    self.signals.send(RequestSignal::did_fail(
                        &request,
                        message.clone(),
                        Some(result.status),
                        false,
                    ));
                    warn!(
                        request_id = %request.request_id,
                        status = result.status,
                        dropped = ids.len(),
                        "Analytics batch rejected, dropping events"
                    );
                    report.dropped += removed?;
                    report.last_error = Some(message);
                }
                Err(e) => {
                    self.fail_retryable(&request, &e.to_string(), None, &mut report)
                        .await?;
                    break;
                }
            }
        }

        Ok(FlushOutcome::Completed(report))
    }

    async fn fail_retryable(
        &self,
        request: &RequestInfo,
        message: &str,
        status: Option<u16>,
        report: &mut FlushReport,
    ) -> Result<()> {
        let delay = self.schedule_retry().await;
        self.signals
            .send(RequestSignal::did_fail(request, message, status, true));
        warn!(
            request_id = %request.request_id,
            status = ?status,
            error = %message,
            retry_in_ms = millis(delay),
            "Analytics batch failed, keeping events for retry"
        );
        report.retained = self.queue.len().await?;
        report.last_error = Some(message.to_string());
        Ok(())
    }

    async fn schedule_retry(&self) -> Duration {
        let mut backoff = self.backoff.lock().await;
        backoff.attempts = backoff.attempts.saturating_add(1);
        let delay = self.settings.retry.backoff(backoff.attempts);
        backoff.next_attempt = Some(Instant::now() + delay);
        delay
    }

    async fn reset_backoff(&self) {
        let mut backoff = self.backoff.lock().await;
        backoff.attempts = 0;
        backoff.next_attempt = None;
    }

    async fn backoff_remaining(&self) -> Option<Duration> {
        let backoff = self.backoff.lock().await;
        backoff
            .next_attempt
            .and_then(|at| at.checked_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    async fn start_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return;
        }

        let period = self.settings.flush_interval;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = millis(period), "Expa flush timer started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Expa flush timer stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        match inner.flush(FlushTrigger::Timer).await {
                            Ok(FlushOutcome::Completed(report)) => {
                                info!(
                                    requests = report.requests,
                                    delivered = report.delivered,
                                    retained = report.retained,
                                    "Scheduled flush completed"
                                );
                            }
                            Ok(_) => {}
                            Err(AnalyticsError::MissingApiUrl(pending)) => {
                                debug!(pending, "Scheduled flush skipped, no API URL set");
                            }
                            Err(e) => {
                                error!(error = %e, "Scheduled flush failed");
                            }
                        }
                    }
                }
            }
        });

        *timer = Some(FlushTimer {
            handle,
            shutdown: shutdown_tx,
        });
    }

    async fn stop_timer(&self) {
        let timer = self.timer.lock().await.take();
        if let Some(timer) = timer {
            timer.stop().await;
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl AnalyticsIntegration for ExpaIntegration {
    fn name(&self) -> &str {
        INTEGRATION_NAME
    }

    async fn initialize(&self) -> Result<()> {
        self.inner.start_timer().await;
        Ok(())
    }

    async fn identify(&self, user_id: Option<&str>, traits: Properties) -> Result<()> {
        if let Some(user_id) = user_id {
            self.set_user_id(user_id).await;
        }
        let message = Message::identify(&self.identity(), traits);
        self.inner.enqueue(message).await
    }

    async fn track(&self, event: &str, properties: Properties) -> Result<()> {
        let message = Message::track(&self.identity(), event, properties);
        self.inner.enqueue(message).await
    }

    async fn screen(&self, name: &str, properties: Properties) -> Result<()> {
        let message = Message::screen(&self.identity(), name, properties);
        self.inner.enqueue(message).await
    }

    async fn group(&self, group_id: &str, traits: Properties) -> Result<()> {
        let message = Message::group(&self.identity(), group_id, traits);
        self.inner.enqueue(message).await
    }

    async fn alias(&self, new_id: &str) -> Result<()> {
        let previous_id = self.identity().distinct_id().map(str::to_string);
        self.set_user_id(new_id).await;
        let message = Message::alias(&self.identity(), previous_id);
        self.inner.enqueue(message).await
    }

    async fn reset(&self) -> Result<()> {
        self.inner.user_id.store(None);
        self.inner
            .anonymous_id
            .store(Some(Arc::new(Uuid::new_v4().to_string())));
        self.inner.persist_identity().await;
        Ok(())
    }

    async fn flush(&self) -> Result<FlushOutcome> {
        self.inner.flush(FlushTrigger::Manual).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.stop_timer().await;
        match self.inner.flush(FlushTrigger::Manual).await {
            Ok(_) | Err(AnalyticsError::MissingApiUrl(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SendResult;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Answers every request with the next scripted status (last one repeats)
    struct ScriptedTransport {
        statuses: StdMutex<Vec<u16>>,
        batches: StdMutex<Vec<Batch>>,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn new(statuses: Vec<u16>) -> Arc<Self> {
            Self::slow(statuses, Duration::ZERO)
        }

        fn slow(statuses: Vec<u16>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                statuses: StdMutex::new(statuses),
                batches: StdMutex::new(Vec::new()),
                delay,
            })
        }

        fn sent(&self) -> Vec<Batch> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _url: &Url, batch: &Batch) -> Result<SendResult> {
            self.batches.lock().unwrap().push(batch.clone());
            let status = {
                let mut statuses = self.statuses.lock().unwrap();
                if statuses.len() > 1 {
                    statuses.remove(0)
                } else {
                    statuses.first().copied().unwrap_or(200)
                }
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(SendResult {
                status,
                body: String::new(),
            })
        }
    }

    fn config() -> AnalyticsConfig {
        AnalyticsConfig {
            api_url: Some("https://api.example.com".parse().unwrap()),
            flush_at: 100,
            ..Default::default()
        }
    }

    async fn integration(transport: Arc<ScriptedTransport>, config: AnalyticsConfig) -> ExpaIntegration {
        ExpaIntegration::builder(config)
            .with_transport(transport)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_properties_read_back_last_value() {
        let expa = integration(ScriptedTransport::new(vec![200]), AnalyticsConfig::default()).await;

        assert!(expa.anonymous_id().is_some());
        assert!(expa.user_id().is_none());
        assert!(expa.api_url().is_none());

        expa.set_anonymous_id("first").await;
        expa.set_anonymous_id("abc123").await;
        expa.set_user_id("user-1").await;
        expa.set_api_url("https://api.example.com".parse().unwrap());

        assert_eq!(expa.anonymous_id().as_deref(), Some("abc123"));
        assert_eq!(expa.user_id().as_deref(), Some("user-1"));
        assert_eq!(expa.api_url().unwrap().as_str(), "https://api.example.com/");

        expa.clear_user_id().await;
        assert!(expa.user_id().is_none());
    }

    #[tokio::test]
    async fn test_configured_anonymous_id_is_used() {
        let cfg = AnalyticsConfig {
            anonymous_id: Some("fixed".into()),
            ..config()
        };
        let expa = integration(ScriptedTransport::new(vec![200]), cfg).await;
        assert_eq!(expa.anonymous_id().as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn test_flush_with_nothing_queued_is_empty() {
        let transport = ScriptedTransport::new(vec![200]);
        let expa = integration(transport.clone(), config()).await;

        assert_eq!(expa.flush().await.unwrap(), FlushOutcome::Empty);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_flush_without_api_url_keeps_events() {
        let expa = integration(ScriptedTransport::new(vec![200]), AnalyticsConfig::default()).await;
        expa.track("Opened", Properties::new()).await.unwrap();

        let err = expa.flush().await.unwrap_err();
        assert!(matches!(err, AnalyticsError::MissingApiUrl(1)));
        assert_eq!(expa.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_identify_sets_user_and_stamps_events() {
        let transport = ScriptedTransport::new(vec![200]);
        let expa = integration(transport.clone(), config()).await;
        expa.set_anonymous_id("anon-1").await;

        let mut traits = Properties::new();
        traits.insert("email".into(), json!("a@example.com"));
        expa.identify(Some("user-9"), traits).await.unwrap();
        expa.track("Purchased", Properties::new()).await.unwrap();
        expa.flush().await.unwrap();

        let sent = transport.sent();
        let messages = &sent[0].batch;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].traits["email"], "a@example.com");
        for message in messages {
            assert_eq!(message.user_id.as_deref(), Some("user-9"));
            assert_eq!(message.anonymous_id.as_deref(), Some("anon-1"));
        }
    }

    #[tokio::test]
    async fn test_alias_records_previous_distinct_id() {
        let transport = ScriptedTransport::new(vec![200]);
        let expa = integration(transport.clone(), config()).await;
        expa.set_anonymous_id("anon-1").await;

        expa.alias("user-2").await.unwrap();
        expa.flush().await.unwrap();

        let message = &transport.sent()[0].batch[0];
        assert_eq!(message.previous_id.as_deref(), Some("anon-1"));
        assert_eq!(message.user_id.as_deref(), Some("user-2"));
        assert_eq!(expa.user_id().as_deref(), Some("user-2"));
    }

    #[tokio::test]
    async fn test_reset_forgets_user() {
        let expa = integration(ScriptedTransport::new(vec![200]), config()).await;
        expa.set_anonymous_id("anon-1").await;
        expa.set_user_id("user-1").await;

        expa.reset().await.unwrap();

        assert!(expa.user_id().is_none());
        let anonymous_id = expa.anonymous_id().unwrap();
        assert_ne!(anonymous_id, "anon-1");
        assert!(Uuid::parse_str(&anonymous_id).is_ok());
    }

    #[tokio::test]
    async fn test_flush_splits_into_batches() {
        let transport = ScriptedTransport::new(vec![200]);
        let cfg = AnalyticsConfig {
            max_batch_size: 2,
            ..config()
        };
        let expa = integration(transport.clone(), cfg).await;
        for i in 0..5 {
            expa.track(&format!("event-{i}"), Properties::new()).await.unwrap();
        }

        let outcome = expa.flush().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.requests, 3);
        assert_eq!(report.delivered, 5);
        assert!(report.is_success());

        let sizes: Vec<_> = transport.sent().iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(expa.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_dropped_and_flush_continues() {
        let transport = ScriptedTransport::new(vec![400, 200]);
        let cfg = AnalyticsConfig {
            max_batch_size: 1,
            ..config()
        };
        let expa = integration(transport.clone(), cfg).await;
        expa.track("bad", Properties::new()).await.unwrap();
        expa.track("good", Properties::new()).await.unwrap();

        let report = expa.flush().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.requests, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);
        assert!(report.last_error.unwrap().starts_with("HTTP 400"));
        assert_eq!(expa.queue_len().await.unwrap(), 0);
        assert!(expa.retry_backoff().await.is_none());
    }

    #[tokio::test]
    async fn test_retryable_failure_keeps_events_and_backs_off() {
        let transport = ScriptedTransport::new(vec![503, 200]);
        let expa = integration(transport.clone(), config()).await;
        expa.track("kept", Properties::new()).await.unwrap();

        let report = expa.flush().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(expa.queue_len().await.unwrap(), 1);
        assert!(expa.retry_backoff().await.is_some());

        // Scheduled flushes respect the backoff, explicit ones do not
        assert_eq!(
            expa.inner.flush(FlushTrigger::Timer).await.unwrap(),
            FlushOutcome::Deferred
        );
        let report = expa.flush().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.delivered, 1);
        assert!(expa.retry_backoff().await.is_none());
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_background_flush_coalesces_with_running_flush() {
        let expa = integration(ScriptedTransport::new(vec![200]), config()).await;
        expa.track("a", Properties::new()).await.unwrap();

        let _guard = expa.inner.flush_lock.lock().await;
        assert_eq!(
            expa.inner.flush(FlushTrigger::Timer).await.unwrap(),
            FlushOutcome::InFlight
        );
        assert_eq!(
            expa.inner.flush(FlushTrigger::Threshold).await.unwrap(),
            FlushOutcome::InFlight
        );
    }

    /// Waits until the threshold flush spawned by `track` is inside `send`
    async fn wait_for_first_send(transport: &ScriptedTransport) {
        while transport.sent().is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_waits_for_background_flush() {
        let transport = ScriptedTransport::slow(vec![503, 200], Duration::from_millis(300));
        let cfg = AnalyticsConfig {
            flush_at: 1,
            ..config()
        };
        let expa = integration(transport.clone(), cfg).await;
        expa.track("last", Properties::new()).await.unwrap();
        wait_for_first_send(&transport).await;

        let report = expa.flush().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(expa.queue_len().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_delivers_after_background_flush_fails() {
        let transport = ScriptedTransport::slow(vec![503, 200], Duration::from_millis(300));
        let cfg = AnalyticsConfig {
            flush_at: 1,
            ..config()
        };
        let expa = integration(transport.clone(), cfg).await;
        expa.initialize().await.unwrap();
        expa.track("last", Properties::new()).await.unwrap();
        wait_for_first_send(&transport).await;

        expa.shutdown().await.unwrap();
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(expa.queue_len().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_every_interval() {
        let transport = ScriptedTransport::new(vec![200]);
        let cfg = AnalyticsConfig {
            flush_interval_ms: 1_000,
            ..config()
        };
        let expa = integration(transport.clone(), cfg).await;
        expa.initialize().await.unwrap();

        expa.track("first", Properties::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(expa.queue_len().await.unwrap(), 0);

        expa.track("second", Properties::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(expa.queue_len().await.unwrap(), 0);

        expa.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_waits_out_retry_backoff() {
        let transport = ScriptedTransport::new(vec![503, 200]);
        let cfg = AnalyticsConfig {
            flush_interval_ms: 1_000,
            retry: RetryConfig {
                base_delay_ms: 5_000,
                max_delay_ms: 60_000,
            },
            ..config()
        };
        let expa = integration(transport.clone(), cfg).await;
        expa.initialize().await.unwrap();

        expa.track("kept", Properties::new()).await.unwrap();
        expa.flush().await.unwrap();
        assert_eq!(transport.sent().len(), 1);

        // Ticks inside the backoff window send nothing
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(expa.queue_len().await.unwrap(), 1);
        assert_eq!(
            expa.inner.flush(FlushTrigger::Timer).await.unwrap(),
            FlushOutcome::Deferred
        );

        // First tick after the window delivers
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(expa.queue_len().await.unwrap(), 0);

        expa.shutdown().await.unwrap();
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_flush_completes_when_queue_file_is_unwritable() {
        let dir = TempDir::new().unwrap();
        let cfg = AnalyticsConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            ..config()
        };
        let transport = ScriptedTransport::new(vec![200]);
        let expa = integration(transport.clone(), cfg).await;
        std::fs::create_dir(dir.path().join("queue.json.tmp")).unwrap();

        expa.track("kept", Properties::new()).await.unwrap();
        let report = expa.flush().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(expa.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_identity_persisted_across_instances() {
        let dir = TempDir::new().unwrap();
        let cfg = AnalyticsConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            ..config()
        };

        let first = integration(ScriptedTransport::new(vec![200]), cfg.clone()).await;
        first.set_user_id("user-42").await;
        let anonymous_id = first.anonymous_id();
        first.track("queued", Properties::new()).await.unwrap();
        drop(first);

        let second = integration(ScriptedTransport::new(vec![200]), cfg).await;
        assert_eq!(second.user_id().as_deref(), Some("user-42"));
        assert_eq!(second.anonymous_id(), anonymous_id);
        assert_eq!(second.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown_timer() {
        let transport = ScriptedTransport::new(vec![200]);
        let expa = integration(transport.clone(), config()).await;

        expa.initialize().await.unwrap();
        expa.initialize().await.unwrap();
        assert!(expa.is_running().await);

        expa.track("last", Properties::new()).await.unwrap();
        expa.shutdown().await.unwrap();

        assert!(!expa.is_running().await);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(expa.queue_len().await.unwrap(), 0);
    }
}
