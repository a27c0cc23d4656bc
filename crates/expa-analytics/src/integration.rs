use async_trait::async_trait;

use crate::error::Result;
use crate::types::Properties;

/// Result of a flush request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered; no request was issued
    Empty,
    /// A background flush found another flush running and yielded to it
    InFlight,
    /// A scheduled flush skipped because a retry backoff is in effect
    Deferred,
    Completed(FlushReport),
}

impl FlushOutcome {
    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            FlushOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// HTTP requests issued
    pub requests: usize,
    /// Events accepted by the endpoint
    pub delivered: usize,
    /// Events rejected by the endpoint and discarded
    pub dropped: usize,
    /// Events still queued after a retryable failure
    pub retained: usize,
    pub last_error: Option<String>,
}

impl FlushReport {
    pub fn is_success(&self) -> bool {
        self.dropped == 0 && self.retained == 0
    }
}

/// Common lifecycle of an analytics integration.
///
/// A host dispatcher forwards every call to each registered integration.
/// Recording calls only buffer; delivery happens on `flush`, on the
/// integration's own schedule, or both.
#[async_trait]
pub trait AnalyticsIntegration: Send + Sync {
    /// Integration name
    fn name(&self) -> &str;

    /// Start background work (timers). Called once by the host.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Attribute subsequent events to `user_id` (when given) and record traits
    async fn identify(&self, user_id: Option<&str>, traits: Properties) -> Result<()>;

    async fn track(&self, event: &str, properties: Properties) -> Result<()>;

    async fn screen(&self, name: &str, properties: Properties) -> Result<()>;

    async fn group(&self, group_id: &str, traits: Properties) -> Result<()>;

    /// Link the current identity to `new_id` and adopt it as user id
    async fn alias(&self, new_id: &str) -> Result<()>;

    /// Forget the current user
    async fn reset(&self) -> Result<()>;

    /// Deliver buffered events now
    async fn flush(&self) -> Result<FlushOutcome>;

    /// Stop background work and deliver what is left
    async fn shutdown(&self) -> Result<()> {
        self.flush().await.map(|_| ())
    }
}
