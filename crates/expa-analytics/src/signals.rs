//! Request signals broadcast by integrations.
//!
//! Every HTTP request an integration issues produces a `DidSendRequest`
//! signal, followed by exactly one of `RequestDidSucceed` or
//! `RequestDidFail`. Observers subscribe to a [`SignalBroadcaster`] and
//! receive every signal sent after they subscribed.
//!
//! ```
//! use expa_analytics::signals::{RequestInfo, RequestSignal, SignalBroadcaster};
//!
//! let signals = SignalBroadcaster::new();
//! let mut receiver = signals.subscribe();
//!
//! let request = RequestInfo::new("https://api.example.com", 1);
//! signals.send(RequestSignal::did_send(&request));
//!
//! assert_eq!(receiver.try_recv().unwrap().name(), "ExpaAnalyticsDidSendRequest");
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const DID_SEND_REQUEST: &str = "ExpaAnalyticsDidSendRequest";
pub const REQUEST_DID_SUCCEED: &str = "ExpaAnalyticsRequestDidSucceed";
pub const REQUEST_DID_FAIL: &str = "ExpaAnalyticsRequestDidFail";

/// Default buffer size for the broadcast channel.
/// Slow receivers lose the oldest signals past this limit.
const DEFAULT_BUFFER_SIZE: usize = 256;

/// Details shared by all signals of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub request_id: Uuid,
    pub url: String,
    pub batch_size: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl RequestInfo {
    pub fn new(url: impl Into<String>, batch_size: usize) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            url: url.into(),
            batch_size,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn touched(&self) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "camelCase")]
pub enum RequestSignal {
    DidSendRequest {
        request: RequestInfo,
    },
    RequestDidSucceed {
        request: RequestInfo,
        status: u16,
    },
    RequestDidFail {
        request: RequestInfo,
        error: String,
        status: Option<u16>,
        /// Whether the batch stays queued for another attempt
        retained: bool,
    },
}

impl RequestSignal {
    pub fn did_send(request: &RequestInfo) -> Self {
        Self::DidSendRequest {
            request: request.clone(),
        }
    }

    pub fn did_succeed(request: &RequestInfo, status: u16) -> Self {
        Self::RequestDidSucceed {
            request: request.touched(),
            status,
        }
    }

    pub fn did_fail(
        request: &RequestInfo,
        error: impl Into<String>,
        status: Option<u16>,
        retained: bool,
    ) -> Self {
        Self::RequestDidFail {
            request: request.touched(),
            error: error.into(),
            status,
            retained,
        }
    }

    /// Stable signal name
    pub fn name(&self) -> &'static str {
        match self {
            RequestSignal::DidSendRequest { .. } => DID_SEND_REQUEST,
            RequestSignal::RequestDidSucceed { .. } => REQUEST_DID_SUCCEED,
            RequestSignal::RequestDidFail { .. } => REQUEST_DID_FAIL,
        }
    }

    pub fn request(&self) -> &RequestInfo {
        match self {
            RequestSignal::DidSendRequest { request }
            | RequestSignal::RequestDidSucceed { request, .. }
            | RequestSignal::RequestDidFail { request, .. } => request,
        }
    }

    /// True for `RequestDidSucceed` and `RequestDidFail`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestSignal::DidSendRequest { .. })
    }
}

impl std::fmt::Display for RequestSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Broadcaster for request signals.
///
/// Cheap to clone; all clones share the same channel.
#[derive(Clone)]
pub struct SignalBroadcaster {
    sender: broadcast::Sender<RequestSignal>,
}

impl SignalBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Send a signal to all subscribers.
    ///
    /// Returns the number of subscribers that received it, 0 if nobody listens.
    pub fn send(&self, signal: RequestSignal) -> usize {
        self.sender.send(signal).unwrap_or_default()
    }

    /// Subscribe to signals sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RequestSignal> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for SignalBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignalBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBroadcaster")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
