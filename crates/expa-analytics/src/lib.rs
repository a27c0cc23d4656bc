//! Expa analytics integration.
//!
//! An [`ExpaIntegration`] attributes events to an anonymous or identified
//! user, buffers them and delivers them in batches to an HTTP endpoint.
//! Every request is announced through typed [`signals`].
//!
//! ```text
//!   host ──► Analytics ──► dyn AnalyticsIntegration ──► ExpaIntegration
//!                                                          │
//!                                          EventQueue ◄────┤ track / identify / ...
//!                                                          │
//!                                          Transport  ◄────┘ flush
//!                                              │
//!                                      SignalBroadcaster ──► observers
//! ```
//!
//! # Example
//!
//! ```ignore
//! use expa_analytics::{AnalyticsConfig, AnalyticsIntegration, ExpaIntegration, Properties};
//!
//! let expa = ExpaIntegration::from_config(&AnalyticsConfig::default()).await?;
//! expa.set_api_url("https://api.example.com/v1/import".parse()?);
//! expa.set_anonymous_id("abc123").await;
//!
//! let mut signals = expa.signals().subscribe();
//! expa.track("Signed Up", Properties::new()).await?;
//! expa.flush().await?;
//! ```

pub mod analytics;
pub mod config;
pub mod error;
pub mod expa;
pub mod identity;
pub mod integration;
pub mod queue;
pub mod signals;
pub mod transport;
pub mod types;

pub use analytics::Analytics;
pub use config::{AnalyticsConfig, LoggingConfig, RetryConfig};
pub use error::{AnalyticsError, Result};
pub use expa::{ExpaIntegration, ExpaIntegrationBuilder, FlushSettings, INTEGRATION_NAME};
pub use identity::IdentityStore;
pub use integration::{AnalyticsIntegration, FlushOutcome, FlushReport};
pub use queue::{EventQueue, FileQueue, MemoryQueue};
pub use signals::{RequestInfo, RequestSignal, SignalBroadcaster};
pub use transport::{HttpTransport, SendResult, Transport};
pub use types::{Batch, Identity, Message, MessageType, Properties};
