//! Host dispatcher forwarding calls to every registered integration.

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{AnalyticsError, Result};
use crate::integration::{AnalyticsIntegration, FlushOutcome};
use crate::types::Properties;

/// Fans analytics calls out to a set of integrations.
///
/// A failing integration is logged and skipped; the others still receive
/// the call. Recording methods return the first error encountered, if any.
#[derive(Clone, Default)]
pub struct Analytics {
    integrations: Vec<Arc<dyn AnalyticsIntegration>>,
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_integration(mut self, integration: Arc<dyn AnalyticsIntegration>) -> Self {
        self.register(integration);
        self
    }

    pub fn register(&mut self, integration: Arc<dyn AnalyticsIntegration>) {
        debug!(integration = integration.name(), "Registered analytics integration");
        self.integrations.push(integration);
    }

    pub fn integration_names(&self) -> Vec<&str> {
        self.integrations.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.integrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.integrations.is_empty()
    }

    pub async fn initialize(&self) -> Result<()> {
        let mut first_error = None;
        for integration in &self.integrations {
            let result = integration.initialize().await;
            record(integration.name(), "initialize", result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn identify(&self, user_id: Option<&str>, traits: Properties) -> Result<()> {
        let mut first_error = None;
        for integration in &self.integrations {
            let result = integration.identify(user_id, traits.clone()).await;
            record(integration.name(), "identify", result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn track(&self, event: &str, properties: Properties) -> Result<()> {
        let mut first_error = None;
        for integration in &self.integrations {
            let result = integration.track(event, properties.clone()).await;
            record(integration.name(), "track", result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn screen(&self, name: &str, properties: Properties) -> Result<()> {
        let mut first_error = None;
        for integration in &self.integrations {
            let result = integration.screen(name, properties.clone()).await;
            record(integration.name(), "screen", result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn group(&self, group_id: &str, traits: Properties) -> Result<()> {
        let mut first_error = None;
        for integration in &self.integrations {
            let result = integration.group(group_id, traits.clone()).await;
            record(integration.name(), "group", result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn alias(&self, new_id: &str) -> Result<()> {
        let mut first_error = None;
        for integration in &self.integrations {
            let result = integration.alias(new_id).await;
            record(integration.name(), "alias", result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn reset(&self) -> Result<()> {
        let mut first_error = None;
        for integration in &self.integrations {
            let result = integration.reset().await;
            record(integration.name(), "reset", result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flush every integration and return each outcome by integration name
    pub async fn flush(&self) -> Vec<(String, Result<FlushOutcome>)> {
        let mut outcomes = Vec::with_capacity(self.integrations.len());
        for integration in &self.integrations {
            let result = integration.flush().await;
            if let Err(e) = &result {
                error!(integration = integration.name(), error = %e, "Integration flush failed");
            }
            outcomes.push((integration.name().to_string(), result));
        }
        outcomes
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for integration in &self.integrations {
            let result = integration.shutdown().await;
            record(integration.name(), "shutdown", result, &mut first_error);
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn record(
    integration: &str,
    operation: &str,
    result: Result<()>,
    first_error: &mut Option<AnalyticsError>,
) {
    if let Err(e) = result {
        error!(integration, operation, error = %e, "Analytics integration call failed");
        if first_error.is_none() {
            *first_error = Some(e);
        }
    }
}

impl std::fmt::Debug for Analytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analytics")
            .field("integrations", &self.integration_names())
            .finish()
    }
}
