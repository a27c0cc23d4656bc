use anyhow::{Context, Result, bail};
use expa_analytics::{
    AnalyticsConfig, AnalyticsError, AnalyticsIntegration, ExpaIntegration, Properties,
    RequestSignal,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cli::{Cli, Commands};
use crate::output;

/// Record one event (or just flush) and print delivery signals as they arrive
pub async fn run(cli: &Cli, command: &Commands, config: &AnalyticsConfig) -> Result<()> {
    let expa = ExpaIntegration::from_config(config)
        .await
        .context("failed to start Expa integration")?;
    if let Some(user_id) = &cli.user_id {
        expa.set_user_id(user_id.clone()).await;
    }
    let mut signals = expa.signals().subscribe();

    match command {
        Commands::Track(args) => {
            expa.track(&args.event, to_properties(&args.properties)).await?;
            output::print_success(&format!("Tracked '{}'", args.event));
        }
        Commands::Identify(args) => {
            expa.identify(Some(args.user_id.as_str()), to_properties(&args.traits))
                .await?;
            output::print_success(&format!("Identified '{}'", args.user_id));
        }
        Commands::Screen(args) => {
            expa.screen(&args.name, to_properties(&args.properties)).await?;
            output::print_success(&format!("Viewed screen '{}'", args.name));
        }
        Commands::Group(args) => {
            expa.group(&args.group_id, to_properties(&args.traits)).await?;
            output::print_success(&format!("Joined group '{}'", args.group_id));
        }
        Commands::Alias(args) => {
            expa.alias(&args.new_id).await?;
            output::print_success(&format!("Aliased to '{}'", args.new_id));
        }
        Commands::Flush => {}
        Commands::Config(_) => return Ok(()),
    }

    let flush = !cli.no_flush || matches!(command, Commands::Flush);
    if !flush {
        let queued = expa.queue_len().await?;
        output::print_success(&format!("{queued} event(s) queued"));
        return Ok(());
    }

    let outcome = match expa.flush().await {
        Ok(outcome) => outcome,
        Err(AnalyticsError::MissingApiUrl(pending)) => {
            bail!("no api_url configured; {pending} event(s) left in the queue")
        }
        Err(e) => return Err(e.into()),
    };
    drain_signals(&mut signals);

    let remaining = expa.queue_len().await?;
    output::print_outcome(&outcome, remaining);
    debug!(remaining, "flush finished");

    match outcome.report() {
        Some(report) if !report.is_success() => bail!("delivery incomplete"),
        _ => Ok(()),
    }
}

fn to_properties(pairs: &[(String, Value)]) -> Properties {
    pairs.iter().cloned().collect()
}

fn drain_signals(rx: &mut broadcast::Receiver<RequestSignal>) {
    loop {
        match rx.try_recv() {
            Ok(signal) => output::print_signal(&signal),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                debug!(skipped, "signal receiver lagged");
            }
            Err(_) => break,
        }
    }
}
