use anyhow::Result;
use expa_analytics::AnalyticsConfig;

pub fn show(config: &AnalyticsConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
