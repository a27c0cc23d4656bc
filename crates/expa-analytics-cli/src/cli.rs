use clap::{Parser, Subcommand};
use serde_json::Value;
use url::Url;

#[derive(Parser)]
#[command(name = "expa")]
#[command(about = "Record analytics events and deliver them to the Expa API")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (defaults to ./expa-analytics.toml when present)
    #[arg(short, long, global = true, env = "EXPA_CONFIG")]
    pub config: Option<String>,

    /// Endpoint receiving event batches (overrides the settings file)
    #[arg(long, global = true, env = "EXPA_API_URL")]
    pub api_url: Option<Url>,

    /// Attribute events to this anonymous id
    #[arg(long, global = true)]
    pub anonymous_id: Option<String>,

    /// Attribute events to this user id
    #[arg(long, global = true)]
    pub user_id: Option<String>,

    /// Only queue the event; do not deliver it now
    #[arg(long, global = true)]
    pub no_flush: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a named event
    Track(TrackArgs),
    /// Identify the current user
    Identify(IdentifyArgs),
    /// Record a screen view
    Screen(ScreenArgs),
    /// Associate the current user with a group
    Group(GroupArgs),
    /// Link the current identity to a new user id
    Alias(AliasArgs),
    /// Deliver queued events now
    Flush,
    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(clap::Args)]
pub struct TrackArgs {
    /// Event name
    pub event: String,
    /// Event property as key=value (value parsed as JSON when possible)
    #[arg(short = 'p', long = "property", value_parser = parse_key_value)]
    pub properties: Vec<(String, Value)>,
}

#[derive(clap::Args)]
pub struct IdentifyArgs {
    /// User id
    pub user_id: String,
    /// User trait as key=value
    #[arg(short = 't', long = "trait", value_parser = parse_key_value)]
    pub traits: Vec<(String, Value)>,
}

#[derive(clap::Args)]
pub struct ScreenArgs {
    /// Screen name
    pub name: String,
    #[arg(short = 'p', long = "property", value_parser = parse_key_value)]
    pub properties: Vec<(String, Value)>,
}

#[derive(clap::Args)]
pub struct GroupArgs {
    /// Group id
    pub group_id: String,
    #[arg(short = 't', long = "trait", value_parser = parse_key_value)]
    pub traits: Vec<(String, Value)>,
}

#[derive(clap::Args)]
pub struct AliasArgs {
    /// New user id
    pub new_id: String,
}

#[derive(clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
}

/// Parse `key=value`. The value is read as JSON, falling back to a plain string.
pub fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
