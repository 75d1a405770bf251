use std::time::Duration;

use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hub::registry::ConnectionLimits;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] figment::Error),
    #[error(transparent)]
    Cli(#[from] clap::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Shopping list real-time server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "shoplist-server", version, about = "Shopping list real-time server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "SHOPLIST_PORT", default_value = "3001")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "SHOPLIST_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./shoplist.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "SHOPLIST_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (JWT key)
    #[arg(long, env = "SHOPLIST_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Shared HS256 secret used by the auth service to sign tokens.
    /// When empty, a random key is loaded from or generated in the data dir.
    #[arg(long, env = "SHOPLIST_JWT_SECRET", default_value = "", hide_env_values = true)]
    pub jwt_secret: String,

    /// Hub tuning (loaded from [hub] section in TOML or SHOPLIST_HUB__* env)
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub hub: HubConfig,
}

/// Tuning for the real-time hub and its connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Outbound queue capacity per connection; a full queue disconnects the client
    pub queue_capacity: usize,
    /// Interval between keepalive pings sent to each client
    pub ping_interval_secs: u64,
    /// A client that sends nothing (not even a pong) for this long is dropped
    pub idle_timeout_secs: u64,
    /// Maximum time a single frame write may take
    pub write_timeout_secs: u64,
    /// Largest inbound frame accepted from a client
    pub max_frame_bytes: usize,
    /// Most queued messages coalesced into one outbound frame
    pub max_batch: usize,
    pub max_connections_per_user: usize,
    pub max_connections: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ping_interval_secs: 54,
            idle_timeout_secs: 60,
            write_timeout_secs: 10,
            max_frame_bytes: 512,
            max_batch: 16,
            max_connections_per_user: 16,
            max_connections: 10_000,
        }
    }
}

impl HubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            per_user: self.max_connections_per_user,
            total: self.max_connections,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("queue_capacity", self.queue_capacity as u64),
            ("ping_interval_secs", self.ping_interval_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("max_frame_bytes", self.max_frame_bytes as u64),
            ("max_batch", self.max_batch as u64),
            ("max_connections_per_user", self.max_connections_per_user as u64),
            ("max_connections", self.max_connections as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("hub.{name} must be greater than zero")));
        }
        if self.ping_interval_secs >= self.idle_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "hub.ping_interval_secs ({}) must be shorter than hub.idle_timeout_secs ({})",
                self.ping_interval_secs, self.idle_timeout_secs
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            bind_address: "0.0.0.0".to_string(),
            config: "./shoplist.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            jwt_secret: String::new(),
            hub: HubConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (SHOPLIST_*) < CLI args
    pub fn load() -> Result<Self, ConfigError> {
        let matches = Config::command().get_matches();
        let cli = Config::from_arg_matches(&matches)?;
        let overrides = explicit_args(&matches, &cli)?;
        Self::layered(&cli.config, overrides)
    }

    /// Merge defaults, the TOML file at `config_path`, `SHOPLIST_*` env vars
    /// and finally `overrides`, then validate.
    pub fn layered(config_path: &str, overrides: impl Provider) -> Result<Self, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("SHOPLIST_").split("__"))
            .merge(overrides)
            .extract()?;
        config.hub.validate()?;
        Ok(config)
    }
}

/// Only the arguments the user actually passed (flag or env var), so clap's
/// built-in defaults do not mask values from the TOML file.
fn explicit_args(
    matches: &ArgMatches,
    cli: &Config,
) -> Result<Serialized<Map<String, Value>>, ConfigError> {
    let Value::Object(all) =
        serde_json::to_value(cli).map_err(|e| ConfigError::Invalid(e.to_string()))?
    else {
        return Err(ConfigError::Invalid("CLI arguments did not serialize to a table".into()));
    };

    let explicit = all
        .into_iter()
        .filter(|(id, _)| {
            matches!(
                matches.value_source(id),
                Some(ValueSource::CommandLine | ValueSource::EnvVariable)
            )
        })
        .collect();
    Ok(Serialized::defaults(explicit))
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Shopping list real-time server configuration
# Place this file at ./shoplist.toml or specify with --config <path>
# All settings can be overridden via environment variables (SHOPLIST_PORT,
# SHOPLIST_HUB__QUEUE_CAPACITY, etc.) or CLI flags (--port, etc.)

# Server port (default: 3001)
# port = 3001

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the generated JWT key
# data_dir = "./data"

# HS256 secret shared with the auth service. Leave empty to use a random key
# stored in data_dir (only useful for local testing).
# jwt_secret = ""

# ---- Real-time hub ----
# [hub]

# Outbound queue per connection. A client whose queue fills up is disconnected.
# queue_capacity = 256

# Keepalive ping interval; must be shorter than idle_timeout_secs
# ping_interval_secs = 54

# Drop a client that sends nothing (including pongs) for this long
# idle_timeout_secs = 60

# Per-frame write timeout
# write_timeout_secs = 10

# Largest inbound client frame in bytes; larger frames close the connection
# max_frame_bytes = 512

# Queued messages coalesced into one outbound frame (newline separated)
# max_batch = 16

# Connection limits
# max_connections_per_user = 16
# max_connections = 10000
"#
    .to_string()
}
