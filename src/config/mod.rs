//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

const LOCAL_CONFIG_BASENAME: &str = "veille";
pub const DEFAULT_BUS_LISTEN: &str = "127.0.0.1:7040";
const DEFAULT_DURABLE_URL: &str = "sqlite://veille.db";
const DEFAULT_CACHE_SIZE: usize = 500;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_BACKLOG_LIMIT: usize = 256;
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Command-line arguments for the veille binary.
#[derive(Debug, Parser)]
#[command(name = "veille", version, about = "Cache-coherence hub for derived web resources")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VEILLE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the invalidation hub: bus server plus local subscriber.
    Serve(ServeArgs),
    /// Delete expired resources for a builder tag, then exit.
    Expire(ExpireArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    /// Override the bus listen address.
    #[arg(long = "bus-listen", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Override the durable store url.
    #[arg(long = "durable-url", value_name = "URL")]
    pub durable_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ExpireArgs {
    /// Builder tag to garbage-collect.
    pub builder: String,

    /// Override the durable store url.
    #[arg(long = "durable-url", value_name = "URL")]
    pub durable_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub bus: BusSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Durable tier url, e.g. `sqlite://veille.db`.
    pub durable_url: String,
    /// Fast-tier capacity, in entries.
    pub cache_size: usize,
    /// Durable-tier connection pool size.
    pub max_connections: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            durable_url: DEFAULT_DURABLE_URL.to_string(),
            cache_size: DEFAULT_CACHE_SIZE,
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Bus server listen address; `None` runs subscriber-only.
    pub listen: Option<String>,
    /// Server pool the subscriber picks from.
    pub pool: Vec<String>,
    /// Writer token; when set, the server rejects messages from connections
    /// that did not present it.
    pub token: Option<String>,
    /// Backlog window, in messages.
    pub backlog_limit: usize,
    /// Broadcast channel capacity before slow consumers lag.
    pub channel_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            listen: Some(DEFAULT_BUS_LISTEN.to_string()),
            pool: vec![format!("ws://{DEFAULT_BUS_LISTEN}/bus")],
            token: None,
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default tracing directive, overridable via `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

impl Settings {
    /// Load settings from an explicit file, or `veille.toml` in the working
    /// directory when present, layered under `VEILLE_*` environment
    /// variables (`VEILLE_BUS__TOKEN=...`).
    pub fn load(config_file: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        builder = match config_file {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false)),
        };
        builder = builder.add_source(Environment::with_prefix("VEILLE").separator("__"));
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn apply_serve_overrides(&mut self, args: &ServeArgs) {
        if let Some(listen) = &args.listen {
            self.bus.listen = Some(listen.clone());
        }
        if let Some(url) = &args.durable_url {
            self.store.durable_url = url.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.store.durable_url, DEFAULT_DURABLE_URL);
        assert_eq!(settings.store.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(settings.bus.listen.as_deref(), Some(DEFAULT_BUS_LISTEN));
        assert_eq!(settings.bus.pool.len(), 1);
        assert_eq!(settings.logging.format, LogFormat::Compact);
    }

    #[test]
    fn serve_overrides_win() {
        let mut settings = Settings::default();
        settings.apply_serve_overrides(&ServeArgs {
            listen: Some("0.0.0.0:9000".to_string()),
            durable_url: Some("sqlite::memory:".to_string()),
        });
        assert_eq!(settings.bus.listen.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(settings.store.durable_url, "sqlite::memory:");
    }

    #[test]
    fn log_format_parses_lowercase() {
        let format: LogFormat = serde_json::from_str("\"json\"").expect("parse");
        assert_eq!(format, LogFormat::Json);
    }
}
