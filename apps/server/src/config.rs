//! Server configuration.
//!
//! Layered with figment, later layers winning:
//! built-in defaults, the TOML file, `SPIRE_*` environment variables
//! (nested keys split on `__`, e.g. `SPIRE_ENGINE__WORKERS=8`), CLI flags.

use std::net::SocketAddr;
use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use spire_engine::EngineConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// `[logging]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when neither `SPIRE_LOG` nor `RUST_LOG` is set.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,tower_http=info".to_owned(),
            format: LogFormat::Compact,
        }
    }
}

/// Everything the server process reads at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub bind: SocketAddr,
    /// `memory` or a sqlx SQLite URL (`sqlite://spire.db`).
    pub database_url: String,
    /// Register the bundled `refund` workflow and its `issue_refund` action.
    pub demo_workflows: bool,
    /// Logging.
    pub logging: LoggingConfig,
    /// Dispatcher, orchestrator and sweeper tuning.
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            database_url: "memory".to_owned(),
            demo_workflows: true,
            logging: LoggingConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    /// `--bind`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<SocketAddr>,
    /// `--database-url`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// Process-local, lost on exit.
    Memory,
    /// SQLite at the given URL.
    Sqlite(String),
}

impl ServerConfig {
    /// The provider stack, without extracting.
    pub fn figment(file: Option<&Path>, overrides: &Overrides) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(file) = file {
            figment = figment.merge(Toml::file(file));
        }
        figment
            // SPIRE_LOG is the log filter, not the `logging` table.
            .merge(Env::prefixed("SPIRE_").ignore(&["log"]).split("__"))
            .merge(Serialized::defaults(overrides))
    }

    /// Load and validate.
    pub fn load(file: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Self> {
        let config: Self = Self::figment(file, overrides).extract()?;
        config.engine.validate()?;
        config.store_kind()?;
        Ok(config)
    }

    /// Parse `database_url`.
    pub fn store_kind(&self) -> anyhow::Result<StoreKind> {
        let url = self.database_url.trim();
        if url == "memory" {
            Ok(StoreKind::Memory)
        } else if url.starts_with("sqlite:") {
            Ok(StoreKind::Sqlite(url.to_owned()))
        } else {
            anyhow::bail!("unsupported database_url {url:?}: expected `memory` or `sqlite:...`")
        }
    }
}
