use config::builder::{ConfigBuilder, DefaultState};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;

use crate::models::{EngineSpec, FieldMapping, IdentityKind};
use crate::validation::MAX_QUERY_LENGTH;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
    pub access_levels: Vec<String>,
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Id other relays know this relay by
    pub id: String,
    /// Public base URL, also stamped on every row as provenance
    pub uri: String,
    /// Header carrying the client certificate fingerprint set by the TLS terminator
    pub identity_header: String,
    /// Fingerprint of this relay's own client certificate
    pub fingerprint: String,
    pub hop_limit: u8,
    pub endpoint_timeout_secs: u64,
    pub max_result_rows: usize,
    pub strict_substitutions: bool,
    pub max_query_length: usize,
    pub job_ttl_secs: u64,
    pub ticket_ttl_secs: u64,
    pub max_tickets: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub fingerprint: String,
    pub name: String,
    pub access_level: String,
    #[serde(default = "default_identity_kind")]
    pub kind: IdentityKind,
}

fn default_identity_kind() -> IdentityKind {
    IdentityKind::User
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrantConfig {
    pub level: String,
    #[serde(default)]
    pub allowed_rows: Option<String>,
    #[serde(default)]
    pub allowed_columns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub capabilities: Vec<String>,
    pub relation: String,
    pub engine: EngineSpec,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldMapping>,
    #[serde(default)]
    pub grants: Vec<GrantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub endpoint: String,
    pub fingerprint: String,
    /// Highest level this peer may assert when forwarding to us
    pub access_level: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub grants: Vec<GrantConfig>,
    /// Relays this peer forwards to, for topology diagnostics
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

impl Config {
    fn defaults() -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("relay.id", "relay")?
            .set_default("relay.uri", "http://localhost:3000")?
            .set_default("relay.identity_header", "x-client-cert-fingerprint")?
            .set_default("relay.fingerprint", "")?
            .set_default("relay.hop_limit", 8)?
            .set_default("relay.endpoint_timeout_secs", 60)?
            .set_default("relay.max_result_rows", 1_000_000)?
            .set_default("relay.strict_substitutions", false)?
            .set_default("relay.max_query_length", MAX_QUERY_LENGTH as u64)?
            .set_default("relay.job_ttl_secs", 3600)?
            .set_default("relay.ticket_ttl_secs", 600)?
            .set_default("relay.max_tickets", 10_000)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?
            .set_default("access_levels", vec!["default_access", "all_access"])
    }

    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let config_path = env::var("RELAY_CONFIG").unwrap_or_else(|_| "relay.toml".to_string());
        let mut builder =
            Self::defaults()?.add_source(config::File::with_name(&config_path).required(false));

        // Load from environment variables
        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port.parse::<u16>().unwrap_or(3000))?;
        }

        if let Ok(relay_id) = env::var("RELAY_ID") {
            builder = builder.set_override("relay.id", relay_id)?;
        }

        if let Ok(relay_uri) = env::var("RELAY_URI") {
            builder = builder.set_override("relay.uri", relay_uri)?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Parse a configuration from TOML text on top of the usual defaults
    pub fn from_toml(text: &str) -> Result<Self, config::ConfigError> {
        Self::defaults()?
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
