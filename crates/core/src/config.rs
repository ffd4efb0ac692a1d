use anyhow::{anyhow, bail};
use clap::{Parser, ValueEnum};
use key_dispenser_redeem::{DELIVERY_PREFIX, MAX_TOKEN_TTL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Who counts as "one caller" for the one-key-per-caller rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Eligibility {
    /// No limit per caller
    #[serde(rename = "none")]
    #[value(name = "none")]
    Off,
    /// One key per client IP address
    Address,
    /// One key per external account id
    Account,
}

/// Main configuration structure that can be loaded from CLI, environment, or
/// a config file
///
/// Example configuration file content
/// # Key Dispenser Configuration
///
/// listen_on_port = 3000
/// internal_port = 3001
/// workspace = "./data"
///
/// # Files, relative to the workspace
/// keys_file = "keys.txt"
/// ledger_file = "issued.json"
/// payload_file = "payload.txt"
///
/// # Routes
/// entry_path = "/example"
/// payload_path = "/script"
///
/// # Timing
/// token_ttl_secs = 300
/// sweep_interval_secs = 60
/// key_retention_secs = 600
///
/// # One key per caller: "none", "address" or "account"
/// eligibility = "address"
/// trust_forwarded_for = true
///
/// # Audit webhook (optional)
/// webhook_url = "https://example.com/webhook"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port the public API listens on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Port the internal stats API listens on
    #[arg(long, env = "INTERNAL_PORT", default_value_t = 3001)]
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Working directory holding the key file, ledger and payload
    #[arg(short = 'w', long, env = "WORKSPACE", default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Configuration file path (CLI and environment values take precedence)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Newline-delimited key list, rewritten after every draw
    #[arg(long, env = "KEYS_FILE", default_value = "keys.txt")]
    #[serde(default = "default_keys_file")]
    pub keys_file: String,

    /// JSON ledger of issued keys
    #[arg(long, env = "LEDGER_FILE", default_value = "issued.json")]
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,

    /// Protected payload served to key holders
    #[arg(long, env = "PAYLOAD_FILE", default_value = "payload.txt")]
    #[serde(default = "default_payload_file")]
    pub payload_file: String,

    /// Entry point that issues a key and redirects to its one-time link
    #[arg(short, long, env = "ENTRY_PATH", default_value = "/example")]
    #[serde(default = "default_entry_path")]
    pub entry_path: String,

    /// Route of the protected payload
    #[arg(long, env = "PAYLOAD_PATH", default_value = "/script")]
    #[serde(default = "default_payload_path")]
    pub payload_path: String,

    /// Lifetime of a one-time link, in seconds
    #[arg(short, long, env = "TOKEN_TTL_SECS", default_value_t = 300)]
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Interval of the stale-link sweep, in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long a key keeps unlocking the payload after its first fetch
    #[arg(long, env = "KEY_RETENTION_SECS", default_value_t = 600)]
    #[serde(default = "default_key_retention_secs")]
    pub key_retention_secs: u64,

    /// One-key-per-caller policy
    #[arg(long, env = "ELIGIBILITY", value_enum, default_value_t = Eligibility::Address)]
    #[serde(default = "default_eligibility")]
    pub eligibility: Eligibility,

    /// Take the client address from X-Forwarded-For (behind a reverse proxy)
    #[arg(long, env = "TRUST_FORWARDED_FOR")]
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Webhook notified of every issued key
    #[arg(long, env = "WEBHOOK_URL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            internal_port: default_internal_port(),
            workspace: default_workspace(),
            config: None,
            keys_file: default_keys_file(),
            ledger_file: default_ledger_file(),
            payload_file: default_payload_file(),
            entry_path: default_entry_path(),
            payload_path: default_payload_path(),
            token_ttl_secs: default_token_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            key_retention_secs: default_key_retention_secs(),
            eligibility: default_eligibility(),
            trust_forwarded_for: false,
            webhook_url: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and environment, optionally merging
    /// with a config file
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.internal_port == default_internal_port() {
            self.internal_port = file_config.internal_port;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.keys_file == default_keys_file() {
            self.keys_file = file_config.keys_file;
        }
        if self.ledger_file == default_ledger_file() {
            self.ledger_file = file_config.ledger_file;
        }
        if self.payload_file == default_payload_file() {
            self.payload_file = file_config.payload_file;
        }
        if self.entry_path == default_entry_path() {
            self.entry_path = file_config.entry_path;
        }
        if self.payload_path == default_payload_path() {
            self.payload_path = file_config.payload_path;
        }
        if self.token_ttl_secs == default_token_ttl_secs() {
            self.token_ttl_secs = file_config.token_ttl_secs;
        }
        if self.sweep_interval_secs == default_sweep_interval_secs() {
            self.sweep_interval_secs = file_config.sweep_interval_secs;
        }
        if self.key_retention_secs == default_key_retention_secs() {
            self.key_retention_secs = file_config.key_retention_secs;
        }
        if self.eligibility == default_eligibility() {
            self.eligibility = file_config.eligibility;
        }
        if !self.trust_forwarded_for {
            self.trust_forwarded_for = file_config.trust_forwarded_for;
        }

        // For Option fields, CLI takes precedence if Some
        if self.webhook_url.is_none() {
            self.webhook_url = file_config.webhook_url;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_route("entry_path", &self.entry_path)?;
        validate_route("payload_path", &self.payload_path)?;
        if self.entry_path == self.payload_path {
            bail!("entry_path and payload_path must differ");
        }

        if self.token_ttl_secs == 0 {
            bail!("token_ttl_secs must be greater than 0");
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be greater than 0");
        }
        let max_secs = MAX_TOKEN_TTL.as_secs();
        if self.token_ttl_secs > max_secs {
            bail!("token_ttl_secs must be at most {max_secs}");
        }
        if self.sweep_interval_secs > max_secs {
            bail!("sweep_interval_secs must be at most {max_secs}");
        }
        if self.listen_on_port != 0 && self.listen_on_port == self.internal_port {
            bail!("listen_on_port and internal_port must differ");
        }

        if let Some(webhook_url) = &self.webhook_url {
            if webhook_url.is_empty() {
                bail!("Webhook URL cannot be empty");
            }
            if !webhook_url.starts_with("http://") && !webhook_url.starts_with("https://") {
                bail!("Webhook URL must start with http:// or https://");
            }
        }

        Ok(())
    }

    pub fn workspace_path(&self) -> PathBuf {
        PathBuf::from(&self.workspace)
    }

    pub fn keys_path(&self) -> PathBuf {
        self.workspace_path().join(&self.keys_file)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.workspace_path().join(&self.ledger_file)
    }

    pub fn payload_file_path(&self) -> PathBuf {
        self.workspace_path().join(&self.payload_file)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn key_retention(&self) -> Duration {
        Duration::from_secs(self.key_retention_secs)
    }
}

/// Routes are literal paths: no captures, no wildcards, and nothing under the
/// delivery prefix.
fn validate_route(name: &str, path: &str) -> anyhow::Result<()> {
    if !path.starts_with('/') || path.len() < 2 {
        return Err(anyhow!("{name} must start with '/' and name a route"));
    }
    if path.contains(['{', '}', '*', '?', '#']) {
        return Err(anyhow!("{name} must be a literal path: {path}"));
    }
    if path == DELIVERY_PREFIX || path.starts_with(&format!("{DELIVERY_PREFIX}/")) {
        return Err(anyhow!("{name} cannot live under {DELIVERY_PREFIX}/"));
    }
    Ok(())
}

// Default value functions
fn default_port() -> u16 {
    3000
}

fn default_internal_port() -> u16 {
    3001
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_keys_file() -> String {
    "keys.txt".to_string()
}

fn default_ledger_file() -> String {
    "issued.json".to_string()
}

fn default_payload_file() -> String {
    "payload.txt".to_string()
}

fn default_entry_path() -> String {
    "/example".to_string()
}

fn default_payload_path() -> String {
    "/script".to_string()
}

fn default_token_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_key_retention_secs() -> u64 {
    600
}

fn default_eligibility() -> Eligibility {
    Eligibility::Address
}
