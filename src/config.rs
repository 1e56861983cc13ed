use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Channel name whose messages are eligible for relay.
pub const WATCH_CHANNEL_NAME: &str = "receipts";

pub const ENV_BOT_TOKEN: &str = "DISCORD_BOT_TOKEN";
pub const ENV_ENDPOINT_URL: &str = "BASE44_FUNCTION_URL";
pub const ENV_PORT: &str = "PORT";
pub const ENV_TIMEOUT: &str = "RELAY_TIMEOUT_SECS";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub endpoint_url: String,
    /// No timeout when unset; a hung endpoint keeps the message pending.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

impl Config {
    /// Load from an optional TOML file, overlay the process environment, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())?
            .validated()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply environment-style overrides. `lookup` returns the raw value for a key.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_BOT_TOKEN) {
            self.discord.bot_token = token;
        }
        if let Some(url) = lookup(ENV_ENDPOINT_URL) {
            self.relay.endpoint_url = url;
        }
        if let Some(port) = lookup(ENV_PORT).filter(|p| !p.trim().is_empty()) {
            self.health.port = port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} must be a valid port number, got {port:?}"))?;
        }
        if let Some(secs) = lookup(ENV_TIMEOUT).filter(|s| !s.trim().is_empty()) {
            let secs = secs.trim().parse().with_context(|| {
                format!("{ENV_TIMEOUT} must be a whole number of seconds, got {secs:?}")
            })?;
            self.relay.timeout_secs = Some(secs);
        }
        Ok(self)
    }

    /// Fail fast on missing or blank required settings.
    pub fn validated(mut self) -> Result<Self> {
        self.discord.bot_token = self.discord.bot_token.trim().to_string();
        self.relay.endpoint_url = self.relay.endpoint_url.trim().to_string();

        if self.discord.bot_token.is_empty() {
            bail!("{ENV_BOT_TOKEN} is not set; the bot cannot log in to Discord without a token");
        }
        if self.relay.endpoint_url.is_empty() {
            bail!("{ENV_ENDPOINT_URL} is not set; receipts have nowhere to be relayed");
        }
        if self.relay.timeout_secs == Some(0) {
            bail!("relay timeout must be greater than zero seconds");
        }
        Ok(self)
    }
}
