//! Configuration for the token ledger.
//!
//! Loaded from TOML; every section falls back to defaults so an empty file
//! is a valid configuration. The webhook signing secret can be supplied via
//! `TOKEN_LEDGER_WEBHOOK_SECRET` instead of living in the file.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides `[webhook] signing_secret`.
pub const WEBHOOK_SECRET_ENV: &str = "TOKEN_LEDGER_WEBHOOK_SECRET";

/// Default reservation lifetime: 15 minutes.
const DEFAULT_RESERVATION_TTL_SECS: u64 = 15 * 60;

/// Default optimistic-lock attempts (one retry).
const DEFAULT_MAX_LOCK_ATTEMPTS: u32 = 2;

/// Default sweeper interval: 1 minute.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Default number of expired reservations handled per sweeper pass.
const DEFAULT_SWEEP_BATCH_LIMIT: u32 = 500;

/// Default signature timestamp tolerance: 5 minutes.
const DEFAULT_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// SQLite database holding balances, reservations, transactions and payments.
    pub database_path: PathBuf,
    pub ledger: LedgerConfig,
    pub sweeper: SweeperConfig,
    pub webhook: WebhookConfig,
    /// Purchasable token packs, used to validate checkout sessions.
    pub packs: Vec<TokenPack>,
    /// Subscription plans credited on each paid invoice.
    pub subscription_plans: Vec<SubscriptionPlan>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("token-ledger.db"),
            ledger: LedgerConfig::default(),
            sweeper: SweeperConfig::default(),
            webhook: WebhookConfig::default(),
            packs: Vec::new(),
            subscription_plans: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::from_toml(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Override values from the process environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var(WEBHOOK_SECRET_ENV) {
            if !secret.trim().is_empty() {
                self.webhook.signing_secret = Some(secret);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for pack in &self.packs {
            if pack.tokens <= 0 {
                anyhow::bail!("Token pack {} must grant a positive token amount", pack.id);
            }
            if pack.amount_cents < 0 {
                anyhow::bail!("Token pack {} has a negative price", pack.id);
            }
        }
        let mut ids: Vec<&str> = self.packs.iter().map(|p| p.id.as_str()).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            anyhow::bail!("Token pack ids must be unique");
        }
        for plan in &self.subscription_plans {
            if plan.tokens_per_period <= 0 {
                anyhow::bail!(
                    "Subscription plan {} must grant a positive token amount",
                    plan.price_id
                );
            }
        }
        Ok(())
    }

    /// Look up a token pack by its identifier.
    pub fn find_pack(&self, pack_id: &str) -> Option<&TokenPack> {
        self.packs.iter().find(|p| p.id == pack_id)
    }

    /// Look up a token pack by the provider price identifier.
    pub fn find_pack_by_price(&self, price_id: &str) -> Option<&TokenPack> {
        self.packs.iter().find(|p| p.price_id == price_id)
    }

    /// JSON schema of the configuration file, pretty-printed.
    pub fn schema_json() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long a reservation may stay ACTIVE before the sweeper reclaims it.
    pub reservation_ttl_secs: u64,
    /// Attempts for a balance read-modify-write before a version conflict is fatal.
    pub max_lock_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: DEFAULT_RESERVATION_TTL_SECS,
            max_lock_attempts: DEFAULT_MAX_LOCK_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Maximum expired reservations handled per pass.
    pub batch_limit: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            batch_limit: DEFAULT_SWEEP_BATCH_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared secret used to verify provider signatures. Unset rejects every delivery.
    pub signing_secret: Option<String>,
    /// Maximum age of a signed timestamp, in seconds. 0 disables the check.
    pub tolerance_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }
}

/// A purchasable bundle of tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TokenPack {
    /// Pack identifier, carried in checkout session metadata as `packId`.
    pub id: String,
    /// Provider price identifier.
    pub price_id: String,
    /// Price in the smallest currency unit.
    pub amount_cents: i64,
    /// Tokens granted upon purchase.
    pub tokens: i64,
}

/// Recurring plan that grants tokens on every paid invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SubscriptionPlan {
    pub price_id: String,
    pub tokens_per_period: i64,
}
