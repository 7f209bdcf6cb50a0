//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding settings
//! - Chain verification parameters (netuid, stake threshold, timeouts)
//! - Zipcode selection algorithm parameters
//! - Epoch timing and retention
//! - Rate limits and S3 credential settings
//!
//! Secrets (the selection secret key and AWS credentials) are read from the
//! environment only: `ZIPCODE_SECRET_KEY`, `AWS_ACCESS_KEY_ID`,
//! `AWS_SECRET_ACCESS_KEY`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub selection: SelectionConfig,
    pub epochs: EpochConfig,
    pub limits: LimitsConfig,
    pub s3: S3Config,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "zipcode_gateway.db".to_string(),
        }
    }
}

/// Chain verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub network: String,
    pub netuid: u16,
    /// Metagraph snapshot endpoint polled by the background syncer
    pub metagraph_url: String,
    pub sync_interval_secs: u64,
    /// Minimum alpha stake for validator status
    pub min_validator_stake: u64,
    pub signature_timeout_secs: u64,
    pub validator_timeout_secs: u64,
}

/// Zipcode selection algorithm parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub target_listings: u32,
    pub tolerance_percent: u32,
    pub min_zipcode_listings: u32,
    pub max_zipcode_listings: u32,
    pub cooldown_hours: i64,
    pub premium_weight: f64,
    pub standard_weight: f64,
    pub emerging_weight: f64,
    pub honeypot_probability: f64,
    /// Units below this listing count qualify as honeypot candidates
    pub honeypot_threshold: u32,
    /// Comma-separated `STATE:priority` pairs, lower priority = higher weight
    pub state_priorities: String,
}

impl SelectionConfig {
    /// Parse the `state_priorities` string into a lookup map
    pub fn parse_state_priorities(&self) -> HashMap<String, u32> {
        let mut priorities = HashMap::new();
        for item in self.state_priorities.split(',') {
            if let Some((state, priority)) = item.trim().split_once(':') {
                if let Ok(p) = priority.trim().parse::<u32>() {
                    priorities.insert(state.trim().to_string(), p);
                }
            }
        }
        priorities
    }
}

/// Epoch timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochConfig {
    pub duration_hours: i64,
    pub retention_days: i64,
    /// Pre-generate the next epoch this many seconds before its boundary
    pub prepare_lead_secs: i64,
    pub tick_secs: u64,
    /// UTC hour at which the daily archive sweep runs
    pub archive_hour: u32,
}

/// Rate limit configuration (two-tier: global ceiling + per-caller limits)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub daily_per_miner: u64,
    pub daily_per_validator: u64,
    pub total_daily: u64,
    pub assignment_per_minute: u64,
    pub historical_per_hour: u64,
}

/// S3 credential minting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub upload_expiry_hours: u64,
    pub read_expiry_hours: u64,
    pub list_expiry_hours: u64,
}

impl Config {
    /// Load from config.toml or use defaults
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            // Use embedded default config
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    /// Selection secret key from the environment
    ///
    /// Seeds and nonces derive from this value; epoch contents are
    /// predictable to anyone who holds it.
    pub fn secret_key(&self) -> String {
        std::env::var("ZIPCODE_SECRET_KEY")
            .unwrap_or_else(|_| "default-secret-change-in-production".to_string())
    }

    /// AWS credentials from the environment, None when unset
    pub fn aws_credentials(&self) -> Option<(String, String)> {
        let access = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        if access.is_empty() || secret.is_empty() {
            return None;
        }
        Some((access, secret))
    }
}

impl Default for Config {
    fn default() -> Self {
        // The embedded default config is validated at compile time,
        // so this should never fail.
        toml::from_str(DEFAULT_CONFIG).expect("embedded default config must parse")
    }
}
