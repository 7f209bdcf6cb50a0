//! Chain identity verification
//!
//! Signature and validator-status checks against the subnet metagraph. A
//! background syncer keeps a local snapshot fresh so the common verification
//! path never touches the network; on a cache miss the oracle falls back to
//! fetching from the authoritative endpoint under an explicit timeout.
//! Timeouts and fetch errors fail closed: an unverifiable caller is rejected.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::auth;
use crate::config::ChainConfig;

/// Verification could not be performed at all; callers reject the request
/// (fail closed) with a reason distinct from an invalid credential.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("chain verification timed out")]
    Timeout,
    #[error("chain oracle unreachable: {0}")]
    Unreachable(String),
}

/// Identity verification surface consumed by the gateway
#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// Check that `signature_hex` is a valid sr25519 signature over
    /// `commitment` by a hotkey registered on the subnet.
    async fn verify_signature(
        &self,
        commitment: &str,
        signature_hex: &str,
        hotkey: &str,
    ) -> Result<bool, OracleError>;

    /// Check that the hotkey holds a validator permit with sufficient stake
    async fn verify_validator(&self, hotkey: &str) -> Result<bool, OracleError>;
}

/// One neuron's registration entry
#[derive(Debug, Clone, Deserialize)]
pub struct NeuronInfo {
    pub uid: u16,
    pub hotkey: String,
    #[serde(default)]
    pub validator_permit: bool,
    #[serde(default)]
    pub alpha_stake: u64,
}

/// Point-in-time copy of the subnet metagraph
#[derive(Debug, Clone)]
pub struct MetagraphSnapshot {
    neurons: HashMap<String, NeuronInfo>,
    pub synced_at: DateTime<Utc>,
}

impl MetagraphSnapshot {
    pub fn new(neurons: Vec<NeuronInfo>, synced_at: DateTime<Utc>) -> Self {
        let neurons = neurons
            .into_iter()
            .map(|n| (n.hotkey.clone(), n))
            .collect();
        Self { neurons, synced_at }
    }

    pub fn is_registered(&self, hotkey: &str) -> bool {
        self.neurons.contains_key(hotkey)
    }

    pub fn neuron(&self, hotkey: &str) -> Option<&NeuronInfo> {
        self.neurons.get(hotkey)
    }

    pub fn hotkey_count(&self) -> usize {
        self.neurons.len()
    }
}

/// Source of fresh metagraph snapshots
#[async_trait]
pub trait MetagraphProvider: Send + Sync {
    async fn fetch(&self) -> Result<MetagraphSnapshot>;
}

#[derive(Debug, Deserialize)]
struct MetagraphResponse {
    neurons: Vec<NeuronInfo>,
}

/// Fetches snapshots from a metagraph HTTP endpoint
pub struct HttpMetagraphProvider {
    client: reqwest::Client,
    url: String,
    netuid: u16,
}

impl HttpMetagraphProvider {
    pub fn new(url: impl Into<String>, netuid: u16, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build metagraph HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            netuid,
        })
    }
}

#[async_trait]
impl MetagraphProvider for HttpMetagraphProvider {
    async fn fetch(&self) -> Result<MetagraphSnapshot> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("netuid", self.netuid)])
            .send()
            .await
            .context("Metagraph request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Metagraph endpoint returned {}", response.status());
        }

        let body: MetagraphResponse = response
            .json()
            .await
            .context("Failed to parse metagraph response")?;
        Ok(MetagraphSnapshot::new(body.neurons, Utc::now()))
    }
}

/// Fixed snapshot provider for tests and offline operation
pub struct StaticMetagraphProvider {
    neurons: Vec<NeuronInfo>,
}

impl StaticMetagraphProvider {
    pub fn new(neurons: Vec<NeuronInfo>) -> Self {
        Self { neurons }
    }
}

#[async_trait]
impl MetagraphProvider for StaticMetagraphProvider {
    async fn fetch(&self) -> Result<MetagraphSnapshot> {
        Ok(MetagraphSnapshot::new(self.neurons.clone(), Utc::now()))
    }
}

/// Periodically refreshed local metagraph copy
///
/// Each instance owns its snapshot; nothing here is process-global, so tests
/// construct independent caches without leakage.
pub struct MetagraphCache {
    provider: Arc<dyn MetagraphProvider>,
    snapshot: RwLock<Option<MetagraphSnapshot>>,
    sync_interval: std::time::Duration,
    /// A snapshot older than this is treated as a cache miss
    stale_after: Duration,
}

impl MetagraphCache {
    pub fn new(provider: Arc<dyn MetagraphProvider>, sync_interval: std::time::Duration) -> Self {
        let stale_after = Duration::seconds(sync_interval.as_secs() as i64 * 4);
        Self {
            provider,
            snapshot: RwLock::new(None),
            sync_interval,
            stale_after,
        }
    }

    /// Fetch once before serving traffic; an initial failure is logged and
    /// leaves the cache empty (the oracle then uses the direct path).
    pub async fn initial_sync(&self) {
        match self.provider.fetch().await {
            Ok(snapshot) => {
                info!(
                    "Initial metagraph sync complete: {} hotkeys",
                    snapshot.hotkey_count()
                );
                *self.snapshot.write() = Some(snapshot);
            }
            Err(e) => {
                error!("Initial metagraph sync failed: {:#}", e);
            }
        }
    }

    /// Fresh snapshot from the cache, None when empty or stale
    pub fn get(&self, now: DateTime<Utc>) -> Option<MetagraphSnapshot> {
        let guard = self.snapshot.read();
        let snapshot = guard.as_ref()?;
        if now - snapshot.synced_at > self.stale_after {
            return None;
        }
        Some(snapshot.clone())
    }

    async fn refresh(&self) -> Result<()> {
        let snapshot = self.provider.fetch().await?;
        *self.snapshot.write() = Some(snapshot);
        Ok(())
    }

    /// Background refresh loop
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting metagraph syncer (every {}s)",
            self.sync_interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.sync_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("Metagraph sync failed, keeping previous snapshot: {:#}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Metagraph syncer shutting down");
                    break;
                }
            }
        }
    }
}

/// Oracle backed by the cached snapshot with a direct slow path
pub struct CachedChainOracle {
    cache: Arc<MetagraphCache>,
    min_validator_stake: u64,
    signature_timeout: std::time::Duration,
    validator_timeout: std::time::Duration,
}

impl CachedChainOracle {
    pub fn new(cache: Arc<MetagraphCache>, config: &ChainConfig) -> Self {
        Self {
            cache,
            min_validator_stake: config.min_validator_stake,
            signature_timeout: std::time::Duration::from_secs(config.signature_timeout_secs),
            validator_timeout: std::time::Duration::from_secs(config.validator_timeout_secs),
        }
    }

    /// Cached snapshot, or an authoritative fetch bounded by `timeout`
    async fn snapshot(
        &self,
        timeout: std::time::Duration,
    ) -> Result<MetagraphSnapshot, OracleError> {
        if let Some(snapshot) = self.cache.get(Utc::now()) {
            return Ok(snapshot);
        }

        warn!("Metagraph cache miss, falling back to direct fetch");
        match tokio::time::timeout(timeout, self.cache.provider.fetch()).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => {
                error!("Direct metagraph fetch failed: {:#}", e);
                Err(OracleError::Unreachable(e.to_string()))
            }
            Err(_) => {
                error!("Direct metagraph fetch timed out after {:?}", timeout);
                Err(OracleError::Timeout)
            }
        }
    }
}

#[async_trait]
impl ChainOracle for CachedChainOracle {
    async fn verify_signature(
        &self,
        commitment: &str,
        signature_hex: &str,
        hotkey: &str,
    ) -> Result<bool, OracleError> {
        let snapshot = self.snapshot(self.signature_timeout).await?;
        if !snapshot.is_registered(hotkey) {
            warn!("Hotkey {} is not registered in the metagraph", hotkey);
            return Ok(false);
        }
        // The cryptographic check itself is local and fast
        Ok(auth::verify_signature(hotkey, commitment, signature_hex))
    }

    async fn verify_validator(&self, hotkey: &str) -> Result<bool, OracleError> {
        let snapshot = self.snapshot(self.validator_timeout).await?;
        Ok(match snapshot.neuron(hotkey) {
            Some(neuron) => neuron.validator_permit && neuron.alpha_stake > self.min_validator_stake,
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_core::crypto::Ss58Codec;
    use sp_core::Pair;

    fn neuron(hotkey: &str, permit: bool, stake: u64) -> NeuronInfo {
        NeuronInfo {
            uid: 0,
            hotkey: hotkey.to_string(),
            validator_permit: permit,
            alpha_stake: stake,
        }
    }

    fn oracle_with(neurons: Vec<NeuronInfo>) -> CachedChainOracle {
        let provider = Arc::new(StaticMetagraphProvider::new(neurons));
        let cache = Arc::new(MetagraphCache::new(
            provider,
            std::time::Duration::from_secs(300),
        ));
        let config = crate::config::Config::default().chain;
        CachedChainOracle::new(cache, &config)
    }

    #[tokio::test]
    async fn test_signature_requires_registration() {
        let (pair, _) = sp_core::sr25519::Pair::generate();
        let hotkey = pair.public().to_ss58check();
        let commitment = "zipcode:assignments:test:1700000000";
        let signature = hex::encode(pair.sign(commitment.as_bytes()));

        // Registered hotkey with a valid signature passes
        let oracle = oracle_with(vec![neuron(&hotkey, false, 0)]);
        assert!(oracle
            .verify_signature(commitment, &signature, &hotkey)
            .await
            .unwrap());
        // Wrong commitment fails even for a registered hotkey
        assert!(!oracle
            .verify_signature("other", &signature, &hotkey)
            .await
            .unwrap());

        // Unregistered hotkey fails regardless of signature validity
        let empty_oracle = oracle_with(vec![]);
        assert!(!empty_oracle
            .verify_signature(commitment, &signature, &hotkey)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_validator_requires_permit_and_stake() {
        let oracle = oracle_with(vec![
            neuron("validator", true, 50_000),
            neuron("low-stake", true, 10_000),
            neuron("no-permit", false, 50_000),
        ]);

        assert!(oracle.verify_validator("validator").await.unwrap());
        assert!(!oracle.verify_validator("low-stake").await.unwrap());
        assert!(!oracle.verify_validator("no-permit").await.unwrap());
        assert!(!oracle.verify_validator("unknown").await.unwrap());
    }

    struct FailingProvider;

    #[async_trait]
    impl MetagraphProvider for FailingProvider {
        async fn fetch(&self) -> Result<MetagraphSnapshot> {
            anyhow::bail!("endpoint unreachable")
        }
    }

    #[tokio::test]
    async fn test_fail_closed_when_unreachable() {
        let cache = Arc::new(MetagraphCache::new(
            Arc::new(FailingProvider),
            std::time::Duration::from_secs(300),
        ));
        let config = crate::config::Config::default().chain;
        let oracle = CachedChainOracle::new(cache, &config);

        assert!(matches!(
            oracle.verify_validator("anyone").await,
            Err(OracleError::Unreachable(_))
        ));
        assert!(oracle.verify_signature("c", "00", "anyone").await.is_err());
    }

    #[test]
    fn test_cache_staleness() {
        let provider = Arc::new(StaticMetagraphProvider::new(vec![neuron("hk", false, 0)]));
        let cache = MetagraphCache::new(provider, std::time::Duration::from_secs(300));

        tokio_test::block_on(cache.initial_sync());
        let now = Utc::now();
        assert!(cache.get(now).is_some());
        // Past four sync intervals the snapshot no longer counts
        assert!(cache.get(now + Duration::seconds(1300)).is_none());
    }
}
