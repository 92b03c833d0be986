//! RouterConfigSource: bootstrap from a local file, then periodically
//! re-fetch from an HTTP endpoint and reconcile.
//!
//! Reconciliation is skipped on an unchanged fetch (hash comparison) so a
//! steady-state control plane produces no churn in the live pool/consumer
//! set, matching the idempotence spec.md's `reconcile` requires.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rc_common::{RouterConfig, Warning, WarningCategory, WarningSeverity};
use reqwest::Client;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::router::Router;
use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct ConfigSourceSettings {
    pub config_path: Option<String>,
    pub config_url: Option<String>,
    pub sync_interval: Duration,
    pub max_fetch_attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub fail_on_initial_sync_error: bool,
}

impl Default for ConfigSourceSettings {
    fn default() -> Self {
        Self {
            config_path: None,
            config_url: None,
            sync_interval: Duration::from_secs(300),
            max_fetch_attempts: 12,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            fail_on_initial_sync_error: true,
        }
    }
}

impl ConfigSourceSettings {
    /// Build settings from the process environment: `ROUTER_CONFIG_PATH` for
    /// the bootstrap file, `ROUTER_CONFIG_URL` for periodic refresh.
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("ROUTER_CONFIG_PATH").ok(),
            config_url: std::env::var("ROUTER_CONFIG_URL").ok(),
            ..Default::default()
        }
    }
}

pub struct RouterConfigSource {
    settings: ConfigSourceSettings,
    http_client: Client,
    router: Arc<Router>,
    warnings: Arc<WarningService>,
    last_hash: Mutex<Option<u64>>,
}

impl RouterConfigSource {
    pub fn new(settings: ConfigSourceSettings, router: Arc<Router>, warnings: Arc<WarningService>) -> Self {
        let http_client = Client::builder().timeout(settings.request_timeout).build().expect("reqwest client");
        Self { settings, http_client, router, warnings, last_hash: Mutex::new(None) }
    }

    /// Load the bootstrap config from disk, if configured, and reconcile it
    /// immediately. Falls through silently if no file is configured.
    pub async fn bootstrap_from_file(&self) -> Result<Option<RouterConfig>, String> {
        let Some(path) = &self.settings.config_path else { return Ok(None) };

        let contents = tokio::fs::read_to_string(path).await.map_err(|e| format!("failed to read {path}: {e}"))?;
        let config: RouterConfig = serde_json::from_str(&contents).map_err(|e| format!("failed to parse {path}: {e}"))?;

        self.router.reconcile(&config).await;
        *self.last_hash.lock() = Some(hash_config(&config));
        info!(path = %path, pools = config.pools.len(), queues = config.queues.len(), "bootstrapped router config from file");
        Ok(Some(config))
    }

    async fn fetch_once(&self) -> Result<RouterConfig, String> {
        let url = self.settings.config_url.as_deref().ok_or_else(|| "no config url configured".to_string())?;
        let response = self.http_client.get(url).send().await.map_err(|e| format!("http request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("config endpoint returned {}", response.status()));
        }
        response.json::<RouterConfig>().await.map_err(|e| format!("failed to parse config response: {e}"))
    }

    async fn fetch_with_retry(&self) -> Result<RouterConfig, String> {
        let mut last_error = String::new();
        for attempt in 1..=self.settings.max_fetch_attempts {
            match self.fetch_once().await {
                Ok(config) => return Ok(config),
                Err(e) => {
                    last_error = e;
                    if attempt < self.settings.max_fetch_attempts {
                        warn!(attempt, error = %last_error, "config fetch failed, retrying");
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Perform the first HTTP fetch. On failure, respects
    /// `fail_on_initial_sync_error`.
    pub async fn initial_sync(&self) -> Result<Option<RouterConfig>, String> {
        if self.settings.config_url.is_none() {
            return Ok(None);
        }

        match self.fetch_with_retry().await {
            Ok(config) => {
                self.router.reconcile(&config).await;
                *self.last_hash.lock() = Some(hash_config(&config));
                info!(pools = config.pools.len(), queues = config.queues.len(), "initial config sync completed");
                Ok(Some(config))
            }
            Err(e) if self.settings.fail_on_initial_sync_error => Err(e),
            Err(e) => {
                warn!(error = %e, "initial config sync failed, continuing with bootstrap config");
                Ok(None)
            }
        }
    }

    async fn sync_once(&self) {
        let config = match self.fetch_with_retry().await {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "scheduled config sync failed, keeping existing configuration");
                self.warnings.add(Warning::new(WarningCategory::Configuration, WarningSeverity::Error, format!("config sync failed: {e}"), "RouterConfigSource"));
                return;
            }
        };

        let new_hash = hash_config(&config);
        let unchanged = *self.last_hash.lock() == Some(new_hash);
        if unchanged {
            debug!("configuration unchanged, skipping reconcile");
            return;
        }

        info!(pools = config.pools.len(), queues = config.queues.len(), "configuration changed, reconciling");
        self.router.reconcile(&config).await;
        *self.last_hash.lock() = Some(new_hash);
    }

    pub fn sync_interval(&self) -> Duration {
        self.settings.sync_interval
    }

    pub fn is_periodic_refresh_enabled(&self) -> bool {
        self.settings.config_url.is_some()
    }
}

pub fn spawn_sync_task(source: Arc<RouterConfigSource>, mut shutdown_rx: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !source.is_periodic_refresh_enabled() {
            return;
        }

        let mut ticker = tokio::time::interval(source.sync_interval());
        ticker.tick().await; // skip the immediate first tick; initial_sync already ran

        loop {
            tokio::select! {
                _ = ticker.tick() => source.sync_once().await,
                _ = shutdown_rx.recv() => {
                    info!("config sync task shutting down");
                    break;
                }
            }
        }
    })
}

fn hash_config(config: &RouterConfig) -> u64 {
    let mut hasher = DefaultHasher::new();
    for pool in &config.pools {
        pool.code.hash(&mut hasher);
        pool.concurrency.hash(&mut hasher);
        pool.rate_limit_per_minute.hash(&mut hasher);
        pool.max_queue_depth.hash(&mut hasher);
    }
    for queue in &config.queues {
        queue.queue_id.hash(&mut hasher);
        queue.url.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_common::PoolConfig;

    #[test]
    fn hash_changes_when_concurrency_changes() {
        let a = RouterConfig { pools: vec![PoolConfig { code: "P".into(), concurrency: 1, rate_limit_per_minute: None, max_queue_depth: 200 }], queues: vec![] };
        let b = RouterConfig { pools: vec![PoolConfig { code: "P".into(), concurrency: 2, rate_limit_per_minute: None, max_queue_depth: 200 }], queues: vec![] };
        assert_ne!(hash_config(&a), hash_config(&b));
    }

    #[test]
    fn hash_is_stable_for_identical_config() {
        let a = RouterConfig { pools: vec![PoolConfig { code: "P".into(), concurrency: 1, rate_limit_per_minute: Some(100), max_queue_depth: 200 }], queues: vec![] };
        let b = a.clone();
        assert_eq!(hash_config(&a), hash_config(&b));
    }
}
