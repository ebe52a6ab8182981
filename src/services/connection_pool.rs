use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_postgres::NoTls;

use crate::api::middleware::RelayError;

/// Shared pools for Postgres-backed sources.
///
/// Sources pointing at the same database share one pool, keyed by connection URL.
pub struct ConnectionPoolManager {
    pools: Arc<RwLock<HashMap<String, Pool>>>,
    max_pool_size: usize,
}

impl ConnectionPoolManager {
    pub fn new() -> Self {
        Self::with_max_size(16)
    }

    pub fn with_max_size(max_pool_size: usize) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            max_pool_size,
        }
    }

    /// Get or create the pool for a connection URL. Safe to call concurrently.
    pub async fn get_or_create_pool(&self, connection_url: &str) -> Result<Pool, RelayError> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(connection_url) {
                return Ok(pool.clone());
            }
        }

        let mut pools = self.pools.write().await;

        // Another task may have created it while we waited for the write lock
        if let Some(pool) = pools.get(connection_url) {
            return Ok(pool.clone());
        }

        tracing::info!(
            "Creating connection pool for: {} (max_size: {})",
            Self::mask_credentials(connection_url),
            self.max_pool_size
        );

        let mut cfg = PoolConfig::new();
        cfg.url = Some(connection_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .map_err(|e| {
                tracing::error!("Failed to create connection pool: {}", e);
                RelayError::Config(format!("Failed to create connection pool: {}", e))
            })?;
        pool.resize(self.max_pool_size);

        pools.insert(connection_url.to_string(), pool.clone());
        Ok(pool)
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Mask credentials in a connection URL for logging
    pub fn mask_credentials(url: &str) -> String {
        match url::Url::parse(url) {
            Ok(parsed) => {
                let mut masked = parsed.clone();
                if parsed.password().is_some() {
                    let _ = masked.set_password(Some("***"));
                }
                masked.to_string()
            }
            Err(_) => "[invalid-url]".to_string(),
        }
    }
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self::new()
    }
}
