// DataFusion SessionManager
//
// Creates the SessionContext each file or in-memory source runs its queries in.

use anyhow::Result;
use datafusion::prelude::*;

/// Configuration for DataFusion sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Batch size for query execution
    pub batch_size: usize,
    /// Number of partitions for parallel execution
    pub target_partitions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            target_partitions: num_cpus::get(),
        }
    }
}

/// Manages DataFusion SessionContext lifecycle
///
/// # Example
/// ```rust,ignore
/// let manager = DataFusionSessionManager::new(SessionConfig::default());
/// let session = manager.create_session()?;
/// let df = session.sql("SELECT * FROM lineitem").await?;
/// ```
pub struct DataFusionSessionManager {
    config: SessionConfig,
}

impl DataFusionSessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn default_config() -> Self {
        Self::new(SessionConfig::default())
    }

    /// Create a new DataFusion SessionContext configured from this manager
    pub fn create_session(&self) -> Result<SessionContext> {
        let config = datafusion::execution::context::SessionConfig::new()
            .with_batch_size(self.config.batch_size)
            .with_target_partitions(self.config.target_partitions);

        Ok(SessionContext::new_with_config(config))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Default for DataFusionSessionManager {
    fn default() -> Self {
        Self::default_config()
    }
}
