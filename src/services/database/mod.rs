// Execution engines behind local sources
pub mod adapter;
pub mod postgresql;

pub use adapter::{EngineRow, EngineRowStream, QueryRunner};
pub use postgresql::PostgresRunner;

use crate::api::middleware::RelayError;
use crate::models::{EngineSpec, LocalBinding};
use crate::services::datafusion::{DataFusionRunner, DataFusionSessionManager};
use crate::services::ConnectionPoolManager;
use std::sync::Arc;

/// Factory function to create the runner for a local source.
/// Postgres sources share pools through the pool manager, everything else runs in DataFusion.
pub async fn create_runner(
    binding: &LocalBinding,
    sessions: Arc<DataFusionSessionManager>,
    pool_manager: Arc<ConnectionPoolManager>,
) -> Result<Arc<dyn QueryRunner>, RelayError> {
    match &binding.engine {
        EngineSpec::Postgres { url } => {
            let pool = pool_manager.get_or_create_pool(url).await?;
            Ok(Arc::new(PostgresRunner::new(pool, url)?))
        }
        engine => Ok(Arc::new(DataFusionRunner::new(
            &binding.relation,
            engine.clone(),
            sessions,
        )?)),
    }
}
