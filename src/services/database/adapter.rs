// Query runner trait for local sources
use crate::api::middleware::RelayError;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

/// One result row as produced by an engine, before provenance is attached
pub type EngineRow = Map<String, Value>;

/// Rows as they come off an engine. Dropping the stream stops the query.
pub type EngineRowStream = BoxStream<'static, Result<EngineRow, RelayError>>;

/// Executes an expanded query against the engine holding one local source.
///
/// Runners only ever see fully expanded SQL: placeholders are already replaced and
/// access restrictions already applied.
#[async_trait::async_trait]
pub trait QueryRunner: Send + Sync {
    /// Start the query and return its rows as a stream
    async fn execute_stream(&self, sql: &str) -> Result<EngineRowStream, RelayError>;

    /// Engine kind, for logging
    fn engine_kind(&self) -> &str;
}
