// DataFusion QueryRunner
//
// Runs expanded queries against file and in-memory sources. The source's rows are
// registered once, under the source's relation name, in a session owned by the runner.

use datafusion::execution::context::SQLOptions;
use datafusion::prelude::{CsvReadOptions, NdJsonReadOptions, ParquetReadOptions, SessionContext};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::api::middleware::RelayError;
use crate::models::EngineSpec;
use crate::services::database::adapter::{EngineRow, EngineRowStream, QueryRunner};

use super::converter::DataFusionResultConverter;
use super::session::DataFusionSessionManager;

pub struct DataFusionRunner {
    relation: String,
    engine: EngineSpec,
    sessions: Arc<DataFusionSessionManager>,
    context: OnceCell<SessionContext>,
}

impl DataFusionRunner {
    /// # Arguments
    /// * `relation` - Table name the source's rows are registered under
    /// * `engine` - File or in-memory engine holding the rows
    /// * `sessions` - Shared session factory
    pub fn new(
        relation: &str,
        engine: EngineSpec,
        sessions: Arc<DataFusionSessionManager>,
    ) -> Result<Self, RelayError> {
        if matches!(engine, EngineSpec::Postgres { .. }) {
            return Err(RelayError::Config(
                "postgres sources are not run through DataFusion".to_string(),
            ));
        }
        if relation.is_empty()
            || !relation.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(RelayError::Config(format!(
                "{} sources need a plain table name as relation, found '{}'",
                engine.kind(),
                relation
            )));
        }

        Ok(Self {
            relation: relation.to_string(),
            engine,
            sessions,
            context: OnceCell::new(),
        })
    }

    async fn context(&self) -> Result<&SessionContext, RelayError> {
        self.context.get_or_try_init(|| self.register()).await
    }

    async fn register(&self) -> Result<SessionContext, RelayError> {
        let ctx = self.sessions.create_session()?;
        let table = self.relation.as_str();

        match &self.engine {
            EngineSpec::Csv { path, has_header } => {
                let options = CsvReadOptions::new()
                    .has_header(*has_header)
                    .file_extension(file_extension(path));
                ctx.register_csv(table, path, options).await?
            }
            EngineSpec::Parquet { path } => {
                let options = ParquetReadOptions {
                    file_extension: file_extension(path),
                    ..Default::default()
                };
                ctx.register_parquet(table, path, options).await?
            }
            EngineSpec::Json { path } => {
                let options = NdJsonReadOptions::default().file_extension(file_extension(path));
                ctx.register_json(table, path, options).await?
            }
            EngineSpec::Memory { rows } => {
                let batch = DataFusionResultConverter::rows_to_batch(rows)?;
                ctx.register_batch(table, batch)?;
            }
            EngineSpec::Postgres { .. } => {
                return Err(RelayError::Config(
                    "postgres sources are not run through DataFusion".to_string(),
                ))
            }
        }

        tracing::debug!("Registered {} source as table {}", self.engine.kind(), table);
        Ok(ctx)
    }
}

/// Extension filter for a single-file source, so files named `*.jsonl` or `*.tbl` still register
fn file_extension(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rfind('.').map(|idx| &name[idx..]).unwrap_or("")
}

#[async_trait::async_trait]
impl QueryRunner for DataFusionRunner {
    async fn execute_stream(&self, sql: &str) -> Result<EngineRowStream, RelayError> {
        let ctx = self.context().await?;

        // Queries only ever read
        let options = SQLOptions::new()
            .with_allow_ddl(false)
            .with_allow_dml(false)
            .with_allow_statements(false);
        let df = ctx.sql_with_options(sql, options).await?;
        let batches = df.execute_stream().await?;

        let rows = batches
            .map_err(RelayError::from)
            .and_then(|batch| async move {
                let rows = DataFusionResultConverter::batch_to_rows(&batch)?;
                Ok::<_, RelayError>(futures::stream::iter(rows.into_iter().map(Ok::<EngineRow, RelayError>)))
            })
            .try_flatten();

        Ok(rows.boxed())
    }

    fn engine_kind(&self) -> &str {
        self.engine.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sessions() -> Arc<DataFusionSessionManager> {
        Arc::new(DataFusionSessionManager::default_config())
    }

    async fn collect(runner: &DataFusionRunner, sql: &str) -> Vec<EngineRow> {
        runner
            .execute_stream(sql)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_memory_source() {
        let engine = EngineSpec::Memory {
            rows: vec![
                json!({"returnflag": "N", "quantity": 17}),
                json!({"returnflag": "R", "quantity": 36}),
                json!({"returnflag": "N", "quantity": 8}),
            ],
        };
        let runner = DataFusionRunner::new("lineitem", engine, sessions()).unwrap();

        let rows = collect(
            &runner,
            "SELECT returnflag, SUM(quantity) AS total FROM lineitem GROUP BY returnflag ORDER BY returnflag",
        )
        .await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["returnflag"], json!("N"));
        assert_eq!(rows[0]["total"], json!(25));

        // The table is registered once and reused
        let again = collect(&runner, "SELECT COUNT(*) AS n FROM lineitem").await;
        assert_eq!(again[0]["n"], json!(3));
    }

    #[tokio::test]
    async fn test_csv_source() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "returnflag,quantity").unwrap();
        writeln!(file, "N,17").unwrap();
        writeln!(file, "A,4").unwrap();
        file.flush().unwrap();

        let engine = EngineSpec::Csv {
            path: file.path().to_string_lossy().to_string(),
            has_header: true,
        };
        let runner = DataFusionRunner::new("lineitem", engine, sessions()).unwrap();
        let rows = collect(&runner, "SELECT quantity FROM lineitem WHERE returnflag = 'A'").await;
        assert_eq!(rows, vec![json!({"quantity": 4}).as_object().unwrap().clone()]);
    }

    #[tokio::test]
    async fn test_writes_are_rejected() {
        let engine = EngineSpec::Memory { rows: vec![json!({"a": 1})] };
        let runner = DataFusionRunner::new("t", engine, sessions()).unwrap();
        let err = runner.execute_stream("CREATE TABLE u AS SELECT 1").await.err().unwrap();
        assert!(matches!(err, RelayError::Engine(_)));
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("/data/lineitem.csv"), ".csv");
        assert_eq!(file_extension("/data.d/lineitem.jsonl"), ".jsonl");
        assert_eq!(file_extension("/data/lineitem"), "");
    }

    #[test]
    fn test_relation_must_be_a_table_name() {
        let engine = EngineSpec::Memory { rows: vec![] };
        assert!(DataFusionRunner::new("(SELECT 1)", engine.clone(), sessions()).is_err());
        let postgres = EngineSpec::Postgres { url: "postgresql://localhost/db".to_string() };
        assert!(DataFusionRunner::new("lineitem", postgres, sessions()).is_err());
    }
}
