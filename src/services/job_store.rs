// Job Store
//
// Submitted polling queries. Each job owns a background task draining the dispatch
// stream into a row buffer that GET /query/{id} reads from. Jobs expire after a TTL;
// expiry aborts whatever is still running.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::api::middleware::RelayError;
use crate::models::{Caller, DispatchPhase, QueryStatus, ResultRow};
use crate::services::dispatcher::DispatchProgress;
use crate::services::result_streamer::RowStream;

#[derive(Debug, Default)]
struct JobState {
    rows: Vec<ResultRow>,
    truncated: bool,
    finished: bool,
    failure: Option<String>,
}

struct Job {
    owners: Vec<String>,
    progress: DispatchProgress,
    state: Arc<Mutex<JobState>>,
    created_at: Instant,
    task: Option<AbortHandle>,
}

/// What a retrieve sees of a job
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub rows: Vec<ResultRow>,
    pub status: QueryStatus,
}

pub struct JobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    ttl: Duration,
    max_rows: usize,
}

fn lock_state(state: &Mutex<JobState>) -> MutexGuard<'_, JobState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobStore {
    /// # Arguments
    ///
    /// * `ttl` - How long a job and its rows are kept after submission
    /// * `max_rows` - Rows kept per job; the rest are dropped and the job marked truncated
    pub fn new(ttl: Duration, max_rows: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            ttl,
            max_rows,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job and start draining its rows in the background
    pub fn start(&self, id: Uuid, owners: Vec<String>, progress: DispatchProgress, mut rows: RowStream) {
        self.purge_expired();

        let state = Arc::new(Mutex::new(JobState::default()));
        let max_rows = self.max_rows;
        let task_state = Arc::clone(&state);

        let handle = tokio::spawn(async move {
            while let Some(item) = rows.next().await {
                let mut job = lock_state(&task_state);
                match item {
                    Ok(row) if job.rows.len() < max_rows => job.rows.push(row),
                    Ok(_) => {
                        if !job.truncated {
                            tracing::warn!("Query {} exceeded {} rows, dropping the rest", id, max_rows);
                        }
                        job.truncated = true;
                    }
                    Err(e) => {
                        tracing::error!("Query {} failed: {}", id, e);
                        job.failure = Some(e.to_string());
                    }
                }
            }
            let mut job = lock_state(&task_state);
            job.finished = true;
            tracing::info!("Query {} finished with {} rows", id, job.rows.len());
        });

        self.lock().insert(
            id,
            Job {
                owners,
                progress,
                state,
                created_at: Instant::now(),
                task: Some(handle.abort_handle()),
            },
        );
    }

    /// Register a job that failed before anything was dispatched
    pub fn reject(&self, id: Uuid, owners: Vec<String>, progress: DispatchProgress, err: &RelayError) {
        let state = JobState {
            finished: true,
            failure: Some(err.to_string()),
            ..JobState::default()
        };
        self.lock().insert(
            id,
            Job {
                owners,
                progress,
                state: Arc::new(Mutex::new(state)),
                created_at: Instant::now(),
                task: None,
            },
        );
    }

    /// Rows collected so far and the job's status, for a caller allowed to see it
    pub fn snapshot(&self, id: &Uuid, caller: &Caller) -> Result<JobSnapshot, RelayError> {
        self.purge_expired();

        let jobs = self.lock();
        let job = jobs
            .get(id)
            .filter(|job| caller.may_access(&job.owners))
            .ok_or_else(|| RelayError::NotFound(format!("No query exists with id {}", id)))?;

        let report = job.progress.snapshot();
        let state = lock_state(&job.state);
        let failed = state.failure.is_some() || report.phase == DispatchPhase::Failed;
        let complete = state.finished && !failed;

        let message = match (&state.failure, complete) {
            (Some(failure), _) => failure.clone(),
            (None, true) if state.truncated => format!(
                "Query complete, result truncated to {} rows",
                state.rows.len()
            ),
            (None, true) => "Query complete".to_string(),
            (None, false) => format!("Query in progress ({})", report.phase),
        };

        Ok(JobSnapshot {
            rows: state.rows.clone(),
            status: QueryStatus {
                request_id: id.to_string(),
                message,
                complete,
                failed,
                in_progress: !state.finished,
                phase: report.phase,
                rows: state.rows.len(),
                truncated: state.truncated,
                endpoints: report.endpoints,
            },
        })
    }

    /// Drop jobs past their TTL, aborting any still running
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut jobs = self.lock();
        let expired: Vec<Uuid> = jobs
            .iter()
            .filter(|(_, job)| now.duration_since(job.created_at) > self.ttl)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(job) = jobs.remove(id) {
                if let Some(task) = job.task {
                    task.abort();
                }
                tracing::info!("Query {} expired", id);
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for JobStore {
    fn drop(&mut self) {
        for job in self.lock().values() {
            if let Some(task) = &job.task {
                task.abort();
            }
        }
    }
}
