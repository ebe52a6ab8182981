// Dispatcher / Fan-out Engine
//
// Turns a validated request into endpoints (expanded local queries and forwarded peer
// requests) and runs them concurrently. Every endpoint is isolated: its failure is
// recorded and logged, the other endpoints keep streaming. Rows reach the caller as
// they arrive, tagged with the relay and source that produced them.

use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::api::middleware::RelayError;
use crate::config::Config;
use crate::models::{
    Caller, DispatchPhase, EndpointOutcome, PeerRelay, QueryRequest, Reachability, ResultRow,
};
use crate::services::access_control::VisibleSource;
use crate::services::database::{create_runner, QueryRunner};
use crate::services::datafusion::DataFusionSessionManager;
use crate::services::peer_client::PeerClient;
use crate::services::registry::SourceRegistry;
use crate::services::result_streamer::RowStream;
use crate::services::template::TemplateEngine;
use crate::services::topology::RelayGraph;
use crate::services::ConnectionPoolManager;
use crate::validation::{QueryValidator, ValidationOptions};

/// Rows buffered between endpoint tasks and the consumer
const ROW_CHANNEL_CAPACITY: usize = 1024;

/// One dispatch unit
#[derive(Clone)]
pub enum EndpointTarget {
    /// Expanded query against a source this relay executes
    Local {
        source_id: String,
        sql: String,
        runner: Arc<dyn QueryRunner>,
    },
    /// The original template, forwarded to a peer relay
    Peer { peer: PeerRelay, request: QueryRequest },
    /// A ticket a peer handed out, redeemed at its location
    Remote {
        relay: String,
        location: String,
        ticket: String,
    },
}

impl EndpointTarget {
    pub fn name(&self) -> &str {
        match self {
            EndpointTarget::Local { source_id, .. } => source_id,
            EndpointTarget::Peer { peer, .. } => &peer.id,
            EndpointTarget::Remote { location, .. } => location,
        }
    }

    fn relay<'a>(&'a self, local_relay: &'a str) -> &'a str {
        match self {
            EndpointTarget::Local { .. } => local_relay,
            EndpointTarget::Peer { peer, .. } => &peer.id,
            EndpointTarget::Remote { relay, .. } => relay,
        }
    }
}

impl std::fmt::Debug for EndpointTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointTarget::Local { source_id, sql, runner } => f
                .debug_struct("Local")
                .field("source_id", source_id)
                .field("sql", sql)
                .field("engine", &runner.engine_kind())
                .finish(),
            EndpointTarget::Peer { peer, .. } => f.debug_struct("Peer").field("peer", &peer.id).finish(),
            EndpointTarget::Remote { relay, location, .. } => f
                .debug_struct("Remote")
                .field("relay", relay)
                .field("location", location)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub request_id: Uuid,
    pub entity: String,
    pub targets: Vec<EndpointTarget>,
}

/// Where a dispatch stands and what each endpoint did
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub request_id: Uuid,
    pub phase: DispatchPhase,
    pub endpoints: Vec<EndpointOutcome>,
    pub error: Option<String>,
}

/// Shared, updatable view of a [`DispatchReport`]
#[derive(Debug, Clone)]
pub struct DispatchProgress(Arc<Mutex<DispatchReport>>);

impl DispatchProgress {
    pub fn new(request_id: Uuid) -> Self {
        Self(Arc::new(Mutex::new(DispatchReport {
            request_id,
            phase: DispatchPhase::Validating,
            endpoints: Vec::new(),
            error: None,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, DispatchReport> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_id(&self) -> Uuid {
        self.lock().request_id
    }

    pub fn phase(&self) -> DispatchPhase {
        self.lock().phase
    }

    pub fn advance(&self, next: DispatchPhase) {
        let mut report = self.lock();
        if report.phase.can_advance_to(next) {
            tracing::debug!("Request {}: {} -> {}", report.request_id, report.phase, next);
            report.phase = next;
        }
    }

    pub fn fail(&self, err: &RelayError) {
        let mut report = self.lock();
        if report.phase.can_advance_to(DispatchPhase::Failed) {
            report.phase = DispatchPhase::Failed;
            report.error = Some(err.to_string());
        }
    }

    pub fn record(&self, outcome: EndpointOutcome) {
        self.lock().endpoints.push(outcome);
    }

    pub fn snapshot(&self) -> DispatchReport {
        self.lock().clone()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub relay_id: String,
    /// Stamped on every row this relay produces
    pub relay_uri: String,
    pub endpoint_timeout: Duration,
    pub validation: ValidationOptions,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            relay_id: config.relay.id.clone(),
            relay_uri: config.relay.uri.trim_end_matches('/').to_string(),
            endpoint_timeout: Duration::from_secs(config.relay.endpoint_timeout_secs),
            validation: ValidationOptions {
                max_query_length: config.relay.max_query_length,
                strict_substitutions: config.relay.strict_substitutions,
            },
        }
    }
}

/// Aborts the coordinator when the row stream is dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Dispatcher {
    registry: Arc<SourceRegistry>,
    topology: Arc<RelayGraph>,
    runners: HashMap<String, Arc<dyn QueryRunner>>,
    peers: Arc<dyn PeerClient>,
    settings: DispatchSettings,
}

impl Dispatcher {
    /// Build a dispatcher with one runner per local source
    pub async fn new(
        registry: Arc<SourceRegistry>,
        topology: Arc<RelayGraph>,
        peers: Arc<dyn PeerClient>,
        settings: DispatchSettings,
    ) -> Result<Self, RelayError> {
        let sessions = Arc::new(DataFusionSessionManager::default_config());
        let pools = Arc::new(ConnectionPoolManager::new());

        let mut runners = HashMap::new();
        for source in registry.local_sources() {
            if let Reachability::Local(binding) = &source.reachability {
                let runner = create_runner(binding, sessions.clone(), pools.clone()).await?;
                tracing::info!("Source {} runs on {}", source.id, runner.engine_kind());
                runners.insert(source.id.clone(), runner);
            }
        }

        Ok(Self::with_runners(registry, topology, peers, settings, runners))
    }

    pub fn with_runners(
        registry: Arc<SourceRegistry>,
        topology: Arc<RelayGraph>,
        peers: Arc<dyn PeerClient>,
        settings: DispatchSettings,
        runners: HashMap<String, Arc<dyn QueryRunner>>,
    ) -> Self {
        Self {
            registry,
            topology,
            runners,
            peers,
            settings,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Validate, resolve and expand a request into endpoints.
    ///
    /// Fails before anything runs: on validation or expansion errors, and when no
    /// endpoint is left to dispatch to.
    pub fn plan(
        &self,
        request: &QueryRequest,
        caller: &Caller,
        progress: &DispatchProgress,
    ) -> Result<DispatchPlan, RelayError> {
        let request_id = progress.request_id();
        let template = QueryValidator::validate(request, &self.settings.validation)?;

        progress.advance(DispatchPhase::Resolving);
        let visible = self
            .registry
            .resolve(&template.substitutions.sources, &caller.access);

        progress.advance(DispatchPhase::Expanding);
        let remaining_hops = self.topology.remaining_hops(request.hop_limit);
        let mut targets = Vec::with_capacity(visible.len());

        for VisibleSource { source, grant } in visible {
            // A forwarding relay's grant narrows whatever this relay would allow
            let grant = match &request.restriction {
                Some(inherited) => grant.intersect(inherited),
                None => grant,
            };
            match &source.reachability {
                Reachability::Local(binding) => {
                    let sql = TemplateEngine::expand(&template, &source.id, binding, &grant)?;
                    let runner = self.runners.get(&source.id).cloned().ok_or_else(|| {
                        RelayError::Internal(format!("no runner registered for source {}", source.id))
                    })?;
                    tracing::debug!("Expanded query for {}: {}", source.id, sql);
                    targets.push(EndpointTarget::Local {
                        source_id: source.id.clone(),
                        sql,
                        runner,
                    });
                }
                Reachability::Peer(peer) => {
                    if !self
                        .topology
                        .may_forward(&peer.id, &request.relay_path, remaining_hops)
                    {
                        tracing::debug!(
                            "Not forwarding request {} to {}: already visited or out of hops",
                            request_id,
                            peer.id
                        );
                        continue;
                    }
                    targets.push(EndpointTarget::Peer {
                        peer: peer.clone(),
                        request: request
                            .forwarded(
                                request_id,
                                &self.settings.relay_id,
                                remaining_hops - 1,
                                &caller.access.name,
                                &caller.requesting_fingerprint,
                            )
                            .restricted_to(&grant),
                    });
                }
            }
        }

        if targets.is_empty() {
            return Err(RelayError::EmptyResolution);
        }

        Ok(DispatchPlan {
            request_id,
            entity: template.entity,
            targets,
        })
    }

    /// Plan a request and fan it out. The returned stream ends once every endpoint has
    /// finished; its last item is an error only if every endpoint failed.
    pub fn dispatch(
        self: &Arc<Self>,
        request: &QueryRequest,
        caller: &Caller,
        progress: &DispatchProgress,
    ) -> Result<RowStream, RelayError> {
        let plan = self.plan(request, caller, progress).map_err(|e| {
            progress.fail(&e);
            e
        })?;

        tracing::info!(
            "Dispatching request {} on {} to {} endpoints at level {}",
            plan.request_id,
            plan.entity,
            plan.targets.len(),
            caller.access.name
        );
        Ok(self.fan_out(plan.targets, progress.clone()))
    }

    /// Run every target concurrently and merge their rows into one stream.
    ///
    /// Dropping the stream cancels whatever is still running.
    pub fn fan_out(self: &Arc<Self>, targets: Vec<EndpointTarget>, progress: DispatchProgress) -> RowStream {
        let (tx, rx) = mpsc::channel::<Result<ResultRow, RelayError>>(ROW_CHANNEL_CAPACITY);
        let dispatcher = Arc::clone(self);
        progress.advance(DispatchPhase::Dispatching);

        let coordinator = tokio::spawn(async move {
            let total = targets.len();
            let mut tasks = JoinSet::new();
            for target in targets {
                let dispatcher = Arc::clone(&dispatcher);
                let tx = tx.clone();
                tasks.spawn(async move { dispatcher.run_endpoint(target, tx).await });
            }
            progress.advance(DispatchPhase::Awaiting);

            let mut failed = 0;
            while let Some(joined) = tasks.join_next().await {
                let outcome = joined.unwrap_or_else(|e| EndpointOutcome {
                    endpoint: "unknown".to_string(),
                    relay: dispatcher.settings.relay_id.clone(),
                    rows: 0,
                    elapsed_ms: 0,
                    error: Some(format!("endpoint task did not finish: {}", e)),
                });
                if !outcome.succeeded() {
                    failed += 1;
                }
                progress.record(outcome);
            }

            progress.advance(DispatchPhase::Merging);
            if total > 0 && failed == total {
                let err = RelayError::AllEndpointsFailed(total);
                tracing::error!("Request {}: {}", progress.request_id(), err);
                progress.fail(&err);
                let _ = tx.send(Err(err)).await;
            } else {
                if failed > 0 {
                    tracing::warn!(
                        "Request {}: {} of {} endpoints failed, returning partial results",
                        progress.request_id(),
                        failed,
                        total
                    );
                }
                progress.advance(DispatchPhase::Complete);
            }
        });

        let guard = AbortOnDrop(coordinator);
        futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        })
        .boxed()
    }

    async fn run_endpoint(
        self: Arc<Self>,
        target: EndpointTarget,
        tx: mpsc::Sender<Result<ResultRow, RelayError>>,
    ) -> EndpointOutcome {
        let started = Instant::now();
        let mut rows = 0;

        let result = async {
            let mut stream = self.stream_endpoint(&target).await?;
            while let Some(row) = stream.next().await {
                if tx.send(Ok(row?)).await.is_err() {
                    // Consumer went away
                    break;
                }
                rows += 1;
            }
            Ok::<(), RelayError>(())
        }
        .await;

        let outcome = EndpointOutcome {
            endpoint: target.name().to_string(),
            relay: target.relay(&self.settings.relay_id).to_string(),
            rows,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        match &result {
            Ok(()) => tracing::debug!(
                "Endpoint {} delivered {} rows in {}ms",
                outcome.endpoint,
                rows,
                outcome.elapsed_ms
            ),
            Err(e) => tracing::warn!(
                "Endpoint {} on {} failed after {} rows: {}",
                outcome.endpoint,
                outcome.relay,
                rows,
                e
            ),
        }
        outcome
    }

    /// Open one endpoint, bounded by the per-endpoint timeout from start to last row
    pub async fn stream_endpoint(self: &Arc<Self>, target: &EndpointTarget) -> Result<RowStream, RelayError> {
        let timeout = self.settings.endpoint_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let name = target.name().to_string();

        let stream = tokio::time::timeout_at(deadline, self.open(target))
            .await
            .map_err(|_| Self::timed_out(&name, timeout))??;

        Ok(futures::stream::unfold((stream, false), move |(mut stream, expired)| {
            let name = name.clone();
            async move {
                if expired {
                    return None;
                }
                match tokio::time::timeout_at(deadline, stream.next()).await {
                    Ok(Some(item)) => Some((item, (stream, false))),
                    Ok(None) => None,
                    Err(_) => Some((Err(Self::timed_out(&name, timeout)), (stream, true))),
                }
            }
        })
        .boxed())
    }

    fn timed_out(endpoint: &str, timeout: Duration) -> RelayError {
        RelayError::Endpoint {
            endpoint: endpoint.to_string(),
            message: format!("no complete answer within {}s", timeout.as_secs_f64()),
        }
    }

    async fn open(self: &Arc<Self>, target: &EndpointTarget) -> Result<RowStream, RelayError> {
        match target {
            EndpointTarget::Local { source_id, sql, runner } => {
                let rows = runner.execute_stream(sql).await?;
                let relay_uri = self.settings.relay_uri.clone();
                let source_id = source_id.clone();
                Ok(rows
                    .map_ok(move |values| ResultRow::new(values, relay_uri.clone(), source_id.clone()))
                    .boxed())
            }
            EndpointTarget::Peer { peer, request } => {
                let info = self.peers.get_info(peer, request).await?;
                if info.is_empty() {
                    tracing::debug!("Peer {} has nothing to contribute", peer.id);
                    return Ok(futures::stream::empty().boxed());
                }

                let targets = info
                    .endpoints
                    .into_iter()
                    .map(|endpoint| EndpointTarget::Remote {
                        relay: peer.id.clone(),
                        location: endpoint
                            .locations
                            .first()
                            .cloned()
                            .unwrap_or_else(|| peer.endpoint.clone()),
                        ticket: endpoint.ticket,
                    })
                    .collect();
                let progress = DispatchProgress::new(request.request_uuid.unwrap_or_else(Uuid::new_v4));
                Ok(self.fan_out(targets, progress))
            }
            EndpointTarget::Remote { location, ticket, .. } => self.peers.do_get(location, ticket).await,
        }
    }
}
