// Relay Service
//
// Entry points behind both transports. GetInfo plans a request and hands out one
// ticket per endpoint, DoGet redeems a ticket as a row stream. Submit and retrieve
// run the same dispatch as a background job for polling clients.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::api::middleware::RelayError;
use crate::config::Config;
use crate::models::{Caller, ClientIdentity, Endpoint, FlightInfo, QueryRequest};
use crate::services::access_control::AccessFilter;
use crate::services::dispatcher::{DispatchProgress, Dispatcher};
use crate::services::job_store::{JobSnapshot, JobStore};
use crate::services::result_streamer::RowStream;
use crate::services::ticket_store::{IssuedTicket, TicketStore, TtlCache};

pub struct RelayService {
    dispatcher: Arc<Dispatcher>,
    tickets: TicketStore,
    /// Request ids already answered, so a request looping back is answered once
    seen: TtlCache<()>,
    jobs: JobStore,
    relay_uri: String,
}

impl RelayService {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &Config) -> Self {
        let ticket_ttl = Duration::from_secs(config.relay.ticket_ttl_secs);
        Self {
            dispatcher,
            tickets: TtlCache::new(config.relay.max_tickets, ticket_ttl),
            seen: TtlCache::new(config.relay.max_tickets, ticket_ttl),
            jobs: JobStore::new(
                Duration::from_secs(config.relay.job_ttl_secs),
                config.relay.max_result_rows,
            ),
            relay_uri: config.relay.uri.trim_end_matches('/').to_string(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Who the request runs for, and the request as this relay accepts it from them
    fn admit(
        &self,
        identity: &ClientIdentity,
        request: &QueryRequest,
    ) -> Result<(Caller, QueryRequest), RelayError> {
        let caller = AccessFilter::caller_for(identity, request, self.dispatcher.registry().levels())?;
        let request = request.received(caller.via_relay);
        Ok((caller, request))
    }

    /// Descriptor step: plan the request and issue one ticket per endpoint.
    ///
    /// Every ticket points back at this relay, so a user only ever talks to the relay it
    /// entered through. A request id this relay has already answered gets no endpoints.
    pub fn get_info(&self, identity: &ClientIdentity, request: &QueryRequest) -> Result<FlightInfo, RelayError> {
        let (caller, request) = self.admit(identity, request)?;
        let request_id = request.request_uuid.unwrap_or_else(Uuid::new_v4);

        if !self.seen.insert_if_absent(&request_id.to_string(), ()) {
            tracing::info!(
                "Request {} already answered by this relay, returning no endpoints",
                request_id
            );
            return Ok(FlightInfo::empty());
        }

        tracing::info!(
            "GetInfo {} from {} at level {}{}",
            request_id,
            identity.name,
            caller.access.name,
            if caller.via_relay { " (forwarded)" } else { "" }
        );

        let progress = DispatchProgress::new(request_id);
        let plan = match self.dispatcher.plan(&request, &caller, &progress) {
            Ok(plan) => plan,
            // A peer with nothing to contribute is not an error for the relay that asked
            Err(RelayError::EmptyResolution) if caller.via_relay => return Ok(FlightInfo::empty()),
            Err(e) => {
                tracing::warn!("Rejected request {}: {}", request_id, e);
                return Err(e);
            }
        };

        let owners = vec![
            caller.direct_fingerprint.clone(),
            caller.requesting_fingerprint.clone(),
        ];
        let mut info = FlightInfo::empty();
        for target in plan.targets {
            let ticket = Uuid::new_v4().to_string();
            tracing::debug!("Issued ticket {} for {}", ticket, target.name());
            self.tickets.put(
                ticket.clone(),
                IssuedTicket {
                    request_id,
                    target,
                    owners: owners.clone(),
                },
            );
            info.endpoints.push(Endpoint {
                ticket,
                locations: vec![self.relay_uri.clone()],
            });
        }
        Ok(info)
    }

    /// Ticket step: redeem a ticket issued to this caller. Tickets are single use.
    pub async fn do_get(&self, identity: &ClientIdentity, ticket: &str) -> Result<RowStream, RelayError> {
        let not_found = || RelayError::NotFound(format!("No query exists with id {}", ticket));

        let caller = Caller::connection(identity);
        // Checked and removed under one lock, so two concurrent redeems cannot both win
        let issued = self
            .tickets
            .take_if(ticket, |issued| {
                let owned = caller.may_access(&issued.owners);
                if !owned {
                    tracing::warn!("{} tried to redeem a ticket issued to someone else", identity.name);
                }
                owned
            })
            .ok_or_else(not_found)?;

        tracing::debug!(
            "Redeeming ticket {} of request {} for {}",
            ticket,
            issued.request_id,
            issued.target.name()
        );
        self.dispatcher.stream_endpoint(&issued.target).await
    }

    /// Submit step: validate synchronously, dispatch in the background
    pub fn submit(&self, identity: &ClientIdentity, request: &QueryRequest) -> Result<Uuid, RelayError> {
        let (caller, request) = self.admit(identity, request)?;
        let request_id = Uuid::new_v4();
        let progress = DispatchProgress::new(request_id);
        let owners = vec![
            caller.direct_fingerprint.clone(),
            caller.requesting_fingerprint.clone(),
        ];

        match self.dispatcher.dispatch(&request, &caller, &progress) {
            Ok(rows) => {
                tracing::info!("Submitted query {} for {}", request_id, identity.name);
                self.jobs.start(request_id, owners, progress, rows);
                Ok(request_id)
            }
            Err(e) if e.is_rejection() => {
                tracing::warn!("Rejected query {}: {}", request_id, e);
                Err(e)
            }
            Err(e) => {
                self.jobs.reject(request_id, owners, progress, &e);
                Ok(request_id)
            }
        }
    }

    /// Retrieve step: rows collected so far plus the job status
    pub fn retrieve(&self, identity: &ClientIdentity, id: &Uuid) -> Result<JobSnapshot, RelayError> {
        let caller = Caller::connection(identity);
        self.jobs.snapshot(id, &caller)
    }

    /// Drop expired tickets, request ids and jobs
    pub fn purge_expired(&self) {
        let tickets = self.tickets.cleanup_expired();
        self.seen.cleanup_expired();
        let jobs = self.jobs.purge_expired();
        if tickets + jobs > 0 {
            tracing::debug!("Purged {} tickets and {} jobs", tickets, jobs);
        }
    }
}
