// Relay client
//
// Speaks both transports of a relay over HTTP. Used by relays to forward queries to
// their peers, and by tools that submit queries on behalf of a user.

use futures::TryStreamExt;
use reqwest::{Certificate, Client, Identity, Response};
use std::time::Duration;
use uuid::Uuid;

use crate::api::middleware::{RelayError, RpcStatus};
use crate::config::TlsConfig;
use crate::models::{
    FlightInfo, QueryRequest, QueryStatus, ResultRow, SubmitResponse, TicketRequest,
    QUERY_STATUS_HEADER,
};
use crate::services::result_streamer::{decode_ndjson, decode_rows, RowFormat, RowStream};

/// Bounded fixed-interval retry for polling a submitted query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

/// One poll of a submitted query
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub complete: bool,
    pub failed: bool,
    pub rows: Vec<ResultRow>,
}

/// Build the HTTP client used for relay traffic, presenting a client certificate when configured
pub fn build_http_client(tls: Option<&TlsConfig>) -> Result<Client, RelayError> {
    let mut builder = Client::builder().connect_timeout(Duration::from_secs(10));

    if let Some(tls) = tls {
        if let Some(ca_path) = &tls.ca_cert {
            let pem = std::fs::read(ca_path).map_err(|e| {
                RelayError::Config(format!("could not read CA certificate {}: {}", ca_path, e))
            })?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| RelayError::Config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        match (&tls.client_cert, &tls.client_key) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).map_err(|e| {
                    RelayError::Config(format!("could not read client certificate {}: {}", cert_path, e))
                })?;
                let key = std::fs::read(key_path).map_err(|e| {
                    RelayError::Config(format!("could not read client key {}: {}", key_path, e))
                })?;
                let identity = Identity::from_pkcs8_pem(&cert, &key)
                    .map_err(|e| RelayError::Config(format!("invalid client identity: {}", e)))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(RelayError::Config(
                    "tls.client_cert and tls.client_key must be set together".to_string(),
                ))
            }
        }
    }

    builder
        .build()
        .map_err(|e| RelayError::Config(format!("could not build HTTP client: {}", e)))
}

#[derive(Clone)]
pub struct RelayClient {
    http: Client,
    base_url: String,
    identity_header: String,
    fingerprint: String,
}

impl RelayClient {
    /// # Arguments
    /// * `http` - Shared HTTP client
    /// * `base_url` - Relay base URL, e.g. `https://relay-na:3000`
    /// * `identity_header` - Header the relay reads the caller fingerprint from
    /// * `fingerprint` - Fingerprint presented as the caller identity
    pub fn new(
        http: Client,
        base_url: &str,
        identity_header: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            identity_header: identity_header.into(),
            fingerprint: fingerprint.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    async fn rpc_error(response: Response) -> RelayError {
        let status = response.status();
        match response.json::<RpcStatus>().await {
            Ok(rpc) => RelayError::Remote(format!("{} ({})", rpc.message, rpc.code)),
            Err(_) => RelayError::Remote(format!("relay answered with status {}", status)),
        }
    }

    async fn polling_error(response: Response) -> RelayError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if text.is_empty() {
            RelayError::Remote(format!("relay answered with status {}", status))
        } else {
            RelayError::Remote(text)
        }
    }

    /// Descriptor step of the streaming transport
    pub async fn get_info(&self, request: &QueryRequest) -> Result<FlightInfo, RelayError> {
        let response = self
            .http
            .post(Self::url(&self.base_url, "/flight/info"))
            .header(&self.identity_header, &self.fingerprint)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::rpc_error(response).await);
        }
        Ok(response.json::<FlightInfo>().await?)
    }

    /// Redeem a ticket at one of its locations
    pub async fn do_get(&self, location: &str, ticket: &str) -> Result<RowStream, RelayError> {
        let response = self
            .http
            .post(Self::url(location, "/flight/get"))
            .header(&self.identity_header, &self.fingerprint)
            .json(&TicketRequest {
                ticket: ticket.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::rpc_error(response).await);
        }
        Ok(decode_ndjson(response.bytes_stream(), RowFormat::Streaming))
    }

    /// Pull every endpoint of a query and concatenate the rows.
    ///
    /// Endpoints that fail are skipped. The query fails only if every endpoint did.
    pub async fn execute(&self, request: &QueryRequest) -> Result<Vec<ResultRow>, RelayError> {
        let info = self.get_info(request).await?;
        let total = info.endpoints.len();
        let mut failed = 0;
        let mut rows = Vec::new();

        for endpoint in info.endpoints {
            let location = endpoint
                .locations
                .first()
                .cloned()
                .unwrap_or_else(|| self.base_url.clone());
            let pulled: Result<Vec<ResultRow>, RelayError> = async {
                let stream = self.do_get(&location, &endpoint.ticket).await?;
                stream.try_collect().await
            }
            .await;

            match pulled {
                Ok(mut endpoint_rows) => rows.append(&mut endpoint_rows),
                Err(e) => {
                    tracing::warn!("Endpoint at {} failed: {}", location, e);
                    failed += 1;
                }
            }
        }

        if total > 0 && failed == total {
            return Err(RelayError::AllEndpointsFailed(total));
        }
        Ok(rows)
    }

    /// Submit step of the polling transport
    pub async fn submit(&self, request: &QueryRequest) -> Result<Uuid, RelayError> {
        let response = self
            .http
            .post(Self::url(&self.base_url, "/query"))
            .header(&self.identity_header, &self.fingerprint)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::polling_error(response).await);
        }
        let submitted = response.json::<SubmitResponse>().await?;
        Uuid::parse_str(&submitted.id)
            .map_err(|e| RelayError::Remote(format!("relay returned a malformed query id: {}", e)))
    }

    /// Fetch the rows of a submitted query collected so far
    pub async fn retrieve(&self, id: &Uuid) -> Result<Retrieved, RelayError> {
        let response = self
            .http
            .get(Self::url(&self.base_url, &format!("/query/{}", id)))
            .header(&self.identity_header, &self.fingerprint)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::polling_error(response).await);
        }
        let label = response
            .headers()
            .get(QUERY_STATUS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("in_progress")
            .to_string();
        let text = response.text().await?;

        Ok(Retrieved {
            complete: label == "complete",
            failed: label == "failed",
            rows: decode_rows(&text, RowFormat::Polling)?,
        })
    }

    pub async fn status(&self, id: &Uuid) -> Result<QueryStatus, RelayError> {
        let response = self
            .http
            .get(Self::url(&self.base_url, &format!("/query/{}", id)))
            .query(&[("status_only", "true")])
            .header(&self.identity_header, &self.fingerprint)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::polling_error(response).await);
        }
        Ok(response.json::<QueryStatus>().await?)
    }

    /// Submit, then poll until the relay reports the query complete or the policy runs out
    pub async fn execute_polling(
        &self,
        request: &QueryRequest,
        policy: &RetryPolicy,
    ) -> Result<Vec<ResultRow>, RelayError> {
        let id = self.submit(request).await?;

        for attempt in 1..=policy.attempts.max(1) {
            let retrieved = self.retrieve(&id).await?;
            if retrieved.failed {
                let status = self.status(&id).await?;
                return Err(RelayError::Remote(status.message));
            }
            if retrieved.complete {
                return Ok(retrieved.rows);
            }
            tracing::debug!(
                "Query {} not ready after attempt {}/{}",
                id,
                attempt,
                policy.attempts
            );
            tokio::time::sleep(policy.interval).await;
        }

        Err(RelayError::Remote(format!(
            "query {} did not complete after {} attempts",
            id, policy.attempts
        )))
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("base_url", &self.base_url)
            .field("identity_header", &self.identity_header)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 30);
        assert_eq!(policy.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_base_url_trimmed() {
        let client = RelayClient::new(Client::new(), "http://relay-na:3000/", "x-fp", "fp");
        assert_eq!(client.base_url(), "http://relay-na:3000");
        assert_eq!(RelayClient::url("http://relay-eu:3000/", "/flight/get"), "http://relay-eu:3000/flight/get");
    }

    #[test]
    fn test_mismatched_client_identity_is_rejected() {
        let tls = TlsConfig {
            ca_cert: None,
            client_cert: Some("/etc/relay/client.pem".to_string()),
            client_key: None,
        };
        let err = tokio_test::assert_err!(build_http_client(Some(&tls)));
        assert!(matches!(err, RelayError::Config(_)));
        tokio_test::assert_ok!(build_http_client(None));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_remote_error() {
        let client = RelayClient::new(build_http_client(None).unwrap(), "http://127.0.0.1:1", "x-fp", "fp");
        let err = client.get_info(&QueryRequest::new("select * from lineitem")).await.err().unwrap();
        assert!(matches!(err, RelayError::Remote(_)));
    }
}
