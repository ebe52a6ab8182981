// In-process relay network for tests
//
// Every relay runs its own RelayService; peers reach each other through a loopback
// PeerClient that calls the target service directly instead of going over HTTP.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::api::middleware::RelayError;
use crate::config::Config;
use crate::models::{ClientIdentity, FlightInfo, PeerRelay, QueryRequest};
use crate::services::dispatcher::{DispatchSettings, Dispatcher};
use crate::services::peer_client::PeerClient;
use crate::services::registry::SourceRegistry;
use crate::services::relay::RelayService;
use crate::services::result_streamer::RowStream;
use crate::services::topology::RelayGraph;

/// Relays by base URI
#[derive(Default)]
pub struct Network {
    relays: RwLock<HashMap<String, Weak<RelayService>>>,
}

impl Network {
    fn relay(&self, uri: &str) -> Result<Arc<RelayService>, RelayError> {
        self.relays
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(uri.trim_end_matches('/'))
            .and_then(Weak::upgrade)
            .ok_or_else(|| RelayError::Remote(format!("no relay listening at {}", uri)))
    }
}

/// Peer client presenting one relay's fingerprint to the others
pub struct LoopbackPeers {
    network: Arc<Network>,
    fingerprint: String,
}

impl LoopbackPeers {
    fn identity_at(&self, relay: &RelayService) -> Result<ClientIdentity, RelayError> {
        relay
            .dispatcher()
            .registry()
            .identity(&self.fingerprint)
            .cloned()
            .ok_or_else(|| RelayError::Remote(format!("forbidden: unknown fingerprint {}", self.fingerprint)))
    }
}

#[async_trait]
impl PeerClient for LoopbackPeers {
    async fn get_info(&self, peer: &PeerRelay, request: &QueryRequest) -> Result<FlightInfo, RelayError> {
        let relay = self.network.relay(&peer.endpoint)?;
        let identity = self.identity_at(&relay)?;
        relay
            .get_info(&identity, request)
            .map_err(|e| RelayError::Remote(e.to_string()))
    }

    async fn do_get(&self, location: &str, ticket: &str) -> Result<RowStream, RelayError> {
        let relay = self.network.relay(location)?;
        let identity = self.identity_at(&relay)?;
        relay
            .do_get(&identity, ticket)
            .await
            .map_err(|e| RelayError::Remote(e.to_string()))
    }
}

/// Relays of a test network, keeping every service alive
pub struct TestNetwork {
    pub relays: HashMap<String, Arc<RelayService>>,
    _network: Arc<Network>,
}

impl TestNetwork {
    /// Start one relay per configuration, wired together by their peer sections
    pub async fn start(configs: &[&str]) -> Self {
        let network = Arc::new(Network::default());
        let mut relays = HashMap::new();

        for text in configs {
            let config = Config::from_toml(text).expect("relay config");
            let registry = Arc::new(SourceRegistry::from_config(&config).expect("registry"));
            let topology = Arc::new(RelayGraph::from_config(&config));
            let peers = Arc::new(LoopbackPeers {
                network: Arc::clone(&network),
                fingerprint: config.relay.fingerprint.clone(),
            });
            let dispatcher = Dispatcher::new(
                registry,
                topology,
                peers,
                DispatchSettings::from_config(&config),
            )
            .await
            .expect("dispatcher");

            let service = Arc::new(RelayService::new(Arc::new(dispatcher), &config));
            network
                .relays
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(
                    config.relay.uri.trim_end_matches('/').to_string(),
                    Arc::downgrade(&service),
                );
            relays.insert(config.relay.id.clone(), service);
        }

        Self {
            relays,
            _network: network,
        }
    }

    pub fn relay(&self, id: &str) -> &Arc<RelayService> {
        &self.relays[id]
    }
}

/// Five relays holding six lineitem sources. relay-na and relay-eu link to each other,
/// as do relay-asia and relay-sa, so forwarding has cycles to cope with.
///
/// Default access only sees rows with returnflag 'N'.
pub fn lineitem_network() -> Vec<String> {
    const RELAYS: [(&str, &[&str], &[(&str, &str)]); 5] = [
        (
            "na",
            &["eu", "asia"],
            &[
                ("lineitem_na_1", r#"[{returnflag = "N", quantity = 10}, {returnflag = "N", quantity = 20}, {returnflag = "R", quantity = 5}]"#),
                ("lineitem_na_2", r#"[{returnflag = "N", quantity = 30}, {returnflag = "A", quantity = 7}]"#),
            ],
        ),
        (
            "eu",
            &["na", "af"],
            &[("lineitem_eu_1", r#"[{returnflag = "N", quantity = 40}, {returnflag = "N", quantity = 50}]"#)],
        ),
        (
            "asia",
            &["sa"],
            &[("lineitem_asia_1", r#"[{returnflag = "N", quantity = 60}, {returnflag = "R", quantity = 8}]"#)],
        ),
        (
            "af",
            &[],
            &[("lineitem_af_1", r#"[{returnflag = "N", quantity = 70}]"#)],
        ),
        (
            "sa",
            &["asia"],
            &[("lineitem_sa_1", r#"[{returnflag = "N", quantity = 80}, {returnflag = "A", quantity = 9}]"#)],
        ),
    ];

    RELAYS
        .iter()
        .map(|(name, peers, sources)| {
            let mut text = format!(
                r#"
                access_levels = ["default_access", "all_access"]

                [relay]
                id = "relay-{name}"
                uri = "http://relay-{name}:3000"
                fingerprint = "{name}-fp"
                hop_limit = 4

                [[identities]]
                fingerprint = "user-default"
                name = "analyst"
                access_level = "default_access"

                [[identities]]
                fingerprint = "user-all"
                name = "auditor"
                access_level = "all_access"
                "#
            );

            // Every relay accepts forwarded requests from every other one
            for (other, _, _) in RELAYS.iter().filter(|(other, _, _)| other != name) {
                if !peers.contains(other) {
                    text.push_str(&format!(
                        r#"
                [[identities]]
                fingerprint = "{other}-fp"
                name = "relay-{other}"
                access_level = "all_access"
                kind = "relay"
                "#
                    ));
                }
            }

            for peer in peers.iter() {
                text.push_str(&format!(
                    r#"
                [[peers]]
                id = "relay-{peer}"
                endpoint = "http://relay-{peer}:3000"
                fingerprint = "{peer}-fp"
                access_level = "all_access"
                "#
                ));
            }

            for (id, rows) in sources.iter() {
                text.push_str(&format!(
                    r#"
                [[sources]]
                id = "{id}"
                capabilities = ["lineitem"]
                relation = "lineitem"
                engine = {{ kind = "memory", rows = {rows} }}
                grants = [
                    {{ level = "default_access", allowed_rows = "returnflag = 'N'" }},
                    {{ level = "all_access" }},
                ]
                "#
                ));
            }
            text
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryRequest, ResultRow};
    use futures::{StreamExt, TryStreamExt};
    use std::collections::BTreeSet;
    use std::time::Duration;

    const GROUPED: &str =
        "select returnflag, count(*) as n, avg(quantity) as avg_qty from lineitem group by returnflag";

    async fn network() -> TestNetwork {
        let configs = lineitem_network();
        let refs: Vec<&str> = configs.iter().map(String::as_str).collect();
        TestNetwork::start(&refs).await
    }

    fn user(net: &TestNetwork, fingerprint: &str) -> ClientIdentity {
        net.relay("relay-na")
            .dispatcher()
            .registry()
            .identity(fingerprint)
            .cloned()
            .unwrap()
    }

    /// What a streaming client does: get the endpoints, pull each one, concatenate
    async fn stream_query(net: &TestNetwork, fingerprint: &str, sql: &str) -> Vec<ResultRow> {
        let entry = net.relay("relay-na");
        let identity = user(net, fingerprint);
        let info = entry.get_info(&identity, &QueryRequest::new(sql)).unwrap();
        assert!(info
            .endpoints
            .iter()
            .all(|e| e.locations == vec!["http://relay-na:3000".to_string()]));

        let mut rows = Vec::new();
        for endpoint in info.endpoints {
            let stream = entry.do_get(&identity, &endpoint.ticket).await.unwrap();
            let mut endpoint_rows: Vec<ResultRow> = stream.try_collect().await.unwrap();
            rows.append(&mut endpoint_rows);
        }
        rows
    }

    fn number(row: &ResultRow, column: &str) -> f64 {
        row.values[column].as_f64().unwrap()
    }

    #[tokio::test]
    async fn test_default_access_across_network() {
        let net = network().await;
        let rows = stream_query(&net, "user-default", GROUPED).await;

        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| r.values["returnflag"] == "N"));
        assert!(rows.iter().all(|r| r.values.len() == 3));

        let sources: BTreeSet<&str> = rows.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(sources.len(), 6);
        let relays: BTreeSet<&str> = rows.iter().map(|r| r.source_relay_uri.as_str()).collect();
        assert_eq!(relays.len(), 5);

        let count: f64 = rows.iter().map(|r| number(r, "n")).sum();
        let weighted: f64 = rows.iter().map(|r| number(r, "avg_qty") * number(r, "n")).sum();
        assert_eq!(count, 8.0);
        assert!((weighted / count - 45.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_all_access_sees_a_superset() {
        let net = network().await;
        let default = stream_query(&net, "user-default", GROUPED).await;
        let all = stream_query(&net, "user-all", GROUPED).await;

        let key = |r: &ResultRow| (r.source_id.clone(), r.values["returnflag"].to_string());
        let default_keys: BTreeSet<_> = default.iter().map(key).collect();
        let all_keys: BTreeSet<_> = all.iter().map(key).collect();

        assert_eq!(all.len(), 10);
        assert!(default_keys.is_subset(&all_keys));
        let extra: BTreeSet<String> = all_keys
            .difference(&default_keys)
            .map(|(_, flag)| flag.clone())
            .collect();
        assert_eq!(extra, ["\"A\"".to_string(), "\"R\"".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn test_multi_entity_rejected_at_entry() {
        let net = network().await;
        let identity = user(&net, "user-default");
        let request = QueryRequest::new("select * from lineitem join orders on l_orderkey = o_orderkey");
        let err = net.relay("relay-na").get_info(&identity, &request).err().unwrap();
        assert_eq!(err.to_string(), "invalid query: There must be exactly one entity per query.");
    }

    #[tokio::test]
    async fn test_ticket_is_single_use_and_owned() {
        let net = network().await;
        let entry = net.relay("relay-na");
        let identity = user(&net, "user-default");
        let info = entry.get_info(&identity, &QueryRequest::new(GROUPED)).unwrap();
        let ticket = &info.endpoints[0].ticket;

        let stranger = user(&net, "user-all");
        let err = entry.do_get(&stranger, ticket).await.err().unwrap();
        assert_eq!(err.to_string(), format!("No query exists with id {}", ticket));

        let stream = entry.do_get(&identity, ticket).await.unwrap();
        let _: Vec<_> = stream.collect().await;
        assert!(entry.do_get(&identity, ticket).await.is_err());
    }

    #[tokio::test]
    async fn test_repeated_request_id_gets_no_endpoints() {
        let net = network().await;
        let entry = net.relay("relay-na");
        let relay_eu = user(&net, "eu-fp");
        let mut request = QueryRequest::new(GROUPED);
        request.request_uuid = Some(uuid::Uuid::new_v4());

        assert!(!entry.get_info(&relay_eu, &request).unwrap().is_empty());
        assert!(entry.get_info(&relay_eu, &request).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_supplied_forwarding_fields_are_ignored() {
        let net = network().await;
        let entry = net.relay("relay-na");
        let identity = user(&net, "user-default");
        let mut request = QueryRequest::new(GROUPED);
        request.request_uuid = Some(uuid::Uuid::new_v4());
        request.hop_limit = Some(0);
        request.relay_path = vec!["relay-eu".to_string(), "relay-asia".to_string()];

        let first = entry.get_info(&identity, &request).unwrap();
        let second = entry.get_info(&identity, &request).unwrap();
        // Two local sources plus both peers, every time
        assert_eq!(first.endpoints.len(), 4);
        assert_eq!(second.endpoints.len(), 4);
    }

    #[tokio::test]
    async fn test_qualified_columns_across_network() {
        let net = network().await;
        let rows = stream_query(
            &net,
            "user-default",
            "select lineitem.quantity from lineitem where lineitem.quantity > 0",
        )
        .await;
        assert_eq!(rows.len(), 8);
        let sources: BTreeSet<&str> = rows.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(sources.len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redeem_streams_once() {
        let net = network().await;
        let entry = Arc::clone(net.relay("relay-na"));
        let identity = user(&net, "user-default");
        let info = entry.get_info(&identity, &QueryRequest::new(GROUPED)).unwrap();
        let ticket = info.endpoints[0].ticket.clone();

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut redeems = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let entry = Arc::clone(&entry);
            let identity = identity.clone();
            let ticket = ticket.clone();
            let barrier = Arc::clone(&barrier);
            redeems.spawn(async move {
                barrier.wait().await;
                entry.do_get(&identity, &ticket).await.is_ok()
            });
        }

        let mut granted = 0;
        while let Some(redeemed) = redeems.join_next().await {
            if redeemed.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    const GUARDED_NA: &str = r#"
        access_levels = ["default_access", "all_access"]

        [relay]
        id = "relay-na"
        uri = "http://relay-na:3000"
        fingerprint = "na-fp"

        [[identities]]
        fingerprint = "user-default"
        name = "analyst"
        access_level = "default_access"

        [[identities]]
        fingerprint = "user-all"
        name = "auditor"
        access_level = "all_access"

        [[sources]]
        id = "lineitem_na_1"
        capabilities = ["lineitem"]
        relation = "lineitem"
        engine = { kind = "memory", rows = [{returnflag = "N", quantity = 10}, {returnflag = "R", quantity = 5}] }

        [[peers]]
        id = "relay-eu"
        endpoint = "http://relay-eu:3000"
        fingerprint = "eu-fp"
        access_level = "all_access"
        grants = [
            { level = "default_access", allowed_rows = "returnflag = 'N'" },
            { level = "all_access" },
        ]
    "#;

    const OPEN_EU: &str = r#"
        access_levels = ["default_access", "all_access"]

        [relay]
        id = "relay-eu"
        uri = "http://relay-eu:3000"
        fingerprint = "eu-fp"

        [[identities]]
        fingerprint = "na-fp"
        name = "relay-na"
        access_level = "all_access"
        kind = "relay"

        [[sources]]
        id = "lineitem_eu_1"
        capabilities = ["lineitem"]
        relation = "lineitem"
        engine = { kind = "memory", rows = [{returnflag = "N", quantity = 40}, {returnflag = "R", quantity = 41}] }
    "#;

    #[tokio::test]
    async fn test_peer_grant_limits_what_the_peer_returns() {
        let net = TestNetwork::start(&[GUARDED_NA, OPEN_EU]).await;
        let sql = "select returnflag, quantity from lineitem";

        let restricted = stream_query(&net, "user-default", sql).await;
        let from_eu: Vec<&ResultRow> = restricted
            .iter()
            .filter(|r| r.source_id == "lineitem_eu_1")
            .collect();
        assert_eq!(from_eu.len(), 1);
        assert_eq!(from_eu[0].values["returnflag"], "N");
        // The grant on the peer says nothing about local sources
        assert_eq!(restricted.len(), 3);

        let full = stream_query(&net, "user-all", sql).await;
        assert_eq!(full.len(), 4);
    }

    #[tokio::test]
    async fn test_polling_transport() {
        let net = network().await;
        let entry = net.relay("relay-na");
        let identity = user(&net, "user-default");
        let id = entry.submit(&identity, &QueryRequest::new(GROUPED)).unwrap();

        let mut snapshot = entry.retrieve(&identity, &id).unwrap();
        for _ in 0..200 {
            if !snapshot.status.in_progress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            snapshot = entry.retrieve(&identity, &id).unwrap();
        }

        assert!(snapshot.status.complete);
        assert_eq!(snapshot.rows.len(), 6);
        assert_eq!(snapshot.status.endpoints.len(), 4);
        assert!(snapshot.status.endpoints.iter().all(|e| e.succeeded()));
    }

    #[tokio::test]
    async fn test_polling_rejects_invalid_query_synchronously() {
        let net = network().await;
        let identity = user(&net, "user-default");
        let err = net
            .relay("relay-na")
            .submit(&identity, &QueryRequest::new("drop table lineitem"))
            .err()
            .unwrap();
        assert!(err.to_string().starts_with(
            "invalid query: SQL templates may only contain read-only queries"
        ));
    }
}
