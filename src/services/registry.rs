// Source Registry
//
// Holds every source this relay can answer from: local sources it executes itself
// and peer relays it forwards to. Built once from configuration and shared by handle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::api::middleware::RelayError;
use crate::config::{Config, GrantConfig};
use crate::models::{
    AccessLevel, AccessLevels, AccessPolicy, ClientIdentity, Grant, IdentityKind, LocalBinding,
    PeerRelay, Reachability, Source, SourceSubstitution,
};
use crate::services::access_control::{AccessFilter, VisibleSource};

pub struct SourceRegistry {
    /// Sorted by id so resolution order never depends on registration order
    sources: Vec<Arc<Source>>,
    levels: AccessLevels,
    identities: HashMap<String, ClientIdentity>,
}

impl SourceRegistry {
    pub fn new(
        mut sources: Vec<Source>,
        levels: AccessLevels,
        identities: Vec<ClientIdentity>,
    ) -> Result<Self, RelayError> {
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(pair) = sources.windows(2).find(|pair| pair[0].id == pair[1].id) {
            return Err(RelayError::Config(format!("duplicate source id '{}'", pair[0].id)));
        }

        let mut by_fingerprint = HashMap::new();
        for identity in identities {
            if identity.fingerprint.is_empty() {
                return Err(RelayError::Config(format!(
                    "identity '{}' has an empty fingerprint",
                    identity.name
                )));
            }
            by_fingerprint.insert(identity.fingerprint.clone(), identity);
        }

        Ok(Self {
            sources: sources.into_iter().map(Arc::new).collect(),
            levels,
            identities: by_fingerprint,
        })
    }

    /// Build the registry from the `sources`, `peers` and `identities` sections
    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        let levels = AccessLevels::new(config.access_levels.clone())?;

        let mut sources = Vec::new();
        for source in &config.sources {
            sources.push(Source {
                id: source.id.clone(),
                capabilities: source.capabilities.iter().cloned().collect(),
                policy: Self::policy(&levels, &source.grants)?,
                reachability: Reachability::Local(LocalBinding {
                    relation: source.relation.clone(),
                    engine: source.engine.clone(),
                    fields: source.fields.clone(),
                }),
            });
        }

        let mut identities = Vec::new();
        for identity in &config.identities {
            identities.push(ClientIdentity {
                fingerprint: identity.fingerprint.clone(),
                name: identity.name.clone(),
                kind: identity.kind,
                access: levels.require(&identity.access_level)?,
            });
        }

        for peer in &config.peers {
            url::Url::parse(&peer.endpoint).map_err(|e| {
                RelayError::Config(format!("peer '{}' has an invalid endpoint: {}", peer.id, e))
            })?;
            if peer.id == config.relay.id {
                return Err(RelayError::Config(format!(
                    "relay '{}' lists itself as a peer",
                    peer.id
                )));
            }

            sources.push(Source {
                id: peer.id.clone(),
                capabilities: peer.capabilities.iter().cloned().collect(),
                policy: Self::policy(&levels, &peer.grants)?,
                reachability: Reachability::Peer(PeerRelay {
                    id: peer.id.clone(),
                    endpoint: peer.endpoint.trim_end_matches('/').to_string(),
                    fingerprint: peer.fingerprint.clone(),
                }),
            });
            identities.push(ClientIdentity {
                fingerprint: peer.fingerprint.clone(),
                name: peer.id.clone(),
                kind: IdentityKind::Relay,
                access: levels.require(&peer.access_level)?,
            });
        }

        Self::new(sources, levels, identities)
    }

    fn policy(levels: &AccessLevels, grants: &[GrantConfig]) -> Result<AccessPolicy, RelayError> {
        let mut policy = AccessPolicy::open();
        for grant in grants {
            policy.grants.push(Grant {
                level: levels.require(&grant.level)?,
                allowed_rows: grant.allowed_rows.clone(),
                allowed_columns: grant
                    .allowed_columns
                    .as_ref()
                    .map(|columns| columns.iter().cloned().collect::<BTreeSet<_>>()),
            });
        }
        Ok(policy)
    }

    /// Sources satisfying every selection, narrowed to what `level` may see.
    ///
    /// Deterministic for a given registry: results come back ordered by source id, each
    /// source at most once.
    pub fn resolve(
        &self,
        selections: &BTreeMap<String, SourceSubstitution>,
        level: &AccessLevel,
    ) -> Vec<VisibleSource> {
        if selections.is_empty() {
            return Vec::new();
        }

        let matching: Vec<Arc<Source>> = self
            .sources
            .iter()
            .filter(|source| {
                selections
                    .values()
                    .all(|selection| Self::selects(selection, source))
            })
            .cloned()
            .collect();

        AccessFilter::filter_sources(matching, level)
    }

    fn selects(selection: &SourceSubstitution, source: &Source) -> bool {
        match selection {
            SourceSubstitution::AllSourcesWith(capabilities) => source.has_capabilities(capabilities),
            // Ids of remote sources are only known to the peer, so peers always qualify
            SourceSubstitution::SourceList(ids) => {
                !source.is_local() || ids.iter().any(|id| id == &source.id)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Source>> {
        self.sources
            .binary_search_by(|source| source.id.as_str().cmp(id))
            .ok()
            .map(|idx| self.sources[idx].clone())
    }

    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    pub fn local_sources(&self) -> impl Iterator<Item = &Arc<Source>> {
        self.sources.iter().filter(|source| source.is_local())
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRelay> {
        self.sources.iter().filter_map(|source| match &source.reachability {
            Reachability::Peer(peer) => Some(peer),
            Reachability::Local(_) => None,
        })
    }

    pub fn levels(&self) -> &AccessLevels {
        &self.levels
    }

    /// Identity for a client certificate fingerprint
    pub fn identity(&self, fingerprint: &str) -> Option<&ClientIdentity> {
        self.identities.get(fingerprint)
    }
}
