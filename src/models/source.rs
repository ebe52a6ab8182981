use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::access::AccessPolicy;

/// Where a local source's rows live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EngineSpec {
    Csv {
        path: String,
        #[serde(default = "default_true")]
        has_header: bool,
    },
    Parquet {
        path: String,
    },
    /// Newline delimited JSON file
    Json {
        path: String,
    },
    /// Rows held inline, mostly for demos and tests
    Memory {
        rows: Vec<serde_json::Value>,
    },
    Postgres {
        url: String,
    },
}

fn default_true() -> bool {
    true
}

impl EngineSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineSpec::Csv { .. } => "csv",
            EngineSpec::Parquet { .. } => "parquet",
            EngineSpec::Json { .. } => "json",
            EngineSpec::Memory { .. } => "memory",
            EngineSpec::Postgres { .. } => "postgres",
        }
    }
}

/// Maps an info name onto the field a source stores it in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMapping {
    pub path: String,
    /// Expression over the field, `{v}` stands for the field path
    #[serde(default)]
    pub transform: Option<String>,
}

impl FieldMapping {
    pub fn direct(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            transform: None,
        }
    }

    /// Expression yielding the info in this source's terms
    pub fn expression(&self) -> String {
        match &self.transform {
            Some(transform) => transform.replace("{v}", &self.path),
            None => self.path.clone(),
        }
    }
}

/// A source executed by this relay
#[derive(Debug, Clone, PartialEq)]
pub struct LocalBinding {
    /// Relation name (or parenthesised SQL) the engine exposes the rows under
    pub relation: String,
    pub engine: EngineSpec,
    /// Info name to physical field. Empty means info names are column names.
    pub fields: BTreeMap<String, FieldMapping>,
}

/// A neighbouring relay, reachable only by forwarding the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRelay {
    pub id: String,
    /// Base URL of the peer's relay API
    pub endpoint: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reachability {
    Local(LocalBinding),
    Peer(PeerRelay),
}

/// An entry of the source registry
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub policy: AccessPolicy,
    pub reachability: Reachability,
}

impl Source {
    /// True when every requested capability is advertised.
    ///
    /// Peers that advertise nothing are treated as able to answer anything; the peer
    /// resolves against its own registry.
    pub fn has_capabilities(&self, requested: &[String]) -> bool {
        match &self.reachability {
            Reachability::Peer(_) if self.capabilities.is_empty() => true,
            _ => requested.iter().all(|cap| self.capabilities.contains(cap)),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.reachability, Reachability::Local(_))
    }
}
