use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::api::middleware::RelayError;
use crate::models::EffectiveGrant;

/// Query request as it arrives on either transport
///
/// Also the envelope a relay uses when forwarding the original request to a peer.
/// Only relays may set the forwarding fields; see [`QueryRequest::received`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitution_blocks: Option<SubstitutionBlocks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_uuid: Option<Uuid>,
    /// Relays this request has already passed through, origin first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relay_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_limit: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requesting_fingerprint: Option<String>,
    /// What the forwarding relay's grant lets the requester see of this relay's data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restriction: Option<EffectiveGrant>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            substitution_blocks: None,
            request_uuid: None,
            relay_path: Vec::new(),
            hop_limit: None,
            access_level: None,
            requesting_fingerprint: None,
            restriction: None,
        }
    }

    /// The request as this relay acts on it. Forwarding fields from anyone but a relay
    /// are dropped, so users cannot pick a request id, path, hop budget or restriction.
    pub fn received(&self, via_relay: bool) -> Self {
        if via_relay {
            return self.clone();
        }
        Self {
            sql: self.sql.clone(),
            substitution_blocks: self.substitution_blocks.clone(),
            ..Self::new("")
        }
    }

    pub fn with_substitutions(mut self, blocks: SubstitutionBlocks) -> Self {
        self.substitution_blocks = Some(blocks);
        self
    }

    /// Build the request sent to a peer relay.
    ///
    /// The template and substitutions travel untouched; only the forwarding envelope changes.
    pub fn forwarded(
        &self,
        request_uuid: Uuid,
        via_relay: &str,
        remaining_hops: u8,
        access_level: &str,
        requesting_fingerprint: &str,
    ) -> Self {
        let mut relay_path = self.relay_path.clone();
        if !relay_path.iter().any(|id| id == via_relay) {
            relay_path.push(via_relay.to_string());
        }

        Self {
            sql: self.sql.clone(),
            substitution_blocks: self.substitution_blocks.clone(),
            request_uuid: Some(request_uuid),
            relay_path,
            hop_limit: Some(remaining_hops),
            access_level: Some(access_level.to_string()),
            requesting_fingerprint: Some(requesting_fingerprint.to_string()),
            restriction: self.restriction.clone(),
        }
    }

    /// Replace the restriction the receiving relay applies to everything it returns
    pub fn restricted_to(mut self, grant: &EffectiveGrant) -> Self {
        self.restriction = (!grant.is_unrestricted()).then(|| grant.clone());
        self
    }
}

/// Substitution blocks in their wire form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstitutionBlocks {
    #[serde(default)]
    pub info_substitutions: HashMap<String, InfoSubstitutionSpec>,
    #[serde(default)]
    pub source_substitutions: HashMap<String, SourceSubstitution>,
    #[serde(default = "default_capture_braces")]
    pub num_capture_braces: usize,
}

impl Default for SubstitutionBlocks {
    fn default() -> Self {
        Self {
            info_substitutions: HashMap::new(),
            source_substitutions: HashMap::new(),
            num_capture_braces: default_capture_braces(),
        }
    }
}

fn default_capture_braces() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfoSubstitutionSpec {
    pub entity_name: String,
    pub info_name: String,
    #[serde(default = "default_true")]
    pub include_info: bool,
    #[serde(default)]
    pub exclude_info_alias: bool,
    #[serde(default)]
    pub include_data_field: bool,
}

impl InfoSubstitutionSpec {
    pub fn new(entity_name: impl Into<String>, info_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            info_name: info_name.into(),
            include_info: true,
            exclude_info_alias: false,
            include_data_field: false,
        }
    }
}

/// Source selection predicate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceSubstitution {
    /// Every source advertising all listed capabilities
    AllSourcesWith(Vec<String>),
    /// Explicit source ids
    SourceList(Vec<String>),
}

/// How an info placeholder renders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoResolution {
    /// The physical field backing the info in a given source
    DataField,
    /// A column expression, optionally aliased as the info name
    Column { alias: bool },
}

/// Validated info substitution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoSubstitution {
    pub entity_name: String,
    pub info_name: String,
    pub resolution: InfoResolution,
}

impl TryFrom<(&str, InfoSubstitutionSpec)> for InfoSubstitution {
    type Error = RelayError;

    fn try_from((placeholder, spec): (&str, InfoSubstitutionSpec)) -> Result<Self, Self::Error> {
        if spec.entity_name.trim().is_empty() || spec.info_name.trim().is_empty() {
            return Err(RelayError::Template(format!(
                "Information Substitution {} must name both an entity and an info",
                placeholder
            )));
        }

        let resolution = if spec.include_data_field {
            InfoResolution::DataField
        } else if spec.include_info {
            InfoResolution::Column {
                alias: !spec.exclude_info_alias,
            }
        } else {
            return Err(RelayError::Template(format!(
                "Information Substitution must have at least one of include_data_field or include_info set to true for {}",
                placeholder
            )));
        };

        Ok(Self {
            entity_name: spec.entity_name,
            info_name: spec.info_name,
            resolution,
        })
    }
}

/// Placeholder capture mode: `{name}` or `{{name}}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureBraces(usize);

impl CaptureBraces {
    pub const SINGLE: CaptureBraces = CaptureBraces(1);
    pub const DOUBLE: CaptureBraces = CaptureBraces(2);

    pub fn new(count: usize) -> Result<Self, RelayError> {
        match count {
            1 | 2 => Ok(CaptureBraces(count)),
            other => Err(RelayError::Template(format!(
                "num_capture_braces must be 1 or 2, got {}",
                other
            ))),
        }
    }

    pub fn count(&self) -> usize {
        self.0
    }

    pub fn open(&self) -> String {
        "{".repeat(self.0)
    }

    pub fn close(&self) -> String {
        "}".repeat(self.0)
    }
}

/// Typed substitution map, checked at construction
#[derive(Debug, Clone, PartialEq)]
pub struct Substitutions {
    pub info: BTreeMap<String, InfoSubstitution>,
    pub sources: BTreeMap<String, SourceSubstitution>,
    pub braces: CaptureBraces,
}

impl Substitutions {
    pub fn empty() -> Self {
        Self {
            info: BTreeMap::new(),
            sources: BTreeMap::new(),
            braces: CaptureBraces::SINGLE,
        }
    }

    pub fn contains(&self, placeholder: &str) -> bool {
        self.info.contains_key(placeholder) || self.sources.contains_key(placeholder)
    }
}

impl TryFrom<SubstitutionBlocks> for Substitutions {
    type Error = RelayError;

    fn try_from(blocks: SubstitutionBlocks) -> Result<Self, Self::Error> {
        let braces = CaptureBraces::new(blocks.num_capture_braces)?;

        let mut info = BTreeMap::new();
        for (placeholder, spec) in blocks.info_substitutions {
            check_placeholder_name(&placeholder)?;
            let substitution = InfoSubstitution::try_from((placeholder.as_str(), spec))?;
            info.insert(placeholder, substitution);
        }

        let mut sources = BTreeMap::new();
        for (placeholder, selection) in blocks.source_substitutions {
            check_placeholder_name(&placeholder)?;
            if info.contains_key(&placeholder) {
                return Err(RelayError::Template(format!(
                    "Placeholder {} is declared as both an info and a source substitution",
                    placeholder
                )));
            }
            let empty = match &selection {
                SourceSubstitution::AllSourcesWith(caps) => caps.is_empty(),
                SourceSubstitution::SourceList(ids) => ids.is_empty(),
            };
            if empty {
                return Err(RelayError::Template(format!(
                    "Source Substitution {} must select at least one capability or source",
                    placeholder
                )));
            }
            sources.insert(placeholder, selection);
        }

        Ok(Self { info, sources, braces })
    }
}

/// Placeholder names are plain identifiers
pub fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_placeholder_name(name: &str) -> Result<(), RelayError> {
    if is_placeholder_name(name) {
        Ok(())
    } else {
        Err(RelayError::Template(format!(
            "Substitution key {:?} is not a valid placeholder name",
            name
        )))
    }
}
