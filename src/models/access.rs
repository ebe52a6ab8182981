use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::api::middleware::RelayError;

/// A named access level with its position in the privilege ordering
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AccessLevel {
    pub name: String,
    /// 0 is the least privileged level
    pub rank: usize,
}

impl PartialOrd for AccessLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AccessLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank).then_with(|| self.name.cmp(&other.name))
    }
}

/// Ordered set of access levels, least privileged first
#[derive(Debug, Clone)]
pub struct AccessLevels {
    ordered: Vec<String>,
}

impl AccessLevels {
    pub fn new(ordered: Vec<String>) -> Result<Self, RelayError> {
        if ordered.is_empty() {
            return Err(RelayError::Config("at least one access level is required".to_string()));
        }
        let unique: BTreeSet<&String> = ordered.iter().collect();
        if unique.len() != ordered.len() {
            return Err(RelayError::Config("access levels must be unique".to_string()));
        }
        Ok(Self { ordered })
    }

    pub fn get(&self, name: &str) -> Option<AccessLevel> {
        self.ordered
            .iter()
            .position(|level| level == name)
            .map(|rank| AccessLevel {
                name: name.to_string(),
                rank,
            })
    }

    pub fn require(&self, name: &str) -> Result<AccessLevel, RelayError> {
        self.get(name)
            .ok_or_else(|| RelayError::Config(format!("unknown access level '{}'", name)))
    }

    pub fn lowest(&self) -> AccessLevel {
        AccessLevel {
            name: self.ordered[0].clone(),
            rank: 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = AccessLevel> + '_ {
        self.ordered.iter().enumerate().map(|(rank, name)| AccessLevel {
            name: name.clone(),
            rank,
        })
    }
}

/// What one access level is allowed to see of a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub level: AccessLevel,
    /// Row predicate; `None` means every row
    pub allowed_rows: Option<String>,
    /// Physical columns; `None` means every column
    pub allowed_columns: Option<BTreeSet<String>>,
}

/// Access policy attached to a source or peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    pub grants: Vec<Grant>,
}

impl AccessPolicy {
    /// Policy that exposes everything to every level
    pub fn open() -> Self {
        Self { grants: Vec::new() }
    }

    pub fn is_open(&self) -> bool {
        self.grants.is_empty()
    }
}

/// Combined grant for one caller level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveGrant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_rows: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_columns: Option<BTreeSet<String>>,
}

impl EffectiveGrant {
    pub fn unrestricted() -> Self {
        Self {
            allowed_rows: None,
            allowed_columns: None,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed_rows.is_none() && self.allowed_columns.is_none()
    }

    /// What is left visible under both grants: rows must pass both predicates and only
    /// columns allowed by both remain.
    pub fn intersect(&self, other: &EffectiveGrant) -> EffectiveGrant {
        let allowed_rows = match (&self.allowed_rows, &other.allowed_rows) {
            (Some(a), Some(b)) if a == b => Some(a.clone()),
            (Some(a), Some(b)) => Some(format!("({}) AND ({})", a, b)),
            (Some(rows), None) | (None, Some(rows)) => Some(rows.clone()),
            (None, None) => None,
        };
        let allowed_columns = match (&self.allowed_columns, &other.allowed_columns) {
            (Some(a), Some(b)) => Some(a.intersection(b).cloned().collect()),
            (Some(columns), None) | (None, Some(columns)) => Some(columns.clone()),
            (None, None) => None,
        };
        EffectiveGrant {
            allowed_rows,
            allowed_columns,
        }
    }

    pub fn column_visible(&self, column: &str) -> bool {
        match &self.allowed_columns {
            Some(columns) => columns.contains(column),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    User,
    Relay,
}

/// Authenticated client, resolved from its certificate fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub fingerprint: String,
    pub name: String,
    pub kind: IdentityKind,
    pub access: AccessLevel,
}

impl ClientIdentity {
    pub fn is_relay(&self) -> bool {
        self.kind == IdentityKind::Relay
    }
}

/// Who a request is evaluated for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Fingerprint of the connection that delivered the request
    pub direct_fingerprint: String,
    /// Fingerprint of the user the request originated from
    pub requesting_fingerprint: String,
    pub access: AccessLevel,
    pub via_relay: bool,
}

impl Caller {
    /// The connection itself, acting for nobody else
    pub fn connection(identity: &ClientIdentity) -> Self {
        Self {
            direct_fingerprint: identity.fingerprint.clone(),
            requesting_fingerprint: identity.fingerprint.clone(),
            access: identity.access.clone(),
            via_relay: identity.is_relay(),
        }
    }

    /// May this caller redeem something issued to `owner`?
    pub fn may_access(&self, owners: &[String]) -> bool {
        owners
            .iter()
            .any(|owner| owner == &self.direct_fingerprint || owner == &self.requesting_fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels() -> AccessLevels {
        AccessLevels::new(vec!["default_access".to_string(), "all_access".to_string()]).unwrap()
    }

    #[test]
    fn test_access_level_ordering() {
        let levels = levels();
        let low = levels.get("default_access").unwrap();
        let high = levels.get("all_access").unwrap();
        assert!(low < high);
        assert_eq!(levels.lowest(), low);
        assert!(levels.get("root").is_none());
    }

    #[test]
    fn test_duplicate_levels_rejected() {
        let err = AccessLevels::new(vec!["a".to_string(), "a".to_string()]).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_effective_grant_column_visibility() {
        let grant = EffectiveGrant {
            allowed_rows: None,
            allowed_columns: Some(["tax".to_string()].into_iter().collect()),
        };
        assert!(grant.column_visible("tax"));
        assert!(!grant.column_visible("discount"));
        assert!(EffectiveGrant::unrestricted().column_visible("discount"));
    }

    #[test]
    fn test_intersected_grants_narrow_both_ways() {
        let rows_only = EffectiveGrant {
            allowed_rows: Some("(returnflag = 'N')".to_string()),
            allowed_columns: None,
        };
        let columns_only = EffectiveGrant {
            allowed_rows: Some("(quantity > 5)".to_string()),
            allowed_columns: Some(["quantity".to_string(), "returnflag".to_string()].into_iter().collect()),
        };

        let both = rows_only.intersect(&columns_only);
        assert_eq!(
            both.allowed_rows.as_deref(),
            Some("((returnflag = 'N')) AND ((quantity > 5))")
        );
        assert!(both.column_visible("quantity"));
        assert!(!both.column_visible("tax"));

        assert_eq!(rows_only.intersect(&EffectiveGrant::unrestricted()), rows_only);
        assert_eq!(rows_only.intersect(&rows_only), rows_only);
    }

    #[test]
    fn test_caller_may_access_as_forwarding_relay() {
        let caller = Caller {
            direct_fingerprint: "relay-fp".to_string(),
            requesting_fingerprint: "user-fp".to_string(),
            access: levels().lowest(),
            via_relay: true,
        };
        assert!(caller.may_access(&["user-fp".to_string()]));
        assert!(caller.may_access(&["relay-fp".to_string()]));
        assert!(!caller.may_access(&["someone-else".to_string()]));
    }
}
