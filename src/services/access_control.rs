// Access Control Filter
//
// Narrows the resolved source set by access level and decides which rows and
// columns of a visible source a caller may read.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::api::middleware::RelayError;
use crate::models::{
    AccessLevel, AccessLevels, AccessPolicy, Caller, ClientIdentity, EffectiveGrant,
    InfoSubstitution, LocalBinding, QueryRequest, Source,
};

/// Outcome of filtering one info substitution for one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedInfo {
    Field { path: String, expression: String },
    /// Not stored by the source, or hidden from the caller
    Suppressed,
}

/// A source the caller may query, with what it may see
#[derive(Debug, Clone)]
pub struct VisibleSource {
    pub source: Arc<Source>,
    pub grant: EffectiveGrant,
}

pub struct AccessFilter;

impl AccessFilter {
    /// Union of every grant at or below `level`. `None` means the source is hidden.
    ///
    /// Raising the level only adds grants to the union, so visibility never shrinks.
    pub fn effective_grant(policy: &AccessPolicy, level: &AccessLevel) -> Option<EffectiveGrant> {
        if policy.is_open() {
            return Some(EffectiveGrant::unrestricted());
        }

        let applicable: Vec<_> = policy
            .grants
            .iter()
            .filter(|grant| grant.level.rank <= level.rank)
            .collect();
        if applicable.is_empty() {
            return None;
        }

        let allowed_rows = if applicable.iter().any(|grant| grant.allowed_rows.is_none()) {
            None
        } else {
            let predicates: BTreeSet<&str> = applicable
                .iter()
                .filter_map(|grant| grant.allowed_rows.as_deref())
                .collect();
            Some(
                predicates
                    .into_iter()
                    .map(|predicate| format!("({})", predicate))
                    .collect::<Vec<_>>()
                    .join(" OR "),
            )
        };

        let allowed_columns = if applicable.iter().any(|grant| grant.allowed_columns.is_none()) {
            None
        } else {
            Some(
                applicable
                    .iter()
                    .filter_map(|grant| grant.allowed_columns.as_ref())
                    .flatten()
                    .cloned()
                    .collect(),
            )
        };

        Some(EffectiveGrant {
            allowed_rows,
            allowed_columns,
        })
    }

    /// Drop the sources `level` may not see
    pub fn filter_sources(sources: Vec<Arc<Source>>, level: &AccessLevel) -> Vec<VisibleSource> {
        sources
            .into_iter()
            .filter_map(|source| {
                let grant = Self::effective_grant(&source.policy, level);
                if grant.is_none() {
                    tracing::debug!("Source {} hidden from access level {}", source.id, level.name);
                }
                grant.map(|grant| VisibleSource { source, grant })
            })
            .collect()
    }

    /// Resolve an info substitution against a source's field map and the caller's grant
    pub fn filter_substitution(
        substitution: &InfoSubstitution,
        binding: &LocalBinding,
        grant: &EffectiveGrant,
    ) -> ResolvedInfo {
        let (path, expression) = match binding.fields.get(&substitution.info_name) {
            Some(mapping) => (mapping.path.clone(), mapping.expression()),
            None if binding.fields.is_empty() => {
                (substitution.info_name.clone(), substitution.info_name.clone())
            }
            None => return ResolvedInfo::Suppressed,
        };

        if grant.column_visible(&path) {
            ResolvedInfo::Field { path, expression }
        } else {
            ResolvedInfo::Suppressed
        }
    }

    /// Work out who a request is evaluated for.
    ///
    /// Users get their own level. A forwarding relay may assert a level for the user it
    /// acts for, but never above the level granted to the relay itself.
    pub fn caller_for(
        identity: &ClientIdentity,
        request: &QueryRequest,
        levels: &AccessLevels,
    ) -> Result<Caller, RelayError> {
        if !identity.is_relay() {
            return Ok(Caller {
                direct_fingerprint: identity.fingerprint.clone(),
                requesting_fingerprint: identity.fingerprint.clone(),
                access: identity.access.clone(),
                via_relay: false,
            });
        }

        let asserted = match request.access_level.as_deref() {
            Some(name) => levels.get(name).ok_or_else(|| {
                RelayError::Forbidden(format!("unknown access level '{}'", name))
            })?,
            None => levels.lowest(),
        };
        let access = if asserted > identity.access {
            tracing::warn!(
                "Relay {} asserted access level {} above its own {}, capping",
                identity.name,
                asserted.name,
                identity.access.name
            );
            identity.access.clone()
        } else {
            asserted
        };

        Ok(Caller {
            direct_fingerprint: identity.fingerprint.clone(),
            requesting_fingerprint: request
                .requesting_fingerprint
                .clone()
                .unwrap_or_else(|| identity.fingerprint.clone()),
            access,
            via_relay: true,
        })
    }
}
