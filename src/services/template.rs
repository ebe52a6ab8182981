// Template Engine
//
// Splits query templates into literal text and placeholders, and expands a validated
// template into the concrete query a single local source executes.

use std::collections::{BTreeMap, BTreeSet};

use crate::api::middleware::RelayError;
use crate::models::{
    is_placeholder_name, CaptureBraces, EffectiveGrant, InfoResolution, LocalBinding,
    Substitutions,
};
use crate::services::access_control::{AccessFilter, ResolvedInfo};

/// Prefix of the identifiers placeholders are masked with while the SQL is parsed
pub const PLACEHOLDER_MASK_PREFIX: &str = "__relay_ph_";
/// Prefix of the CTEs that wrap access-restricted sources
pub const SOURCE_CTE_PREFIX: &str = "__relay_src_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSegment {
    Literal(String),
    Placeholder(String),
}

/// A template that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTemplate {
    pub segments: Vec<TemplateSegment>,
    pub substitutions: Substitutions,
    /// The single entity the query is about
    pub entity: String,
}

impl QueryTemplate {
    pub fn placeholders(&self) -> BTreeSet<&str> {
        placeholder_names(&self.segments)
    }
}

pub fn placeholder_names(segments: &[TemplateSegment]) -> BTreeSet<&str> {
    segments
        .iter()
        .filter_map(|segment| match segment {
            TemplateSegment::Placeholder(name) => Some(name.as_str()),
            TemplateSegment::Literal(_) => None,
        })
        .collect()
}

pub fn mask(name: &str) -> String {
    format!("{}{}__", PLACEHOLDER_MASK_PREFIX, name)
}

/// Split `sql` into literals and placeholders.
///
/// Only identifier-shaped tokens wrapped in exactly the configured number of braces are
/// placeholders. Everything else, including `{value}` under double-brace capture, stays literal.
pub fn tokenize(sql: &str, braces: CaptureBraces) -> Vec<TemplateSegment> {
    let open = braces.open();
    let close = braces.close();

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = sql;

    while let Some(start) = rest.find(&open) {
        let after_open = &rest[start + open.len()..];
        let name_len = after_open
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after_open.len());
        let name = &after_open[..name_len];

        if is_placeholder_name(name) && after_open[name_len..].starts_with(&close) {
            literal.push_str(&rest[..start]);
            if !literal.is_empty() {
                segments.push(TemplateSegment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(TemplateSegment::Placeholder(name.to_string()));
            rest = &after_open[name_len + close.len()..];
        } else {
            // '{' is one byte, so this stays on a char boundary
            literal.push_str(&rest[..start + 1]);
            rest = &rest[start + 1..];
        }
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(TemplateSegment::Literal(literal));
    }
    segments
}

/// Render segments with every placeholder replaced by its mask identifier
pub fn render_masked(segments: &[TemplateSegment]) -> String {
    segments
        .iter()
        .map(|segment| match segment {
            TemplateSegment::Literal(text) => text.clone(),
            TemplateSegment::Placeholder(name) => mask(name),
        })
        .collect()
}

/// Inverse of [`render_masked`] for a known set of placeholder names
pub fn split_masked(sql: &str, names: &BTreeSet<String>) -> Vec<TemplateSegment> {
    // Longest first so `a_b` wins over `a` when both masks could match
    let mut masks: Vec<(String, &String)> = names.iter().map(|name| (mask(name), name)).collect();
    masks.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = sql;

    while let Some(start) = rest.find(PLACEHOLDER_MASK_PREFIX) {
        let candidate = &rest[start..];
        match masks.iter().find(|(masked, _)| candidate.starts_with(masked.as_str())) {
            Some((masked, name)) => {
                literal.push_str(&rest[..start]);
                if !literal.is_empty() {
                    segments.push(TemplateSegment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(TemplateSegment::Placeholder((*name).clone()));
                rest = &rest[start + masked.len()..];
            }
            None => {
                let skip = start + PLACEHOLDER_MASK_PREFIX.len();
                literal.push_str(&rest[..skip]);
                rest = &rest[skip..];
            }
        }
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(TemplateSegment::Literal(literal));
    }
    segments
}

/// Expands validated templates against individual sources
pub struct TemplateEngine;

impl TemplateEngine {
    /// Produce the concrete query for one local source under one effective grant.
    ///
    /// # Arguments
    /// * `template` - Validated template
    /// * `source_id` - Source the query is for, used in error messages
    /// * `binding` - How the source is stored locally
    /// * `grant` - What the caller may see of the source
    pub fn expand(
        template: &QueryTemplate,
        source_id: &str,
        binding: &LocalBinding,
        grant: &EffectiveGrant,
    ) -> Result<String, RelayError> {
        let mut body = String::new();
        let mut ctes: BTreeMap<String, String> = BTreeMap::new();

        for segment in &template.segments {
            match segment {
                TemplateSegment::Literal(text) => body.push_str(text),
                TemplateSegment::Placeholder(name) => {
                    if let Some(info) = template.substitutions.info.get(name) {
                        let resolved = AccessFilter::filter_substitution(info, binding, grant);
                        body.push_str(&Self::render_info(&info.info_name, info.resolution, resolved));
                    } else if template.substitutions.sources.contains_key(name) {
                        if grant.is_unrestricted() {
                            body.push_str(&binding.relation);
                        } else {
                            let cte_name = format!("{}{}", SOURCE_CTE_PREFIX, name);
                            ctes.entry(cte_name.clone())
                                .or_insert_with(|| Self::restricted_relation(binding, grant));
                            body.push_str(&cte_name);
                        }
                    } else {
                        return Err(RelayError::Template(format!(
                            "No substitution was provided for placeholder {} while expanding for source {}",
                            name, source_id
                        )));
                    }
                }
            }
        }

        let ctes: Vec<String> = ctes
            .into_iter()
            .map(|(name, query)| format!("{} AS ({})", name, query))
            .collect();
        Ok(prepend_ctes(&body, &ctes))
    }

    fn render_info(info_name: &str, resolution: InfoResolution, resolved: ResolvedInfo) -> String {
        match (resolution, resolved) {
            (InfoResolution::DataField, ResolvedInfo::Field { path, .. }) => path,
            (InfoResolution::DataField, ResolvedInfo::Suppressed) => "NULL".to_string(),
            (InfoResolution::Column { alias: true }, ResolvedInfo::Field { expression, .. }) => {
                format!("{} AS {}", expression, info_name)
            }
            (InfoResolution::Column { alias: false }, ResolvedInfo::Field { expression, .. }) => {
                expression
            }
            (InfoResolution::Column { alias: true }, ResolvedInfo::Suppressed) => {
                format!("NULL AS {}", info_name)
            }
            (InfoResolution::Column { alias: false }, ResolvedInfo::Suppressed) => "NULL".to_string(),
        }
    }

    fn restricted_relation(binding: &LocalBinding, grant: &EffectiveGrant) -> String {
        let columns = match &grant.allowed_columns {
            Some(columns) if !columns.is_empty() => {
                columns.iter().cloned().collect::<Vec<_>>().join(", ")
            }
            // An empty column grant still exposes row counts, nothing else
            Some(_) => "1 AS __relay_row__".to_string(),
            None => "*".to_string(),
        };
        match &grant.allowed_rows {
            Some(rows) => format!("SELECT {} FROM {} WHERE {}", columns, binding.relation, rows),
            None => format!("SELECT {} FROM {}", columns, binding.relation),
        }
    }
}

fn starts_with_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &sql[keyword.len()..];
    match rest.chars().next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => None,
        _ => Some(rest),
    }
}

/// Put generated CTEs in front of the query, merging with a leading WITH clause
fn prepend_ctes(sql: &str, ctes: &[String]) -> String {
    if ctes.is_empty() {
        return sql.to_string();
    }
    let generated = ctes.join(", ");
    let trimmed = sql.trim_start();

    match starts_with_keyword(trimmed, "WITH") {
        Some(rest) => {
            let rest = rest.trim_start();
            match starts_with_keyword(rest, "RECURSIVE") {
                Some(after) => format!("WITH RECURSIVE {}, {}", generated, after.trim_start()),
                None => format!("WITH {}, {}", generated, rest),
            }
        }
        None => format!("WITH {} {}", generated, trimmed),
    }
}
