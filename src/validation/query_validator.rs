use sqlparser::ast::{
    visit_relations, visit_relations_mut, Ident, ObjectName, ObjectNamePart, Statement,
    TableAlias, TableFactor, VisitMut, VisitorMut,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::ops::ControlFlow;

use crate::api::middleware::RelayError;
use crate::models::{QueryRequest, SourceSubstitution, Substitutions};
use crate::services::template::{
    mask, placeholder_names, render_masked, split_masked, tokenize, QueryTemplate,
    TemplateSegment, PLACEHOLDER_MASK_PREFIX,
};

pub const MAX_QUERY_LENGTH: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct ValidationOptions {
    pub max_query_length: usize,
    /// Reject substitution entries the template never references
    pub strict_substitutions: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            max_query_length: MAX_QUERY_LENGTH,
            strict_substitutions: false,
        }
    }
}

/// Structural checks run on every request before anything is dispatched
pub struct QueryValidator;

impl QueryValidator {
    /// Validate a request and turn it into a template ready for expansion.
    ///
    /// Pure: no registry access, no side effects. Requests without substitution blocks
    /// are plain SQL whose single relation becomes the entity placeholder.
    pub fn validate(
        request: &QueryRequest,
        options: &ValidationOptions,
    ) -> Result<QueryTemplate, RelayError> {
        let sql = request.sql.trim();
        if sql.is_empty() {
            return Err(RelayError::InvalidQuery("SQL query cannot be empty".to_string()));
        }
        if sql.chars().count() > options.max_query_length {
            return Err(RelayError::InvalidQuery(format!(
                "SQL string exceeds maximum length of {} characters! Either simplify query or break into multiple parts.",
                options.max_query_length
            )));
        }

        let (mut substitutions, segments) = match &request.substitution_blocks {
            Some(blocks) => {
                let substitutions = Substitutions::try_from(blocks.clone())?;
                let segments = tokenize(sql, substitutions.braces);
                (substitutions, segments)
            }
            None => (
                Substitutions::empty(),
                vec![TemplateSegment::Literal(sql.to_string())],
            ),
        };

        Self::check_placeholders(&segments, &substitutions, options)?;

        let statement = Self::parse_single_read_only(&render_masked(&segments))?;
        let relations = Self::bare_relations(&statement)?;

        let mut entities: BTreeSet<String> = substitutions
            .info
            .values()
            .map(|info| info.entity_name.clone())
            .collect();
        entities.extend(relations.iter().cloned());
        match entities.len() {
            1 => {}
            0 => {
                return Err(RelayError::InvalidQuery(
                    "The query does not name an entity; reference one through an info substitution or as the queried relation.".to_string(),
                ))
            }
            _ => {
                return Err(RelayError::InvalidQuery(
                    "There must be exactly one entity per query.".to_string(),
                ))
            }
        }
        let entity = entities.into_iter().next().unwrap_or_default();

        let segments = if relations.is_empty() {
            segments
        } else {
            Self::promote_entity_relation(statement, &entity, &segments, &mut substitutions)?
        };

        if substitutions.sources.is_empty() {
            return Err(RelayError::InvalidQuery(format!(
                "The query does not reference any source of {}; name the entity or use a source substitution.",
                entity
            )));
        }

        Ok(QueryTemplate {
            segments,
            substitutions,
            entity,
        })
    }

    /// Every placeholder needs an entry; unused entries fail only in strict mode
    fn check_placeholders(
        segments: &[TemplateSegment],
        substitutions: &Substitutions,
        options: &ValidationOptions,
    ) -> Result<(), RelayError> {
        let used = placeholder_names(segments);

        if let Some(missing) = used.iter().find(|name| !substitutions.contains(name)) {
            return Err(RelayError::Template(format!(
                "No substitution was provided for placeholder {}{}{}",
                substitutions.braces.open(),
                missing,
                substitutions.braces.close()
            )));
        }

        if options.strict_substitutions {
            let declared = substitutions.info.keys().chain(substitutions.sources.keys());
            for name in declared {
                if !used.contains(name.as_str()) {
                    return Err(RelayError::Template(format!(
                        "Substitution {} is not used by the query template",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    fn parse_single_read_only(sql: &str) -> Result<Statement, RelayError> {
        let dialect = GenericDialect {};
        let mut statements = Parser::parse_sql(&dialect, sql)
            .map_err(|e| RelayError::InvalidQuery(format!("SQL parsing error: {}", e)))?;

        if statements.len() != 1 {
            return Err(RelayError::InvalidQuery(format!(
                "Each query must contain exactly one statement. Found: {}",
                statements.len()
            )));
        }

        let statement = statements.remove(0);
        match statement {
            Statement::Query(_) => Ok(statement),
            other => Err(RelayError::InvalidQuery(format!(
                "SQL templates may only contain read-only queries (e.g. select statements), found statement: {}",
                other
            ))),
        }
    }

    /// Relations named directly in the query, excluding placeholders and top-level CTEs
    fn bare_relations(statement: &Statement) -> Result<BTreeSet<String>, RelayError> {
        let ctes: BTreeSet<String> = match statement {
            Statement::Query(query) => query
                .with
                .as_ref()
                .map(|with| {
                    with.cte_tables
                        .iter()
                        .map(|cte| cte.alias.name.value.clone())
                        .collect()
                })
                .unwrap_or_default(),
            _ => BTreeSet::new(),
        };

        let mut relations = BTreeSet::new();
        let mut invalid = None;
        let _ = visit_relations(statement, |relation| {
            match single_part_name(relation) {
                Some(name) if name.starts_with(PLACEHOLDER_MASK_PREFIX) => {}
                Some(name) if ctes.contains(&name) => {}
                Some(name) => {
                    relations.insert(name);
                }
                None => {
                    invalid = Some(relation.to_string());
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });

        match invalid {
            Some(relation) => Err(RelayError::InvalidQuery(format!(
                "Explicit table paths are not allowed, found {}",
                relation
            ))),
            None => Ok(relations),
        }
    }

    /// Turn the entity's bare relation into a source placeholder selecting every
    /// source with the entity's capability.
    fn promote_entity_relation(
        mut statement: Statement,
        entity: &str,
        segments: &[TemplateSegment],
        substitutions: &mut Substitutions,
    ) -> Result<Vec<TemplateSegment>, RelayError> {
        if substitutions.contains(entity) {
            return Err(RelayError::Template(format!(
                "Relation {} collides with a substitution of the same name",
                entity
            )));
        }

        // The placeholder may expand to a restricted CTE or a differently named table,
        // so columns qualified with the entity name need the name kept as an alias
        let _ = statement.visit(&mut AliasBareRelation { relation: entity });

        let masked = mask(entity);
        let _ = visit_relations_mut(&mut statement, |relation| {
            if single_part_name(relation).as_deref() == Some(entity) {
                *relation = ObjectName(vec![ObjectNamePart::Identifier(Ident::new(masked.clone()))]);
            }
            ControlFlow::<()>::Continue(())
        });

        let mut names: BTreeSet<String> = placeholder_names(segments)
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        names.insert(entity.to_string());

        substitutions.sources.insert(
            entity.to_string(),
            SourceSubstitution::AllSourcesWith(vec![entity.to_string()]),
        );
        Ok(split_masked(&statement.to_string(), &names))
    }
}

/// Gives every unaliased reference to `relation` an alias of its own name
struct AliasBareRelation<'a> {
    relation: &'a str,
}

impl VisitorMut for AliasBareRelation<'_> {
    type Break = ();

    fn pre_visit_table_factor(&mut self, table_factor: &mut TableFactor) -> ControlFlow<()> {
        if let TableFactor::Table { name, alias, .. } = table_factor {
            if alias.is_none() && single_part_name(name).as_deref() == Some(self.relation) {
                *alias = Some(TableAlias {
                    explicit: true,
                    name: Ident::new(self.relation),
                    columns: Vec::new(),
                });
            }
        }
        ControlFlow::Continue(())
    }
}

fn single_part_name(name: &ObjectName) -> Option<String> {
    match name.0.as_slice() {
        [ObjectNamePart::Identifier(ident)] => Some(ident.value.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InfoSubstitutionSpec, SubstitutionBlocks};

    const MULTI_ENTITY: &str = "invalid query: There must be exactly one entity per query.";

    fn validate(request: &QueryRequest) -> Result<QueryTemplate, RelayError> {
        QueryValidator::validate(request, &ValidationOptions::default())
    }

    fn templated(sql: &str, info: &[(&str, &str, &str)], braces: usize) -> QueryRequest {
        let mut blocks = SubstitutionBlocks::default();
        blocks.num_capture_braces = braces;
        for (name, entity, info_name) in info {
            blocks
                .info_substitutions
                .insert(name.to_string(), InfoSubstitutionSpec::new(*entity, *info_name));
        }
        blocks.source_substitutions.insert(
            "src".to_string(),
            SourceSubstitution::AllSourcesWith(vec!["lineitem".to_string()]),
        );
        QueryRequest::new(sql).with_substitutions(blocks)
    }

    #[test]
    fn test_plain_sql_becomes_entity_template() {
        let request = QueryRequest::new(
            "select returnflag, count(*) as count_order from lineitem where shipdate <= date '1998-09-02' group by returnflag",
        );
        let template = validate(&request).unwrap();
        assert_eq!(template.entity, "lineitem");
        assert_eq!(
            template.substitutions.sources["lineitem"],
            SourceSubstitution::AllSourcesWith(vec!["lineitem".to_string()])
        );
        assert_eq!(
            template.placeholders().into_iter().collect::<Vec<_>>(),
            vec!["lineitem"]
        );
    }

    #[test]
    fn test_plain_sql_keeps_literal_braces() {
        let request = QueryRequest::new(
            "select count(*) from lineitem where '{tax_val}'='{tax_val}'",
        );
        let template = validate(&request).unwrap();
        let literal: String = template
            .segments
            .iter()
            .filter_map(|s| match s {
                TemplateSegment::Literal(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(literal.contains("'{tax_val}' = '{tax_val}'"));
    }

    #[test]
    fn test_two_relations_rejected() {
        let request =
            QueryRequest::new("with a as (select * from user_tables) select * from user_data_folder");
        let err = validate(&request).unwrap_err();
        assert_eq!(err.to_string(), MULTI_ENTITY);
    }

    #[test]
    fn test_multi_entity_template_rejected() {
        let request = templated(
            "select {tax}, {price} from {src}",
            &[("tax", "lineitem", "tax"), ("price", "orders", "totalprice")],
            1,
        );
        let err = validate(&request).unwrap_err();
        assert_eq!(err.to_string(), MULTI_ENTITY);
    }

    #[test]
    fn test_promoted_relation_keeps_its_name_as_alias() {
        let template = validate(&QueryRequest::new(
            "select lineitem.quantity from lineitem where lineitem.returnflag = 'N'",
        ))
        .unwrap();
        assert_eq!(
            template.segments,
            vec![
                TemplateSegment::Literal("SELECT lineitem.quantity FROM ".to_string()),
                TemplateSegment::Placeholder("lineitem".to_string()),
                TemplateSegment::Literal(" AS lineitem WHERE lineitem.returnflag = 'N'".to_string()),
            ]
        );

        let aliased = validate(&QueryRequest::new("select l.quantity from lineitem l")).unwrap();
        assert_eq!(
            aliased.segments.last(),
            Some(&TemplateSegment::Literal(" l".to_string()))
        );
    }

    #[test]
    fn test_source_only_template_has_no_entity() {
        let request = templated("select count(*) from {src}", &[], 1);
        let err = validate(&request).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid query: The query does not name an entity; reference one through an info substitution or as the queried relation."
        );
    }

    #[test]
    fn test_cte_reference_is_not_an_entity() {
        let request = templated(
            "with x as (select {tax} from {src}) select * from x",
            &[("tax", "lineitem", "tax")],
            1,
        );
        let template = validate(&request).unwrap();
        assert_eq!(template.entity, "lineitem");
        assert!(!template.substitutions.sources.contains_key("x"));
    }

    #[test]
    fn test_unmatched_placeholder_is_template_error() {
        let request = templated(
            "select {tax} from {src} where '{tax_val}'='{tax_val}'",
            &[("tax", "lineitem", "tax")],
            1,
        );
        let err = validate(&request).unwrap_err();
        assert!(matches!(err, RelayError::Template(_)));
        assert!(err.to_string().contains("{tax_val}"));
    }

    #[test]
    fn test_double_braces_accept_literal_single_braces() {
        let request = templated(
            "select {{tax}} from {{src}} where '{tax_val}'='{tax_val}'",
            &[("tax", "lineitem", "tax")],
            2,
        );
        let template = validate(&request).unwrap();
        assert_eq!(
            template.placeholders().into_iter().collect::<Vec<_>>(),
            vec!["src", "tax"]
        );
    }

    #[test]
    fn test_unused_substitution_policy() {
        let request = templated(
            "select {tax} from {src}",
            &[("tax", "lineitem", "tax"), ("unused", "lineitem", "discount")],
            1,
        );
        assert!(validate(&request).is_ok());

        let strict = ValidationOptions {
            strict_substitutions: true,
            ..ValidationOptions::default()
        };
        let err = QueryValidator::validate(&request, &strict).unwrap_err();
        assert!(matches!(err, RelayError::Template(_)));
    }

    #[test]
    fn test_write_statement_rejected() {
        let err = validate(&QueryRequest::new("delete from lineitem")).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("invalid query: SQL templates may only contain read-only queries"));
    }

    #[test]
    fn test_multiple_statements_rejected() {
        let err = validate(&QueryRequest::new("select 1 from a; select 2 from a")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid query: Each query must contain exactly one statement. Found: 2"
        );
    }

    #[test]
    fn test_length_limit() {
        let options = ValidationOptions {
            max_query_length: 20,
            strict_substitutions: false,
        };
        let request = QueryRequest::new("select returnflag from lineitem");
        let err = QueryValidator::validate(&request, &options).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum length of 20 characters"));
    }

    #[test]
    fn test_qualified_relation_rejected() {
        let err = validate(&QueryRequest::new("select * from tpch.lineitem")).unwrap_err();
        assert!(err.to_string().contains("Explicit table paths are not allowed"));
    }

    #[test]
    fn test_query_without_source_rejected() {
        let mut request = templated("select {tax}", &[("tax", "lineitem", "tax")], 1);
        if let Some(blocks) = request.substitution_blocks.as_mut() {
            blocks.source_substitutions.clear();
        }
        let err = validate(&request).unwrap_err();
        assert!(matches!(err, RelayError::InvalidQuery(_)));
    }
}
