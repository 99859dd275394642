//! The read-only view of a Trino request that routing rules evaluate against.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use http::HeaderMap;
use tracing::debug;

use crate::{
    sql::{self, QueryType, RawIdentifier, ResourceGroupQueryType, Token},
    trino_headers,
};

/// Structured projection of a Trino HTTP request.
///
/// All identifier sets are fully qualified with `defaultCatalog`/`defaultSchema` where
/// possible. References that cannot be qualified end up in [`QueryAttributes::unqualified`]
/// and are excluded from the qualified sets.
#[derive(Clone, Debug, Default)]
pub struct QueryAttributes {
    pub user: Option<String>,
    pub source: Option<String>,
    pub client_tags: HashSet<String>,
    pub client_info: Option<String>,

    pub default_catalog: Option<String>,
    pub default_schema: Option<String>,
    pub prepared_statements: BTreeMap<String, String>,

    /// Value of the `X-Trino-Routing-Group` header, captured here so that selectors stay
    /// pure functions of this view.
    pub requested_routing_group: Option<String>,

    pub query_type: QueryType,
    pub resource_group_query_type: ResourceGroupQueryType,

    pub catalogs: BTreeSet<String>,
    pub schemas: BTreeSet<String>,
    pub catalog_schemas: BTreeSet<String>,
    pub tables: BTreeSet<String>,
    pub unqualified: BTreeSet<String>,

    /// The SQL as received, kept for query-history persistence. Not exposed to rules.
    pub raw_sql: Option<String>,
}

impl QueryAttributes {
    /// Minimal view for requests that carry no statement (everything that is not a
    /// `POST /v1/statement`).
    pub fn from_headers_only(headers: &HeaderMap) -> Self {
        Self {
            user: trino_headers::get_string(headers, trino_headers::TRINO_USER_HEADER),
            source: trino_headers::get_string(headers, trino_headers::TRINO_SOURCE_HEADER),
            client_tags: trino_headers::get_client_tags(headers),
            client_info: trino_headers::get_string(headers, trino_headers::TRINO_CLIENT_INFO_HEADER),
            requested_routing_group: trino_headers::get_string(
                headers,
                trino_headers::TRINO_ROUTING_GROUP_HEADER,
            ),
            query_type: QueryType::Unknown,
            resource_group_query_type: ResourceGroupQueryType::Unknown,
            ..Default::default()
        }
    }

    /// Full view for a new-statement request. Never fails: malformed SQL degrades to
    /// `queryType = unknown` with empty identifier sets.
    pub fn from_statement_request(headers: &HeaderMap, sql_text: &str) -> Self {
        let mut attributes = Self::from_headers_only(headers);
        attributes.default_catalog =
            trino_headers::get_string(headers, trino_headers::TRINO_CATALOG_HEADER);
        attributes.default_schema =
            trino_headers::get_string(headers, trino_headers::TRINO_SCHEMA_HEADER);
        attributes.prepared_statements = trino_headers::get_prepared_statements(headers);
        attributes.raw_sql = Some(sql_text.to_string());

        attributes.extract_from_sql(sql_text);
        attributes
    }

    fn extract_from_sql(&mut self, sql_text: &str) {
        // `EXECUTE stmt` routes based on what the prepared statement does, not on the
        // EXECUTE shell around it.
        let effective_sql = match self.resolve_execute(sql_text) {
            Ok(Some(prepared_sql)) => prepared_sql,
            Ok(None) => sql_text.to_string(),
            Err(error) => {
                debug!(error = %error, "Failed to tokenize statement, using a minimal attribute view");
                return;
            }
        };

        let analysis = match sql::analyze(&effective_sql) {
            Ok(analysis) => analysis,
            Err(error) => {
                debug!(error = %error, "Failed to tokenize statement, using a minimal attribute view");
                return;
            }
        };

        if let Some(keyword) = &analysis.leading_keyword {
            self.query_type = QueryType::from_leading_keyword(keyword);
            self.resource_group_query_type = ResourceGroupQueryType::from_leading_keyword(keyword);
        }

        for table in analysis.tables {
            self.add_table(table);
        }
        for schema in analysis.schemas {
            self.add_schema(schema);
        }
        for target in analysis.use_targets {
            self.add_schema(target);
        }
    }

    /// Returns the SQL of the referenced prepared statement for `EXECUTE <name> ...`
    /// statements, `None` otherwise. An unknown statement name also yields `None`, leaving
    /// the view at `queryType = other` without identifiers.
    fn resolve_execute(&self, sql_text: &str) -> Result<Option<String>, sql::Error> {
        let tokens = sql::tokenize(sql_text)?;
        let mut words = tokens.iter().filter_map(|t| match t {
            Token::Word(word) => Some(word),
            _ => None,
        });

        if !words
            .next()
            .is_some_and(|word| word.eq_ignore_ascii_case("EXECUTE"))
        {
            return Ok(None);
        }

        let Some(statement_name) = words.next() else {
            return Ok(None);
        };

        match self.prepared_statements.get(statement_name) {
            Some(prepared_sql) => Ok(Some(prepared_sql.clone())),
            None => {
                debug!(
                    statement_name,
                    "EXECUTE references a prepared statement that was not sent along"
                );
                Ok(None)
            }
        }
    }

    /// Qualifies and records a table reference. Three parts are taken verbatim, fewer parts
    /// are filled up from the default catalog/schema. Without the needed defaults the
    /// reference only shows up in the unqualified set.
    fn add_table(&mut self, identifier: RawIdentifier) {
        let parts = identifier.parts;
        let qualified = match parts.len() {
            3 => Some((parts[0].clone(), parts[1].clone(), parts[2].clone())),
            2 => self
                .default_catalog
                .clone()
                .map(|catalog| (catalog, parts[0].clone(), parts[1].clone())),
            1 => match (&self.default_catalog, &self.default_schema) {
                (Some(catalog), Some(schema)) => {
                    Some((catalog.clone(), schema.clone(), parts[0].clone()))
                }
                _ => None,
            },
            _ => None,
        };

        match qualified {
            Some((catalog, schema, table)) => {
                self.catalog_schemas.insert(format!("{catalog}.{schema}"));
                self.tables.insert(format!("{catalog}.{schema}.{table}"));
                self.catalogs.insert(catalog);
                self.schemas.insert(schema);
            }
            None => {
                self.unqualified.insert(parts.join("."));
            }
        }
    }

    /// Records a schema reference (`SHOW TABLES FROM`, `USE`).
    fn add_schema(&mut self, identifier: RawIdentifier) {
        let parts = identifier.parts;
        let qualified = match parts.len() {
            2 => Some((parts[0].clone(), parts[1].clone())),
            1 => self
                .default_catalog
                .clone()
                .map(|catalog| (catalog, parts[0].clone())),
            _ => None,
        };

        match qualified {
            Some((catalog, schema)) => {
                self.catalog_schemas.insert(format!("{catalog}.{schema}"));
                self.catalogs.insert(catalog);
                self.schemas.insert(schema);
            }
            None => {
                self.unqualified.insert(parts.join("."));
            }
        }
    }

    pub fn tables_contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    pub fn catalogs_contains(&self, catalog: &str) -> bool {
        self.catalogs.contains(catalog)
    }

    pub fn schemas_contains(&self, schema: &str) -> bool {
        self.schemas.contains(schema)
    }
}
