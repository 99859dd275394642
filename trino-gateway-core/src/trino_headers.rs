use std::collections::{BTreeMap, HashSet};

use http::HeaderMap;
use tracing::debug;

pub const TRINO_USER_HEADER: &str = "x-trino-user";
pub const TRINO_SOURCE_HEADER: &str = "x-trino-source";
pub const TRINO_CLIENT_TAGS_HEADER: &str = "x-trino-client-tags";
pub const TRINO_CLIENT_INFO_HEADER: &str = "x-trino-client-info";
pub const TRINO_CATALOG_HEADER: &str = "x-trino-catalog";
pub const TRINO_SCHEMA_HEADER: &str = "x-trino-schema";
pub const TRINO_PREPARED_STATEMENT_HEADER: &str = "x-trino-prepared-statement";
pub const TRINO_ROUTING_GROUP_HEADER: &str = "x-trino-routing-group";

pub fn get_string(headers: &HeaderMap, header: &str) -> Option<String> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn get_client_tags(headers: &HeaderMap) -> HashSet<String> {
    match get_string(headers, TRINO_CLIENT_TAGS_HEADER) {
        Some(tags) => tags.split(',').map(str::to_string).collect(),
        None => HashSet::new(),
    }
}

/// Parses the `X-Trino-Prepared-Statement` header(s) into a name → SQL map.
///
/// Each header value is a comma-joined list of `name=sql` pairs, with both sides URL-encoded
/// by the client. The header can appear multiple times. Entries that cannot be decoded are
/// skipped, they never fail the request.
pub fn get_prepared_statements(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut prepared_statements = BTreeMap::new();

    for value in headers.get_all(TRINO_PREPARED_STATEMENT_HEADER) {
        let Ok(value) = value.to_str() else {
            debug!("Skipping non-ASCII prepared statement header");
            continue;
        };

        for entry in value.split(',') {
            let Some((name, sql)) = entry.split_once('=') else {
                debug!(entry, "Skipping malformed prepared statement entry");
                continue;
            };

            match (
                urlencoding::decode(name.trim()),
                urlencoding::decode(sql.trim()),
            ) {
                (Ok(name), Ok(sql)) => {
                    prepared_statements.insert(name.into_owned(), sql.into_owned());
                }
                _ => debug!(entry, "Skipping undecodable prepared statement entry"),
            }
        }
    }

    prepared_statements
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_client_tags_are_split_on_comma() {
        let mut headers = HeaderMap::new();
        headers.insert(
            TRINO_CLIENT_TAGS_HEADER,
            HeaderValue::from_static("etl,system=airflow"),
        );

        assert_eq!(
            get_client_tags(&headers),
            HashSet::from(["etl".to_string(), "system=airflow".to_string()])
        );
    }

    #[test]
    fn test_empty_header_is_treated_as_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(TRINO_USER_HEADER, HeaderValue::from_static(""));

        assert_eq!(get_string(&headers, TRINO_USER_HEADER), None);
    }

    #[test]
    fn test_prepared_statements_are_url_decoded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            TRINO_PREPARED_STATEMENT_HEADER,
            HeaderValue::from_static("stmt1=SELECT%20%2A%20FROM%20foo"),
        );
        headers.append(
            TRINO_PREPARED_STATEMENT_HEADER,
            HeaderValue::from_static("stmt2=SELECT%201,stmt3=SELECT%202"),
        );

        let prepared = get_prepared_statements(&headers);
        assert_eq!(prepared.len(), 3);
        assert_eq!(prepared["stmt1"], "SELECT * FROM foo");
        assert_eq!(prepared["stmt2"], "SELECT 1");
        assert_eq!(prepared["stmt3"], "SELECT 2");
    }

    #[test]
    fn test_malformed_prepared_statement_entries_are_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            TRINO_PREPARED_STATEMENT_HEADER,
            HeaderValue::from_static("no-equals-sign,stmt1=SELECT%201"),
        );

        let prepared = get_prepared_statements(&headers);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared["stmt1"], "SELECT 1");
    }
}
