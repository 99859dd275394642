//! Helpers for the Trino client protocol: the query-id grammar, the few response fields the
//! gateway needs to observe, and rewriting of coordinator links in proxied responses.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::TrinoQueryId;

/// Trino query ids look like `20240101_000000_00001_abcde`.
static QUERY_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{8}_\d{6}_\d{5}_[a-z0-9]{5}$").expect("Query id pattern must compile")
});

pub fn is_query_id(candidate: &str) -> bool {
    QUERY_ID_PATTERN.is_match(candidate)
}

/// Extracts the first path segment that looks like a Trino query id, e.g. from
/// `/v1/statement/executing/20240101_000000_00001_abcde/ya1b2/0` or
/// `/ui/api/query/20240101_000000_00001_abcde`.
pub fn query_id_from_path(path: &str) -> Option<TrinoQueryId> {
    path.split('/').find(|segment| is_query_id(segment)).map(str::to_string)
}

pub const TERMINAL_QUERY_STATES: &[&str] = &["FINISHED", "FAILED", "CANCELED"];

/// The part of a statement response the gateway cares about. Everything else in the body is
/// passed through untouched, so this deliberately only captures what routing needs.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementResponseCapture {
    pub id: Option<TrinoQueryId>,
    pub next_uri: Option<String>,
    pub stats: Option<StatsCapture>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsCapture {
    pub state: Option<String>,
}

impl StatementResponseCapture {
    /// Best-effort parse. A body that is not a JSON object (error pages, HTML) yields `None`.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    /// A terminal response has no `nextUri` and reports a final state. The client will not
    /// poll again (beyond fetching final results), so the binding can be released soon.
    pub fn is_terminal(&self) -> bool {
        self.next_uri.is_none()
            && self
                .stats
                .as_ref()
                .and_then(|stats| stats.state.as_deref())
                .is_some_and(|state| TERMINAL_QUERY_STATES.contains(&state))
    }
}

/// The URI-bearing keys Trino puts into statement responses.
const URI_KEYS: &[&str] = &["\"nextUri\"", "\"infoUri\"", "\"partialCancelUri\""];

fn origin(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Rewrites coordinator links in a JSON response body so clients keep talking to the
/// gateway: every `nextUri`/`infoUri`/`partialCancelUri` value starting with the backend's
/// external origin gets that origin replaced by the gateway's.
///
/// This is plain token substitution instead of a parse-and-serialize round trip, so unknown
/// fields, field order and number formatting survive byte-for-byte.
pub fn rewrite_proxied_uris(body: &str, backend_external: &Url, gateway_external: &Url) -> String {
    substitute_uri_origins(body, &origin(backend_external), &origin(gateway_external))
}

fn substitute_uri_origins(body: &str, from_origin: &str, to_origin: &str) -> String {
    let mut result = String::with_capacity(body.len());
    let mut rest = body;

    while let Some((key_index, key)) = next_uri_key(rest) {
        let after_key = key_index + key.len();
        result.push_str(&rest[..after_key]);
        rest = &rest[after_key..];

        // Expect `: "` with optional whitespace, otherwise this was not an object key
        let Some(value_start) = match_value_start(rest) else {
            continue;
        };
        let Some(value_len) = json_string_end(&rest[value_start..]) else {
            continue;
        };

        result.push_str(&rest[..value_start]);
        let value = &rest[value_start..value_start + value_len];
        match value.strip_prefix(from_origin) {
            Some(remainder) => {
                result.push_str(to_origin);
                result.push_str(remainder);
            }
            None => result.push_str(value),
        }
        rest = &rest[value_start + value_len..];
    }

    result.push_str(rest);
    result
}

/// Finds the earliest occurrence of any URI key in `haystack`.
fn next_uri_key(haystack: &str) -> Option<(usize, &'static str)> {
    URI_KEYS
        .iter()
        .filter_map(|key| haystack.find(key).map(|index| (index, *key)))
        .min_by_key(|(index, _)| *index)
}

fn match_value_start(rest: &str) -> Option<usize> {
    let mut chars = rest.char_indices().skip_while(|(_, c)| c.is_whitespace());
    let (_, colon) = chars.next()?;
    if colon != ':' {
        return None;
    }
    let (index, quote) = chars.find(|(_, c)| !c.is_whitespace())?;
    if quote != '"' {
        return None;
    }
    Some(index + 1)
}

/// Length of the JSON string starting at the beginning of `value` (exclusive of the closing
/// quote). Escapes are skipped, although Trino URIs do not contain any.
fn json_string_end(value: &str) -> Option<usize> {
    let mut escaped = false;
    for (index, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(index),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("20240101_000000_00001_abcde", true)]
    #[case("20231125_173754_00083_4sknc", true)]
    #[case("20240101_000000_00001_ABCDE", false)]
    #[case("20240101_000000_001_abcde", false)]
    #[case("not_a_query_id", false)]
    #[case("", false)]
    fn test_query_id_grammar(#[case] candidate: &str, #[case] expected: bool) {
        assert_eq!(is_query_id(candidate), expected);
    }

    #[rstest]
    #[case("/v1/statement/queued/20240101_000000_00001_abcde/ya1b2/1", Some("20240101_000000_00001_abcde"))]
    #[case("/v1/statement/executing/20240112_082858_00000_kggk9/yb3c6/0", Some("20240112_082858_00000_kggk9"))]
    #[case("/ui/api/query/20240101_000000_00001_abcde", Some("20240101_000000_00001_abcde"))]
    #[case("/v1/statement", None)]
    #[case("/ui/api/stats", None)]
    fn test_query_id_from_path(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(query_id_from_path(path).as_deref(), expected);
    }

    #[rstest]
    #[case(r#"{"id":"20240101_000000_00001_abcde","stats":{"state":"FINISHED"}}"#, true)]
    #[case(r#"{"id":"20240101_000000_00001_abcde","stats":{"state":"FAILED"}}"#, true)]
    #[case(r#"{"id":"20240101_000000_00001_abcde","stats":{"state":"CANCELED"}}"#, true)]
    #[case(
        r#"{"id":"20240101_000000_00001_abcde","nextUri":"http://t/v1/statement/executing/x/y/1","stats":{"state":"FINISHED"}}"#,
        false
    )]
    #[case(r#"{"id":"20240101_000000_00001_abcde","stats":{"state":"RUNNING"}}"#, false)]
    #[case(r#"{"id":"20240101_000000_00001_abcde"}"#, false)]
    fn test_terminal_detection(#[case] body: &str, #[case] expected: bool) {
        let capture = StatementResponseCapture::from_body(body.as_bytes()).unwrap();
        assert_eq!(capture.is_terminal(), expected);
    }

    #[test]
    fn test_capture_of_non_json_body() {
        assert!(StatementResponseCapture::from_body(b"<html>nope</html>").is_none());
    }

    fn rewrite(body: &str) -> String {
        let backend = Url::parse("http://trino-1.example.com:8080").unwrap();
        let gateway = Url::parse("https://gateway.example.com:8443").unwrap();
        rewrite_proxied_uris(body, &backend, &gateway)
    }

    #[test]
    fn test_next_uri_is_rewritten_to_the_gateway() {
        let body = r#"{"id":"20240101_000000_00001_abcde","infoUri":"http://trino-1.example.com:8080/ui/query.html?20240101_000000_00001_abcde","nextUri":"http://trino-1.example.com:8080/v1/statement/queued/20240101_000000_00001_abcde/y1/1","stats":{"state":"QUEUED"}}"#;

        let rewritten = rewrite(body);
        assert_eq!(
            rewritten,
            r#"{"id":"20240101_000000_00001_abcde","infoUri":"https://gateway.example.com:8443/ui/query.html?20240101_000000_00001_abcde","nextUri":"https://gateway.example.com:8443/v1/statement/queued/20240101_000000_00001_abcde/y1/1","stats":{"state":"QUEUED"}}"#
        );
    }

    #[test]
    fn test_unrelated_fields_survive_byte_for_byte() {
        // Unknown fields, odd whitespace and URI-looking data values must not change
        let body = r#"{
            "id": "20240101_000000_00001_abcde",
            "nextUri" : "http://trino-1.example.com:8080/v1/statement/executing/x/y/1",
            "data": [["http://trino-1.example.com:8080/not-a-uri-field"]],
            "unknownField": {"nested": 1.2300}
        }"#;

        let rewritten = rewrite(body);
        assert!(rewritten.contains(r#""nextUri" : "https://gateway.example.com:8443/v1/statement/executing/x/y/1""#));
        assert!(rewritten.contains(r#""data": [["http://trino-1.example.com:8080/not-a-uri-field"]]"#));
        assert!(rewritten.contains(r#""unknownField": {"nested": 1.2300}"#));
    }

    #[test]
    fn test_rewrite_round_trip() {
        let backend = Url::parse("http://trino-1.example.com:8080").unwrap();
        let gateway = Url::parse("https://gateway.example.com:8443").unwrap();
        let body = r#"{"nextUri":"http://trino-1.example.com:8080/v1/statement/queued/a/b/1","partialCancelUri":"http://trino-1.example.com:8080/v1/statement/executing/partialCancel/a/0/b/1","other":"x"}"#;

        let there = rewrite_proxied_uris(body, &backend, &gateway);
        let back = rewrite_proxied_uris(&there, &gateway, &backend);
        assert_eq!(back, body);
    }

    #[test]
    fn test_uris_of_other_hosts_are_left_alone() {
        let body = r#"{"nextUri":"http://somewhere-else:8080/v1/statement/queued/a/b/1"}"#;
        assert_eq!(rewrite(body), body);
    }
}
