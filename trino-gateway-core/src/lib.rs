pub mod config;
pub mod query_attributes;
pub mod sanitization;
pub mod sql;
pub mod trino_api;
pub mod trino_headers;

pub type TrinoQueryId = String;
pub type TrinoBackendName = String;
pub type RoutingGroupName = String;

/// The routing group every selector falls back to when no rule or header
/// produced a usable group.
pub const DEFAULT_ROUTING_GROUP: &str = "adhoc";

/// Group name (also produced by catch-all rules) that explicitly requests
/// the fallback to [`DEFAULT_ROUTING_GROUP`].
pub const NO_MATCH_ROUTING_GROUP: &str = "no-match";
