use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::instrument;
use trino_gateway_core::{RoutingGroupName, config::Config, query_attributes::QueryAttributes};

mod header;
pub mod python;
pub mod rules;

pub use header::{HeaderSelector, HeaderWithRulesFallbackSelector};
pub use rules::RulesEngine;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to load the routing rules"))]
    LoadRoutingRules { source: rules::Error },

    #[snafu(display(
        "The rules engine is enabled but `routingRules.rulesConfigPath` is not configured"
    ))]
    RulesConfigPathMissing,
}

/// Chooses the routing group for a request. Selection is a pure function of the attribute
/// view and the current rule set: selectors never perform I/O and never block.
#[enum_dispatch(SelectorImplementation)]
pub trait RoutingGroupSelectorTrait {
    /// The routing group for the request, or [`None`] for "use the default group".
    fn select(&self, attributes: &QueryAttributes) -> Option<RoutingGroupName>;
}

#[enum_dispatch]
pub enum SelectorImplementation {
    Header(HeaderSelector),
    Rules(RuleEngineSelector),
    HeaderWithRulesFallback(HeaderWithRulesFallbackSelector),
}

/// Routes through the rules engine, ignoring the routing-group header.
pub struct RuleEngineSelector {
    engine: Arc<RulesEngine>,
}

impl RoutingGroupSelectorTrait for RuleEngineSelector {
    #[instrument(name = "RuleEngineSelector::select", skip_all)]
    fn select(&self, attributes: &QueryAttributes) -> Option<RoutingGroupName> {
        self.engine.evaluate(attributes)
    }
}

/// Builds the selector variant the configuration asks for. When the rules engine is in play
/// this also loads the rules file and installs the SIGHUP reload handler.
#[instrument(skip(config))]
pub fn selector_from_config(config: &Config) -> Result<SelectorImplementation, Error> {
    if !config.routing_rules.rules_engine_enabled {
        return Ok(HeaderSelector.into());
    }

    let rules_file = config
        .routing_rules
        .rules_config_path
        .as_ref()
        .context(RulesConfigPathMissingSnafu)?;
    let engine = RulesEngine::new(rules_file).context(LoadRoutingRulesSnafu)?;
    #[cfg(unix)]
    engine.spawn_reload_on_sighup();

    let rules = RuleEngineSelector { engine };
    if config.routing_rules.header_fallback {
        Ok(HeaderWithRulesFallbackSelector {
            header: HeaderSelector,
            rules,
        }
        .into())
    } else {
        Ok(rules.into())
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;
    use indoc::{formatdoc, indoc};

    use super::*;

    fn write_rules_file(name: &str) -> std::path::PathBuf {
        let rules_file = std::env::temp_dir().join(name);
        std::fs::write(
            &rules_file,
            indoc! {r#"
                ---
                name: route-will
                condition: 'trinoRequestUser.userExistsAndEquals("will")'
                actions:
                  - 'result["routingGroup"] = "will-group"'
            "#},
        )
        .expect("Failed to write rules file");
        rules_file
    }

    fn config(rules_file: &std::path::Path, header_fallback: bool) -> Config {
        serde_yaml::from_str(&formatdoc! {r#"
                requestRouter:
                  externalUrl: http://trino-gateway:8080
                routingRules:
                  rulesEngineEnabled: true
                  rulesConfigPath: {rules_file}
                  headerFallback: {header_fallback}
                backends:
                  - name: trino-1
                    externalUrl: http://trino-1:8080
            "#,
            rules_file = rules_file.display(),
            header_fallback = header_fallback,
        })
        .expect("Failed to parse test config")
    }

    fn attributes(user: Option<&str>, routing_group_header: Option<&str>) -> QueryAttributes {
        let mut headers = HeaderMap::new();
        if let Some(user) = user {
            headers.insert("x-trino-user", user.parse().unwrap());
        }
        if let Some(group) = routing_group_header {
            headers.insert("x-trino-routing-group", group.parse().unwrap());
        }
        QueryAttributes::from_statement_request(&headers, "SELECT 1")
    }

    #[tokio::test]
    async fn test_rules_selector_ignores_the_header() {
        let rules_file = write_rules_file("trino-gateway-rules-selector-test.yaml");
        let selector = selector_from_config(&config(&rules_file, false)).unwrap();

        assert_eq!(
            selector.select(&attributes(Some("will"), Some("from-header"))).as_deref(),
            Some("will-group")
        );
        assert_eq!(selector.select(&attributes(None, Some("from-header"))), None);
    }

    #[tokio::test]
    async fn test_header_with_rules_fallback() {
        let rules_file = write_rules_file("trino-gateway-fallback-selector-test.yaml");
        let selector = selector_from_config(&config(&rules_file, true)).unwrap();

        // The header wins when present
        assert_eq!(
            selector.select(&attributes(Some("will"), Some("from-header"))).as_deref(),
            Some("from-header")
        );
        // Without the header the rules decide
        assert_eq!(
            selector.select(&attributes(Some("will"), None)).as_deref(),
            Some("will-group")
        );
        assert_eq!(selector.select(&attributes(None, None)), None);
    }
}
