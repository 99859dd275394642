use tracing::instrument;
use trino_gateway_core::{RoutingGroupName, query_attributes::QueryAttributes};

use crate::routing::{RoutingGroupSelectorTrait, RuleEngineSelector};

/// Routes purely on the `X-Trino-Routing-Group` header. An absent or empty header means "no
/// opinion", which makes routing use the default group.
pub struct HeaderSelector;

impl RoutingGroupSelectorTrait for HeaderSelector {
    #[instrument(name = "HeaderSelector::select", skip_all)]
    fn select(&self, attributes: &QueryAttributes) -> Option<RoutingGroupName> {
        attributes.requested_routing_group.clone()
    }
}

/// Honors the routing-group header when present and falls back to the rules engine
/// otherwise.
pub struct HeaderWithRulesFallbackSelector {
    pub header: HeaderSelector,
    pub rules: RuleEngineSelector,
}

impl RoutingGroupSelectorTrait for HeaderWithRulesFallbackSelector {
    #[instrument(name = "HeaderWithRulesFallbackSelector::select", skip_all)]
    fn select(&self, attributes: &QueryAttributes) -> Option<RoutingGroupName> {
        self.header
            .select(attributes)
            .or_else(|| self.rules.select(attributes))
    }
}
