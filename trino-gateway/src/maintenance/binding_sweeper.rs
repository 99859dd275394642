use std::{sync::Arc, time::Duration};

use tokio::time;
use tracing::{Instrument, debug, info, info_span};
use trino_gateway_core::config::Config;
use trino_gateway_state::BindingRegistry;

use crate::metrics::Metrics;

/// Periodically drops query bindings nobody asked about within the TTL, and bindings whose
/// terminal grace period ran out.
pub struct BindingSweeper {
    bindings: Arc<BindingRegistry>,
    metrics: Arc<Metrics>,
    sweep_interval: Duration,
}

impl BindingSweeper {
    pub fn new(bindings: Arc<BindingRegistry>, metrics: Arc<Metrics>, config: &Config) -> Self {
        Self {
            bindings,
            metrics,
            sweep_interval: Duration::from_secs(config.routing.sweep_interval_seconds),
        }
    }

    pub fn start_loop(self) {
        tokio::spawn(async move {
            let mut interval = time::interval(self.sweep_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                // First tick does not sleep, so let's put it at the start of the loop.
                interval.tick().await;

                async {
                    let removed = self.bindings.sweep();
                    self.metrics.active_bindings.set(self.bindings.len() as i64);

                    // Verbosity level depending on whether a binding was removed
                    match removed {
                        0 => debug!("BindingSweeper: Successfully checked for expired query bindings"),
                        removed => info!(
                            removed,
                            "BindingSweeper: Successfully removed expired query bindings"
                        ),
                    }
                }
                .instrument(info_span!("Sweeping expired query bindings"))
                .await;
            }
        });
    }
}
