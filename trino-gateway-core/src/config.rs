use std::{
    collections::HashSet,
    fmt::Debug,
    fs::File,
    path::PathBuf,
};

use serde::Deserialize;
use snafu::{ResultExt, Snafu, ensure};
use url::Url;

use crate::{DEFAULT_ROUTING_GROUP, RoutingGroupName, TrinoBackendName};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to read configuration file at {config_file:?}"))]
    ReadConfigFile {
        source: std::io::Error,
        config_file: PathBuf,
    },

    #[snafu(display("Failed to parse configuration file at {config_file:?}"))]
    ParseConfigFile {
        source: serde_yaml::Error,
        config_file: PathBuf,
    },

    #[snafu(display(
        "Configuration error: The backend {backend:?} is configured multiple times. Backend names must be unique"
    ))]
    DuplicateBackendName { backend: TrinoBackendName },

    #[snafu(display("Configuration error: At least one backend must be configured"))]
    NoBackendsConfigured,

    #[snafu(display(
        "Configuration error: In case ssl is enabled the `requestRouter.certPemFile` and `requestRouter.keyPemFile` options must be set"
    ))]
    CertsMissing,

    #[snafu(display(
        "Configuration error: `routingRules.rulesEngineEnabled` is set, but `routingRules.rulesConfigPath` is missing"
    ))]
    RulesConfigPathMissing,

    #[snafu(display(
        "Configuration error: `requestRouter.uiBackend` points to the backend {backend:?} which is not configured"
    ))]
    UiBackendDoesNotExist { backend: TrinoBackendName },
}

#[derive(Clone, Debug, Deserialize)]
// We want to fail on unknown config properties (as Trino is doing as well) to make the user aware
// that what he tried to configure is not a valid configuration.
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    pub request_router: RequestRouterConfig,

    #[serde(default)]
    pub routing_rules: RoutingRulesConfig,

    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub backends_ignore_cert: bool,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RequestRouterConfig {
    /// The address clients use to reach the gateway. All `nextUri`-style links in proxied
    /// responses are rewritten to this address.
    pub external_url: Url,

    #[serde(default = "RequestRouterConfig::default_port")]
    pub port: u16,

    #[serde(default)]
    pub ssl: bool,

    pub cert_pem_file: Option<PathBuf>,
    pub key_pem_file: Option<PathBuf>,

    #[serde(default = "RequestRouterConfig::default_metrics_port")]
    pub metrics_port: u16,

    /// Backend that serves `/ui/*` and `/v1/info` style requests not tied to a known query.
    /// Defaults to the first routable backend of the default routing group.
    pub ui_backend: Option<TrinoBackendName>,
}

impl RequestRouterConfig {
    /// Same port Trino is using by default
    fn default_port() -> u16 {
        8080
    }

    fn default_metrics_port() -> u16 {
        9090
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RoutingRulesConfig {
    #[serde(default)]
    pub rules_engine_enabled: bool,

    pub rules_config_path: Option<PathBuf>,

    /// When the rules engine is enabled, also honor the `X-Trino-Routing-Group` header and
    /// only consult the rules when the header is absent.
    #[serde(default)]
    pub header_fallback: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BackendConfig {
    pub name: TrinoBackendName,

    /// The address of this coordinator as it is advertised to clients, used to spot and
    /// rewrite links in responses.
    pub external_url: Url,

    /// The address the gateway actually connects to. Falls back to `externalUrl`.
    pub proxy_url: Option<Url>,

    #[serde(default = "default_routing_group")]
    pub routing_group: RoutingGroupName,

    #[serde(default = "default_true")]
    pub active: bool,

    /// Credentials for the coordinator web UI. Only needed when the queue depth should be
    /// fetched from `/ui/api/stats` to order backends within a group.
    pub credentials: Option<BackendCredentialsConfig>,
}

impl BackendConfig {
    pub fn proxy_url(&self) -> &Url {
        self.proxy_url.as_ref().unwrap_or(&self.external_url)
    }
}

fn default_routing_group() -> RoutingGroupName {
    DEFAULT_ROUTING_GROUP.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BackendCredentialsConfig {
    pub username: String,
    pub password: String,
}

impl Debug for BackendCredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCredentialsConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(default = "MonitorConfig::default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,

    #[serde(default = "MonitorConfig::default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl MonitorConfig {
    fn default_probe_interval_seconds() -> u64 {
        5
    }

    fn default_probe_timeout_ms() -> u64 {
        1000
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_seconds: Self::default_probe_interval_seconds(),
            probe_timeout_ms: Self::default_probe_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Bindings not looked up for this long are evicted by the sweeper.
    #[serde(default = "RoutingConfig::default_binding_ttl_seconds")]
    pub binding_ttl_seconds: u64,

    /// How long a binding outlives a terminal response, so clients can still fetch the
    /// final result page.
    #[serde(default = "RoutingConfig::default_terminal_grace_seconds")]
    pub terminal_grace_seconds: u64,

    #[serde(default = "RoutingConfig::default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    /// Number of entries the in-memory query history keeps.
    #[serde(default = "RoutingConfig::default_history_retention")]
    pub history_retention: usize,
}

impl RoutingConfig {
    fn default_binding_ttl_seconds() -> u64 {
        3600
    }

    fn default_terminal_grace_seconds() -> u64 {
        15
    }

    fn default_sweep_interval_seconds() -> u64 {
        60
    }

    fn default_history_retention() -> usize {
        1000
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            binding_ttl_seconds: Self::default_binding_ttl_seconds(),
            terminal_grace_seconds: Self::default_terminal_grace_seconds(),
            sweep_interval_seconds: Self::default_sweep_interval_seconds(),
            history_retention: Self::default_history_retention(),
        }
    }
}

impl Config {
    /// Using [`std::fs::File`] over `tokio::fs::File`, as [`serde_yaml::from_reader`] does not
    /// support async yet (?). Should not matter, as we only read the config once during startup.
    pub async fn read_from_file(config_file: &PathBuf) -> Result<Self, Error> {
        let config_file_content =
            File::open(config_file).context(ReadConfigFileSnafu { config_file })?;

        let config: Config = serde_yaml::from_reader(config_file_content)
            .context(ParseConfigFileSnafu { config_file })?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        ensure!(!self.backends.is_empty(), NoBackendsConfiguredSnafu);

        let mut backend_names = HashSet::new();
        for backend in &self.backends {
            ensure!(
                backend_names.insert(&backend.name),
                DuplicateBackendNameSnafu {
                    backend: &backend.name,
                }
            );
        }

        if self.request_router.ssl {
            ensure!(
                self.request_router.cert_pem_file.is_some()
                    && self.request_router.key_pem_file.is_some(),
                CertsMissingSnafu
            );
        }

        if self.routing_rules.rules_engine_enabled {
            ensure!(
                self.routing_rules.rules_config_path.is_some(),
                RulesConfigPathMissingSnafu
            );
        }

        if let Some(ui_backend) = &self.request_router.ui_backend {
            ensure!(
                backend_names.contains(ui_backend),
                UiBackendDoesNotExistSnafu {
                    backend: ui_backend,
                }
            );
        }

        Ok(())
    }
}
