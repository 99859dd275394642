use std::{
    cmp::Reverse,
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use serde::Deserialize;
use snafu::{ResultExt, Snafu, ensure};
use tracing::{error, info, instrument};
use trino_gateway_core::{RoutingGroupName, query_attributes::QueryAttributes};

use crate::routing::python::{self, CompiledPredicate, CompiledRule};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to read rules file at {rules_file:?}"))]
    ReadRulesFile {
        source: std::io::Error,
        rules_file: PathBuf,
    },

    #[snafu(display("Failed to parse rules file at {rules_file:?}"))]
    ParseRulesFile {
        source: serde_yaml::Error,
        rules_file: PathBuf,
    },

    #[snafu(display("The rule name {rule:?} is used more than once"))]
    DuplicateRuleName { rule: String },

    #[snafu(display("Failed to compile rule {rule:?}"))]
    CompileRule {
        source: python::Error,
        rule: String,
    },
}

/// One document of the rules file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RuleDefinition {
    name: String,

    #[expect(dead_code, reason = "Documentation field for rule authors")]
    description: Option<String>,

    #[serde(default)]
    priority: i64,

    condition: String,

    #[serde(default)]
    actions: Vec<String>,
}

/// Holds the current rule set and swaps in a new one on reload.
///
/// The rule set snapshot is behind a single `Arc` swap: evaluations clone the `Arc` once and
/// run against that snapshot, so an in-flight evaluation never observes a half-reloaded set.
pub struct RulesEngine {
    rules: RwLock<Arc<Vec<CompiledRule>>>,
    rules_file: PathBuf,
}

impl RulesEngine {
    #[instrument]
    pub fn new(rules_file: &Path) -> Result<Arc<Self>, Error> {
        let rules = load_rules(rules_file)?;
        info!(rules = rules.len(), ?rules_file, "Loaded routing rules");

        Ok(Arc::new(Self {
            rules: RwLock::new(Arc::new(rules)),
            rules_file: rules_file.to_path_buf(),
        }))
    }

    /// Recompiles the rules file and atomically swaps the new set in. On failure the
    /// previous rule set stays in place.
    #[instrument(skip(self))]
    pub fn reload(&self) -> Result<(), Error> {
        let rules = load_rules(&self.rules_file)?;
        info!(rules = rules.len(), rules_file = ?self.rules_file, "Reloaded routing rules");

        *self.rules.write().expect("Rule set lock poisoned") = Arc::new(rules);
        Ok(())
    }

    pub fn evaluate(&self, attributes: &QueryAttributes) -> Option<RoutingGroupName> {
        let snapshot = Arc::clone(&self.rules.read().expect("Rule set lock poisoned"));
        python::evaluate(&snapshot, attributes)
    }

    /// Reloads the rules on SIGHUP, the usual "reread your config" convention.
    #[cfg(unix)]
    pub fn spawn_reload_on_sighup(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut hangups =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(hangups) => hangups,
                    Err(err) => {
                        error!(?err, "Failed to install SIGHUP handler, rules will not reload");
                        return;
                    }
                };

            while hangups.recv().await.is_some() {
                if let Err(err) = engine.reload() {
                    error!(?err, "Failed to reload routing rules, keeping the previous rule set");
                }
            }
        });
    }
}

fn load_rules(rules_file: &Path) -> Result<Vec<CompiledRule>, Error> {
    let content = std::fs::read_to_string(rules_file).context(ReadRulesFileSnafu { rules_file })?;
    compile_rules(&content, rules_file)
}

/// Compiles a rules file: a sequence of YAML documents separated by `---`, sorted by
/// priority descending with the file order as tie breaker.
fn compile_rules(content: &str, rules_file: &Path) -> Result<Vec<CompiledRule>, Error> {
    let mut definitions = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        definitions
            .push(RuleDefinition::deserialize(document).context(ParseRulesFileSnafu { rules_file })?);
    }

    let mut seen_names = HashSet::new();
    let mut rules = Vec::with_capacity(definitions.len());
    for definition in definitions {
        ensure!(
            seen_names.insert(definition.name.clone()),
            DuplicateRuleNameSnafu {
                rule: &definition.name,
            }
        );

        let predicate =
            CompiledPredicate::compile(&definition.name, &definition.condition, &definition.actions)
                .context(CompileRuleSnafu {
                    rule: &definition.name,
                })?;

        rules.push(CompiledRule {
            name: definition.name,
            priority: definition.priority,
            predicate,
        });
    }

    // Stable sort: equal priorities keep their file order
    rules.sort_by_key(|rule| Reverse(rule.priority));

    Ok(rules)
}
