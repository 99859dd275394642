//! The predicate evaluator behind the rules engine.
//!
//! Rule conditions and actions are authored as Python expressions/statements over the
//! request attribute view. Each rule is compiled once at load time into a small module with
//! a `condition` and an `actions` function; evaluation only calls the compiled functions.

use std::{collections::BTreeSet, ffi::CString};

use pyo3::{prelude::*, types::PyDict};
use snafu::{ResultExt, Snafu};
use tracing::{instrument, warn};
use trino_gateway_core::query_attributes::QueryAttributes;

/// The reserved result-map key holding the chosen routing group. The generated module also
/// exposes it as a Python constant, so actions can use either the literal or the constant.
pub const RESULTS_ROUTING_GROUP_KEY: &str = "routingGroup";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("The rule contains a null byte"))]
    RuleContainsNullByte { source: std::ffi::NulError },

    #[snafu(display("Failed to compile rule"))]
    CompileRule { source: pyo3::PyErr },
}

/// A rule's condition and actions, compiled to Python functions.
pub struct CompiledPredicate {
    condition: Py<PyAny>,
    actions: Py<PyAny>,
}

/// The user part of the attribute view, as rules see it.
#[pyclass(name = "TrinoRequestUser")]
struct TrinoRequestUser {
    user: Option<String>,
}

#[pymethods]
impl TrinoRequestUser {
    #[pyo3(name = "getUser")]
    fn get_user(&self) -> Option<String> {
        self.user.clone()
    }

    #[pyo3(name = "userExists")]
    fn user_exists(&self) -> bool {
        self.user.is_some()
    }

    #[pyo3(name = "userExistsAndEquals")]
    fn user_exists_and_equals(&self, expected: &str) -> bool {
        self.user.as_deref() == Some(expected)
    }
}

/// The query part of the attribute view, as rules see it. All identifier sets are fully
/// qualified; the default catalog/schema accessors return `None` when the client did not
/// send the header.
#[pyclass(name = "TrinoQueryProperties")]
struct TrinoQueryProperties {
    query_type: String,
    resource_group_query_type: String,
    tables: BTreeSet<String>,
    catalogs: BTreeSet<String>,
    schemas: BTreeSet<String>,
    catalog_schemas: BTreeSet<String>,
    default_catalog: Option<String>,
    default_schema: Option<String>,
    source: Option<String>,
    client_tags: BTreeSet<String>,
    client_info: Option<String>,
    prepared_statement_names: Vec<String>,
}

#[pymethods]
impl TrinoQueryProperties {
    #[pyo3(name = "getQueryType")]
    fn get_query_type(&self) -> String {
        self.query_type.clone()
    }

    #[pyo3(name = "getResourceGroupQueryType")]
    fn get_resource_group_query_type(&self) -> String {
        self.resource_group_query_type.clone()
    }

    #[pyo3(name = "getTables")]
    fn get_tables(&self) -> BTreeSet<String> {
        self.tables.clone()
    }

    #[pyo3(name = "tablesContains")]
    fn tables_contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    #[pyo3(name = "getCatalogs")]
    fn get_catalogs(&self) -> BTreeSet<String> {
        self.catalogs.clone()
    }

    #[pyo3(name = "getSchemas")]
    fn get_schemas(&self) -> BTreeSet<String> {
        self.schemas.clone()
    }

    #[pyo3(name = "getCatalogSchemas")]
    fn get_catalog_schemas(&self) -> BTreeSet<String> {
        self.catalog_schemas.clone()
    }

    #[pyo3(name = "getDefaultCatalog")]
    fn get_default_catalog(&self) -> Option<String> {
        self.default_catalog.clone()
    }

    #[pyo3(name = "getDefaultSchema")]
    fn get_default_schema(&self) -> Option<String> {
        self.default_schema.clone()
    }

    #[pyo3(name = "getSource")]
    fn get_source(&self) -> Option<String> {
        self.source.clone()
    }

    #[pyo3(name = "getClientTags")]
    fn get_client_tags(&self) -> BTreeSet<String> {
        self.client_tags.clone()
    }

    #[pyo3(name = "clientTagsContain")]
    fn client_tags_contain(&self, tag: &str) -> bool {
        self.client_tags.contains(tag)
    }

    #[pyo3(name = "getClientInfo")]
    fn get_client_info(&self) -> Option<String> {
        self.client_info.clone()
    }

    #[pyo3(name = "getPreparedStatementNames")]
    fn get_prepared_statement_names(&self) -> Vec<String> {
        self.prepared_statement_names.clone()
    }
}

impl TrinoQueryProperties {
    fn from_attributes(attributes: &QueryAttributes) -> Self {
        Self {
            query_type: attributes.query_type.to_string(),
            resource_group_query_type: attributes.resource_group_query_type.to_string(),
            tables: attributes.tables.iter().cloned().collect(),
            catalogs: attributes.catalogs.iter().cloned().collect(),
            schemas: attributes.schemas.iter().cloned().collect(),
            catalog_schemas: attributes.catalog_schemas.iter().cloned().collect(),
            default_catalog: attributes.default_catalog.clone(),
            default_schema: attributes.default_schema.clone(),
            source: attributes.source.clone(),
            client_tags: attributes.client_tags.iter().cloned().collect(),
            client_info: attributes.client_info.clone(),
            prepared_statement_names: attributes.prepared_statements.keys().cloned().collect(),
        }
    }
}

impl CompiledPredicate {
    #[instrument(skip(condition, actions))]
    pub fn compile(rule_name: &str, condition: &str, actions: &[String]) -> Result<Self, Error> {
        let code = generate_module(condition, actions);
        let code = CString::new(code).context(RuleContainsNullByteSnafu)?;

        Python::attach(|py| {
            let module = PyModule::from_code(py, code.as_c_str(), c"<routing-rule>", c"routing_rule")
                .context(CompileRuleSnafu)?;
            Ok(Self {
                condition: module.getattr("condition").context(CompileRuleSnafu)?.unbind(),
                actions: module.getattr("actions").context(CompileRuleSnafu)?.unbind(),
            })
        })
    }
}

fn generate_module(condition: &str, actions: &[String]) -> String {
    let mut code = format!(
        "RESULTS_ROUTING_GROUP_KEY = \"{RESULTS_ROUTING_GROUP_KEY}\"\n\
         \n\
         def condition(trinoRequestUser, trinoQueryProperties, result):\n\
         \x20   return bool(\n{}\n    )\n\
         \n\
         def actions(trinoRequestUser, trinoQueryProperties, result):\n\
         \x20   pass\n",
        indent(condition, 8),
    );
    for action in actions {
        code.push_str(&indent(action, 4));
        code.push('\n');
    }

    code
}

fn indent(text: &str, spaces: usize) -> String {
    let prefix = " ".repeat(spaces);
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A rule ready for evaluation, ordered by priority at load time.
pub struct CompiledRule {
    pub name: String,
    pub priority: i64,
    pub predicate: CompiledPredicate,
}

/// Evaluates all rules against the attribute view. All matching rules fire in order, later
/// actions can overwrite earlier assignments. A failing condition or action is logged and
/// behaves as if the rule did not match; it never aborts the remaining rules.
#[instrument(skip_all)]
pub fn evaluate(rules: &[CompiledRule], attributes: &QueryAttributes) -> Option<String> {
    Python::attach(|py| {
        let user = TrinoRequestUser {
            user: attributes.user.clone(),
        };
        let (user, properties) = match (
            Py::new(py, user),
            Py::new(py, TrinoQueryProperties::from_attributes(attributes)),
        ) {
            (Ok(user), Ok(properties)) => (user, properties),
            (Err(error), _) | (_, Err(error)) => {
                warn!(%error, "Failed to build the Python attribute view, skipping rule evaluation");
                return None;
            }
        };
        let result = PyDict::new(py);

        for rule in rules {
            let matched = rule
                .predicate
                .condition
                .call1(py, (user.clone_ref(py), properties.clone_ref(py), result.clone()))
                .and_then(|value| value.bind(py).is_truthy());

            let matched = match matched {
                Ok(matched) => matched,
                Err(error) => {
                    warn!(rule = rule.name, %error, "Rule condition failed to evaluate, treating it as false");
                    false
                }
            };
            if !matched {
                continue;
            }

            if let Err(error) = rule.predicate.actions.call1(
                py,
                (user.clone_ref(py), properties.clone_ref(py), result.clone()),
            ) {
                warn!(rule = rule.name, %error, "Rule actions failed to execute");
            }
        }

        routing_group_from_result(&result)
    })
}

fn routing_group_from_result(result: &Bound<'_, PyDict>) -> Option<String> {
    let value = match result.get_item(RESULTS_ROUTING_GROUP_KEY) {
        Ok(value) => value?,
        Err(error) => {
            warn!(%error, "Failed to read the routing group from the rule results");
            return None;
        }
    };

    match value.extract::<String>() {
        Ok(group) if !group.is_empty() => Some(group),
        Ok(_) => None,
        Err(error) => {
            warn!(%error, "The rules assigned a non-string routing group, ignoring it");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;

    use super::*;

    fn rule(name: &str, priority: i64, condition: &str, actions: &[&str]) -> CompiledRule {
        CompiledRule {
            name: name.to_string(),
            priority,
            predicate: CompiledPredicate::compile(
                name,
                condition,
                &actions.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
            )
            .expect("Failed to compile test rule"),
        }
    }

    fn attributes_with_user(user: &str) -> QueryAttributes {
        let mut headers = HeaderMap::new();
        headers.insert("x-trino-user", user.parse().unwrap());
        QueryAttributes::from_statement_request(&headers, "SELECT 1")
    }

    #[test]
    fn test_user_rule() {
        let rules = [rule(
            "route-will",
            0,
            r#"trinoRequestUser.userExistsAndEquals("will")"#,
            &[r#"result["routingGroup"] = "will-group""#],
        )];

        assert_eq!(
            evaluate(&rules, &attributes_with_user("will")).as_deref(),
            Some("will-group")
        );
        assert_eq!(evaluate(&rules, &attributes_with_user("someone-else")), None);
    }

    #[test]
    fn test_the_constant_spelling_of_the_result_key() {
        let rules = [rule(
            "constant-key",
            0,
            "True",
            &[r#"result[RESULTS_ROUTING_GROUP_KEY] = "etl""#],
        )];

        assert_eq!(
            evaluate(&rules, &attributes_with_user("will")).as_deref(),
            Some("etl")
        );
    }

    #[test]
    fn test_failing_condition_behaves_like_false() {
        let rules = [
            rule(
                "explodes",
                1,
                // None has no attribute length: raises at evaluation time
                "trinoQueryProperties.getDefaultCatalog().length()",
                &[r#"result["routingGroup"] = "never""#],
            ),
            rule("catch-all", -1, "True", &[r#"result["routingGroup"] = "no-match""#]),
        ];

        assert_eq!(
            evaluate(&rules, &attributes_with_user("will")).as_deref(),
            Some("no-match")
        );
    }

    #[test]
    fn test_all_matching_rules_fire_and_later_rules_overwrite() {
        let rules = [
            rule("first", 10, "True", &[r#"result["routingGroup"] = "first""#]),
            rule("second", 0, "True", &[r#"result["routingGroup"] = "second""#]),
        ];

        assert_eq!(
            evaluate(&rules, &attributes_with_user("will")).as_deref(),
            Some("second")
        );
    }

    #[test]
    fn test_no_rule_matches_yields_no_group() {
        let rules = [rule("never", 0, "False", &[r#"result["routingGroup"] = "x""#])];

        assert_eq!(evaluate(&rules, &attributes_with_user("will")), None);
    }

    #[test]
    fn test_default_catalog_is_optional_in_conditions() {
        let rules = [rule(
            "defaults-group",
            0,
            r#"trinoQueryProperties.getDefaultCatalog() == "hive""#,
            &[r#"result["routingGroup"] = "hive-group""#],
        )];

        let mut headers = HeaderMap::new();
        headers.insert("x-trino-catalog", "hive".parse().unwrap());
        let attributes = QueryAttributes::from_statement_request(&headers, "SELECT 1");
        assert_eq!(evaluate(&rules, &attributes).as_deref(), Some("hive-group"));

        // Missing header: the accessor returns None and the comparison is simply false
        let attributes = attributes_with_user("will");
        assert_eq!(evaluate(&rules, &attributes), None);
    }

    #[test]
    fn test_table_based_condition() {
        let rules = [rule(
            "foo-table",
            0,
            r#"trinoQueryProperties.tablesContains("cat.schem.foo")"#,
            &[r#"result["routingGroup"] = "statement-header-group""#],
        )];

        let mut headers = HeaderMap::new();
        headers.insert("x-trino-catalog", "cat".parse().unwrap());
        headers.insert("x-trino-schema", "schem".parse().unwrap());
        headers.insert(
            "x-trino-prepared-statement",
            "stmt1=SELECT%20%2A%20FROM%20foo".parse().unwrap(),
        );
        let attributes =
            QueryAttributes::from_statement_request(&headers, "EXECUTE stmt1 USING 1");

        assert_eq!(
            evaluate(&rules, &attributes).as_deref(),
            Some("statement-header-group")
        );
    }

    #[test]
    fn test_invalid_python_fails_compilation() {
        assert!(CompiledPredicate::compile("broken", "this is not python", &[]).is_err());
    }
}
