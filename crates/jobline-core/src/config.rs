//! Workflow YAML loading with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::domain::error::{JoblineError, Result};
use crate::domain::workflow::Workflow;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns [`JoblineError::MissingEnvVars`] naming every referenced variable
/// that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    substitute_with(input, |name| std::env::var(name).ok())
}

/// Substitution against an arbitrary lookup (used by tests and dry runs).
pub fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        let name = &cap[1];
        match lookup(name) {
            Some(value) => value,
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(JoblineError::MissingEnvVars(missing));
    }
    Ok(result.into_owned())
}

/// Parse a workflow YAML string (after env var substitution) and validate it.
pub fn parse_workflow_str(yaml: &str) -> Result<Workflow> {
    let substituted = substitute_env_vars(yaml)?;
    let workflow: Workflow = serde_yaml::from_str(&substituted)?;
    workflow.validate()?;
    debug!(
        workflow = %workflow.name,
        steps = workflow.steps.len(),
        services = workflow.services.len(),
        "workflow parsed"
    );
    Ok(workflow)
}

/// Read and parse a workflow YAML file.
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_substitution_from_lookup() {
        let vars: HashMap<&str, &str> = [("DB_HOST", "localhost"), ("DB_PORT", "5432")].into();
        let out = substitute_with("host=${DB_HOST} port=${DB_PORT}", |n| {
            vars.get(n).map(|v| v.to_string())
        })
        .unwrap();
        assert_eq!(out, "host=localhost port=5432");
    }

    #[test]
    fn test_no_placeholders_passthrough() {
        let input = "name: tests\nsteps: []";
        assert_eq!(substitute_with(input, |_| None).unwrap(), input);
    }

    #[test]
    fn test_every_missing_variable_reported_once() {
        let err = substitute_with("${A_MISSING} ${B_MISSING} ${A_MISSING}", |_| None).unwrap_err();
        match err {
            JoblineError::MissingEnvVars(names) => {
                assert_eq!(names, vec!["A_MISSING".to_string(), "B_MISSING".to_string()]);
            }
            other => panic!("expected MissingEnvVars, got {other:?}"),
        }
    }

    #[test]
    fn test_process_env_substitution() {
        std::env::set_var("JOBLINE_TEST_SUBST_USER", "ci");
        let out = substitute_env_vars("user: ${JOBLINE_TEST_SUBST_USER}").unwrap();
        assert_eq!(out, "user: ci");
        std::env::remove_var("JOBLINE_TEST_SUBST_USER");
    }

    #[test]
    fn test_invalid_yaml_errors() {
        assert!(parse_workflow_str("this is not: [valid: yaml: {{{}}}").is_err());
    }
}
