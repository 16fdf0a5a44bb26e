//! Variable Registry
//!
//! Holds the resolved value(s) for every template variable of one analysis
//! run. Bindings are collected through a [`RegistryBuilder`] and frozen with
//! [`RegistryBuilder::seal`]; the sealed [`VariableRegistry`] has no mutating
//! methods.

use crate::template::error::{TemplateError, TemplateResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Selection value meaning "every candidate value"
pub const ALL_SENTINEL: &str = "$__all";

/// Kind of template variable, as declared on the dashboard
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    /// Values come from a datasource query
    #[default]
    Query,
    /// Static comma-separated list
    Custom,
    /// Time interval such as `1h`
    Interval,
    /// Datasource picker
    Datasource,
    /// Free text input
    Textbox,
    /// Hidden constant
    Constant,
}

impl VariableKind {
    /// Parse a dashboard `type` string; unknown kinds are treated as query variables
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "custom" => Self::Custom,
            "interval" => Self::Interval,
            "datasource" => Self::Datasource,
            "textbox" => Self::Textbox,
            "constant" => Self::Constant,
            _ => Self::Query,
        }
    }
}

/// A template variable with its current selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    /// Current selection, in selection order
    pub current_values: Vec<String>,
    /// Whether the "All" option is offered
    pub allow_all: bool,
    /// Custom value substituted for "All" when no candidates are known
    pub all_value: Option<String>,
    pub multi_value: bool,
    /// Candidate values known without querying a datasource
    #[serde(default)]
    pub options: Vec<String>,
}

impl Variable {
    /// Create a single-valued variable
    pub fn new(name: impl Into<String>, kind: VariableKind, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            current_values: vec![value.into()],
            allow_all: false,
            all_value: None,
            multi_value: false,
            options: Vec::new(),
        }
    }

    /// Create a multi-valued variable
    pub fn multi<I, S>(name: impl Into<String>, kind: VariableKind, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind,
            current_values: values.into_iter().map(Into::into).collect(),
            allow_all: false,
            all_value: None,
            multi_value: true,
            options: Vec::new(),
        }
    }

    /// Builder: offer the "All" option, optionally with a custom all value
    pub fn allow_all(mut self, all_value: Option<String>) -> Self {
        self.allow_all = true;
        self.all_value = all_value;
        self
    }

    /// Builder: set the known candidate values
    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: replace the current selection
    pub fn select<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.current_values = values.into_iter().map(Into::into).collect();
        self
    }

    /// True when the current selection is the all-values sentinel
    pub fn is_all_selected(&self) -> bool {
        self.allow_all
            && self
                .current_values
                .iter()
                .any(|v| v == ALL_SENTINEL || v.eq_ignore_ascii_case("all"))
    }
}

/// What a variable resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Concrete values (a plain selection, or an expanded "All")
    Values { values: Vec<String>, multi: bool },
    /// "All" with a custom all value, emitted verbatim
    AllCustom(String),
    /// "All" with no known candidates and no custom all value
    AllUnknown,
}

/// Collects variable declarations before a run starts
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    variables: HashMap<String, Variable>,
    order: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register variables in declaration order; a later declaration of the
    /// same name replaces the earlier one.
    pub fn register_all<I>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = Variable>,
    {
        for variable in variables {
            if self.variables.contains_key(&variable.name) {
                tracing::debug!("Variable {} redeclared, keeping the later declaration", variable.name);
            } else {
                self.order.push(variable.name.clone());
            }
            self.variables.insert(variable.name.clone(), variable);
        }
        self
    }

    /// Replace the current selection of already-registered variables.
    /// Selections for undeclared names are ignored.
    pub fn with_selections(mut self, selections: &HashMap<String, Vec<String>>) -> Self {
        for (name, values) in selections {
            match self.variables.get_mut(name) {
                Some(variable) => variable.current_values = values.clone(),
                None => tracing::warn!("Ignoring selection for undeclared variable {}", name),
            }
        }
        self
    }

    /// Freeze the bindings for the run
    pub fn seal(self) -> VariableRegistry {
        VariableRegistry {
            variables: self.variables,
            order: self.order,
        }
    }
}

/// Immutable variable bindings for one analysis run
#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    variables: HashMap<String, Variable>,
    order: Vec<String>,
}

impl VariableRegistry {
    /// Shortcut for `RegistryBuilder::new().register_all(variables).seal()`
    pub fn from_variables<I>(variables: I) -> Self
    where
        I: IntoIterator<Item = Variable>,
    {
        RegistryBuilder::new().register_all(variables).seal()
    }

    /// Get a variable declaration
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Check whether a variable was declared
    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Variable names in first-declaration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Resolve a variable to its binding
    pub fn binding(&self, name: &str) -> TemplateResult<Binding> {
        let variable = self
            .variables
            .get(name)
            .ok_or_else(|| TemplateError::UnknownVariable(name.to_string()))?;

        if !variable.is_all_selected() {
            return Ok(Binding::Values {
                values: variable.current_values.clone(),
                multi: variable.multi_value,
            });
        }

        if !variable.options.is_empty() {
            let values = variable
                .options
                .iter()
                .filter(|o| o.as_str() != ALL_SENTINEL)
                .cloned()
                .collect();
            return Ok(Binding::Values {
                values,
                multi: true,
            });
        }

        match &variable.all_value {
            Some(custom) => Ok(Binding::AllCustom(custom.clone())),
            None => Ok(Binding::AllUnknown),
        }
    }

    /// Resolve a variable to its sequence of values
    pub fn resolve(&self, name: &str) -> TemplateResult<Vec<String>> {
        match self.binding(name)? {
            Binding::Values { values, .. } => Ok(values),
            Binding::AllCustom(custom) => Ok(vec![custom]),
            Binding::AllUnknown => Err(TemplateError::AllValuesUnavailable(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_single_value() {
        let registry = VariableRegistry::from_variables([Variable::new(
            "env",
            VariableKind::Custom,
            "prod",
        )]);
        assert_eq!(registry.resolve("env").unwrap(), vec!["prod"]);
    }

    #[test]
    fn test_resolve_unknown_variable() {
        let registry = VariableRegistry::default();
        assert_eq!(
            registry.resolve("missing"),
            Err(TemplateError::UnknownVariable("missing".to_string()))
        );
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = RegistryBuilder::new()
            .register_all([
                Variable::new("env", VariableKind::Custom, "dev"),
                Variable::new("region", VariableKind::Custom, "eu"),
                Variable::new("env", VariableKind::Constant, "prod"),
            ])
            .seal();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("env").unwrap(), vec!["prod"]);
        assert_eq!(registry.get("env").unwrap().kind, VariableKind::Constant);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["env", "region"]);
    }

    #[test]
    fn test_all_expands_to_candidates() {
        let registry = VariableRegistry::from_variables([Variable::multi(
            "host",
            VariableKind::Query,
            [ALL_SENTINEL],
        )
        .allow_all(None)
        .options(["x", "y", "z"])]);

        assert_eq!(registry.resolve("host").unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_all_ignores_declared_current_values() {
        let registry = VariableRegistry::from_variables([Variable::multi(
            "host",
            VariableKind::Custom,
            ["a", ALL_SENTINEL],
        )
        .allow_all(None)
        .options([ALL_SENTINEL, "x", "y", "z"])]);

        assert_eq!(registry.resolve("host").unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_all_with_custom_value() {
        let registry = VariableRegistry::from_variables([Variable::new(
            "host",
            VariableKind::Query,
            ALL_SENTINEL,
        )
        .allow_all(Some("%".to_string()))]);

        assert_eq!(
            registry.binding("host").unwrap(),
            Binding::AllCustom("%".to_string())
        );
    }

    #[test]
    fn test_all_without_candidates() {
        let registry = VariableRegistry::from_variables([Variable::new(
            "host",
            VariableKind::Query,
            ALL_SENTINEL,
        )
        .allow_all(None)]);

        assert_eq!(registry.binding("host").unwrap(), Binding::AllUnknown);
        assert!(matches!(
            registry.resolve("host"),
            Err(TemplateError::AllValuesUnavailable(_))
        ));
    }

    #[test]
    fn test_sentinel_without_allow_all_is_literal() {
        let registry = VariableRegistry::from_variables([Variable::new(
            "host",
            VariableKind::Textbox,
            ALL_SENTINEL,
        )
        .options(["x"])]);

        assert_eq!(registry.resolve("host").unwrap(), vec![ALL_SENTINEL]);
    }

    #[test]
    fn test_selections_override_current() {
        let mut selections = HashMap::new();
        selections.insert("env".to_string(), vec!["staging".to_string()]);
        selections.insert("nope".to_string(), vec!["x".to_string()]);

        let registry = RegistryBuilder::new()
            .register_all([Variable::new("env", VariableKind::Custom, "prod")])
            .with_selections(&selections)
            .seal();

        assert_eq!(registry.resolve("env").unwrap(), vec!["staging"]);
        assert!(!registry.contains("nope"));
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(VariableKind::parse("custom"), VariableKind::Custom);
        assert_eq!(VariableKind::parse("TEXTBOX"), VariableKind::Textbox);
        assert_eq!(VariableKind::parse("adhoc"), VariableKind::Query);
    }
}
