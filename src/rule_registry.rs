use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;
use crate::{
    naming_rule::{CustomTransform, NamingRule, NamingRuleTable, RuleScope},
    normalizer::ColumnNormalizer,
    sql_renderer::render_template,
};

const EMBEDDED_RULES: &str = include_str!("../rules/naming_rules.yaml");
const RULES_SCHEMA: &str = include_str!("../rules/naming_rules.schema.json");

/// Validated, compiled rule table shared read-only by every request
#[derive(Debug)]
pub struct RuleRegistry {
    table: NamingRuleTable,
    global_renames: Vec<NamingRule>,
    strip_rules: Vec<CompiledRule>,
    table_renames: BTreeMap<String, Vec<NamingRule>>,
    version_token: Regex,
    false_array_prefixes: Vec<String>,
    allowed_names: HashSet<String>,
    allowed_tokens: HashSet<String>,
    excluded_columns: HashSet<String>,
    excluded_substrings: Vec<String>,
}

/// A prefix/suffix/substring rule with its pattern compiled
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: NamingRule,
    pub regex: Regex,
}

impl CompiledRule {
    pub fn apply(&self, name: &str) -> String {
        self.regex
            .replace_all(name, regex::NoExpand(&self.rule.replacement))
            .into_owned()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Rule table is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Rule table does not match its schema:\n{0}")]
    SchemaViolation(String),

    #[error("Rule validation failed: {0}")]
    RuleValidationFailed(String),

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("False array reference is invalid: {0}")]
    InvalidReference(String),
}

/// Accepted layouts of the false-array reference file
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FalseArrayReference {
    Pairs(Vec<Vec<String>>),
    Wrapped { concept_id_pairs: Vec<Vec<String>> },
}

impl RuleRegistry {
    /// Registry built from the rule table compiled into the binary
    pub fn embedded() -> Result<Self, RegistryError> {
        Self::from_yaml_str(EMBEDDED_RULES)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegistryError> {
        validate_against_schema(yaml)?;
        let table: NamingRuleTable = serde_yaml::from_str(yaml)?;
        Self::from_table(table)
    }

    pub fn from_table(table: NamingRuleTable) -> Result<Self, RegistryError> {
        validate_rules(&table)?;

        let version_token = compile(&table.version_token_pattern)?;
        if version_token.captures_len() < 2 {
            return Err(RegistryError::RuleValidationFailed(format!(
                "version_token_pattern '{}' must capture the version number",
                table.version_token_pattern
            )));
        }

        let mut global_renames = Vec::new();
        let mut strip_rules = Vec::new();
        for rule in &table.rules {
            if rule.scope == RuleScope::Exact {
                global_renames.push(rule.clone());
            } else {
                let regex = rule.to_regex().map_err(|source| RegistryError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    source,
                })?;
                strip_rules.push(CompiledRule {
                    rule: rule.clone(),
                    regex,
                });
            }
        }

        let table_renames = table
            .table_renames
            .iter()
            .map(|(key, rules)| (key.to_lowercase(), rules.clone()))
            .collect();

        let registry = Self {
            false_array_prefixes: table.false_array_prefixes(),
            allowed_names: lowercase_set(&table.allowed_names),
            allowed_tokens: lowercase_set(&table.allowed_tokens),
            excluded_columns: lowercase_set(&table.excluded_columns),
            excluded_substrings: table
                .excluded_substrings
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            table,
            global_renames,
            strip_rules,
            table_renames,
            version_token,
        };
        registry.validate_rename_targets()?;
        Ok(registry)
    }

    /// Replace the false-array pairs with those of a JSON reference file
    pub fn with_false_array_reference(
        mut self,
        path: impl AsRef<Path>,
    ) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let pairs = parse_false_array_reference(&json)?;
        tracing::info!(
            "Loaded {} concept ID pairs from {}",
            pairs.len(),
            path.display()
        );
        self.table.false_array_pairs = pairs;
        self.false_array_prefixes = self.table.false_array_prefixes();
        Ok(self)
    }

    pub fn table(&self) -> &NamingRuleTable {
        &self.table
    }

    pub fn key_column(&self) -> &str {
        &self.table.key_column
    }

    /// Exact renames that apply to `dataset_table`, table-specific ones first
    pub fn renames_for<'a>(
        &'a self,
        dataset_table: Option<&str>,
    ) -> impl Iterator<Item = &'a NamingRule> + 'a {
        let specific = dataset_table
            .and_then(|key| self.table_renames.get(&key.to_lowercase()))
            .map(|rules| rules.as_slice())
            .unwrap_or(&[]);
        specific.iter().chain(self.global_renames.iter())
    }

    pub fn strip_rules(&self) -> &[CompiledRule] {
        &self.strip_rules
    }

    pub fn version_token(&self) -> &Regex {
        &self.version_token
    }

    pub fn is_allowed_name(&self, name: &str) -> bool {
        self.allowed_names.contains(&name.to_lowercase())
    }

    pub fn is_allowed_token(&self, token: &str) -> bool {
        self.allowed_tokens.contains(&token.to_lowercase())
    }

    /// Whether a column is dropped before transformation. The key column never is.
    pub fn is_excluded(&self, column: &str) -> bool {
        if column == self.key_column() {
            return false;
        }
        let lower = column.to_lowercase();
        self.excluded_columns.contains(&lower)
            || self
                .excluded_substrings
                .iter()
                .any(|substring| lower.contains(substring.as_str()))
    }

    /// Whether a column is a known false array: `d_X_d_Y` itself or a numeric loop variant of it
    pub fn is_false_array_column(&self, column: &str) -> bool {
        let lower = column.to_lowercase();
        self.false_array_prefixes.iter().any(|prefix| {
            if lower == *prefix {
                return true;
            }
            match lower.strip_prefix(prefix.as_str()).and_then(|rest| rest.strip_prefix('_')) {
                Some(suffix) => {
                    !suffix.is_empty()
                        && suffix.split('_').all(|token| {
                            !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
                        })
                }
                None => false,
            }
        })
    }

    pub fn custom_transforms_for<'a>(
        &'a self,
        dataset_table: &'a str,
    ) -> impl Iterator<Item = &'a CustomTransform> + 'a {
        self.table
            .custom_transforms
            .iter()
            .filter(move |transform| transform.applies_to(dataset_table))
    }

    /// Rename targets are returned verbatim, so they must already be canonical
    fn validate_rename_targets(&self) -> Result<(), RegistryError> {
        let normalizer = ColumnNormalizer::new(self);
        let all_renames = self
            .global_renames
            .iter()
            .map(|rule| (None, rule))
            .chain(self.table_renames.iter().flat_map(|(key, rules)| {
                rules.iter().map(move |rule| (Some(key.as_str()), rule))
            }));

        for (table_key, rule) in all_renames {
            let target = &rule.replacement;
            if self.renames_for(table_key).any(|other| other.matches_exactly(target)) {
                return Err(RegistryError::RuleValidationFailed(format!(
                    "Rename target '{}' is itself renamed",
                    target
                )));
            }
            let canonical = normalizer.canonicalize(target);
            if canonical != *target {
                return Err(RegistryError::RuleValidationFailed(format!(
                    "Rename target '{}' is not canonical (would become '{}')",
                    target, canonical
                )));
            }
        }
        Ok(())
    }
}

/// Parse a false-array reference: a bare list of pairs or `{"concept_id_pairs": [...]}`
pub fn parse_false_array_reference(json: &str) -> Result<Vec<[String; 2]>, RegistryError> {
    let reference: FalseArrayReference = serde_json::from_str(json)
        .map_err(|e| RegistryError::InvalidReference(e.to_string()))?;
    let entries = match reference {
        FalseArrayReference::Pairs(pairs) => pairs,
        FalseArrayReference::Wrapped { concept_id_pairs } => concept_id_pairs,
    };

    let mut pairs = Vec::new();
    for entry in entries {
        match entry.as_slice() {
            [first, second, ..] => pairs.push([first.clone(), second.clone()]),
            _ => tracing::warn!("Skipping false array reference entry {:?}", entry),
        }
    }
    Ok(pairs)
}

fn validate_against_schema(yaml: &str) -> Result<(), RegistryError> {
    let schema_json: serde_json::Value = serde_json::from_str(RULES_SCHEMA)
        .map_err(|e| RegistryError::SchemaViolation(format!("Failed to parse schema: {}", e)))?;
    let instance_json: serde_json::Value = serde_yaml::from_str(yaml)?;

    let compiled_schema = jsonschema::JSONSchema::compile(&schema_json)
        .map_err(|e| RegistryError::SchemaViolation(format!("Failed to compile schema: {}", e)))?;

    if let Err(errors) = compiled_schema.validate(&instance_json) {
        let error_messages: Vec<String> = errors
            .map(|error| format!("  - {}: {}", error.instance_path, error))
            .collect();
        return Err(RegistryError::SchemaViolation(error_messages.join("\n")));
    }
    Ok(())
}

/// Structural checks the schema cannot express
fn validate_rules(table: &NamingRuleTable) -> Result<(), RegistryError> {
    if table.key_column.is_empty() {
        return Err(RegistryError::RuleValidationFailed(
            "key_column cannot be empty".to_string(),
        ));
    }

    for rule in &table.rules {
        validate_rule(rule)?;
    }

    for (table_key, rules) in &table.table_renames {
        for rule in rules {
            if rule.scope != RuleScope::Exact {
                return Err(RegistryError::RuleValidationFailed(format!(
                    "Rule '{}' for {} must be an exact rename",
                    rule.pattern, table_key
                )));
            }
            validate_rule(rule)?;
        }
    }

    for transform in &table.custom_transforms {
        if transform.source.to_vec().is_empty() {
            return Err(RegistryError::RuleValidationFailed(format!(
                "Custom transform '{}' has no source columns",
                transform.template
            )));
        }
        render_template(transform)
            .map_err(|e| RegistryError::RuleValidationFailed(e.to_string()))?;
    }
    Ok(())
}

fn validate_rule(rule: &NamingRule) -> Result<(), RegistryError> {
    if rule.pattern.is_empty() {
        return Err(RegistryError::RuleValidationFailed(
            "Rule pattern cannot be empty".to_string(),
        ));
    }

    match rule.scope {
        RuleScope::Exact if rule.replacement.is_empty() => {
            Err(RegistryError::RuleValidationFailed(format!(
                "Exact rename of '{}' needs a replacement",
                rule.pattern
            )))
        }
        RuleScope::Exact => Ok(()),
        _ if rule
            .replacement
            .to_lowercase()
            .contains(&rule.pattern.to_lowercase()) =>
        {
            Err(RegistryError::RuleValidationFailed(format!(
                "Replacement '{}' reintroduces pattern '{}'",
                rule.replacement, rule.pattern
            )))
        }
        _ => Ok(()),
    }
}

fn compile(pattern: &str) -> Result<Regex, RegistryError> {
    Regex::new(pattern).map_err(|source| RegistryError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn lowercase_set(values: &[String]) -> HashSet<String> {
    values.iter().map(|value| value.to_lowercase()).collect()
}
