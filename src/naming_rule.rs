use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Concept ID standing in for a "Yes" response
pub const YES_CONCEPT_ID: &str = "353358909";
/// Concept ID standing in for a "No" response
pub const NO_CONCEPT_ID: &str = "104430631";

/// The participant identifier every source table carries. Never lowercased.
pub const CONNECT_ID: &str = "Connect_ID";

/// A single renaming rule applied to column names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingRule {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    pub scope: RuleScope,
}

/// Where in a column name a rule's pattern is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    /// Start of the name
    Prefix,
    /// End of the name
    Suffix,
    /// Anywhere in the name, every occurrence
    Substring,
    /// The whole name; a one-off rename
    Exact,
}

impl NamingRule {
    pub fn new(pattern: impl Into<String>, scope: RuleScope) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: String::new(),
            scope,
        }
    }

    /// One-off rename of `source` to `target`
    pub fn rename(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, RuleScope::Exact).with_replacement(target)
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = replacement.into();
        self
    }

    /// Case-insensitive whole-name comparison, only meaningful for `Exact` rules
    pub fn matches_exactly(&self, name: &str) -> bool {
        self.scope == RuleScope::Exact && self.pattern.eq_ignore_ascii_case(name)
    }

    /// Compile the literal pattern into an anchored, case-insensitive regex
    pub fn to_regex(&self) -> Result<Regex, regex::Error> {
        let literal = regex::escape(&self.pattern);
        let anchored = match self.scope {
            RuleScope::Prefix => format!("(?i)^{}", literal),
            RuleScope::Suffix => format!("(?i){}$", literal),
            RuleScope::Substring => format!("(?i){}", literal),
            RuleScope::Exact => format!("(?i)^{}$", literal),
        };
        Regex::new(&anchored)
    }
}

/// A value that YAML/JSON may give either as a scalar or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value.clone()],
            OneOrMany::Many(values) => values.clone(),
        }
    }
}

/// A hand-written SQL template for columns the generic rules cannot express.
///
/// Placeholders: `{source}`, `{target}`, `{source[i]}`, `{target[i]}`.
/// One-to-one, many-to-one (coalesce) and one-to-many (split) entries are all
/// written the same way; every non-empty rendered line becomes a select item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomTransform {
    /// `dataset.table` the entry applies to; `None` applies to every table
    #[serde(default)]
    pub table: Option<String>,
    pub source: OneOrMany,
    pub target: OneOrMany,
    pub template: String,
}

impl CustomTransform {
    pub fn applies_to(&self, dataset_table: &str) -> bool {
        match &self.table {
            None => true,
            Some(table) => table.eq_ignore_ascii_case(dataset_table),
        }
    }
}

/// The static lookup tables that drive the rule engine. Pure data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingRuleTable {
    /// Join key for merges and the column kept verbatim everywhere
    #[serde(default = "default_key_column")]
    pub key_column: String,

    /// Global rules, exact renames and strip rules mixed, applied in listed order
    #[serde(default)]
    pub rules: Vec<NamingRule>,

    /// One-off renames that only apply to a given `dataset.table`
    #[serde(default)]
    pub table_renames: BTreeMap<String, Vec<NamingRule>>,

    /// Regex matched against a single `_`-separated token; group 1 is the version number
    #[serde(default = "default_version_token_pattern")]
    pub version_token_pattern: String,

    /// Whole column names that are accepted as pure without concept IDs
    #[serde(default)]
    pub allowed_names: Vec<String>,

    /// Extra tokens accepted inside otherwise pure names
    #[serde(default)]
    pub allowed_tokens: Vec<String>,

    /// Columns dropped before any transformation
    #[serde(default)]
    pub excluded_columns: Vec<String>,

    /// Columns containing any of these substrings are dropped before any transformation
    #[serde(default)]
    pub excluded_substrings: Vec<String>,

    /// Concept ID pairs whose `d_X_d_Y` columns hold singleton values serialized as arrays
    #[serde(default)]
    pub false_array_pairs: Vec<[String; 2]>,

    #[serde(default)]
    pub custom_transforms: Vec<CustomTransform>,
}

fn default_key_column() -> String {
    CONNECT_ID.to_string()
}

fn default_version_token_pattern() -> String {
    r"^[vV](\d+)$".to_string()
}

impl Default for NamingRuleTable {
    fn default() -> Self {
        Self {
            key_column: default_key_column(),
            rules: Vec::new(),
            table_renames: BTreeMap::new(),
            version_token_pattern: default_version_token_pattern(),
            allowed_names: Vec::new(),
            allowed_tokens: Vec::new(),
            excluded_columns: Vec::new(),
            excluded_substrings: Vec::new(),
            false_array_pairs: Vec::new(),
            custom_transforms: Vec::new(),
        }
    }
}

impl NamingRuleTable {
    /// `d_X_d_Y` column prefixes derived from the false-array pairs
    pub fn false_array_prefixes(&self) -> Vec<String> {
        self.false_array_pairs
            .iter()
            .map(|[first, second]| format!("d_{}_d_{}", first, second))
            .collect()
    }
}
