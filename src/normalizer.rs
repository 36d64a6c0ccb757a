use regex::Regex;
use std::sync::OnceLock;
use crate::{
    loop_coalescer::LoopGroupKey,
    rule_registry::RuleRegistry,
    table_id::TableId,
};

const MAX_PASSES: usize = 16;

/// A source column as seen while generating SQL for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub raw_name: String,
    pub canonical_name: Option<String>,
    pub loop_group_key: Option<LoopGroupKey>,
}

impl ColumnDescriptor {
    pub fn new(raw_name: impl Into<String>) -> Self {
        Self {
            raw_name: raw_name.into(),
            canonical_name: None,
            loop_group_key: None,
        }
    }

    /// Canonical name when known, the raw name otherwise
    pub fn output_name(&self) -> &str {
        self.canonical_name.as_deref().unwrap_or(&self.raw_name)
    }
}

/// Turns a raw FlatConnect column name into its canonical CleanConnect form
pub struct ColumnNormalizer<'a> {
    registry: &'a RuleRegistry,
    dataset_table: Option<String>,
}

impl<'a> ColumnNormalizer<'a> {
    pub fn new(registry: &'a RuleRegistry) -> Self {
        Self {
            registry,
            dataset_table: None,
        }
    }

    /// Also apply the one-off renames filed under this table
    pub fn for_table(mut self, table: &TableId) -> Self {
        self.dataset_table = Some(table.dataset_table());
        self
    }

    /// Rename sources match either the raw name or its canonical form.
    /// Rename targets are canonical and never sources, so the result is a fixed point.
    pub fn normalize(&self, raw: &str) -> String {
        if let Some(target) = self.rename_target(raw) {
            return target;
        }
        let canonical = self.canonicalize(raw);
        self.rename_target(&canonical).unwrap_or(canonical)
    }

    fn rename_target(&self, name: &str) -> Option<String> {
        self.registry
            .renames_for(self.dataset_table.as_deref())
            .find(|rule| rule.matches_exactly(name))
            .map(|rule| rule.replacement.clone())
    }

    /// Everything but the one-off renames, repeated until the name settles
    pub fn canonicalize(&self, raw: &str) -> String {
        if raw == self.registry.key_column() {
            return raw.to_string();
        }

        let mut current = raw.to_string();
        for _ in 0..MAX_PASSES {
            let next = self.single_pass(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    pub fn describe(&self, raw: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            raw_name: raw.to_string(),
            canonical_name: Some(self.normalize(raw)),
            loop_group_key: None,
        }
    }

    fn single_pass(&self, name: &str) -> String {
        let stripped = self.strip(name);
        let (base, version) = split_version(&stripped, self.registry.version_token());
        let repositioned = match version {
            Some(suffix) => format!("{}{}", base, suffix),
            None => base,
        };
        if repositioned == self.registry.key_column() {
            repositioned
        } else {
            repositioned.to_lowercase()
        }
    }

    fn strip(&self, name: &str) -> String {
        let mut current = name.to_string();
        for _ in 0..MAX_PASSES {
            let next = self
                .registry
                .strip_rules()
                .iter()
                .fold(current.clone(), |acc, rule| rule.apply(&acc));
            if next == current {
                break;
            }
            current = next;
        }
        current
    }
}

/// Remove every version token after the first token, returning the first one as `_vN`
pub fn split_version(name: &str, version_token: &Regex) -> (String, Option<String>) {
    let mut version = None;
    let mut kept = Vec::new();

    for (index, token) in name.split('_').enumerate() {
        if index > 0 {
            if let Some(captures) = version_token.captures(token) {
                if version.is_none() {
                    version = captures.get(1).map(|number| format!("_v{}", number.as_str()));
                }
                continue;
            }
        }
        kept.push(token);
    }

    (kept.join("_"), version)
}

fn concept_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[dD]_(\d{9})(?:_|$)").expect("valid regex"))
}

fn numeric_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[dD]_(\d+)(?:_|$)").expect("valid regex"))
}

/// 9-digit concept IDs in order of appearance, duplicates kept
pub fn extract_ordered_concept_ids(name: &str) -> Vec<String> {
    concept_id_pattern()
        .captures_iter(name)
        .filter_map(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
        .collect()
}

/// `d_<digits>` segments whose digit count is not 9
pub fn non_standard_concept_ids(name: &str) -> Vec<String> {
    numeric_id_pattern()
        .captures_iter(name)
        .filter_map(|captures| captures.get(1))
        .map(|id| id.as_str())
        .filter(|id| id.len() != 9)
        .map(str::to_string)
        .collect()
}

/// A name is pure when every token is `d`, numeric, a version token or explicitly allowed
pub fn is_pure_variable(name: &str, registry: &RuleRegistry) -> bool {
    if registry.is_allowed_name(name) {
        return true;
    }

    name.split('_')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .all(|token| {
            token.eq_ignore_ascii_case("d")
                || token.chars().all(|c| c.is_ascii_digit())
                || registry.version_token().is_match(token)
                || registry.is_allowed_token(token)
        })
}
