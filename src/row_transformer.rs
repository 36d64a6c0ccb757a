use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use crate::{
    naming_rule::{NO_CONCEPT_ID, YES_CONCEPT_ID},
    rule_registry::RuleRegistry,
    sql_renderer::SelectItem,
    table_id::TableId,
};

/// Columns profiled per detection query
pub const DETECTION_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowTransform {
    /// `"1"`/`"0"` to the Yes/No concept IDs
    BinaryToConcept,
    /// `"[123456789]"` to `"123456789"`. Anything else becomes NULL, including
    /// multi-element arrays; the loss is accepted for these columns.
    UnwrapFalseArray,
    Passthrough,
}

fn singleton_array() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\[(\d{9})\]$").expect("valid regex"))
}

impl RowTransform {
    /// Pick the transform for one column. False arrays win over binary detection.
    pub fn classify(column: &str, registry: &RuleRegistry, binary_columns: &HashSet<String>) -> Self {
        if column == registry.key_column() {
            RowTransform::Passthrough
        } else if registry.is_false_array_column(column) {
            RowTransform::UnwrapFalseArray
        } else if binary_columns.contains(column) {
            RowTransform::BinaryToConcept
        } else {
            RowTransform::Passthrough
        }
    }

    /// In-process equivalent of the SQL emitted by [`RowTransform::render`]
    pub fn apply(&self, value: Option<&str>) -> Option<String> {
        let value = value?;
        match self {
            RowTransform::BinaryToConcept => match value {
                "1" => Some(YES_CONCEPT_ID.to_string()),
                "0" => Some(NO_CONCEPT_ID.to_string()),
                _ => None,
            },
            RowTransform::UnwrapFalseArray => singleton_array()
                .captures(value)
                .and_then(|captures| captures.get(1))
                .map(|id| id.as_str().to_string()),
            RowTransform::Passthrough => Some(value.to_string()),
        }
    }

    pub fn render(&self, column: &str) -> SelectItem {
        match self {
            RowTransform::BinaryToConcept => SelectItem::aliased(
                format!(
                    r#"CASE WHEN {col} = "1" THEN "{yes}" WHEN {col} = "0" THEN "{no}" ELSE NULL END"#,
                    col = column,
                    yes = YES_CONCEPT_ID,
                    no = NO_CONCEPT_ID
                ),
                column,
            ),
            RowTransform::UnwrapFalseArray => SelectItem::aliased(
                format!(
                    r#"CASE WHEN {col} = "[]" THEN NULL WHEN REGEXP_CONTAINS({col}, r'^\[\d{{9}}\]$') THEN REGEXP_REPLACE({col}, r'^\[(\d{{9}})\]$', r'\1') ELSE NULL END"#,
                    col = column
                ),
                column,
            ),
            RowTransform::Passthrough => SelectItem::column(column),
        }
    }
}

/// Profiling queries that report, per STRING column, whether it only holds
/// `"0"`, `"1"`, `""` or NULL. One query per batch of columns.
pub fn binary_detection_queries(source: &TableId, columns: &[String]) -> Vec<String> {
    columns
        .chunks(DETECTION_BATCH_SIZE)
        .map(|batch| {
            let checks: Vec<String> = batch
                .iter()
                .map(|col| {
                    format!(
                        r#"COUNTIF(NOT (`{col}` = "0" OR `{col}` = "1" OR `{col}` IS NULL OR `{col}` = "")) = 0 AS `{col}`"#,
                        col = col
                    )
                })
                .collect();
            format!(
                "SELECT\n    {}\nFROM {}",
                checks.join(",\n    "),
                source.quoted()
            )
        })
        .collect()
}

/// Columns flagged true in a detection result row. The REST API returns booleans as strings.
pub fn parse_binary_detection(row: &BTreeMap<String, Value>) -> Vec<String> {
    row.iter()
        .filter(|(_, value)| match value {
            Value::Bool(flag) => *flag,
            Value::String(text) => text.eq_ignore_ascii_case("true"),
            _ => false,
        })
        .map(|(column, _)| column.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming_rule::NamingRuleTable;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> RuleRegistry {
        RuleRegistry::from_table(NamingRuleTable {
            false_array_pairs: vec![["578895128".to_string(), "578895128".to_string()]],
            ..NamingRuleTable::default()
        })
        .unwrap()
    }

    #[test]
    fn test_binary_values_map_to_concepts() {
        let transform = RowTransform::BinaryToConcept;
        assert_eq!(transform.apply(Some("1")).as_deref(), Some("353358909"));
        assert_eq!(transform.apply(Some("0")).as_deref(), Some("104430631"));
        assert_eq!(transform.apply(Some("2")), None);
        assert_eq!(transform.apply(Some("")), None);
        assert_eq!(transform.apply(None), None);
    }

    #[test]
    fn test_false_array_unwrap_is_lossy() {
        let transform = RowTransform::UnwrapFalseArray;
        assert_eq!(transform.apply(Some("[123456789]")).as_deref(), Some("123456789"));
        assert_eq!(transform.apply(Some("[]")), None);
        assert_eq!(transform.apply(Some("[12]")), None);
        // multi-valued and malformed arrays are dropped, not preserved
        assert_eq!(transform.apply(Some("[123456789, 987654321]")), None);
        assert_eq!(transform.apply(Some("123456789]")), None);
    }

    #[test]
    fn test_passthrough_keeps_value() {
        assert_eq!(
            RowTransform::Passthrough.apply(Some("anything")).as_deref(),
            Some("anything")
        );
    }

    #[test]
    fn test_render_binary_case() {
        assert_eq!(
            RowTransform::BinaryToConcept.render("d_123456789").render(),
            r#"CASE WHEN d_123456789 = "1" THEN "353358909" WHEN d_123456789 = "0" THEN "104430631" ELSE NULL END AS d_123456789"#
        );
    }

    #[test]
    fn test_render_false_array_case() {
        assert_eq!(
            RowTransform::UnwrapFalseArray.render("d_578895128_d_578895128").render(),
            r#"CASE WHEN d_578895128_d_578895128 = "[]" THEN NULL WHEN REGEXP_CONTAINS(d_578895128_d_578895128, r'^\[\d{9}\]$') THEN REGEXP_REPLACE(d_578895128_d_578895128, r'^\[(\d{9})\]$', r'\1') ELSE NULL END AS d_578895128_d_578895128"#
        );
    }

    #[test]
    fn test_classify_precedence() {
        let registry = registry();
        let binary: HashSet<String> = ["d_578895128_d_578895128", "d_111111111", "Connect_ID"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(
            RowTransform::classify("d_578895128_d_578895128", &registry, &binary),
            RowTransform::UnwrapFalseArray
        );
        assert_eq!(
            RowTransform::classify("d_111111111", &registry, &binary),
            RowTransform::BinaryToConcept
        );
        assert_eq!(
            RowTransform::classify("Connect_ID", &registry, &binary),
            RowTransform::Passthrough
        );
        assert_eq!(
            RowTransform::classify("d_222222222", &registry, &binary),
            RowTransform::Passthrough
        );
    }

    #[test]
    fn test_detection_queries_are_batched() {
        let source = TableId::new("p", "FlatConnect", "module1");
        let columns: Vec<String> = (0..1001).map(|i| format!("d_{:09}", i)).collect();
        let queries = binary_detection_queries(&source, &columns);
        assert_eq!(queries.len(), 3);
        assert!(queries[0].starts_with("SELECT\n    COUNTIF(NOT (`d_000000000` = \"0\""));
        assert!(queries[2].contains("AS `d_000001000`"));
        assert!(queries[2].ends_with("FROM `p.FlatConnect.module1`"));
        assert!(binary_detection_queries(&source, &[]).is_empty());
    }

    #[test]
    fn test_parse_binary_detection() {
        let row = BTreeMap::from([
            ("d_1".to_string(), json!("true")),
            ("d_2".to_string(), json!("false")),
            ("d_3".to_string(), json!(true)),
            ("d_4".to_string(), Value::Null),
        ]);
        assert_eq!(parse_binary_detection(&row), vec!["d_1", "d_3"]);
    }
}
