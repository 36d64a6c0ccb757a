use std::collections::BTreeMap;
use crate::{
    normalizer::{
        extract_ordered_concept_ids, is_pure_variable, non_standard_concept_ids, split_version,
        ColumnDescriptor,
    },
    rule_registry::RuleRegistry,
    sql_renderer::SelectItem,
};

/// Identity of a repeated question: which concepts, which iteration, which version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopGroupKey {
    /// Sorted, repeats kept: `d_X_d_X` and `d_X` are different questions
    pub concept_ids: Vec<String>,
    pub loop_number: String,
    pub version: Option<String>,
}

/// One output column and the raw columns feeding it, highest precedence first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalescedColumn {
    pub name: String,
    pub sources: Vec<String>,
}

impl CoalescedColumn {
    pub fn to_select_item(&self) -> SelectItem {
        match self.sources.as_slice() {
            [single] if *single == self.name => SelectItem::column(single),
            [single] => SelectItem::aliased(single.clone(), &self.name),
            many => SelectItem::aliased(format!("COALESCE({})", many.join(", ")), &self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoalesceOutcome {
    /// Key column first, the rest ordered by output name
    pub columns: Vec<CoalescedColumn>,
    pub loop_groups: usize,
    pub warnings: Vec<String>,
}

/// Groups loop-variable columns and collapses each group into one output column
pub struct LoopCoalescer<'a> {
    registry: &'a RuleRegistry,
}

impl<'a> LoopCoalescer<'a> {
    pub fn new(registry: &'a RuleRegistry) -> Self {
        Self { registry }
    }

    /// Fill in the loop group key of a normalized column
    pub fn classify(&self, mut descriptor: ColumnDescriptor) -> ColumnDescriptor {
        descriptor.loop_group_key = descriptor
            .canonical_name
            .as_deref()
            .and_then(|name| loop_group_key(name, self.registry));
        descriptor
    }

    pub fn coalesce(&self, descriptors: Vec<ColumnDescriptor>) -> CoalesceOutcome {
        let key_column = self.registry.key_column();
        let mut key_present = false;
        let mut loops: BTreeMap<LoopGroupKey, Vec<ColumnDescriptor>> = BTreeMap::new();
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut warnings = Vec::new();

        for descriptor in descriptors {
            if descriptor.raw_name == key_column {
                key_present = true;
                continue;
            }

            let descriptor = self.classify(descriptor);
            let canonical = descriptor.output_name().to_string();

            if !is_pure_variable(&canonical, self.registry) {
                warnings.push(format!(
                    "Column '{}' contains unrecognized tokens and was passed through unchanged",
                    descriptor.raw_name
                ));
                by_name
                    .entry(descriptor.raw_name.clone())
                    .or_default()
                    .push(descriptor.raw_name);
                continue;
            }

            for id in non_standard_concept_ids(&canonical) {
                warnings.push(format!(
                    "Column '{}' has concept ID '{}' that is not 9 digits",
                    descriptor.raw_name, id
                ));
            }

            match descriptor.loop_group_key.clone() {
                Some(key) => loops.entry(key).or_default().push(descriptor),
                None => by_name.entry(canonical).or_default().push(descriptor.raw_name),
            }
        }

        let loop_groups = loops.len();
        for (key, mut members) in loops {
            members.sort_by(|a, b| precedence(&a.raw_name, &b.raw_name));
            let name = loop_output_name(&members[0], &key);
            by_name
                .entry(name)
                .or_default()
                .extend(members.into_iter().map(|member| member.raw_name));
        }

        let mut columns = Vec::with_capacity(by_name.len() + 1);
        if key_present {
            columns.push(CoalescedColumn {
                name: key_column.to_string(),
                sources: vec![key_column.to_string()],
            });
        }
        for (name, mut sources) in by_name {
            if name == key_column {
                continue;
            }
            sources.sort_by(|a, b| precedence(a, b));
            sources.dedup();
            if sources.len() > 1 {
                tracing::debug!("Coalescing {} columns into {}", sources.len(), name);
            }
            columns.push(CoalescedColumn { name, sources });
        }

        CoalesceOutcome {
            columns,
            loop_groups,
            warnings,
        }
    }
}

/// Fewer `_`-separated segments first, then lexical
fn precedence(a: &str, b: &str) -> std::cmp::Ordering {
    let segments = |name: &str| name.split('_').count();
    segments(a).cmp(&segments(b)).then_with(|| a.cmp(b))
}

/// The first pair of equal adjacent numeric tokens after the first token, version tokens excised.
/// Concept IDs are 9 digits and never count as a loop number.
pub fn loop_number(name: &str, registry: &RuleRegistry) -> Option<String> {
    let (base, _) = split_version(name, registry.version_token());
    let tokens: Vec<&str> = base.split('_').collect();

    tokens
        .windows(2)
        .enumerate()
        .skip(1)
        .find(|(_, pair)| {
            let token = pair[0];
            token == pair[1]
                && !token.is_empty()
                && token.len() < 9
                && token.chars().all(|c| c.is_ascii_digit())
        })
        .map(|(_, pair)| pair[0].to_string())
}

pub fn loop_group_key(name: &str, registry: &RuleRegistry) -> Option<LoopGroupKey> {
    let mut concept_ids = extract_ordered_concept_ids(name);
    concept_ids.sort();
    if concept_ids.is_empty() {
        return None;
    }
    let loop_number = loop_number(name, registry)?;
    let (_, version) = split_version(name, registry.version_token());

    Some(LoopGroupKey {
        concept_ids,
        loop_number,
        version,
    })
}

fn loop_output_name(representative: &ColumnDescriptor, key: &LoopGroupKey) -> String {
    let ids: Vec<String> = extract_ordered_concept_ids(representative.output_name())
        .into_iter()
        .map(|id| format!("d_{}", id))
        .collect();

    format!(
        "{}_{}{}",
        ids.join("_"),
        key.loop_number,
        key.version.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming_rule::{NamingRule, NamingRuleTable};
    use crate::normalizer::ColumnNormalizer;
    use crate::row_transformer::RowTransform;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn registry() -> RuleRegistry {
        RuleRegistry::from_table(NamingRuleTable {
            rules: vec![NamingRule::rename("OLD_NAME", "d_555555555")],
            allowed_names: vec!["connect_id".to_string()],
            ..NamingRuleTable::default()
        })
        .unwrap()
    }

    fn coalesce(registry: &RuleRegistry, raw: &[&str]) -> CoalesceOutcome {
        let normalizer = ColumnNormalizer::new(registry);
        let descriptors = raw.iter().map(|name| normalizer.describe(name)).collect();
        LoopCoalescer::new(registry).coalesce(descriptors)
    }

    fn rendered(outcome: &CoalesceOutcome) -> Vec<String> {
        outcome
            .columns
            .iter()
            .map(|column| column.to_select_item().render())
            .collect()
    }

    #[test]
    fn test_loop_number_detection() {
        let registry = registry();
        assert_eq!(loop_number("d_123456789_1_1", &registry).as_deref(), Some("1"));
        assert_eq!(
            loop_number("d_869387390_11_11_d_478706011_11", &registry).as_deref(),
            Some("11")
        );
        assert_eq!(loop_number("d_123456789_v2_3_3", &registry).as_deref(), Some("3"));
        assert_eq!(loop_number("d_123456789_1_2", &registry), None);
        assert_eq!(loop_number("d_123456789_d_123456789", &registry), None);
    }

    #[test]
    fn test_group_key_ignores_concept_order() {
        let registry = registry();
        let a = loop_group_key("d_111111111_2_2_d_222222222", &registry).unwrap();
        let b = loop_group_key("d_222222222_d_111111111_2_2", &registry).unwrap();
        assert_eq!(a, b);

        let versioned = loop_group_key("d_111111111_2_2_d_222222222_v2", &registry).unwrap();
        assert_ne!(a, versioned);
        assert_eq!(versioned.version.as_deref(), Some("_v2"));
    }

    #[test]
    fn test_loop_variants_collapse_to_one_column() {
        let registry = registry();
        let outcome = coalesce(
            &registry,
            &[
                "Connect_ID",
                "D_869387390_11_11_D_478706011_11",
                "D_869387390_11_11_D_478706011_11_11",
                "D_869387390_12_12_D_478706011_12",
            ],
        );

        assert_eq!(outcome.loop_groups, 2);
        assert_eq!(
            rendered(&outcome),
            vec![
                "Connect_ID",
                "COALESCE(D_869387390_11_11_D_478706011_11, D_869387390_11_11_D_478706011_11_11) AS d_869387390_d_478706011_11",
                "D_869387390_12_12_D_478706011_12 AS d_869387390_d_478706011_12",
            ]
        );
    }

    #[test]
    fn test_output_is_deterministic() {
        let registry = registry();
        let forward = coalesce(
            &registry,
            &["d_333333333_1_1", "d_111111111_2_2", "d_111111111_2_2_2", "Connect_ID"],
        );
        let reversed = coalesce(
            &registry,
            &["Connect_ID", "d_111111111_2_2_2", "d_111111111_2_2", "d_333333333_1_1"],
        );
        assert_eq!(forward, reversed);
        assert_eq!(forward.columns[0].name, "Connect_ID");
        assert_eq!(forward.columns[1].name, "d_111111111_2");
        assert_eq!(forward.columns[2].name, "d_333333333_1");
    }

    #[test]
    fn test_renamed_column_coalesces_with_existing() {
        let registry = registry();
        let outcome = coalesce(&registry, &["D_555555555", "OLD_NAME"]);
        assert_eq!(
            rendered(&outcome),
            vec!["COALESCE(D_555555555, OLD_NAME) AS d_555555555"]
        );
    }

    #[test]
    fn test_impure_columns_pass_through_with_warning() {
        let registry = registry();
        let outcome = coalesce(&registry, &["Connect_ID", "D_123456789_FreeText", "d_123456789"]);
        assert_eq!(
            rendered(&outcome),
            vec!["Connect_ID", "D_123456789_FreeText", "d_123456789"]
        );
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("D_123456789_FreeText"));
    }

    #[test]
    fn test_non_standard_concept_id_warns() {
        let registry = registry();
        let outcome = coalesce(&registry, &["d_12345678_1_1"]);
        assert_eq!(outcome.columns.len(), 1);
        assert!(outcome.warnings[0].contains("12345678"));
    }

    #[test]
    fn test_repeated_concept_ids_are_kept() {
        let registry = registry();
        let outcome = coalesce(&registry, &["D_578895128_D_578895128_19_19", "D_578895128_19_19"]);

        assert_eq!(outcome.loop_groups, 2);
        assert_eq!(
            rendered(&outcome),
            vec![
                "D_578895128_19_19 AS d_578895128_19",
                "D_578895128_D_578895128_19_19 AS d_578895128_d_578895128_19",
            ]
        );
    }

    #[test]
    fn test_false_array_loop_column_survives_cleaning() {
        let registry = RuleRegistry::embedded().unwrap();
        let raw = "D_578895128_D_578895128_19_19";
        assert!(registry.is_false_array_column(raw));

        let outcome = coalesce(&registry, &["Connect_ID", raw]);
        let cleaned = &outcome.columns[1].name;
        assert_eq!(cleaned, "d_578895128_d_578895128_19");
        assert_eq!(
            RowTransform::classify(cleaned, &registry, &HashSet::new()),
            RowTransform::UnwrapFalseArray
        );
    }

    #[test]
    fn test_classify_sets_loop_key() {
        let registry = registry();
        let descriptor = ColumnNormalizer::new(&registry).describe("D_123456789_V2_4_4");
        let classified = LoopCoalescer::new(&registry).classify(descriptor);
        let key = classified.loop_group_key.unwrap();
        assert_eq!(key.loop_number, "4");
        assert_eq!(key.version.as_deref(), Some("_v2"));
    }
}
