use std::collections::BTreeSet;
use thiserror::Error;
use crate::{sql_renderer::SelectItem, table_id::TableId};

/// One side of a merge, aliased `vN` in source order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSource {
    pub table: TableId,
    pub alias: String,
    pub unique_columns: BTreeSet<String>,
}

/// Full-outer-join plan across version tables of the same module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub sources: Vec<MergeSource>,
    pub common_columns: BTreeSet<String>,
    /// Columns every join condition is built on, in priority order
    pub join_keys: Vec<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("A merge needs at least 2 source tables, got {0}")]
    NotEnoughSources(usize),

    #[error("Source table {0} has no columns")]
    NoColumns(TableId),

    #[error("Join key '{key}' is missing from {tables}")]
    MissingKeyColumn { key: String, tables: String },
}

impl MergePlan {
    pub fn build(
        sources: Vec<(TableId, Vec<String>)>,
        key_column: &str,
    ) -> Result<Self, MergeError> {
        if sources.len() < 2 {
            return Err(MergeError::NotEnoughSources(sources.len()));
        }

        let column_sets: Vec<(TableId, BTreeSet<String>)> = sources
            .into_iter()
            .map(|(table, columns)| (table, columns.into_iter().collect()))
            .collect();

        if let Some((table, _)) = column_sets.iter().find(|(_, columns)| columns.is_empty()) {
            return Err(MergeError::NoColumns(table.clone()));
        }

        let missing_key: Vec<String> = column_sets
            .iter()
            .filter(|(_, columns)| !columns.contains(key_column))
            .map(|(table, _)| table.to_string())
            .collect();
        if !missing_key.is_empty() {
            return Err(MergeError::MissingKeyColumn {
                key: key_column.to_string(),
                tables: missing_key.join(", "),
            });
        }

        let mut common_columns = column_sets[0].1.clone();
        for (_, columns) in &column_sets[1..] {
            common_columns = common_columns.intersection(columns).cloned().collect();
        }

        let sources = column_sets
            .into_iter()
            .enumerate()
            .map(|(index, (table, columns))| MergeSource {
                table,
                alias: format!("v{}", index + 1),
                unique_columns: columns.difference(&common_columns).cloned().collect(),
            })
            .collect();

        Ok(Self {
            sources,
            common_columns,
            join_keys: vec![key_column.to_string()],
        })
    }

    fn key_column(&self) -> &str {
        &self.join_keys[0]
    }

    /// Key first, other common columns sorted, then each source's own columns sorted
    pub fn select_items(&self) -> Vec<SelectItem> {
        let key = self.key_column();
        let all_aliases: Vec<&str> = self.sources.iter().map(|s| s.alias.as_str()).collect();

        let mut items = vec![coalesce_item(&all_aliases, key)];
        items.extend(
            self.common_columns
                .iter()
                .filter(|column| column.as_str() != key)
                .map(|column| coalesce_item(&all_aliases, column)),
        );

        for (index, source) in self.sources.iter().enumerate() {
            for column in &source.unique_columns {
                let owners: Vec<&MergeSource> = self
                    .sources
                    .iter()
                    .filter(|other| other.unique_columns.contains(column))
                    .collect();
                // emitted once, at its first owner
                if owners[0].alias != source.alias {
                    continue;
                }
                if owners.len() == 1 {
                    items.push(SelectItem::column(format!("{}.{}", source.alias, column)));
                } else {
                    let aliases: Vec<&str> = owners.iter().map(|o| o.alias.as_str()).collect();
                    tracing::debug!(
                        "Column {} is shared by {} of {} sources, first at index {}",
                        column,
                        owners.len(),
                        self.sources.len(),
                        index
                    );
                    items.push(coalesce_item(&aliases, column));
                }
            }
        }
        items
    }

    pub fn from_clause(&self) -> String {
        let key = self.key_column();
        let mut clause = String::from("FROM ");
        let mut joined_aliases: Vec<&str> = Vec::new();

        for source in &self.sources {
            if joined_aliases.is_empty() {
                clause.push_str(&format!("{} {}", source.table.quoted(), source.alias));
            } else {
                let left = match joined_aliases.as_slice() {
                    [only] => format!("{}.{}", only, key),
                    many => coalesce(many, key),
                };
                clause.push_str(&format!(
                    "\nFULL OUTER JOIN {} {} ON {} = {}.{}",
                    source.table.quoted(),
                    source.alias,
                    left,
                    source.alias,
                    key
                ));
            }
            joined_aliases.push(&source.alias);
        }
        clause
    }

    pub fn unique_column_count(&self) -> usize {
        self.sources.iter().map(|s| s.unique_columns.len()).sum()
    }
}

fn coalesce(aliases: &[&str], column: &str) -> String {
    let qualified: Vec<String> = aliases
        .iter()
        .map(|alias| format!("{}.{}", alias, column))
        .collect();
    format!("COALESCE({})", qualified.join(", "))
}

fn coalesce_item(aliases: &[&str], column: &str) -> SelectItem {
    SelectItem::aliased(coalesce(aliases, column), column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table(name: &str) -> TableId {
        TableId::new("p", "FlatConnect", name)
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn rendered(plan: &MergePlan) -> Vec<String> {
        plan.select_items().iter().map(SelectItem::render).collect()
    }

    #[test]
    fn test_common_and_unique_columns() {
        let plan = MergePlan::build(
            vec![
                (table("m_v1"), columns(&["a", "b", "c"])),
                (table("m_v2"), columns(&["a", "b", "d"])),
            ],
            "a",
        )
        .unwrap();

        assert_eq!(plan.common_columns, BTreeSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(plan.sources[0].unique_columns, BTreeSet::from(["c".to_string()]));
        assert_eq!(plan.sources[1].unique_columns, BTreeSet::from(["d".to_string()]));
        assert_eq!(
            rendered(&plan),
            vec![
                "COALESCE(v1.a, v2.a) AS a",
                "COALESCE(v1.b, v2.b) AS b",
                "v1.c",
                "v2.d",
            ]
        );
    }

    #[test]
    fn test_every_column_lands_in_exactly_one_set() {
        let inputs = vec![
            (table("m_v1"), columns(&["Connect_ID", "x", "y"])),
            (table("m_v2"), columns(&["Connect_ID", "y", "z"])),
            (table("m_v3"), columns(&["Connect_ID", "z", "w"])),
        ];
        let plan = MergePlan::build(inputs.clone(), "Connect_ID").unwrap();

        for ((_, cols), source) in inputs.iter().zip(&plan.sources) {
            for column in cols {
                let in_common = plan.common_columns.contains(column);
                let in_unique = source.unique_columns.contains(column);
                assert!(in_common ^ in_unique, "column {}", column);
            }
        }
    }

    #[test]
    fn test_three_way_join_chain() {
        let plan = MergePlan::build(
            vec![
                (table("m_v1"), columns(&["Connect_ID", "x", "y"])),
                (table("m_v2"), columns(&["Connect_ID", "y", "z"])),
                (table("m_v3"), columns(&["Connect_ID", "z", "w"])),
            ],
            "Connect_ID",
        )
        .unwrap();

        assert_eq!(
            plan.from_clause(),
            "FROM `p.FlatConnect.m_v1` v1\n\
             FULL OUTER JOIN `p.FlatConnect.m_v2` v2 ON v1.Connect_ID = v2.Connect_ID\n\
             FULL OUTER JOIN `p.FlatConnect.m_v3` v3 ON COALESCE(v1.Connect_ID, v2.Connect_ID) = v3.Connect_ID"
        );
        assert_eq!(
            rendered(&plan),
            vec![
                "COALESCE(v1.Connect_ID, v2.Connect_ID, v3.Connect_ID) AS Connect_ID",
                "v1.x",
                "COALESCE(v1.y, v2.y) AS y",
                "COALESCE(v2.z, v3.z) AS z",
                "v3.w",
            ]
        );
        assert_eq!(plan.unique_column_count(), 6);
    }

    #[test]
    fn test_missing_key_is_a_plan_error() {
        let err = MergePlan::build(
            vec![
                (table("m_v1"), columns(&["Connect_ID", "x"])),
                (table("m_v2"), columns(&["x"])),
            ],
            "Connect_ID",
        )
        .unwrap_err();
        assert_eq!(
            err,
            MergeError::MissingKeyColumn {
                key: "Connect_ID".to_string(),
                tables: "p.FlatConnect.m_v2".to_string(),
            }
        );
    }

    #[test]
    fn test_rejects_single_source_and_empty_tables() {
        assert_eq!(
            MergePlan::build(vec![(table("m_v1"), columns(&["a"]))], "a").unwrap_err(),
            MergeError::NotEnoughSources(1)
        );
        assert_eq!(
            MergePlan::build(
                vec![(table("m_v1"), columns(&["a"])), (table("m_v2"), vec![])],
                "a"
            )
            .unwrap_err(),
            MergeError::NoColumns(table("m_v2"))
        );
    }
}
