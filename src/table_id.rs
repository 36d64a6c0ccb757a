use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// A fully qualified warehouse table: `project.dataset.table`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableId {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableId {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// `dataset.table`, the key one-off renames and custom transforms are filed under
    pub fn dataset_table(&self) -> String {
        format!("{}.{}", self.dataset, self.table)
    }

    /// Backtick-quoted form used inside generated SQL
    pub fn quoted(&self) -> String {
        format!("`{}`", self)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

fn project_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").expect("valid regex"))
}

fn dataset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

fn table_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_\-]*$").expect("valid regex"))
}

impl FromStr for TableId {
    type Err = TableIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(TableIdError::NotFullyQualified(s.to_string()));
        }

        let checks: [(&str, &str, &Regex); 3] = [
            ("project", parts[0], project_pattern()),
            ("dataset", parts[1], dataset_pattern()),
            ("table", parts[2], table_pattern()),
        ];
        for (part, value, pattern) in checks {
            if !pattern.is_match(value) {
                return Err(TableIdError::InvalidPart {
                    identifier: s.to_string(),
                    part,
                    value: value.to_string(),
                });
            }
        }

        Ok(TableId::new(parts[0], parts[1], parts[2]))
    }
}

impl TryFrom<String> for TableId {
    type Error = TableIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TableId> for String {
    fn from(id: TableId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TableIdError {
    #[error("Table name '{0}' is not fully qualified as project.dataset.table")]
    NotFullyQualified(String),

    #[error("Table name '{identifier}' has an invalid {part} '{value}'")]
    InvalidPart {
        identifier: String,
        part: &'static str,
        value: String,
    },
}
