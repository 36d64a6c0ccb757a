use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use crate::table_id::TableId;

/// The three transformations the service performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CleanColumns,
    CleanRows,
    MergeTableVersions,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::CleanColumns => "clean_columns",
            Operation::CleanRows => "clean_rows",
            Operation::MergeTableVersions => "merge_table_versions",
        };
        f.write_str(name)
    }
}

/// Response body of a successful transformation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationReport {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub destination: TableId,
    /// `None` when the statement ran but archiving it failed
    pub submitted_sql_path: Option<String>,
    pub summary: TransformationSummary,
    pub warnings: Vec<String>,
}

/// Counters describing what one transformation did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformationSummary {
    pub operation: Option<Operation>,
    pub source_tables: Vec<String>,
    pub job_id: Option<String>,
    pub columns_read: usize,
    pub columns_written: usize,
    pub columns_excluded: usize,
    pub loop_groups: usize,
    pub custom_transforms: usize,
    pub binary_columns: usize,
    pub false_array_columns: usize,
    pub common_columns: usize,
    pub unique_columns: usize,
}

impl TransformationSummary {
    pub fn new(operation: Operation, sources: &[TableId]) -> Self {
        Self {
            operation: Some(operation),
            source_tables: sources.iter().map(TableId::to_string).collect(),
            ..Self::default()
        }
    }
}

/// Response body of `GET /heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
}

/// Stamps reports with the service identity and time of completion
#[derive(Debug, Clone)]
pub struct TransformationReporter {
    service: String,
}

impl TransformationReporter {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn generate_report(
        &self,
        destination: TableId,
        submitted_sql_path: Option<String>,
        summary: TransformationSummary,
        warnings: Vec<String>,
    ) -> TransformationReport {
        let operation = summary
            .operation
            .map(|op| op.to_string())
            .unwrap_or_else(|| "transformation".to_string());
        let status = match &submitted_sql_path {
            Some(_) => format!("{} completed for {}", operation, destination),
            None => format!(
                "{} completed for {}; submitted SQL was not archived",
                operation, destination
            ),
        };

        TransformationReport {
            status,
            timestamp: Utc::now(),
            service: self.service.clone(),
            destination,
            submitted_sql_path,
            summary,
            warnings,
        }
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            status: "healthy".to_string(),
            timestamp: Utc::now(),
            service: self.service.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_status_reflects_archival() {
        let reporter = TransformationReporter::new("connect-transform");
        let destination = TableId::new("p", "CleanConnect", "module1");
        let summary = TransformationSummary::new(
            Operation::CleanColumns,
            &[TableId::new("p", "FlatConnect", "module1")],
        );

        let archived = reporter.generate_report(
            destination.clone(),
            Some("gs://bucket/a.sql".to_string()),
            summary.clone(),
            Vec::new(),
        );
        assert_eq!(archived.status, "clean_columns completed for p.CleanConnect.module1");
        assert_eq!(archived.service, "connect-transform");

        let unarchived = reporter.generate_report(destination, None, summary, Vec::new());
        assert!(unarchived.status.ends_with("submitted SQL was not archived"));
    }

    #[test]
    fn test_report_serializes_destination_as_string() {
        let reporter = TransformationReporter::new("svc");
        let report = reporter.generate_report(
            TableId::new("p", "CleanConnect", "module1"),
            None,
            TransformationSummary::new(Operation::MergeTableVersions, &[]),
            vec!["warning".to_string()],
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["destination"], "p.CleanConnect.module1");
        assert_eq!(json["submitted_sql_path"], serde_json::Value::Null);
        assert_eq!(json["summary"]["operation"], "merge_table_versions");
        assert_eq!(json["warnings"][0], "warning");
    }

    #[test]
    fn test_heartbeat() {
        let heartbeat = TransformationReporter::new("svc").heartbeat();
        assert_eq!(heartbeat.status, "healthy");
        assert_eq!(heartbeat.service, "svc");
    }
}
