use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use crate::table_id::TableId;

/// Body of every transformation request, before validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformationRequest {
    #[serde(default)]
    pub source: Option<RequestSource>,
    #[serde(default)]
    pub destination: Option<String>,
}

/// `source` is a single table or an ordered list of tables
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RequestSource {
    Single(String),
    Many(Vec<String>),
}

/// How many source tables an endpoint accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceArity {
    Single,
    AtLeastTwo,
}

/// A request whose identifiers are all well-formed and distinct
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub sources: Vec<TableId>,
    pub destination: TableId,
}

/// Every problem found in a request, collected before anything runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// One line per error
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.field_path, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub field_path: String,
    pub error_type: ValidationErrorType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationErrorType {
    MissingRequiredField,
    InvalidFieldType,
    InvalidFieldValue,
    Conflict,
}

impl ValidationError {
    pub fn new(
        field_path: impl Into<String>,
        error_type: ValidationErrorType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field_path: field_path.into(),
            error_type,
            message: message.into(),
            suggested_fix: None,
        }
    }

    pub fn with_suggested_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }
}

impl TransformationRequest {
    pub fn validate(&self, arity: SourceArity) -> Result<ValidatedRequest, ValidationReport> {
        let mut report = ValidationReport::new();

        let sources = self.validate_sources(arity, &mut report);
        let destination = match self.destination.as_deref() {
            None | Some("") => {
                report.add_error(
                    ValidationError::new(
                        "destination",
                        ValidationErrorType::MissingRequiredField,
                        "destination is required",
                    )
                    .with_suggested_fix("Pass a fully qualified project.dataset.table"),
                );
                None
            }
            Some(raw) => parse_table("destination", raw, &mut report),
        };

        if let Some(destination) = &destination {
            if sources.contains(destination) {
                report.add_error(ValidationError::new(
                    "destination",
                    ValidationErrorType::Conflict,
                    format!("destination {} must differ from every source", destination),
                ));
            }
        }

        match destination {
            Some(destination) if !report.has_errors() => Ok(ValidatedRequest {
                sources,
                destination,
            }),
            _ => Err(report),
        }
    }

    fn validate_sources(&self, arity: SourceArity, report: &mut ValidationReport) -> Vec<TableId> {
        let source = match &self.source {
            Some(RequestSource::Single(source)) if source.is_empty() => None,
            other => other.as_ref(),
        };

        let raw_sources: Vec<String> = match (source, arity) {
            (None, _) => {
                report.add_error(ValidationError::new(
                    "source",
                    ValidationErrorType::MissingRequiredField,
                    "source is required",
                ));
                return Vec::new();
            }
            (Some(RequestSource::Single(source)), SourceArity::Single) => vec![source.clone()],
            (Some(RequestSource::Many(_)), SourceArity::Single) => {
                report.add_error(
                    ValidationError::new(
                        "source",
                        ValidationErrorType::InvalidFieldType,
                        "source must be a single table name",
                    )
                    .with_suggested_fix("Use merge_table_versions to combine several tables"),
                );
                return Vec::new();
            }
            (Some(RequestSource::Single(_)), SourceArity::AtLeastTwo) => {
                report.add_error(ValidationError::new(
                    "source",
                    ValidationErrorType::InvalidFieldType,
                    "source must be a list of table names",
                ));
                return Vec::new();
            }
            (Some(RequestSource::Many(sources)), SourceArity::AtLeastTwo) => {
                if sources.len() < 2 {
                    report.add_error(ValidationError::new(
                        "source",
                        ValidationErrorType::InvalidFieldValue,
                        format!("merging needs at least 2 source tables, got {}", sources.len()),
                    ));
                    return Vec::new();
                }
                sources.clone()
            }
        };

        let mut seen = HashSet::new();
        let mut tables = Vec::with_capacity(raw_sources.len());
        for (index, raw) in raw_sources.iter().enumerate() {
            let field = match arity {
                SourceArity::Single => "source".to_string(),
                SourceArity::AtLeastTwo => format!("source[{}]", index),
            };
            if let Some(table) = parse_table(&field, raw, report) {
                if !seen.insert(table.clone()) {
                    report.add_error(ValidationError::new(
                        field,
                        ValidationErrorType::Conflict,
                        format!("{} is listed more than once", table),
                    ));
                    continue;
                }
                tables.push(table);
            }
        }
        tables
    }
}

fn parse_table(field: &str, raw: &str, report: &mut ValidationReport) -> Option<TableId> {
    match raw.parse::<TableId>() {
        Ok(table) => Some(table),
        Err(e) => {
            report.add_error(ValidationError::new(
                field,
                ValidationErrorType::InvalidFieldValue,
                e.to_string(),
            ));
            None
        }
    }
}
