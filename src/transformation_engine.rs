use std::collections::HashSet;
use std::sync::Arc;
use crate::{
    archive::{ArchiveStore, ArchivedArtifact},
    error::ServiceError,
    merge_planner::MergePlan,
    report::{Operation, TransformationReport, TransformationReporter, TransformationSummary},
    row_transformer::{binary_detection_queries, parse_binary_detection, RowTransform},
    rule_registry::RuleRegistry,
    sql_renderer,
    table_id::TableId,
    validation::{SourceArity, TransformationRequest},
    warehouse::{TableColumn, Warehouse},
};

/// Orchestrates a transformation: validate, read metadata, render, execute, archive
pub struct TransformationEngine {
    registry: Arc<RuleRegistry>,
    warehouse: Arc<dyn Warehouse>,
    archive: Arc<dyn ArchiveStore>,
    reporter: TransformationReporter,
}

/// Columns of a source table that survived the exclusion lists
struct SourceColumns {
    columns: Vec<TableColumn>,
    excluded: usize,
}

impl SourceColumns {
    fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

impl TransformationEngine {
    pub fn new(
        registry: Arc<RuleRegistry>,
        warehouse: Arc<dyn Warehouse>,
        archive: Arc<dyn ArchiveStore>,
        reporter: TransformationReporter,
    ) -> Self {
        Self {
            registry,
            warehouse,
            archive,
            reporter,
        }
    }

    pub fn reporter(&self) -> &TransformationReporter {
        &self.reporter
    }

    /// Normalize column names and collapse loop variants into one column each
    pub async fn clean_columns(
        &self,
        request: &TransformationRequest,
    ) -> Result<TransformationReport, ServiceError> {
        let validated = request.validate(SourceArity::Single)?;
        let source = &validated.sources[0];
        tracing::info!("clean_columns {} -> {}", source, validated.destination);

        let columns = self.source_columns(source).await?;
        let cleanup = sql_renderer::plan_column_cleanup(&self.registry, source, &columns.names())?;
        let sql = sql_renderer::render_clean_columns(&cleanup, source, &validated.destination);

        let mut summary = TransformationSummary::new(Operation::CleanColumns, &validated.sources);
        summary.columns_read = cleanup.columns_read + columns.excluded;
        summary.columns_excluded = columns.excluded;
        summary.columns_written = cleanup.items.len();
        summary.loop_groups = cleanup.loop_groups;
        summary.custom_transforms = cleanup.custom_transforms;

        self.submit(sql, validated.destination, summary, cleanup.warnings)
            .await
    }

    /// Rewrite binary answers and false arrays, column by column
    pub async fn clean_rows(
        &self,
        request: &TransformationRequest,
    ) -> Result<TransformationReport, ServiceError> {
        let validated = request.validate(SourceArity::Single)?;
        let source = &validated.sources[0];
        tracing::info!("clean_rows {} -> {}", source, validated.destination);

        let columns = self.source_columns(source).await?;
        let binary_columns = self.detect_binary_columns(source, &columns.columns).await?;

        let transforms: Vec<(String, RowTransform)> = columns
            .columns
            .iter()
            .map(|column| {
                let transform = RowTransform::classify(&column.name, &self.registry, &binary_columns);
                (column.name.clone(), transform)
            })
            .collect();
        let sql = sql_renderer::render_clean_rows(&transforms, source, &validated.destination);

        let count = |kind: RowTransform| transforms.iter().filter(|(_, t)| *t == kind).count();
        let mut summary = TransformationSummary::new(Operation::CleanRows, &validated.sources);
        summary.columns_read = columns.columns.len() + columns.excluded;
        summary.columns_excluded = columns.excluded;
        summary.columns_written = transforms.len();
        summary.binary_columns = count(RowTransform::BinaryToConcept);
        summary.false_array_columns = count(RowTransform::UnwrapFalseArray);

        self.submit(sql, validated.destination, summary, Vec::new())
            .await
    }

    /// Full outer join of version tables on the key column
    pub async fn merge_table_versions(
        &self,
        request: &TransformationRequest,
    ) -> Result<TransformationReport, ServiceError> {
        let validated = request.validate(SourceArity::AtLeastTwo)?;
        tracing::info!(
            "merge_table_versions {} sources -> {}",
            validated.sources.len(),
            validated.destination
        );

        let mut sources = Vec::with_capacity(validated.sources.len());
        let mut columns_read = 0;
        let mut columns_excluded = 0;
        for table in &validated.sources {
            let columns = self.source_columns(table).await?;
            columns_read += columns.columns.len() + columns.excluded;
            columns_excluded += columns.excluded;
            sources.push((table.clone(), columns.names()));
        }

        let plan = MergePlan::build(sources, self.registry.key_column())?;
        let sql = sql_renderer::render_merge(&plan, &validated.destination);

        let mut summary =
            TransformationSummary::new(Operation::MergeTableVersions, &validated.sources);
        summary.columns_read = columns_read;
        summary.columns_excluded = columns_excluded;
        summary.columns_written = plan.select_items().len();
        summary.common_columns = plan.common_columns.len();
        summary.unique_columns = plan.unique_column_count();

        self.submit(sql, validated.destination, summary, Vec::new())
            .await
    }

    async fn source_columns(&self, table: &TableId) -> Result<SourceColumns, ServiceError> {
        let all = self.warehouse.table_columns(table).await?;
        if all.is_empty() {
            return Err(ServiceError::Plan(format!("Source table {} has no columns", table)));
        }

        let total = all.len();
        let columns: Vec<TableColumn> = all
            .into_iter()
            .filter(|column| !self.registry.is_excluded(&column.name))
            .collect();
        let excluded = total - columns.len();
        if excluded > 0 {
            tracing::debug!("Excluded {} columns of {}", excluded, table);
        }
        if columns.is_empty() {
            return Err(ServiceError::Plan(format!(
                "Every column of {} is excluded",
                table
            )));
        }

        Ok(SourceColumns { columns, excluded })
    }

    /// STRING columns that only hold "0", "1", "" or NULL. False arrays and the key are never candidates.
    async fn detect_binary_columns(
        &self,
        table: &TableId,
        columns: &[TableColumn],
    ) -> Result<HashSet<String>, ServiceError> {
        let candidates: Vec<String> = columns
            .iter()
            .filter(|c| c.is_string())
            .filter(|c| c.name != self.registry.key_column())
            .filter(|c| !self.registry.is_false_array_column(&c.name))
            .map(|c| c.name.clone())
            .collect();

        let mut binary = HashSet::new();
        let queries = binary_detection_queries(table, &candidates);
        let batches = queries.len();
        for (batch, query) in queries.iter().enumerate() {
            tracing::debug!("Profiling batch {} of {} for {}", batch + 1, batches, table);
            let row = self.warehouse.query_row(query).await?;
            binary.extend(parse_binary_detection(&row));
        }
        tracing::info!(
            "{} of {} STRING columns in {} are binary",
            binary.len(),
            candidates.len(),
            table
        );
        Ok(binary)
    }

    /// Execute, then archive. An archive failure is reported, never fatal.
    async fn submit(
        &self,
        sql: String,
        destination: TableId,
        mut summary: TransformationSummary,
        mut warnings: Vec<String>,
    ) -> Result<TransformationReport, ServiceError> {
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        let job_id = self.warehouse.execute(&sql, &destination).await?;
        if !job_id.is_empty() {
            summary.job_id = Some(job_id);
        }

        let artifact = ArchivedArtifact::new(sql, destination);
        let submitted_sql_path = match self
            .archive
            .store(&artifact.file_name(), &artifact.sql_text)
            .await
        {
            Ok(path) => {
                tracing::info!("Archived submitted SQL to {}", path);
                Some(path)
            }
            Err(e) => {
                tracing::error!(
                    "Failed to archive SQL for {} under {}: {}",
                    artifact.destination,
                    self.archive.location(),
                    e
                );
                warnings.push(format!("Submitted SQL was not archived: {}", e));
                None
            }
        };

        Ok(self.reporter.generate_report(
            artifact.destination,
            submitted_sql_path,
            summary,
            warnings,
        ))
    }
}
