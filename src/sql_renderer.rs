use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;
use crate::{
    loop_coalescer::LoopCoalescer,
    merge_planner::MergePlan,
    naming_rule::CustomTransform,
    normalizer::ColumnNormalizer,
    row_transformer::RowTransform,
    rule_registry::RuleRegistry,
    table_id::TableId,
};

/// One entry of a SELECT list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectItem {
    pub expression: String,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn column(name: impl Into<String>) -> Self {
        Self {
            expression: name.into(),
            alias: None,
        }
    }

    pub fn aliased(expression: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            alias: Some(alias.into()),
        }
    }

    pub fn render(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", self.expression, alias),
            None => self.expression.clone(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("Template placeholder '{placeholder}' is out of range in: {template}")]
    IndexOutOfRange {
        placeholder: String,
        template: String,
    },

    #[error("Template renders no select items: {0}")]
    Empty(String),
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{(source|target)(?:\[(\d+)\])?\}").expect("valid regex")
    })
}

/// Fill in a custom transform template. Each non-empty line becomes a select item.
pub fn render_template(transform: &CustomTransform) -> Result<Vec<SelectItem>, TemplateError> {
    let sources = transform.source.to_vec();
    let targets = transform.target.to_vec();
    let template = &transform.template;

    let mut filled = String::with_capacity(template.len());
    let mut last_end = 0;
    for captures in placeholder_pattern().captures_iter(template) {
        let whole = &captures[0];
        let start = captures.get(0).map(|m| m.start()).unwrap_or(last_end);
        let values = if &captures[1] == "source" { &sources } else { &targets };

        let replacement = match captures.get(2) {
            None => values.join(", "),
            Some(index) => index
                .as_str()
                .parse::<usize>()
                .ok()
                .and_then(|i| values.get(i))
                .cloned()
                .ok_or_else(|| TemplateError::IndexOutOfRange {
                    placeholder: whole.to_string(),
                    template: template.clone(),
                })?,
        };

        filled.push_str(&template[last_end..start]);
        filled.push_str(&replacement);
        last_end = start + whole.len();
    }
    filled.push_str(&template[last_end..]);

    let items: Vec<SelectItem> = filled
        .lines()
        .map(|line| line.trim().trim_end_matches(',').trim_end())
        .filter(|line| !line.is_empty())
        .map(SelectItem::column)
        .collect();

    if items.is_empty() {
        return Err(TemplateError::Empty(template.clone()));
    }
    Ok(items)
}

pub fn select_statement(items: &[SelectItem], from_clause: &str) -> String {
    let list: Vec<String> = items.iter().map(SelectItem::render).collect();
    format!("SELECT\n    {}\n{}", list.join(",\n    "), from_clause)
}

pub fn create_or_replace(destination: &TableId, select: &str) -> String {
    format!(
        "CREATE OR REPLACE TABLE {} AS (\n{}\n)",
        destination.quoted(),
        select
    )
}

/// Select list for a column cleanup, with the bookkeeping the response reports
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnCleanup {
    pub items: Vec<SelectItem>,
    pub columns_read: usize,
    pub loop_groups: usize,
    pub custom_transforms: usize,
    pub warnings: Vec<String>,
}

/// Custom transforms consume their source columns; the rest are normalized and coalesced.
/// Key column first, then coalesced columns by output name, then template items.
pub fn plan_column_cleanup(
    registry: &RuleRegistry,
    source: &TableId,
    columns: &[String],
) -> Result<ColumnCleanup, TemplateError> {
    let dataset_table = source.dataset_table();
    let available: HashSet<String> = columns.iter().map(|c| c.to_lowercase()).collect();
    let mut consumed: HashSet<String> = HashSet::new();
    let mut template_items = Vec::new();
    let mut custom_transforms = 0;

    for transform in registry.custom_transforms_for(&dataset_table) {
        let needed: Vec<String> = transform
            .source
            .to_vec()
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        if !needed.iter().all(|c| available.contains(c)) {
            tracing::debug!("Skipping custom transform for {:?}; sources missing", transform.source);
            continue;
        }
        template_items.extend(render_template(transform)?);
        consumed.extend(needed);
        custom_transforms += 1;
    }

    let normalizer = ColumnNormalizer::new(registry).for_table(source);
    let descriptors = columns
        .iter()
        .filter(|c| !consumed.contains(&c.to_lowercase()))
        .map(|c| normalizer.describe(c))
        .collect();
    let outcome = LoopCoalescer::new(registry).coalesce(descriptors);

    let mut items: Vec<SelectItem> = outcome
        .columns
        .iter()
        .map(|column| column.to_select_item())
        .collect();
    items.extend(template_items);

    Ok(ColumnCleanup {
        items,
        columns_read: columns.len(),
        loop_groups: outcome.loop_groups,
        custom_transforms,
        warnings: outcome.warnings,
    })
}

pub fn render_clean_columns(cleanup: &ColumnCleanup, source: &TableId, destination: &TableId) -> String {
    let select = select_statement(&cleanup.items, &format!("FROM {}", source.quoted()));
    create_or_replace(destination, &select)
}

/// Row cleanup keeps the source column order
pub fn render_clean_rows(
    transforms: &[(String, RowTransform)],
    source: &TableId,
    destination: &TableId,
) -> String {
    let items: Vec<SelectItem> = transforms
        .iter()
        .map(|(column, transform)| transform.render(column))
        .collect();
    let select = select_statement(&items, &format!("FROM {}", source.quoted()));
    create_or_replace(destination, &select)
}

pub fn render_merge(plan: &MergePlan, destination: &TableId) -> String {
    let select = select_statement(&plan.select_items(), &plan.from_clause());
    create_or_replace(destination, &select)
}
