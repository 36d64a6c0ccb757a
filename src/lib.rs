// FlatConnect to CleanConnect transformation service
pub mod table_id;
pub mod naming_rule;
pub mod rule_registry;
pub mod normalizer;
pub mod loop_coalescer;
pub mod row_transformer;
pub mod merge_planner;
pub mod sql_renderer;
pub mod validation;
pub mod auth;
pub mod warehouse;
pub mod archive;
pub mod report;
pub mod error;
pub mod transformation_engine;
pub mod config;
pub mod handler;
pub mod router;

// Re-export core types for convenience
pub use table_id::TableId;
pub use naming_rule::{NamingRule, NamingRuleTable, RuleScope};
pub use rule_registry::RuleRegistry;
pub use normalizer::ColumnNormalizer;
pub use loop_coalescer::LoopCoalescer;
pub use row_transformer::RowTransform;
pub use merge_planner::MergePlan;
pub use validation::{TransformationRequest, ValidationReport};
pub use error::ServiceError;
pub use transformation_engine::TransformationEngine;
pub use report::{TransformationReport, TransformationReporter};
