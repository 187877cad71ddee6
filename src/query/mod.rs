//! 查询层：强类型查询与分析计划、结构校验、预检、重试提示、查询摘要

pub mod hints;
pub mod preflight;
pub mod schema;
pub mod summary;
pub mod validate;

pub use hints::retry_hint;
pub use preflight::{check_allow_list, is_rfc3339_date, preflight};
pub use schema::{
    AggFunction, AnalysisPlan, AnalysisPlannerOutput, AnalysisStep, CiDirective, DatasourceRef,
    FieldSpec, FilterField, FilterSpec, PlannerPayload, QueryOptions, QuerySpec,
    planner_payload_schema_json,
};
pub use summary::query_summary;
pub use validate::{
    validate_analysis_output, validate_analysis_plan, validate_planner_payload, IssueKind,
    SchemaIssue, ValidationErrors,
};
