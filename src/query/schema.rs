//! 可执行查询与分析计划的强类型定义（serde + schemars）
//!
//! 查询部分沿用 VizQL Data Service 的 camelCase 键；分析计划沿用 snake_case 键。
//! 过滤器属性大多为 Option：结构（shape）由 validate 负责，语义完整性由 preflight 负责。

use schemars::{schema_for, JsonSchema};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// 固定的聚合函数词表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggFunction {
    Sum,
    Avg,
    Median,
    Count,
    CountDistinct,
    Min,
    Max,
}

impl AggFunction {
    pub const ALL: [AggFunction; 7] = [
        AggFunction::Sum,
        AggFunction::Avg,
        AggFunction::Median,
        AggFunction::Count,
        AggFunction::CountDistinct,
        AggFunction::Min,
        AggFunction::Max,
    ];

    /// 忽略大小写解析；COUNTD 视为 COUNT_DISTINCT
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SUM" => Some(AggFunction::Sum),
            "AVG" => Some(AggFunction::Avg),
            "MEDIAN" => Some(AggFunction::Median),
            "COUNT" => Some(AggFunction::Count),
            "COUNTD" | "COUNT_DISTINCT" => Some(AggFunction::CountDistinct),
            "MIN" => Some(AggFunction::Min),
            "MAX" => Some(AggFunction::Max),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunction::Sum => "SUM",
            AggFunction::Avg => "AVG",
            AggFunction::Median => "MEDIAN",
            AggFunction::Count => "COUNT",
            AggFunction::CountDistinct => "COUNT_DISTINCT",
            AggFunction::Min => "MIN",
            AggFunction::Max => "MAX",
        }
    }
}

impl std::fmt::Display for AggFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AggFunction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AggFunction::parse(&raw)
            .ok_or_else(|| de::Error::custom(format!("Unsupported aggregation function: {}", raw)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub field_caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<AggFunction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_direction: Option<SortDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_priority: Option<u32>,
}

impl FieldSpec {
    pub fn new(caption: impl Into<String>, function: Option<AggFunction>) -> Self {
        Self {
            field_caption: caption.into(),
            function,
            field_alias: None,
            sort_direction: None,
            sort_priority: None,
        }
    }
}

/// 过滤器引用的字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterField {
    pub field_caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<AggFunction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum TopDirection {
    Top,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuantitativeFilterType {
    Range,
    Min,
    Max,
    OnlyNull,
    OnlyNonNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeriodType {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Quarters,
    Years,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum DateRangeType {
    Current,
    Last,
    #[serde(rename = "LASTN")]
    LastN,
    Next,
    #[serde(rename = "NEXTN")]
    NextN,
    #[serde(rename = "TODATE")]
    ToDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopFilter {
    pub field: FilterField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub how_many: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_to_measure: Option<FilterField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<TopDirection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetFilter {
    pub field: FilterField,
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchFilter {
    pub field: FilterField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuantitativeNumericalFilter {
    pub field: FilterField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantitative_filter_type: Option<QuantitativeFilterType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_nulls: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuantitativeDateFilter {
    pub field: FilterField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantitative_filter_type: Option<QuantitativeFilterType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_nulls: Option<bool>,
}

/// 相对日期过滤器（filterType = DATE）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelativeDateFilter {
    pub field: FilterField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_type: Option<PeriodType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range_type: Option<DateRangeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_n: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_nulls: Option<bool>,
}

/// 以 filterType 为标签的过滤器联合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "filterType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterSpec {
    Top(TopFilter),
    Set(SetFilter),
    Match(MatchFilter),
    QuantitativeDate(QuantitativeDateFilter),
    QuantitativeNumerical(QuantitativeNumericalFilter),
    Date(RelativeDateFilter),
}

pub const FILTER_TYPES: [&str; 6] = [
    "TOP",
    "SET",
    "MATCH",
    "QUANTITATIVE_DATE",
    "QUANTITATIVE_NUMERICAL",
    "DATE",
];

impl FilterSpec {
    pub fn filter_type(&self) -> &'static str {
        match self {
            FilterSpec::Top(_) => "TOP",
            FilterSpec::Set(_) => "SET",
            FilterSpec::Match(_) => "MATCH",
            FilterSpec::QuantitativeDate(_) => "QUANTITATIVE_DATE",
            FilterSpec::QuantitativeNumerical(_) => "QUANTITATIVE_NUMERICAL",
            FilterSpec::Date(_) => "DATE",
        }
    }

    pub fn field(&self) -> &FilterField {
        match self {
            FilterSpec::Top(f) => &f.field,
            FilterSpec::Set(f) => &f.field,
            FilterSpec::Match(f) => &f.field,
            FilterSpec::QuantitativeDate(f) => &f.field,
            FilterSpec::QuantitativeNumerical(f) => &f.field,
            FilterSpec::Date(f) => &f.field,
        }
    }

    /// 过滤器引用到的全部字段标题（含 TOP 的 fieldToMeasure）
    pub fn referenced_captions(&self) -> Vec<&str> {
        let mut out = vec![self.field().field_caption.as_str()];
        if let FilterSpec::Top(top) = self {
            if let Some(m) = &top.field_to_measure {
                out.push(m.field_caption.as_str());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReturnFormat {
    Objects,
    Arrays,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_format: Option<ReturnFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disaggregate: Option<bool>,
}

impl QueryOptions {
    pub fn is_empty(&self) -> bool {
        self.return_format.is_none() && self.debug.is_none() && self.disaggregate.is_none()
    }
}

/// 可执行查询：fields 非空；fields / filters 中引用的标题都必须在允许列表内
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

impl QuerySpec {
    pub fn referenced_captions(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.fields.iter().map(|f| f.field_caption.as_str()).collect();
        for filter in &self.filters {
            out.extend(filter.referenced_captions());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceRef {
    pub datasource_luid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VizqlRefinement {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adjust_filters: Vec<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// 步骤要求走代码执行（CI）路径时的指令；SummarizeRunner 以其存在作为路由信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CiDirective {
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisStep {
    pub id: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vizql_refinement: Option<VizqlRefinement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci: Option<CiDirective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
}

/// 分析计划：steps 至少一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<String>,
    pub steps: Vec<AnalysisStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assumptions: Vec<String>,
}

impl AnalysisPlan {
    /// 是否有步骤显式要求代码执行
    pub fn requests_code_execution(&self) -> bool {
        self.steps.iter().any(|s| s.ci.is_some())
    }
}

/// 分析阶段输出：分析计划 + 可选的草拟查询（供编译阶段参考）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisPlannerOutput {
    pub analysis_plan: AnalysisPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QuerySpec>,
}

/// 编译阶段输出：可直接发往连接器的查询载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlannerPayload {
    pub datasource: DatasourceRef,
    pub query: QuerySpec,
    #[serde(default)]
    pub options: QueryOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_plan: Option<AnalysisPlan>,
}

/// 编译器提示中注入的载荷 JSON Schema
pub fn planner_payload_schema_json() -> String {
    let schema = schema_for!(PlannerPayload);
    serde_json::to_string(&schema).unwrap_or_default()
}
