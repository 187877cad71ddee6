//! 执行前的查询预检：不触达连接器，只检查各过滤器类型的必需属性是否齐全且自洽
//!
//! 返回空字符串表示通过；否则为以 "; " 连接的问题列表。对已通过的查询重复调用结果不变。

use chrono::{DateTime, NaiveDate};

use super::schema::{
    DateRangeType, FieldSpec, FilterSpec, QuantitativeFilterType, QuerySpec,
};

/// RFC3339 日期时间或完整日期（YYYY-MM-DD）
pub fn is_rfc3339_date(raw: &str) -> bool {
    let s = raw.trim();
    DateTime::parse_from_rfc3339(s).is_ok() || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn check_quantitative<T>(
    label: &str,
    kind: Option<QuantitativeFilterType>,
    min: Option<T>,
    max: Option<T>,
    min_key: &str,
    max_key: &str,
    problems: &mut Vec<String>,
) {
    let Some(kind) = kind else {
        problems.push(format!("{} requires quantitativeFilterType", label));
        return;
    };
    match kind {
        QuantitativeFilterType::Range => {
            if min.is_none() || max.is_none() {
                problems.push(format!("{} RANGE requires both {} and {}", label, min_key, max_key));
            }
        }
        QuantitativeFilterType::Min => {
            if min.is_none() {
                problems.push(format!("{} MIN requires {}", label, min_key));
            }
        }
        QuantitativeFilterType::Max => {
            if max.is_none() {
                problems.push(format!("{} MAX requires {}", label, max_key));
            }
        }
        QuantitativeFilterType::OnlyNull | QuantitativeFilterType::OnlyNonNull => {
            if min.is_some() || max.is_some() {
                problems.push(format!(
                    "{} {:?} must not set {} or {}",
                    label, kind, min_key, max_key
                ));
            }
        }
    }
}

fn check_filter(index: usize, filter: &FilterSpec, problems: &mut Vec<String>) {
    let label = format!("filters[{}] {}", index, filter.filter_type());
    if filter.field().field_caption.trim().is_empty() {
        problems.push(format!("{} requires field.fieldCaption", label));
    }
    match filter {
        FilterSpec::Top(top) => {
            match top.how_many {
                Some(n) if n > 0 => {}
                Some(n) => problems.push(format!("{} howMany must be a positive integer (got {})", label, n)),
                None => problems.push(format!("{} requires howMany", label)),
            }
            let measured = top
                .field_to_measure
                .as_ref()
                .map(|m| !m.field_caption.trim().is_empty())
                .unwrap_or(false);
            if !measured {
                problems.push(format!("{} requires fieldToMeasure.fieldCaption", label));
            }
        }
        FilterSpec::Set(set) => {
            if set.values.is_empty() {
                problems.push(format!("{} requires non-empty values", label));
            }
        }
        FilterSpec::Match(m) => {
            let has_pattern = [&m.starts_with, &m.ends_with, &m.contains]
                .iter()
                .any(|p| p.as_deref().map(|s| !s.is_empty()).unwrap_or(false));
            if !has_pattern {
                problems.push(format!("{} requires startsWith, endsWith or contains", label));
            }
        }
        FilterSpec::QuantitativeNumerical(q) => {
            check_quantitative(&label, q.quantitative_filter_type, q.min, q.max, "min", "max", problems);
            if let (Some(min), Some(max)) = (q.min, q.max) {
                if min > max {
                    problems.push(format!("{} min must not exceed max", label));
                }
            }
        }
        FilterSpec::QuantitativeDate(q) => {
            check_quantitative(
                &label,
                q.quantitative_filter_type,
                q.min_date.as_deref(),
                q.max_date.as_deref(),
                "minDate",
                "maxDate",
                problems,
            );
            for (key, value) in [("minDate", &q.min_date), ("maxDate", &q.max_date)] {
                if let Some(v) = value {
                    if !is_rfc3339_date(v) {
                        problems.push(format!("{} {} must be an RFC3339 date (got '{}')", label, key, v));
                    }
                }
            }
        }
        FilterSpec::Date(d) => {
            if d.period_type.is_none() {
                problems.push(format!("{} requires periodType", label));
            }
            match d.date_range_type {
                None => problems.push(format!("{} requires dateRangeType", label)),
                Some(DateRangeType::LastN) | Some(DateRangeType::NextN) => match d.range_n {
                    Some(n) if n > 0 => {}
                    _ => problems.push(format!("{} LASTN/NEXTN requires a positive rangeN", label)),
                },
                Some(_) => {}
            }
            if let Some(anchor) = &d.anchor_date {
                if !is_rfc3339_date(anchor) {
                    problems.push(format!("{} anchorDate must be an RFC3339 date (got '{}')", label, anchor));
                }
            }
        }
    }
}

/// 预检查询；返回 "" 表示通过
pub fn preflight(query: &QuerySpec) -> String {
    let mut problems = Vec::new();
    if query.fields.is_empty() {
        problems.push("query.fields must include at least one field".to_string());
    }
    for (i, field) in query.fields.iter().enumerate() {
        if field.field_caption.trim().is_empty() {
            problems.push(format!("fields[{}] requires fieldCaption", i));
        }
    }
    for (i, filter) in query.filters.iter().enumerate() {
        check_filter(i, filter, &mut problems);
    }
    problems.join("; ")
}

/// 允许列表检查：查询中引用的每个标题都必须出现在允许列表中；返回 None 表示通过
pub fn check_allow_list(query: &QuerySpec, allowed: &[FieldSpec]) -> Option<String> {
    let mut outside: Vec<&str> = Vec::new();
    for caption in query.referenced_captions() {
        let known = allowed.iter().any(|a| a.field_caption == caption);
        if !known && !outside.contains(&caption) {
            outside.push(caption);
        }
    }
    if outside.is_empty() {
        None
    } else {
        Some(format!(
            "Fields not in ALLOWED_FIELDS_JSON: {}. Use only allowed fieldCaption values.",
            outside.join(", ")
        ))
    }
}
