//! 查询的自然语言摘要（仅用于 UI 叙述，不具权威性）

use super::schema::{DateRangeType, FilterSpec, QuerySpec};

/// 如 `SUM(Sales) and 2 more fields from 2024-01-01 to 2024-12-31`
pub fn query_summary(query: &QuerySpec) -> String {
    let Some(first) = query.fields.first() else {
        return String::new();
    };
    let mut text = match first.function {
        Some(f) => format!("{}({})", f, first.field_caption),
        None => first.field_caption.clone(),
    };
    let more = query.fields.len() - 1;
    if more == 1 {
        text.push_str(" and 1 more field");
    } else if more > 1 {
        text.push_str(&format!(" and {} more fields", more));
    }
    if let Some(period) = query.filters.iter().find_map(date_range) {
        text.push_str(&period);
    }
    text
}

fn date_range(filter: &FilterSpec) -> Option<String> {
    match filter {
        FilterSpec::QuantitativeDate(q) => match (&q.min_date, &q.max_date) {
            (Some(min), Some(max)) => Some(format!(" from {} to {}", min, max)),
            (Some(min), None) => Some(format!(" since {}", min)),
            (None, Some(max)) => Some(format!(" until {}", max)),
            (None, None) => None,
        },
        FilterSpec::Date(d) => {
            let period = format!("{:?}", d.period_type?).to_lowercase();
            let text = match d.date_range_type? {
                DateRangeType::Current => format!(" for the current {}", singular(&period)),
                DateRangeType::Last => format!(" for the last {}", singular(&period)),
                DateRangeType::Next => format!(" for the next {}", singular(&period)),
                DateRangeType::ToDate => format!(" for {} to date", singular(&period)),
                DateRangeType::LastN => format!(" for the last {} {}", d.range_n?, period),
                DateRangeType::NextN => format!(" for the next {} {}", d.range_n?, period),
            };
            Some(text)
        }
        _ => None,
    }
}

fn singular(period: &str) -> &str {
    period.strip_suffix('s').unwrap_or(period)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(v: serde_json::Value) -> QuerySpec {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_first_field_with_range() {
        let q = query(json!({
            "fields": [{"fieldCaption": "Sales", "function": "SUM"}, {"fieldCaption": "Region"}],
            "filters": [{"filterType": "QUANTITATIVE_DATE", "field": {"fieldCaption": "Order Date"},
                         "quantitativeFilterType": "RANGE", "minDate": "2024-01-01", "maxDate": "2024-12-31"}]
        }));
        assert_eq!(query_summary(&q), "SUM(Sales) and 1 more field from 2024-01-01 to 2024-12-31");
    }

    #[test]
    fn test_relative_date_and_dimension() {
        let q = query(json!({
            "fields": [{"fieldCaption": "Category"}],
            "filters": [{"filterType": "DATE", "field": {"fieldCaption": "Order Date"},
                         "periodType": "MONTHS", "dateRangeType": "LASTN", "rangeN": 6}]
        }));
        assert_eq!(query_summary(&q), "Category for the last 6 months");
    }
}
