//! 由结构校验问题生成面向模型的重试提示

use super::schema::{AggFunction, FILTER_TYPES};
use super::validate::{IssueKind, SchemaIssue};

/// 针对具体违规生成重试提示；相同类别的提示只出现一次
pub fn retry_hint(issues: &[SchemaIssue]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut push = |line: String| {
        if !lines.contains(&line) {
            lines.push(line);
        }
    };

    for issue in issues {
        match issue.kind {
            IssueKind::UnsupportedFilterType => push(format!(
                "{}: use only filterType values {}.",
                issue.message,
                FILTER_TYPES.join(", ")
            )),
            IssueKind::UnsupportedAggregation => push(format!(
                "{}: function must be one of {}, or omitted for dimensions.",
                issue.message,
                AggFunction::ALL.map(|f| f.as_str()).join(", ")
            )),
            _ if issue.path.ends_with("howMany") || issue.path.ends_with("fieldToMeasure") => push(
                "TOP filters require an integer howMany > 0 and fieldToMeasure: {\"fieldCaption\": ..., \"function\": ...}."
                    .to_string(),
            ),
            _ if issue.path.ends_with("steps") => push(
                "analysis_plan.steps must contain at least one step with a non-empty id and goal.".to_string(),
            ),
            IssueKind::Malformed => push(format!(
                "The output could not be parsed ({}); return a single JSON object matching the schema.",
                issue.message
            )),
            _ => push(format!("Fix {}: {}.", issue.path, issue.message)),
        }
    }

    let mut hint = String::from("Your previous output failed validation:\n");
    for line in &lines {
        hint.push_str("- ");
        hint.push_str(line);
        hint.push('\n');
    }
    hint.push_str("Return only the corrected JSON object.");
    hint
}
