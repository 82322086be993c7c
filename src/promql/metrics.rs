// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashSet;

use super::{METRIC_NAME_LABEL, MatchOp, VectorSelector, parse_promql};

/// Literal substituted for dashboard variables so the expression parses.
const MACRO_PLACEHOLDER: &str = "5m";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricNames {
    /// Deduplicated, in first-seen order.
    pub metrics: Vec<String>,
    /// One entry per input expression; empty when it parsed.
    pub errors_by_idx: Vec<String>,
}

pub fn extract_metric_names<S: AsRef<str>>(exprs: &[S]) -> MetricNames {
    let mut seen = HashSet::new();
    let mut metrics = Vec::new();
    let mut errors_by_idx = vec![String::new(); exprs.len()];

    for (idx, expr) in exprs.iter().enumerate() {
        let parsed = match parse_promql(&strip_grafana_macros(expr.as_ref())) {
            Ok(parsed) => parsed,
            Err(err) => {
                errors_by_idx[idx] = err.to_string();
                continue;
            }
        };
        for selector in parsed.vector_selectors() {
            if let Some(name) = selector_metric_name(selector) {
                if seen.insert(name.to_string()) {
                    metrics.push(name.to_string());
                }
            }
        }
    }

    MetricNames {
        metrics,
        errors_by_idx,
    }
}

/// The explicit metric name, else the first `__name__` matcher when it is an
/// equality. A regex `__name__` matcher may select many metrics and yields
/// nothing.
fn selector_metric_name(selector: &VectorSelector) -> Option<&str> {
    if let Some(name) = selector.name.as_deref().filter(|name| !name.is_empty()) {
        return Some(name);
    }
    selector
        .matchers
        .iter()
        .find(|matcher| {
            matcher.name == METRIC_NAME_LABEL
                && matches!(matcher.op, MatchOp::Eq | MatchOp::RegexEq)
        })
        .filter(|matcher| matcher.op == MatchOp::Eq)
        .map(|matcher| matcher.value.as_str())
        .filter(|name| !name.is_empty())
}

/// Replaces `$var` and `$__interval`-style variables with a duration literal.
pub fn strip_grafana_macros(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut chars = expr.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let mut matched = false;
        while let Some(&(_, next)) = chars.peek() {
            if !(next.is_ascii_alphanumeric() || next == '_') {
                break;
            }
            matched = true;
            chars.next();
        }
        if matched {
            out.push_str(MACRO_PLACEHOLDER);
        } else {
            out.push('$');
        }
    }
    out
}
