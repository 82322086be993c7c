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

//! Conversion of query frames into Prometheus text exposition lines.

use std::{collections::BTreeMap, fmt};

use log::{debug, warn};
use serde_json::Value;

use crate::grafana::{Frame, QueryResponse};

const METRIC_NAME_LABEL: &str = "__name__";
const FORBIDDEN_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
pub const DEFAULT_EXPORT_FILENAME: &str = "panel-dump.prom";

/// `metric{label="value",...} value timestamp`; label values are written
/// verbatim.
pub struct ExpositionLine<'a> {
    pub metric: &'a str,
    pub labels: &'a BTreeMap<String, String>,
    pub value: &'a str,
    pub timestamp: &'a str,
}

impl fmt::Display for ExpositionLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric)?;
        if !self.labels.is_empty() {
            f.write_str("{")?;
            for (idx, (key, value)) in self.labels.iter().enumerate() {
                if idx > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{key}=\"{value}\"")?;
            }
            f.write_str("}")?;
        }
        write!(f, " {} {}", self.value, self.timestamp)
    }
}

/// Lines are grouped by result group in ref id order, then by frame, then by
/// ascending sample index. Frames lacking a time or number field, or whose
/// columns disagree in length, contribute nothing.
pub fn frames_to_lines(response: &QueryResponse) -> Vec<String> {
    let mut lines = Vec::new();
    for (ref_id, group) in &response.results {
        if let Some(error) = group.error.as_deref().filter(|error| !error.is_empty()) {
            match group.status {
                Some(status) => warn!("query {ref_id} failed with status {status}: {error}"),
                None => warn!("query {ref_id} failed: {error}"),
            }
        }
        if group.frames.is_empty() {
            continue;
        }
        for (idx, frame) in group.frames.iter().enumerate() {
            let before = lines.len();
            append_frame_lines(ref_id, frame, &mut lines);
            debug!(
                "query {ref_id} frame {idx} produced {} lines",
                lines.len() - before
            );
        }
    }
    lines
}

fn append_frame_lines(ref_id: &str, frame: &Frame, out: &mut Vec<String>) {
    let (Some(schema), Some(data)) = (frame.schema.as_ref(), frame.data.as_ref()) else {
        return;
    };
    let Some(time_idx) = schema.fields.iter().position(|field| field.is_kind("time")) else {
        return;
    };
    let Some(value_idx) = schema.fields.iter().position(|field| field.is_kind("number")) else {
        return;
    };
    let (Some(times), Some(values)) = (data.values.get(time_idx), data.values.get(value_idx))
    else {
        return;
    };
    if times.len() != values.len() {
        debug!(
            "query {ref_id}: skipping frame with {} timestamps and {} values",
            times.len(),
            values.len()
        );
        return;
    }

    let field = &schema.fields[value_idx];
    let metric = field
        .labels
        .get(METRIC_NAME_LABEL)
        .map(String::as_str)
        .or_else(|| field.display_name())
        .or(schema.name.as_deref().filter(|name| !name.is_empty()))
        .unwrap_or(ref_id);
    let mut labels = field.labels.clone();
    labels.remove(METRIC_NAME_LABEL);
    let entities = data.entities.get(value_idx).and_then(Option::as_ref);

    for (idx, (time, value)) in times.iter().zip(values).enumerate() {
        let Some(timestamp) = number_text(time) else {
            continue;
        };
        let value = match value {
            Value::Null => entities.and_then(|entities| entities.special_at(idx)).map(str::to_string),
            other => number_text(other),
        };
        let Some(value) = value else {
            continue;
        };
        let line = ExpositionLine {
            metric,
            labels: &labels,
            value: &value,
            timestamp: &timestamp,
        };
        out.push(line.to_string());
    }
}

fn number_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Joins lines with `\n`; a non-empty body ends with a newline.
pub fn render_exposition(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

pub fn sanitize_filename(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.chars().all(|ch| FORBIDDEN_FILENAME_CHARS.contains(&ch)) {
        return DEFAULT_EXPORT_FILENAME.to_string();
    }
    trimmed.replace(FORBIDDEN_FILENAME_CHARS, "_")
}
