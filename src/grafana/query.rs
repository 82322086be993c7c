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

use chrono::DateTime;
use serde::Serialize;
use serde_json::Value;

use crate::error::AppError;

/// Time bounds in the form `/api/ds/query` accepts: epoch milliseconds or a
/// relative expression such as `now-6h`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub from: String,
    pub to: String,
}

impl TimeRange {
    /// Parses the JSON-encoded range Grafana hands to panel links, e.g.
    /// `{"from":"2024-05-01T10:00:00.000Z","to":"2024-05-01T16:00:00.000Z","raw":{...}}`.
    pub fn parse_json(raw: &str) -> Result<Self, AppError> {
        let value: Value = serde_json::from_str(raw).map_err(|err| AppError::InvalidParameter {
            name: "timerange",
            reason: format!("not valid JSON: {err}"),
        })?;
        let from = bound(&value, "from")?;
        let to = bound(&value, "to")?;
        Ok(Self { from, to })
    }
}

fn bound(value: &Value, key: &'static str) -> Result<String, AppError> {
    let invalid = |reason: String| AppError::InvalidParameter {
        name: "timerange",
        reason,
    };
    match value.get(key) {
        Some(Value::Number(number)) => Ok(number.to_string()),
        Some(Value::String(text)) if !text.trim().is_empty() => {
            let text = text.trim();
            match DateTime::parse_from_rfc3339(text) {
                Ok(datetime) => Ok(datetime.timestamp_millis().to_string()),
                Err(_) => Ok(text.to_string()),
            }
        }
        Some(other) => Err(invalid(format!("`{key}` has unsupported value {other}"))),
        None => Err(invalid(format!("`{key}` is required"))),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryBatch {
    pub queries: Vec<QuerySpec>,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub ref_id: String,
    pub expr: String,
    pub datasource: QueryDatasource,
    pub instant: bool,
    pub range: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryDatasource {
    pub uid: String,
}

/// Reference id for the query at `position`: `A`..`Z`, then `Q26`, `Q27`, ...
pub fn ref_id_for(position: usize) -> String {
    if position < 26 {
        char::from(b'A' + position as u8).to_string()
    } else {
        format!("Q{position}")
    }
}

/// Every query runs as an instant evaluation against one datasource; the
/// range bounds are passed through for the host to derive the evaluation time.
pub fn build_query_batch(exprs: &[String], datasource_uid: &str, range: &TimeRange) -> QueryBatch {
    let queries = exprs
        .iter()
        .enumerate()
        .map(|(position, expr)| QuerySpec {
            ref_id: ref_id_for(position),
            expr: expr.clone(),
            datasource: QueryDatasource {
                uid: datasource_uid.to_string(),
            },
            instant: true,
            range: false,
        })
        .collect();
    QueryBatch {
        queries,
        from: range.from.clone(),
        to: range.to.clone(),
    }
}
