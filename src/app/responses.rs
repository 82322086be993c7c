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

use std::fmt::Write as _;

use axum::{
    http::{
        HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS},
    },
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{
    error::AppError,
    export::PanelExport,
    grafana::{DatasourceRef, ExtractedQuery, PanelInfo, extract_queries},
    promql::extract_metric_names,
};

const MISSING_EXPR_ERROR: &str = "target has no expression";

/// Body of `POST /parse`. Field order and encoding follow the consumers of
/// this endpoint exactly: keys sorted, HTML characters escaped, a trailing
/// newline, and `metrics` written as `null` when nothing was found.
#[derive(Debug, Serialize)]
pub(crate) struct ParseResponse {
    /// `null` when the request body itself was `null`.
    exprs: Option<Vec<String>>,
    metrics: Option<Vec<String>>,
    #[serde(rename = "metricsCount")]
    metrics_count: usize,
    ok: bool,
    #[serde(rename = "parseErrorsByIdx")]
    parse_errors_by_idx: Vec<String>,
    #[serde(rename = "queriesReceived")]
    queries_received: usize,
}

impl ParseResponse {
    pub(crate) fn from_exprs(exprs: Option<Vec<String>>) -> Self {
        let names = extract_metric_names(exprs.as_deref().unwrap_or_default());
        Self {
            queries_received: exprs.as_ref().map_or(0, Vec::len),
            metrics_count: names.metrics.len(),
            metrics: (!names.metrics.is_empty()).then_some(names.metrics),
            ok: true,
            parse_errors_by_idx: names.errors_by_idx,
            exprs,
        }
    }
}

impl IntoResponse for ParseResponse {
    fn into_response(self) -> Response {
        match serde_json::to_string(&self) {
            Ok(json) => {
                let mut body = escape_html(&json);
                body.push('\n');
                ([(CONTENT_TYPE, "application/json")], body).into_response()
            }
            Err(err) => AppError::Internal(format!("failed to encode response: {err}")).into_response(),
        }
    }
}

/// `405` answer for anything but `POST /parse`.
pub(crate) fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        "method not allowed\n",
    )
        .into_response()
}

/// `400` answer for a body that is not a JSON array of strings.
pub(crate) fn invalid_json_body() -> Response {
    (
        StatusCode::BAD_REQUEST,
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        "invalid JSON body\n",
    )
        .into_response()
}

/// These characters only ever occur inside JSON strings, so escaping them
/// textually keeps the document valid.
fn escape_html(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        match ch {
            '<' | '>' | '&' | '\u{2028}' | '\u{2029}' => {
                let _ = write!(out, "\\u{:04x}", ch as u32);
            }
            other => out.push(other),
        }
    }
    out
}

/// Body of `GET /panel`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PanelResponse {
    id: i64,
    title: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    datasource: Option<DatasourceRef>,
    /// `null` where a target has no expression.
    exprs: Vec<Option<String>>,
    metrics: Vec<String>,
    parse_errors_by_idx: Vec<String>,
}

impl PanelResponse {
    pub(crate) fn from_panel(panel: PanelInfo) -> Self {
        let queries = extract_queries(&panel);
        let texts: Vec<&str> = queries.iter().map(|query| query.expr().unwrap_or_default()).collect();
        let names = extract_metric_names(&texts);
        let mut parse_errors_by_idx = names.errors_by_idx;
        for (idx, query) in queries.iter().enumerate() {
            if let ExtractedQuery::Missing { .. } = query {
                parse_errors_by_idx[idx] = MISSING_EXPR_ERROR.to_string();
            }
        }
        Self {
            id: panel.id,
            kind: panel
                .raw_panel
                .get("type")
                .and_then(|kind| kind.as_str())
                .map(str::to_string),
            title: panel.title,
            datasource: panel.datasource,
            exprs: queries
                .into_iter()
                .map(|query| match query {
                    ExtractedQuery::Expr(expr) => Some(expr),
                    ExtractedQuery::Missing { .. } => None,
                })
                .collect(),
            metrics: names.metrics,
            parse_errors_by_idx,
        }
    }
}

/// The exposition body served as a file download.
pub(crate) struct Attachment(pub PanelExport);

impl IntoResponse for Attachment {
    fn into_response(self) -> Response {
        let PanelExport { filename, body, .. } = self.0;
        let disposition = match HeaderValue::from_str(&content_disposition(&filename)) {
            Ok(value) => value,
            Err(err) => {
                return AppError::Internal(format!("invalid attachment name: {err}")).into_response();
            }
        };
        (
            [
                (CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8")),
                (CONTENT_DISPOSITION, disposition),
            ],
            body,
        )
            .into_response()
    }
}

/// `attachment` with a printable ASCII `filename` and, when the name needs
/// it, an RFC 5987 `filename*` carrying the exact UTF-8 name.
fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|ch| if ch == ' ' || ch.is_ascii_graphic() { ch } else { '_' })
        .collect();
    let mut header = format!("attachment; filename=\"{ascii}\"");
    if ascii != filename {
        header.push_str("; filename*=UTF-8''");
        for byte in filename.bytes() {
            if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
                header.push(char::from(byte));
            } else {
                let _ = write!(header, "%{byte:02X}");
            }
        }
    }
    header
}
