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

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing required parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("dashboard `{0}` not found")]
    DashboardNotFound(String),
    #[error("dashboard not found or invalid response shape: {0}")]
    DashboardInvalid(String),
    #[error("grafana rejected the request with status {0}")]
    Unauthorized(u16),
    #[error("panel {panel_id} not found in dashboard {dashboard_uid}")]
    PanelNotFound { dashboard_uid: String, panel_id: i64 },
    #[error("query execution failed: {0}")]
    QueryExecution(String),
    #[error("an export for dashboard {dashboard_uid} panel {panel_id} is already running")]
    Busy { dashboard_uid: String, panel_id: i64 },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error_type) = match &self {
            Self::MissingParameter(_) | Self::InvalidParameter { .. } => {
                (StatusCode::BAD_REQUEST, "bad_data")
            }
            Self::DashboardNotFound(_) | Self::PanelNotFound { .. } => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::DashboardInvalid(_) | Self::QueryExecution(_) | Self::Http(_) => {
                (StatusCode::BAD_GATEWAY, "grafana_error")
            }
            Self::Busy { .. } => (StatusCode::CONFLICT, "busy"),
            Self::Io(_) | Self::Config(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };

        let body = ErrorResponse {
            status: "error",
            error_type,
            error: message,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    status: &'a str,
    #[serde(rename = "errorType")]
    error_type: &'a str,
    error: String,
}
