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

use std::time::Duration;

use log::{debug, info, warn};
use reqwest::{
    Client, StatusCode,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::AppError;

use super::{
    dashboard::DashboardResponse,
    frames::QueryResponse,
    query::QueryBatch,
};

const ORG_ID_HEADER: &str = "X-Grafana-Org-Id";

#[derive(Clone, Debug, Default)]
pub struct GrafanaConfig {
    pub url: String,
    pub token: Option<String>,
    pub org_id: Option<u64>,
    pub timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct GrafanaClient {
    http: Client,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct DatasourceInfo {
    uid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthInfo {
    version: Option<String>,
    database: Option<String>,
}

impl GrafanaClient {
    pub fn new(config: &GrafanaConfig) -> Result<Self, AppError> {
        let mut base = Url::parse(&config.url)
            .map_err(|err| AppError::Config(format!("invalid Grafana URL {}: {err}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "Grafana URL {} cannot be used as a base",
                config.url
            )));
        }
        // Sub-path deployments (https://host/grafana) keep their prefix.
        if let Ok(mut segments) = base.path_segments_mut() {
            segments.pop_if_empty();
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = config.token.as_deref().filter(|token| !token.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| AppError::Config(format!("invalid Grafana token: {err}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(org_id) = config.org_id {
            headers.insert(ORG_ID_HEADER, HeaderValue::from(org_id));
        }

        let mut builder = Client::builder().default_headers(headers);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|err| AppError::Config(format!("failed to build HTTP client: {err}")))?;
        info!("grafana client targeting {}", base);
        Ok(Self { http, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    /// Probes `/api/health` and returns the reported Grafana version.
    pub async fn health(&self) -> Result<Option<String>, AppError> {
        let url = self.endpoint(&["api", "health"]);
        let response = self.http.get(url).send().await?.error_for_status()?;
        let info: HealthInfo = response.json().await?;
        if let Some(database) = info.database.as_deref().filter(|db| *db != "ok") {
            warn!("grafana reports database status `{database}`");
        }
        Ok(info.version)
    }

    pub async fn fetch_dashboard(&self, uid: &str) -> Result<DashboardResponse, AppError> {
        let url = self.endpoint(&["api", "dashboards", "uid", uid]);
        debug!("fetching dashboard from {url}");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| AppError::DashboardInvalid(format!("request failed: {err}")))?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(AppError::DashboardNotFound(uid.to_string())),
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                return Err(AppError::Unauthorized(status.as_u16()));
            }
            status => {
                return Err(AppError::DashboardInvalid(format!(
                    "dashboard request returned status {status}"
                )));
            }
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| AppError::DashboardInvalid(format!("body is not JSON: {err}")))?;
        DashboardResponse::from_json(body)
    }

    /// Resolves a legacy datasource name to its uid. `None` when Grafana has
    /// no datasource by that name.
    pub async fn datasource_uid_by_name(&self, name: &str) -> Result<Option<String>, AppError> {
        let url = self.endpoint(&["api", "datasources", "name", name]);
        debug!("resolving datasource name via {url}");
        let response = self.http.get(url).send().await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Ok(None),
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                return Err(AppError::Unauthorized(status.as_u16()));
            }
            status => {
                return Err(AppError::Internal(format!(
                    "datasource lookup for `{name}` returned status {status}"
                )));
            }
        }
        let info: DatasourceInfo = response.json().await?;
        Ok(info.uid.filter(|uid| !uid.is_empty()))
    }

    pub async fn query(&self, batch: &QueryBatch) -> Result<QueryResponse, AppError> {
        let url = self.endpoint(&["api", "ds", "query"]);
        debug!(
            "executing {} queries via {url} (from={}, to={})",
            batch.queries.len(),
            batch.from,
            batch.to
        );
        let response = self
            .http
            .post(url)
            .json(batch)
            .send()
            .await
            .map_err(|err| AppError::QueryExecution(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::QueryExecution(format!(
                "status {status}: {}",
                error_message(&body)
            )));
        }
        response
            .json()
            .await
            .map_err(|err| AppError::QueryExecution(format!("invalid query response: {err}")))
    }
}

/// Grafana reports failures as `{"message": ...}`; anything else is passed on
/// as-is.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
