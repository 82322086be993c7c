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

//! Dashboard documents as returned by `GET /api/dashboards/uid/{uid}`.
//!
//! Grafana dashboards carry no schema we can rely on across versions, so every
//! node is decoded leniently: absent or mistyped fields fall back to their
//! defaults and the raw JSON is kept alongside for anything not modeled here.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// Pseudo datasource used by panels whose targets each pick their own source.
pub const MIXED_DATASOURCE_UID: &str = "-- Mixed --";

#[derive(Debug, Clone)]
pub struct DashboardResponse {
    pub dashboard: DashboardModel,
    pub meta: Value,
}

impl DashboardResponse {
    /// Rejects bodies without a `dashboard` object, mirroring Grafana's own
    /// "not found or invalid response shape" failure.
    pub fn from_json(raw: Value) -> Result<Self, AppError> {
        let Value::Object(mut body) = raw else {
            return Err(AppError::DashboardInvalid(
                "response body is not a JSON object".into(),
            ));
        };
        let dashboard = match body.remove("dashboard") {
            Some(value @ Value::Object(_)) => DashboardModel::from_value(value),
            Some(_) => {
                return Err(AppError::DashboardInvalid(
                    "`dashboard` field is not an object".into(),
                ));
            }
            None => {
                return Err(AppError::DashboardInvalid(
                    "response has no `dashboard` field".into(),
                ));
            }
        };
        let meta = body.remove("meta").unwrap_or(Value::Null);
        Ok(Self { dashboard, meta })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DashboardModel {
    pub uid: Option<String>,
    pub title: Option<String>,
    pub panels: Vec<PanelNode>,
}

impl DashboardModel {
    fn from_value(raw: Value) -> Self {
        Self {
            uid: string_field(&raw, "uid"),
            title: string_field(&raw, "title"),
            panels: panel_list(&raw),
        }
    }
}

/// One node of the panel tree. Rows and other grouping panels keep their
/// children in `panels`.
#[derive(Debug, Clone, Default)]
pub struct PanelNode {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub datasource: Option<DatasourceRef>,
    pub targets: Vec<Target>,
    pub panels: Vec<PanelNode>,
    pub raw: Value,
}

impl PanelNode {
    pub fn from_value(raw: Value) -> Self {
        Self {
            id: raw.get("id").and_then(integer_id),
            title: string_field(&raw, "title"),
            datasource: raw.get("datasource").and_then(DatasourceRef::from_value),
            targets: raw
                .get("targets")
                .and_then(Value::as_array)
                .map(|targets| targets.iter().map(Target::from_value).collect())
                .unwrap_or_default(),
            panels: panel_list(&raw),
            raw,
        }
    }
}

impl<'de> Deserialize<'de> for PanelNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(PanelNode::from_value)
    }
}

/// Datasource reference as found on panels and targets. Older dashboards
/// store the datasource name as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DatasourceRef {
    Legacy(String),
    Object {
        uid: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
    },
}

impl DatasourceRef {
    pub fn from_value(raw: &Value) -> Option<Self> {
        match raw {
            Value::String(name) if !name.is_empty() => Some(Self::Legacy(name.clone())),
            Value::Object(_) => Some(Self::Object {
                uid: string_field(raw, "uid"),
                kind: string_field(raw, "type"),
            }),
            _ => None,
        }
    }

    /// Uid usable with `/api/ds/query`, if the reference names one directly.
    pub fn uid(&self) -> Option<&str> {
        match self {
            Self::Object { uid: Some(uid), .. } if !uid.is_empty() => Some(uid),
            _ => None,
        }
    }

    pub fn is_mixed(&self) -> bool {
        match self {
            Self::Legacy(name) => name == MIXED_DATASOURCE_UID,
            Self::Object { uid, .. } => uid.as_deref() == Some(MIXED_DATASOURCE_UID),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Target {
    pub ref_id: Option<String>,
    pub expr: Option<String>,
    pub datasource: Option<DatasourceRef>,
}

impl Target {
    fn from_value(raw: &Value) -> Self {
        Self {
            ref_id: string_field(raw, "refId"),
            expr: string_field(raw, "expr"),
            datasource: raw.get("datasource").and_then(DatasourceRef::from_value),
        }
    }
}

/// Depth-first pre-order search. A node is checked before its children and
/// the first match wins when ids repeat.
pub fn find_panel_by_id(panels: &[PanelNode], id: i64) -> Option<&PanelNode> {
    for panel in panels {
        if panel.id == Some(id) {
            return Some(panel);
        }
        if !panel.panels.is_empty() {
            if let Some(found) = find_panel_by_id(&panel.panels, id) {
                return Some(found);
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct PanelInfo {
    pub id: i64,
    pub title: Option<String>,
    pub datasource: Option<DatasourceRef>,
    pub targets: Vec<Target>,
    pub raw_panel: Value,
}

impl PanelInfo {
    pub fn from_dashboard(
        response: &DashboardResponse,
        dashboard_uid: &str,
        panel_id: i64,
    ) -> Result<Self, AppError> {
        let panel = find_panel_by_id(&response.dashboard.panels, panel_id).ok_or_else(|| {
            AppError::PanelNotFound {
                dashboard_uid: dashboard_uid.to_string(),
                panel_id,
            }
        })?;
        Ok(Self {
            id: panel_id,
            title: panel.title.clone(),
            datasource: panel.datasource.clone(),
            targets: panel.targets.clone(),
            raw_panel: panel.raw.clone(),
        })
    }

    /// Base name for the exported file, before sanitizing.
    pub fn export_name(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => format!("{title}.prom"),
            _ => format!("panel-{}.prom", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedQuery {
    Expr(String),
    /// The target at `position` has no string `expr` field.
    Missing { position: usize },
}

impl ExtractedQuery {
    pub fn expr(&self) -> Option<&str> {
        match self {
            Self::Expr(expr) => Some(expr),
            Self::Missing { .. } => None,
        }
    }
}

pub fn extract_queries(panel: &PanelInfo) -> Vec<ExtractedQuery> {
    panel
        .targets
        .iter()
        .enumerate()
        .map(|(position, target)| match &target.expr {
            Some(expr) => ExtractedQuery::Expr(expr.clone()),
            None => ExtractedQuery::Missing { position },
        })
        .collect()
}

fn panel_list(raw: &Value) -> Vec<PanelNode> {
    raw.get("panels")
        .and_then(Value::as_array)
        .map(|panels| panels.iter().cloned().map(PanelNode::from_value).collect())
        .unwrap_or_default()
}

fn string_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Panel ids written by some tools arrive as `42.0`.
fn integer_id(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|id| id.fract() == 0.0 && id.abs() < i64::MAX as f64)
            .map(|id| id as i64)
    })
}
