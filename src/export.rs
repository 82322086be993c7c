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

//! The panel dump pipeline: fetch the dashboard and locate the panel, then
//! execute its queries and render the result as exposition text.

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use log::{debug, info, warn};
use serde::Deserialize;

use crate::{
    error::AppError,
    exposition::{frames_to_lines, render_exposition, sanitize_filename},
    grafana::{
        DatasourceRef, ExtractedQuery, GrafanaClient, PanelInfo, TimeRange, build_query_batch,
        extract_queries,
    },
};

/// Raw parameters as they arrive from the query string or the command line.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportParams {
    pub dashboard: Option<String>,
    pub panel: Option<String>,
    pub timerange: Option<String>,
}

impl ExportParams {
    /// Dashboard uid and panel id; both are required.
    pub fn panel_ref(&self) -> Result<(String, i64), AppError> {
        let dashboard = required(self.dashboard.as_deref(), "dashboard")?;
        let panel = required(self.panel.as_deref(), "panel")?;
        let panel_id = panel
            .parse::<i64>()
            .map_err(|err| AppError::InvalidParameter {
                name: "panel",
                reason: format!("`{panel}` is not an integer id: {err}"),
            })?;
        Ok((dashboard.to_string(), panel_id))
    }
}

fn required<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, AppError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(AppError::MissingParameter(name))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub dashboard_uid: String,
    pub panel_id: i64,
    pub range: TimeRange,
}

impl ExportRequest {
    pub fn from_params(params: &ExportParams) -> Result<Self, AppError> {
        let (dashboard_uid, panel_id) = params.panel_ref()?;
        let timerange = required(params.timerange.as_deref(), "timerange")?;
        Ok(Self {
            dashboard_uid,
            panel_id,
            range: TimeRange::parse_json(timerange)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelExport {
    pub filename: String,
    pub body: String,
    pub line_count: usize,
}

/// Stage one: fetch the dashboard and pull the panel record out of it.
pub async fn load_panel(
    client: &GrafanaClient,
    dashboard_uid: &str,
    panel_id: i64,
) -> Result<PanelInfo, AppError> {
    let dashboard = client.fetch_dashboard(dashboard_uid).await?;
    debug!(
        "dashboard {} loaded (title={:?}, slug={}, top-level panels={})",
        dashboard.dashboard.uid.as_deref().unwrap_or(dashboard_uid),
        dashboard.dashboard.title,
        dashboard.meta.get("slug").and_then(|slug| slug.as_str()).unwrap_or("-"),
        dashboard.dashboard.panels.len()
    );
    PanelInfo::from_dashboard(&dashboard, dashboard_uid, panel_id)
}

/// Picks the datasource uid to run the panel's queries against; `None` when
/// neither the panel, its targets, nor the configured default name one.
pub async fn resolve_datasource(
    client: &GrafanaClient,
    panel: &PanelInfo,
    default_uid: Option<&str>,
) -> Result<Option<String>, AppError> {
    if let Some(reference) = panel.datasource.as_ref().filter(|ds| !ds.is_mixed()) {
        if let Some(uid) = reference.uid() {
            return Ok(Some(uid.to_string()));
        }
        if let DatasourceRef::Legacy(name) = reference {
            return match client.datasource_uid_by_name(name).await? {
                Some(uid) => Ok(Some(uid)),
                None => {
                    debug!("no datasource named `{name}`, using it as a uid");
                    Ok(Some(name.clone()))
                }
            };
        }
    }

    let from_target = panel
        .targets
        .iter()
        .filter_map(|target| target.datasource.as_ref())
        .filter(|ds| !ds.is_mixed())
        .find_map(|ds| ds.uid());
    if let Some(uid) = from_target {
        return Ok(Some(uid.to_string()));
    }

    Ok(default_uid
        .filter(|uid| !uid.is_empty())
        .map(str::to_string))
}

/// Runs both stages. Returns `Ok(None)` when no datasource could be resolved,
/// in which case nothing is queried.
pub async fn run_export(
    client: &GrafanaClient,
    request: &ExportRequest,
    default_datasource: Option<&str>,
) -> Result<Option<PanelExport>, AppError> {
    let started = Instant::now();
    let panel = load_panel(client, &request.dashboard_uid, request.panel_id).await?;
    let Some(datasource_uid) = resolve_datasource(client, &panel, default_datasource).await? else {
        warn!(
            "panel {} in dashboard {} has no resolvable datasource; nothing to export",
            request.panel_id, request.dashboard_uid
        );
        return Ok(None);
    };

    let mut exprs = Vec::with_capacity(panel.targets.len());
    for query in extract_queries(&panel) {
        match query {
            ExtractedQuery::Expr(expr) => exprs.push(expr),
            ExtractedQuery::Missing { position } => {
                let ref_id = panel.targets[position].ref_id.as_deref().unwrap_or("?");
                warn!(
                    "panel {} target {position} (refId {ref_id}) has no expression; skipping it",
                    panel.id
                );
            }
        }
    }

    let filename = sanitize_filename(&panel.export_name());
    if exprs.is_empty() {
        warn!("panel {} has no queries to run", panel.id);
        return Ok(Some(PanelExport {
            filename,
            body: String::new(),
            line_count: 0,
        }));
    }

    let batch = build_query_batch(&exprs, &datasource_uid, &request.range);
    let response = client.query(&batch).await?;
    let lines = frames_to_lines(&response);
    info!(
        "exported dashboard={} panel={} datasource={} queries={} lines={} duration_ms={:.3}",
        request.dashboard_uid,
        request.panel_id,
        datasource_uid,
        batch.queries.len(),
        lines.len(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(Some(PanelExport {
        filename,
        body: render_exposition(&lines),
        line_count: lines.len(),
    }))
}

/// Writes the body unchanged to `dir/filename`, creating `dir` if needed.
pub async fn save_to_dir(export: &PanelExport, dir: &Path) -> Result<PathBuf, AppError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(&export.filename);
    tokio::fs::write(&path, export.body.as_bytes()).await?;
    Ok(path)
}
