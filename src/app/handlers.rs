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

use std::time::Instant;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::{
    error::AppError,
    export::{ExportParams, ExportRequest, load_panel, run_export},
};

use super::{
    responses::{Attachment, PanelResponse, ParseResponse, invalid_json_body, method_not_allowed},
    state::AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/parse", post(parse_exprs).fallback(parse_wrong_method))
        .route("/panel", get(panel_summary))
        .route("/export", get(export_panel))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
}

/// Only the first JSON value of the body is read; anything after it is
/// ignored. A top-level `null` is answered with `"exprs": null`.
async fn parse_exprs(body: Bytes) -> Response {
    let first = serde_json::Deserializer::from_slice(&body)
        .into_iter::<Option<Vec<Option<String>>>>()
        .next();
    let exprs = match first {
        Some(Ok(exprs)) => exprs,
        Some(Err(err)) => {
            log::debug!("rejecting /parse body: {err}");
            return invalid_json_body();
        }
        None => {
            log::debug!("rejecting empty /parse body");
            return invalid_json_body();
        }
    };
    let exprs: Option<Vec<String>> =
        exprs.map(|exprs| exprs.into_iter().map(Option::unwrap_or_default).collect());
    log::debug!(
        "parse request received: {} expressions",
        exprs.as_ref().map_or(0, Vec::len)
    );
    ParseResponse::from_exprs(exprs).into_response()
}

async fn parse_wrong_method() -> Response {
    method_not_allowed()
}

async fn panel_summary(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Json<PanelResponse>, AppError> {
    let (dashboard_uid, panel_id) = params.panel_ref()?;
    let panel = load_panel(state.grafana(), &dashboard_uid, panel_id).await?;
    Ok(Json(PanelResponse::from_panel(panel)))
}

async fn export_panel(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Response, AppError> {
    let request = ExportRequest::from_params(&params)?;
    log::debug!(
        "export requested: dashboard={} panel={} from={} to={}",
        request.dashboard_uid,
        request.panel_id,
        request.range.from,
        request.range.to
    );
    // Released on every exit path, including a dropped connection.
    let _guard = state.begin_export(&request.dashboard_uid, request.panel_id)?;
    match run_export(state.grafana(), &request, state.default_datasource()).await? {
        Some(export) => Ok(Attachment(export).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status();
    let elapsed = start.elapsed();
    log::info!(
        "method={} path={} status={} duration_ms={:.3}",
        method,
        uri.path(),
        status.as_u16(),
        elapsed.as_secs_f64() * 1000.0
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app::AppConfig,
        grafana::GrafanaConfig,
        testing::{FakeGrafana, spawn_fake_grafana},
    };
    use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    struct Harness {
        base: String,
        http: reqwest::Client,
        state: AppState,
        _grafana: FakeGrafana,
    }

    async fn harness(default_datasource: Option<&str>) -> Harness {
        let grafana = spawn_fake_grafana().await;
        let state = AppState::bootstrap(AppConfig {
            grafana: GrafanaConfig {
                url: grafana.url.clone(),
                ..Default::default()
            },
            default_datasource: default_datasource.map(str::to_string),
        })
        .await
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Harness {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            state,
            _grafana: grafana,
        }
    }

    impl Harness {
        async fn get(&self, path_and_query: &str) -> reqwest::Response {
            self.http
                .get(format!("{}{path_and_query}", self.base))
                .send()
                .await
                .unwrap()
        }

        async fn post_parse(&self, body: &'static str) -> reqwest::Response {
            self.http
                .post(format!("{}/parse", self.base))
                .body(body)
                .send()
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn parse_endpoint_reports_metrics_and_errors() {
        let harness = harness(None).await;
        let response = harness
            .post_parse(r#"["rate(http_requests_total[$__rate_interval])", null, "up{"]"#)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body = response.text().await.unwrap();
        assert!(body.ends_with('\n'));
        let decoded: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(decoded["ok"], true);
        assert_eq!(decoded["queriesReceived"], 3);
        assert_eq!(
            decoded["exprs"],
            json!(["rate(http_requests_total[$__rate_interval])", "", "up{"])
        );
        assert_eq!(decoded["metrics"], json!(["http_requests_total"]));
        assert_eq!(decoded["metricsCount"], 1);
        assert_eq!(decoded["parseErrorsByIdx"][0], "");
        assert_eq!(decoded["parseErrorsByIdx"][1], "no expression found in input");
        assert_ne!(decoded["parseErrorsByIdx"][2], "");
    }

    #[tokio::test]
    async fn parse_endpoint_rejects_bad_bodies() {
        let harness = harness(None).await;
        for body in [r#"{"q":"up"}"#, "not json", r#"[1, 2]"#, "", "  "] {
            let response = harness.post_parse(body).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(
                response.headers()[CONTENT_TYPE],
                "text/plain; charset=utf-8"
            );
            assert_eq!(response.text().await.unwrap(), "invalid JSON body\n");
        }
        let response = harness.get("/parse").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.text().await.unwrap(), "method not allowed\n");
    }

    #[tokio::test]
    async fn parse_endpoint_reads_only_the_first_json_value() {
        let harness = harness(None).await;
        let response = harness.post_parse("null").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.text().await.unwrap(),
            "{\"exprs\":null,\"metrics\":null,\"metricsCount\":0,\"ok\":true,\"parseErrorsByIdx\":[],\"queriesReceived\":0}\n"
        );

        let response = harness.post_parse(r#"["up"] trailing"#).await;
        assert_eq!(response.status(), StatusCode::OK);
        let decoded: Value = response.json().await.unwrap();
        assert_eq!(decoded["exprs"], json!(["up"]));
        assert_eq!(decoded["metrics"], json!(["up"]));
        assert_eq!(decoded["queriesReceived"], 1);
    }

    #[tokio::test]
    async fn export_endpoint_serves_attachment() {
        let harness = harness(None).await;
        let response = harness
            .get("/export?dashboard=d1&panel=42&timerange=%7B%22from%22%3A1000%2C%22to%22%3A3000%7D")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"CPU _ load.prom\""
        );
        let body = response.text().await.unwrap();
        assert_eq!(body.lines().count(), 6);
        assert!(body.starts_with("up{job=\"node\"} 1 1000\n"));
    }

    #[tokio::test]
    async fn export_endpoint_maps_errors_to_statuses() {
        let harness = harness(None).await;
        let timerange = "timerange=%7B%22from%22%3A%22now-6h%22%2C%22to%22%3A%22now%22%7D";

        let response = harness.get("/export?dashboard=d1&panel=42").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["errorType"], "bad_data");

        let response = harness.get(&format!("/export?dashboard=nope&panel=1&{timerange}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = harness.get(&format!("/export?dashboard=d1&panel=999&{timerange}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = harness.get(&format!("/export?dashboard=broken&panel=1&{timerange}")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = harness.get(&format!("/export?dashboard=d1&panel=45&{timerange}")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn export_endpoint_rejects_concurrent_duplicate() {
        let harness = harness(None).await;
        let path = "/export?dashboard=d1&panel=42&timerange=%7B%22from%22%3A1000%2C%22to%22%3A3000%7D";
        let guard = harness.state.begin_export("d1", 42).unwrap();
        let response = harness.get(path).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["errorType"], "busy");

        drop(guard);
        assert_eq!(harness.get(path).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn export_endpoint_uses_configured_default_datasource() {
        let harness = harness(Some("fallback")).await;
        let response = harness
            .get("/export?dashboard=d1&panel=45&timerange=%7B%22from%22%3A1%2C%22to%22%3A2%7D")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"panel-45.prom\""
        );
        assert_eq!(response.text().await.unwrap().lines().count(), 3);
    }

    #[tokio::test]
    async fn panel_endpoint_summarizes_queries() {
        let harness = harness(None).await;
        let response = harness.get("/panel?dashboard=d1&panel=43").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["id"], 43);
        assert_eq!(body["title"], "Legacy");
        assert_eq!(body["type"], Value::Null);
        assert_eq!(body["datasource"], "Prometheus");
        assert_eq!(body["exprs"], json!(["up", null]));
        assert_eq!(body["metrics"], json!(["up"]));
        assert_eq!(body["parseErrorsByIdx"], json!(["", "target has no expression"]));

        let body: Value = harness
            .get("/panel?dashboard=d1&panel=42")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(body["type"], "timeseries");
        assert_eq!(body["datasource"], json!({ "uid": "prom1", "type": "prometheus" }));
        assert_eq!(body["metrics"], json!(["up", "x"]));
    }
}
