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

//! In-process stand-in for the Grafana HTTP API used by async tests.

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};

#[derive(Default)]
struct Recorded {
    batches: Vec<Value>,
    authorization: Option<String>,
}

type Shared = Arc<Mutex<Recorded>>;

pub(crate) struct FakeGrafana {
    pub url: String,
    recorded: Shared,
    server: JoinHandle<()>,
}

impl FakeGrafana {
    /// Bodies received by `/api/ds/query`, in arrival order.
    pub fn batches(&self) -> Vec<Value> {
        self.recorded.lock().unwrap().batches.clone()
    }

    pub fn authorization(&self) -> Option<String> {
        self.recorded.lock().unwrap().authorization.clone()
    }
}

impl Drop for FakeGrafana {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub(crate) async fn spawn_fake_grafana() -> FakeGrafana {
    let recorded = Shared::default();
    let app = Router::new()
        .route("/api/dashboards/uid/{uid}", get(dashboard))
        .route("/api/datasources/name/{name}", get(datasource_by_name))
        .route("/api/ds/query", post(query))
        .with_state(recorded.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    FakeGrafana {
        url: format!("http://{addr}"),
        recorded,
        server,
    }
}

/// `d1` nests panel 42 two levels deep under a row; 43 uses a legacy name
/// reference; 44 is a mixed panel; 45 names no datasource at all.
fn dashboard_d1() -> Value {
    json!({
        "meta": { "slug": "node", "canEdit": true },
        "dashboard": {
            "uid": "d1",
            "title": "Node",
            "panels": [
                { "id": 1, "type": "row", "title": "Overview", "panels": [
                    { "id": 7, "type": "row", "panels": [
                        {
                            "id": 42,
                            "type": "timeseries",
                            "title": "CPU / load",
                            "datasource": { "uid": "prom1", "type": "prometheus" },
                            "targets": [
                                { "refId": "A", "expr": "up" },
                                { "refId": "B", "expr": "rate(x[5m])" }
                            ]
                        }
                    ]}
                ]},
                {
                    "id": 43,
                    "title": "Legacy",
                    "datasource": "Prometheus",
                    "targets": [{ "refId": "A", "expr": "up" }, { "refId": "B" }]
                },
                {
                    "id": 44,
                    "title": "Mixed",
                    "datasource": { "uid": "-- Mixed --" },
                    "targets": [
                        { "refId": "A", "expr": "up", "datasource": { "uid": "-- Mixed --" } },
                        { "refId": "B", "expr": "up", "datasource": { "uid": "prom2" } }
                    ]
                },
                { "id": 45, "title": "", "targets": [{ "refId": "A", "expr": "up" }] }
            ]
        }
    })
}

async fn dashboard(Path(uid): Path<String>) -> Response {
    match uid.as_str() {
        "d1" => Json(dashboard_d1()).into_response(),
        "broken" => Json(json!({ "meta": {} })).into_response(),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "Dashboard not found" })),
        )
            .into_response(),
    }
}

async fn datasource_by_name(Path(name): Path<String>) -> Response {
    if name == "Prometheus" {
        Json(json!({ "uid": "prom-legacy", "name": name, "type": "prometheus" })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "Data source not found" })),
        )
            .into_response()
    }
}

/// Answers every query with one frame of three samples. The metric name is
/// `up` for the `up` query and `x` for anything else.
async fn query(State(recorded): State<Shared>, headers: HeaderMap, Json(batch): Json<Value>) -> Json<Value> {
    let queries = batch["queries"].as_array().cloned().unwrap_or_default();
    {
        let mut recorded = recorded.lock().unwrap();
        recorded.authorization = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        recorded.batches.push(batch);
    }

    let mut results = serde_json::Map::new();
    for query in queries {
        let ref_id = query["refId"].as_str().unwrap_or_default().to_string();
        let (name, values) = if query["expr"] == "up" {
            ("up", json!([1, 0, 1]))
        } else {
            ("x", json!([0.5, 0.25, 0.125]))
        };
        results.insert(
            ref_id.clone(),
            json!({
                "status": 200,
                "frames": [{
                    "schema": {
                        "refId": ref_id,
                        "fields": [
                            { "name": "Time", "type": "time" },
                            { "name": "Value", "type": "number",
                              "labels": { "__name__": name, "job": "node" } }
                        ]
                    },
                    "data": { "values": [[1000, 2000, 3000], values] }
                }]
            }),
        );
    }
    Json(json!({ "results": results }))
}
