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

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use log::{info, warn};

use crate::{
    error::AppError,
    grafana::{GrafanaClient, GrafanaConfig},
};

type ExportKey = (String, i64);

#[derive(Clone)]
pub struct AppState {
    grafana: GrafanaClient,
    default_datasource: Option<String>,
    in_flight: Arc<Mutex<HashSet<ExportKey>>>,
}

impl AppState {
    pub async fn bootstrap(config: AppConfig) -> Result<Self, AppError> {
        let AppConfig {
            grafana,
            default_datasource,
        } = config;
        info!("preparing Grafana client for {}", grafana.url);
        let client = GrafanaClient::new(&grafana)?;
        match client.health().await {
            Ok(Some(version)) => info!("connected to Grafana {version}"),
            Ok(None) => info!("connected to Grafana (version not reported)"),
            Err(err) => warn!("Grafana health check failed: {err}"),
        }
        if let Some(uid) = default_datasource.as_deref() {
            info!("falling back to datasource `{uid}` for panels without one");
        }
        Ok(Self {
            grafana: client,
            default_datasource: default_datasource.filter(|uid| !uid.is_empty()),
            in_flight: Arc::default(),
        })
    }

    pub fn grafana(&self) -> &GrafanaClient {
        &self.grafana
    }

    pub fn default_datasource(&self) -> Option<&str> {
        self.default_datasource.as_deref()
    }

    /// Marks an export of `(dashboard, panel)` as running until the returned
    /// guard is dropped. Fails with `Busy` while another one holds it.
    pub fn begin_export(&self, dashboard_uid: &str, panel_id: i64) -> Result<ExportGuard, AppError> {
        let key = (dashboard_uid.to_string(), panel_id);
        if !lock(&self.in_flight).insert(key.clone()) {
            return Err(AppError::Busy {
                dashboard_uid: key.0,
                panel_id,
            });
        }
        Ok(ExportGuard {
            key,
            in_flight: self.in_flight.clone(),
        })
    }
}

pub struct AppConfig {
    pub grafana: GrafanaConfig,
    pub default_datasource: Option<String>,
}

pub struct ExportGuard {
    key: ExportKey,
    in_flight: Arc<Mutex<HashSet<ExportKey>>>,
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.key);
    }
}

// The set stays consistent even if a holder panicked.
fn lock(set: &Mutex<HashSet<ExportKey>>) -> MutexGuard<'_, HashSet<ExportKey>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn state() -> AppState {
        AppState::bootstrap(AppConfig {
            grafana: GrafanaConfig {
                url: "http://127.0.0.1:9".into(),
                timeout: Some(std::time::Duration::from_millis(200)),
                ..Default::default()
            },
            default_datasource: Some(String::new()),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn busy_guard_rejects_duplicate_until_released() {
        let state = state().await;
        let guard = state.begin_export("d1", 42).unwrap();
        assert!(matches!(
            state.begin_export("d1", 42),
            Err(AppError::Busy { panel_id: 42, .. })
        ));
        let other = state.begin_export("d1", 43).unwrap();
        drop(guard);
        let again = state.begin_export("d1", 42);
        assert!(again.is_ok());
        drop(other);
    }

    #[tokio::test]
    async fn empty_default_datasource_counts_as_unset() {
        assert_eq!(state().await.default_datasource(), None);
    }
}
