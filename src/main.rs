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
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use app::{AppConfig, AppState, router};
use clap::{Parser, Subcommand};
use error::AppError;
use export::{ExportParams, ExportRequest, run_export, save_to_dir};
use grafana::GrafanaConfig;
use log::{LevelFilter, info, warn};

mod app;
mod error;
mod export;
mod exposition;
mod grafana;
mod promql;
#[cfg(test)]
mod testing;

#[derive(Debug, Parser)]
#[command(author, version, about, disable_help_subcommand = true)]
struct Args {
    /// Grafana base URL, e.g. https://grafana.example.com or http://host:3000/grafana
    #[arg(long = "grafana-url", env = "GRAFANA_URL")]
    grafana_url: String,
    /// Service account or API token sent as a bearer token
    #[arg(long, env = "GRAFANA_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Organization to act in (X-Grafana-Org-Id)
    #[arg(long = "org-id", env = "GRAFANA_ORG_ID")]
    org_id: Option<u64>,
    /// Per-request timeout towards Grafana, in seconds
    #[arg(long = "timeout-secs", env = "GRAFANA_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,
    /// Datasource uid used when a panel does not name one
    #[arg(long = "default-datasource", env = "DEFAULT_DATASOURCE_UID")]
    default_datasource: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve /parse, /panel and /export over HTTP
    Serve {
        /// HTTP bind address
        #[arg(long = "bind", env = "BIND_ADDR", default_value = "0.0.0.0:3200")]
        bind: SocketAddr,
    },
    /// Dump one panel's current values to a .prom file
    Export {
        /// Dashboard uid
        #[arg(long)]
        dashboard: String,
        /// Panel id
        #[arg(long)]
        panel: String,
        /// JSON time range, e.g. '{"from":"now-6h","to":"now"}'
        #[arg(long)]
        timerange: String,
        /// Directory the file is written to
        #[arg(long = "output-dir", default_value = ".")]
        output_dir: PathBuf,
    },
}

impl Args {
    fn app_config(&self) -> AppConfig {
        AppConfig {
            grafana: GrafanaConfig {
                url: self.grafana_url.clone(),
                token: self.token.clone(),
                org_id: self.org_id,
                timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
            },
            default_datasource: self.default_datasource.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();
    let args = Args::parse();
    info!("starting grafana-panel-dump (grafana={})", args.grafana_url);
    let state = AppState::bootstrap(args.app_config()).await?;

    match args.command {
        Command::Serve { bind } => serve(state, bind).await,
        Command::Export {
            dashboard,
            panel,
            timerange,
            output_dir,
        } => {
            let params = ExportParams {
                dashboard: Some(dashboard),
                panel: Some(panel),
                timerange: Some(timerange),
            };
            export(state, &params, &output_dir).await
        }
    }
}

async fn serve(state: AppState, bind: SocketAddr) -> Result<(), AppError> {
    let app = router(state);
    info!("binding TCP listener on {bind}");
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind listener: {err}")))?;
    info!("grafana-panel-dump listening on {bind}");
    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;
    Ok(())
}

async fn export(state: AppState, params: &ExportParams, output_dir: &Path) -> Result<(), AppError> {
    let request = ExportRequest::from_params(params)?;
    let run = run_export(state.grafana(), &request, state.default_datasource());
    // Dropping the run on Ctrl-C discards whatever it had fetched.
    let export = tokio::select! {
        result = run => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("export cancelled; nothing written");
            return Ok(());
        }
    };
    let Some(export) = export else {
        return Ok(());
    };
    let path = save_to_dir(&export, output_dir).await?;
    info!("wrote {} lines to {}", export.line_count, path.display());
    Ok(())
}

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::Builder::from_default_env().init();
    } else {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Warn)
            .filter_module("grafana_panel_dump", LevelFilter::Info)
            .init();
    }
}
