use proxmox_client::client::{Credentials, HttpProxmoxClient, ProxmoxClient};
use proxmox_k8s_util::client::new_client;
use proxmox_operator::controller::State;
use proxmox_operator::telemetry;

use std::sync::Arc;

use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, Router};
use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::warn;

async fn metrics(AxumState(state): AxumState<State>) -> impl IntoResponse {
    match state.metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
            metrics,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to get metrics: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name = "proxmox-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Address to serve the Prometheus/OpenMetrics `/metrics` endpoint on.
    #[arg(long, default_value = "0.0.0.0:8080", env)]
    metrics_bind_address: String,

    /// Address to serve the `/healthz` liveness/readiness endpoint on.
    #[arg(long, default_value = "0.0.0.0:8081", env)]
    health_probe_bind_address: String,

    /// Enable leader election for active-passive high availability.
    ///
    /// Not yet implemented: accepted for command-line compatibility with the
    /// wider Cluster API provider ecosystem, but a single replica is always
    /// active.
    #[arg(long, default_value_t = false, env)]
    leader_elect: bool,

    /// Enable the conversion/validation webhook server.
    ///
    /// Not yet implemented: this provider has no webhooks to serve.
    #[arg(long, default_value_t = false, env)]
    enable_webhooks: bool,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(&args.log_filter, args.log_format, args.tracing_url.as_deref(), args.sample_ratio).await?;

    if args.leader_elect {
        warn!(msg = "--leader-elect was set but leader election is not implemented; running as sole active instance");
    }
    if args.enable_webhooks {
        warn!(msg = "--enable-webhooks was set but this provider serves no webhooks");
    }

    let config = Config::infer().await?;
    let client = new_client(config).await?;

    let proxmox_client: Arc<dyn ProxmoxClient> = Arc::new(HttpProxmoxClient::new(Credentials::from_env()?)?);

    let controllers = [
        proxmox_cluster::controller::CONTROLLER_ID,
        proxmox_machine::controller::CONTROLLER_ID,
    ];

    let state = State::new(Registry::default(), &controllers);

    let cluster_c = proxmox_cluster::controller::run(state.clone(), client.clone());
    let machine_c = proxmox_machine::controller::run(state.clone(), client.clone(), proxmox_client);

    let metrics_app = Router::new().route("/metrics", get(metrics)).with_state(state.clone());
    let health_app = Router::new().route("/healthz", get(health));

    let metrics_listener = TcpListener::bind(&args.metrics_bind_address).await?;
    let health_listener = TcpListener::bind(&args.health_probe_bind_address).await?;

    let metrics_server = axum::serve(metrics_listener, metrics_app).with_graceful_shutdown(shutdown_signal());
    let health_server = axum::serve(health_listener, health_app).with_graceful_shutdown(shutdown_signal());

    let (_, _, metrics_result, health_result) = tokio::join!(cluster_c, machine_c, metrics_server, health_server);
    metrics_result?;
    health_result?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}
