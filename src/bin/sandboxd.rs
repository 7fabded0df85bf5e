use anyhow::{Context, bail};
use dotenvy::dotenv;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use mikan::config::SandboxdConfig;
use mikan::handlers::sandbox::router;
use mikan::sandbox::SandboxState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Containers, role switches and chown all need root.
    if unsafe { libc::geteuid() } != 0 {
        bail!("sandboxd must run as root");
    }

    dotenv().ok();
    let config = SandboxdConfig::load().context("failed to load configuration")?;
    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("failed to create {}", config.root.display()))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    describe_counter!("sandbox_requests_total", "Requests received, by operation");
    describe_counter!("sandbox_runs_total", "Sandboxed runs, by outcome");
    describe_histogram!("sandbox_run_time_ms", "CPU time of a sandboxed run in milliseconds");
    describe_histogram!("sandbox_run_memory_kb", "Peak memory of a sandboxed run in kilobytes");

    let port = config.port;
    let root = config.root.display().to_string();
    let app = router(SandboxState::new(config, handle));

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .context("failed to bind port")?;
    tracing::info!(root = %root, "listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
