use anyhow::{Context, bail};
use dotenvy::dotenv;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;

use mikan::client::{Sandbox, SandboxClient};
use mikan::config::AppConfig;
use mikan::handlers::intake::{IntakeState, router};
use mikan::judge::{JudgeContext, JudgeSettings};
use mikan::language::LanguageRegistry;
use mikan::paths::Environment;
use mikan::period::PeriodLifecycle;
use mikan::queue::JudgeQueue;
use mikan::store::{FsStore, Store};
use mikan::submit::{Intake, IntakeLimits};
use mikan::worker::{recover, spawn_workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if !cfg!(target_os = "linux") {
        bail!("mikan only runs on Linux");
    }

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    dotenv().ok();
    let config = AppConfig::load().context("failed to load configuration")?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    describe_counter!("submissions_enqueued_total", "Submissions put on the judge queue");
    describe_counter!("submissions_judged_total", "Submissions judged, by outcome");
    describe_histogram!("judge_case_time_ms", "CPU time of a judged testcase in milliseconds");

    let store = Arc::new(FsStore::open(&config.paths.data).context("failed to open data store")?);
    let sandbox: Arc<dyn Sandbox> = Arc::new(
        SandboxClient::connect(&config.sandbox, &store.token_path())
            .await
            .context("sandbox executor refused the token")?,
    );

    let mut languages =
        LanguageRegistry::load(&config.paths.langs).context("failed to load languages")?;
    if config.judge.calibrate_languages {
        let env = Environment::create(&config.sandbox.root, sandbox.clone())
            .context("failed to create calibration sandbox")?;
        languages.calibrate(&env).await;
    }
    let languages = Arc::new(languages);

    let store: Arc<dyn Store> = store;
    let queue = JudgeQueue::new();
    recover(store.as_ref(), &queue).context("failed to recover submissions")?;

    let ctx = JudgeContext {
        store: store.clone(),
        sandbox,
        languages: languages.clone(),
        settings: JudgeSettings {
            sandbox_root: config.sandbox.root.clone(),
            testlib: config.paths.testlib.clone(),
            save_period: config.judge.save_period,
            compile_timeout_secs: config.judge.compile_timeout_secs as f64,
        },
    };
    spawn_workers(ctx, queue.clone(), config.judge.workers);
    tokio::spawn(
        PeriodLifecycle::new(
            store.clone(),
            queue.clone(),
            Duration::from_secs(config.judge.poll_interval_secs),
        )
        .run(),
    );

    let app = router(IntakeState {
        intake: Intake::new(
            store,
            queue,
            languages,
            IntakeLimits {
                pending_limit: config.judge.pending_limit,
                max_code_kb: config.judge.max_code_kb,
            },
        ),
        prometheus_handle: handle,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .context("failed to bind intake port")?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
