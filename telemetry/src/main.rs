use anyhow::Context;
use axum::http::{header, Method};
use clap::{Parser, Subcommand};
use run_telemetry::api;
use run_telemetry::config::{load_env_file, TelemetryConfig};
use run_telemetry::demo::{self, DemoOptions};
use run_telemetry::registry::RunRegistry;
use run_telemetry::report::render_run_report;
use shared_types::RunId;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "run-telemetry", version, about = "Run trace recording, live observation and control")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the observer gateway
    Serve {
        /// Launch a scripted demo run on startup
        #[arg(long)]
        demo: bool,
    },
    /// Render a persisted run directory to an HTML report
    Report {
        #[arg(long)]
        run_dir: PathBuf,
        /// Output file; defaults to `<run_dir>/report.html`
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        title: Option<String>,
        /// Treat the run as still in progress (unclosed spans stay open)
        #[arg(long)]
        live: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // .env is searched from the cwd upwards so running from `telemetry/`
    // still picks up the workspace file.
    load_env_file();

    match Cli::parse().command.unwrap_or(Command::Serve { demo: false }) {
        Command::Serve { demo } => serve(demo).await,
        Command::Report {
            run_dir,
            out,
            title,
            live,
        } => report(run_dir, out, title, live).await,
    }
}

async fn serve(with_demo: bool) -> anyhow::Result<()> {
    let config = TelemetryConfig::from_env().context("invalid configuration")?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    tracing::info!(
        data_dir = %config.data_dir.display(),
        bind = %config.bind_addr,
        min_level = %config.min_level,
        "Starting run telemetry gateway"
    );

    let bind_addr = config.bind_addr;
    let registry = RunRegistry::new(config);
    let pruner = registry.spawn_pruner();

    if with_demo {
        let run_id = RunId(format!("demo-{}", RunId::new()));
        let handle = registry
            .launch(run_id, |ctx| demo::scripted_run(ctx, DemoOptions::default()))
            .await
            .context("launching demo run")?;
        tracing::info!(
            run_id = %handle.run_id,
            "Demo run started; observe at /runs/{}/ws",
            handle.run_id
        );
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    let app = api::router()
        .with_state(api::ApiState {
            registry: registry.clone(),
        })
        .layer(cors);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    pruner.abort();
    registry.shutdown().await;
    Ok(())
}

async fn report(
    run_dir: PathBuf,
    out: Option<PathBuf>,
    title: Option<String>,
    live: bool,
) -> anyhow::Result<()> {
    let title = title.unwrap_or_else(|| {
        let name = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| run_dir.display().to_string());
        format!("Run {name}")
    });

    let html = render_run_report(&run_dir, &title, !live)
        .await
        .with_context(|| format!("rendering report for {}", run_dir.display()))?;

    let out = out.unwrap_or_else(|| run_dir.join("report.html"));
    tokio::fs::write(&out, html)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    tracing::info!(path = %out.display(), "Report written");
    Ok(())
}
