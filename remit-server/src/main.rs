use std::process::ExitCode;

use clap::Parser;
use remit_server::AppState;
use remit_server::ServerConfig;
use remit_server::build_router;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_CONFIG_INVALID: u8 = 2;

/// Multi-tenant accounts-receivable engine.
#[derive(Debug, Parser)]
#[command(name = "remit-server", version)]
struct Cli {
    /// Override BIND_ADDR from the environment.
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    if let Some(bind) = cli.bind {
        vars.retain(|(key, _)| key != "BIND_ADDR");
        vars.push(("BIND_ADDR".into(), bind));
    }

    let config = match ServerConfig::from_env(vars) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration invalid");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start runtime");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server terminated with error");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr;
    let tenant_count = config.tenants.len();
    let state = AppState::from_config(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = remit_server::workers::spawn_all(state.clone(), shutdown_rx);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, tenants = tenant_count, "remit-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received; draining");
        })
        .await?;

    // Stop background loops and let in-flight runs drain.
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
