//! patze-control — the Patze fleet control plane.

use clap::{Parser, Subcommand};
use patze_control::{AppState, AuthConfig, EnvConfig, build_router};
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "patze-control")]
#[command(about = "Patze fleet control plane for OpenClaw installations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-plane server (default)
    Serve,

    /// Print the effective configuration and exit
    Config,

    /// Initialize the settings directory with a token-mode auth file
    InitAuth {
        /// Bearer token to require on every request
        #[arg(long)]
        token: String,
    },
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("patze_control=info,patze=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EnvConfig::from_env();

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config),
        Commands::Config => {
            println!("{config:#?}");
            Ok(())
        }
        Commands::InitAuth { token } => init_auth(config, token),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            std::process::ExitCode::FAILURE
        }
    }
}

fn init_auth(config: EnvConfig, token: String) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.settings_dir)?;
    let auth = AuthConfig {
        mode: patze_control::auth::AuthFileMode::Token,
        token: Some(token),
    };
    auth.save(&config.settings_dir)?;
    println!("auth.json written to {}", config.settings_dir.display());
    Ok(())
}

fn serve(config: EnvConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let auth = AuthConfig::load(&config.settings_dir);
        let bind: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

        let state = AppState::build(config, auth)?;
        state.start_background();

        let router = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind(bind).await?;
        info!(%bind, "patze-control listening");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        state.shutdown().await;
        info!("orderly shutdown complete");
        Ok(())
    })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("ctrl-c received, shutting down"),
        Err(e) => error!(error = %e, "failed to install ctrl-c handler"),
    }
}
