use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tb_domain::config::BrokerConfig;
use tb_gateway::api;
use tb_gateway::bootstrap::{Broker, BrokerOptions};
use tb_gateway::cli::{Cli, Command, ConfigCommand, ServeArgs};
use tb_gateway::model::DevModel;
use tb_sandbox::{InProcessRuntime, SandboxSpec};
use tb_store::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None => {
            init_tracing();
            run_server(ServeArgs::default()).await
        }
        Some(Command::Serve(args)) => {
            init_tracing();
            run_server(args).await
        }
        Some(Command::Config(ConfigCommand::Validate { servers })) => {
            if !tb_gateway::cli::validate_document(&servers) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("toolbroker {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let config = BrokerConfig::from_env();
    if let Some(url) = &config.state_store_url {
        // The external-store adapter is linked in by the deployment
        // build; the stock binary runs against the in-process store.
        tracing::warn!(url = %url, "STATE_STORE_URL set but no external store adapter is linked, using in-process store");
    }

    let broker = Broker::start(BrokerOptions {
        config,
        registry_path: args.servers.clone(),
        store: Arc::new(MemoryStore::new()),
        runtime: Arc::new(InProcessRuntime::new()),
        model: Arc::new(DevModel),
        default_spec: SandboxSpec::default(),
    })
    .await?;

    let router = api::router(broker.state.clone());
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(addr = %args.listen, "control API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}
