use std::sync::Arc;

use branchhook_server::config::Config;
use branchhook_server::event::{BranchEvent, EventType};
use branchhook_server::lifecycle::{BranchDecommissioner, BranchProvisioner, Submission};
use branchhook_server::resources::http::ControlPlaneClient;
use branchhook_server::server;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "branchhook-server",
    version,
    about = "Per-branch build environments driven by repository branch events"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook server (default)
    Serve,
    /// Provision the build job for one branch and exit
    CreateBranch {
        branch: String,
        /// Repository to build from, overrides `provisioning.default_repository`
        #[arg(long)]
        repository: Option<String>,
    },
    /// Tear down everything for one branch and exit
    DestroyBranch { branch: String },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "branchhook_server=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_format);
    if let Err(e) = dotenv {
        warn!("no .env file loaded: {e}");
    }

    let config = Config::load(&cli.config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::CreateBranch { branch, repository } => {
            let client = Arc::new(ControlPlaneClient::from_config(&config.control_plane)?);
            let provisioner = BranchProvisioner::new(client, Arc::new(config.provisioning));
            let event = BranchEvent::new(EventType::Create, branch)?.with_repository(repository);
            report(provisioner.provision(&event).await?)
        }
        Command::DestroyBranch { branch } => {
            let client = Arc::new(ControlPlaneClient::from_config(&config.control_plane)?);
            let decommissioner = BranchDecommissioner::new(
                client.clone(),
                client.clone(),
                client,
                Arc::new(config.provisioning),
            );
            let event = BranchEvent::new(EventType::Delete, branch)?;
            report(decommissioner.decommission(&event).await?)
        }
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let bind = config.server.bind.clone();
    info!(
        bind = %bind,
        prefix = %config.provisioning.prefix,
        bus = %config.bus.name,
        native = config.native.enabled,
        "starting branchhook-server"
    );

    let (router, bus) = server::build(&config)?;
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("listening on {bind}");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    info!("server stopped");
    bus.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn report(submission: Submission) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(&submission)?);
    Ok(())
}
