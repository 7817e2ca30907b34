//! peernet - per-node network fabric controller for multi-cluster peering

use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::controller::Error as ControllerError;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peernet::config::FabricConfig;
use peernet::controller::{error_policy, reconcile, shutdown_cleanup, start_node, Context};
use peernet::crd::PeeringSession;
use peernet::exec::{CommandRunner, HostCommandRunner};
use peernet::netfilter::IptablesCli;
use peernet::error::is_retryable_kube_error;
use peernet::retry::{retry_if, RetryConfig};
use peernet::FIELD_MANAGER;

/// peernet - programs tunnels, packet-filter rules and routes so pods can
/// reach pods in peered clusters
#[derive(Parser, Debug)]
#[command(name = "peernet", version, about, long_about = None)]
struct Cli {
    /// Print the PeeringSession CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the fabric controller on this node
    ///
    /// Brings up the overlay device, rebuilds state for sessions this node
    /// already processed, then watches PeeringSessions until SIGTERM, when
    /// everything it installed is removed again.
    Controller(FabricConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&PeeringSession::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(config)) => run_controller(config).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

/// Install or update the PeeringSession CRD with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = PeeringSession::crd();
    let patch = Patch::Apply(&crd);

    tracing::info!("Installing PeeringSession CRD...");
    retry_if(&RetryConfig::startup(), "install_crd", is_retryable_kube_error, || {
        crds.patch("peeringsessions.peernet.dev", &params, &patch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install PeeringSession CRD: {}", e))?;

    Ok(())
}

async fn run_controller(config: FabricConfig) -> anyhow::Result<()> {
    config.validate()?;
    let role = config.role()?;
    tracing::info!(
        node = %config.node_name,
        gateway = role.is_gateway(),
        "peernet controller starting..."
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(HostCommandRunner::new());

    // No packet filter means nothing here can work
    let filter = IptablesCli::detect(runner.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Packet filter unavailable: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(
        Context::builder(client.clone(), &config.node_name, role)
            .overlay_port(config.overlay_port)
            .command_runner(runner)
            .packet_filter(Arc::new(filter))
            .build(),
    );

    start_node(&ctx, &config, &RetryConfig::startup())
        .await
        .map_err(|e| anyhow::anyhow!("Node startup failed: {}", e))?;

    tracing::info!("Starting PeeringSession controller...");
    let sessions: Api<PeeringSession> = Api::all(client);
    Controller::new(sessions, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Session reconciliation completed");
                }
                // Already logged with its stage by the reconciler
                Err(ControllerError::ReconcilerFailed(e, obj)) => {
                    tracing::debug!(session = %obj.name, error = %e, "Session reconciliation failed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Session controller error");
                }
            }
        })
        .await;

    tracing::info!("peernet controller shutting down");
    if let Err(e) = shutdown_cleanup(&ctx, &config.overlay_interface).await {
        tracing::warn!(error = %e, "cleanup incomplete, leftovers remain on the host");
    }
    Ok(())
}
