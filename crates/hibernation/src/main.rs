use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::{Client, CustomResourceExt};

use hibernation::{
    api::{ClusterDeployment, ClusterSync},
    config::HibernationConfig,
    reconcilers,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the hibernation reconciliation loop
    Reconcile {
        #[command(flatten)]
        config: HibernationConfig,
    },
    /// Output K8s manifest for a given CRD resource
    #[command(subcommand)]
    CrdManifest(Crd),
}

#[derive(Debug, Clone, Subcommand)]
enum Crd {
    Cluster,
    Sync,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env())
        .try_init()?;

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Reconcile { config }) => run_controller(config).await?,
        Some(Commands::CrdManifest(crd)) => {
            let crd = match crd {
                Crd::Cluster => ClusterDeployment::crd(),
                Crd::Sync => ClusterSync::crd(),
            };

            println!("{}", serde_yaml_ng::to_string(&crd)?);
        }
        None => {}
    }

    Ok(())
}

async fn run_controller(config: HibernationConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    tracing::info!(?config, "starting hibernation controller");

    reconcilers::hibernation::control_loop(client, config)
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("Reconciled cluster deployment {:?}", o),
                Err(e) => tracing::error!("Cluster deployment reconcile failed: {:?}", e),
            }
        })
        .await;

    tracing::info!("controller terminated");
    Ok(())
}
