use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kube::Client;
use tracing::{error, info};

use cassandra_migrator::nodetool::detect_installation;
use cassandra_migrator::{
    ClusterMigrator, LeadershipLock, MigrationFinisher, NodeMigrator, Nodetool, ensure_namespace,
};

/// Migrate a running Cassandra/DSE cluster under cass-operator management.
#[derive(Parser)]
#[command(name = "cass-migrate", version, about)]
struct Cli {
    /// Namespace holding the migration state and the migrated pods
    #[arg(long, global = true, default_value = "migrate")]
    namespace: String,

    /// Path to the Cassandra/DSE installation directory
    #[arg(long, global = true)]
    cassandra_home: Option<PathBuf>,

    /// Path to the directory containing the nodetool executable
    #[arg(long, global = true)]
    nodetool_path: Option<PathBuf>,

    /// Override the cassandra.yaml configuration directory
    #[arg(long, global = true, requires = "dse_config_dir")]
    cass_config_dir: Option<PathBuf>,

    /// Override the dse.yaml configuration directory
    #[arg(long, global = true, requires = "cass_config_dir")]
    dse_config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the cluster migration: topology snapshot, configuration
    /// bundle, seed services
    Init,
    /// Migrate the local node into Kubernetes
    Add,
    /// Create the CassandraDatacenter and hand the cluster to cass-operator
    Commit {
        /// Datacenter to commit
        #[arg(long)]
        datacenter: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cassandra_migrator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!(error = %err, "migration step failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> cassandra_migrator::Result<()> {
    let client = Client::try_default().await?;
    info!(namespace = %cli.namespace, "connected to Kubernetes");

    match cli.command {
        Command::Init => {
            let home = detect_installation(cli.cassandra_home.as_deref())?;
            let nodetool = Nodetool::new(cli.nodetool_path.as_deref(), &home);
            ensure_namespace(client.clone(), &cli.namespace).await?;

            let migrator = ClusterMigrator::new(
                client,
                &cli.namespace,
                nodetool,
                cli.cass_config_dir,
                cli.dse_config_dir,
                Some(home),
            );
            migrator.init_cluster().await
        }
        Command::Add => {
            let home = detect_installation(cli.cassandra_home.as_deref())?;
            let nodetool = Nodetool::new(cli.nodetool_path.as_deref(), &home);

            // Node passes mutate shared cluster state, one at a time
            let lock = LeadershipLock::acquire(client.clone(), &cli.namespace).await?;
            info!("acquired node migrator lock");

            let migrator = NodeMigrator::new(
                client,
                &cli.namespace,
                nodetool,
                cli.cass_config_dir,
                cli.dse_config_dir,
                Some(home),
            );
            let result = migrator.migrate_node().await;
            lock.release().await?;
            result
        }
        Command::Commit { datacenter } => {
            // No local tooling: the finisher works from cluster state alone
            MigrationFinisher::new(client, &cli.namespace)
                .finish(&datacenter)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_parses_without_installation_flags() {
        let cli = Cli::try_parse_from(["cass-migrate", "commit", "--datacenter", "dc1"]).unwrap();
        assert!(cli.cassandra_home.is_none());
        assert!(cli.nodetool_path.is_none());
        assert!(matches!(cli.command, Command::Commit { datacenter } if datacenter == "dc1"));
    }

    #[test]
    fn test_config_dir_overrides_come_in_pairs() {
        let err = Cli::try_parse_from(["cass-migrate", "--cass-config-dir", "/etc/c", "init"]);
        assert!(err.is_err());
    }
}
