//! One-shot migration and maintenance tool. The server migrates at startup
//! when `automigrate` is set; this binary covers operator-driven runs,
//! including the online maintenance variant used while draining writes.

use clap::{Parser, Subcommand};
use semver::Version;
use tracing_subscriber::EnvFilter;

use fleet_inventory::config::Config;
use fleet_inventory::migrations::Migrator;

const EXIT_CONFIG: i32 = 1;
const EXIT_DATABASE: i32 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "inventory-migrate",
    about = "Schema migrations for the device inventory service"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply every pending migration, for all tenants or a selection.
    Migrate {
        /// Tenant id to migrate; repeatable. Default: every tenant database.
        #[arg(long = "tenant")]
        tenants: Vec<String>,
    },
    /// Run the maintenance (online) variant of a single migration. Disable
    /// the mutating endpoints while this runs.
    Maintenance {
        /// Tenant id to convert; repeatable. Default: every tenant database.
        #[arg(long = "tenant")]
        tenants: Vec<String>,
        /// Migration version whose maintenance variant to run, e.g. 1.0.0.
        #[arg(long)]
        version: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fleet_inventory=info,inventory_migrate=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let client = match config.mongo_client().await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("database connection failed: {e:#}");
            std::process::exit(EXIT_DATABASE);
        }
    };

    // operator-invoked runs always apply
    let migrator = Migrator::new(client, &config.db_name, true);

    let result = match cli.command {
        Command::Migrate { tenants } => {
            if tenants.is_empty() {
                migrator.migrate_all().await
            } else {
                let mut out = Ok(());
                for tenant in &tenants {
                    out = migrator.migrate_tenant(tenant).await;
                    if out.is_err() {
                        break;
                    }
                }
                out
            }
        }
        Command::Maintenance { tenants, version } => match Version::parse(&version) {
            Ok(version) => migrator.maintenance(&tenants, &version).await,
            Err(e) => {
                tracing::error!("invalid version {version}: {e}");
                std::process::exit(EXIT_CONFIG);
            }
        },
    };

    if let Err(e) = result {
        tracing::error!("migration failed: {e}");
        std::process::exit(EXIT_DATABASE);
    }
    tracing::info!("done");
}
