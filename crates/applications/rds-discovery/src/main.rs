//! rds-discovery - multi-account RDS inventory
//!
//! ## Usage
//!
//! ```bash
//! # Full scheduled run against AWS
//! rds-discovery run --config discovery.json
//!
//! # Manual run, result written to a file
//! rds-discovery run --config discovery.json --trigger manual --output result.json
//!
//! # Offline run against a fixture document
//! rds-discovery run --config discovery.json --fixtures fixtures.json
//!
//! # Validate configuration and print the scan matrix
//! rds-discovery check-config --config discovery.json
//!
//! # Query the stored inventory
//! rds-discovery inventory --config discovery.json --account 111111111111 --include-removed
//! ```

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rds_discovery::{
    DiscoveryConfig, FixtureProvider, InstanceLister, InventoryFilter, Invocation, Orchestrator,
    RdsInstanceLister, RoleExchange, RunStatus, StoreConfig, StsRoleExchange, TriggerSource,
    load_sdk_config, store,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// RDS Discovery: multi-account, multi-region RDS inventory
#[derive(Parser)]
#[command(name = "rds-discovery")]
#[command(about = "Multi-account, multi-region RDS inventory discovery", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "RDS_DISCOVERY_JSON_LOGS")]
    json_logs: bool,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true, env = "RDS_DISCOVERY_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery once and print the result
    Run {
        /// Configuration file (JSON)
        #[arg(long, env = "RDS_DISCOVERY_CONFIG")]
        config: PathBuf,

        /// What started this run
        #[arg(long, value_enum, default_value_t = TriggerSource::Scheduled)]
        trigger: TriggerSource,

        /// Drive the run from a fixture document instead of AWS
        #[arg(long, env = "RDS_DISCOVERY_FIXTURES")]
        fixtures: Option<PathBuf>,

        /// Write the result here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration and print the account x region matrix
    CheckConfig {
        /// Configuration file (JSON)
        #[arg(long, env = "RDS_DISCOVERY_CONFIG")]
        config: PathBuf,
    },

    /// Print stored inventory records
    Inventory {
        /// Configuration file (JSON)
        #[arg(long, env = "RDS_DISCOVERY_CONFIG")]
        config: PathBuf,

        /// Only this account
        #[arg(long)]
        account: Option<String>,

        /// Only this region
        #[arg(long)]
        region: Option<String>,

        /// Include records marked removed
        #[arg(long)]
        include_removed: bool,
    },
}

/// Install the subscriber; the guard keeps the file writer flushing
fn init_tracing(json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rds-discovery.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rds_discovery=info,info".into()),
        )
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(file_layer)
        .init();

    guard
}

fn load_config(path: &Path) -> anyhow::Result<DiscoveryConfig> {
    DiscoveryConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.json_logs, cli.log_dir.as_deref());

    match cli.command {
        Commands::Run {
            config,
            trigger,
            fixtures,
            output,
        } => {
            let config = Arc::new(load_config(&config)?);
            let invocation = Invocation {
                trigger_source: trigger,
                requested_at: Utc::now(),
            };

            let exchange: Arc<dyn RoleExchange>;
            let lister: Arc<dyn InstanceLister>;
            let sdk_config = match fixtures {
                Some(path) => {
                    info!(fixtures = %path.display(), "🧪 Using fixture provider");
                    let provider = Arc::new(FixtureProvider::from_file(&path)?);
                    exchange = provider.clone();
                    lister = provider;
                    None
                }
                None => {
                    let sdk_config = load_sdk_config(&config.timeouts, None).await;
                    let call = config.timeouts.call();
                    exchange = Arc::new(StsRoleExchange::new(&sdk_config, call));
                    lister = Arc::new(RdsInstanceLister::new(call));
                    Some(sdk_config)
                }
            };

            let store = store::open(&config.store, sdk_config.as_ref())?;
            let result = Orchestrator::new(config, exchange, lister, store)
                .run(invocation)
                .await;

            let rendered = serde_json::to_string_pretty(&result)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(output = %path.display(), "📝 Result written");
                }
                None => println!("{}", rendered),
            }

            Ok(if result.execution_status == RunStatus::Failed {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            })
        }

        Commands::CheckConfig { config } => {
            let config = load_config(&config)?;
            println!("✅ Configuration valid");
            println!(
                "   concurrency: {} accounts x {} regions, budget {}s (margin {}s)",
                config.account_concurrency,
                config.region_concurrency,
                config.run_budget_secs,
                config.dispatch_margin_secs
            );
            println!("   region discovery: {:?}", config.region_discovery);
            println!("   store: {:?}", config.store);
            for account in &config.accounts {
                let mode = if account.is_home {
                    "home (ambient credentials)".to_string()
                } else {
                    account
                        .role_arn(&config.partition)
                        .unwrap_or_else(|| "<no role>".to_string())
                };
                let state = if account.enabled { "" } else { " [disabled]" };
                println!(
                    "   {} {}{}: {} -> {}",
                    account.account_id,
                    account.label(),
                    state,
                    mode,
                    config.regions_for(account).join(", ")
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Inventory {
            config,
            account,
            region,
            include_removed,
        } => {
            let config = load_config(&config)?;
            let sdk_config = match config.store {
                StoreConfig::S3 { .. } => Some(load_sdk_config(&config.timeouts, None).await),
                _ => None,
            };
            let store = store::open(&config.store, sdk_config.as_ref())?;

            let records = store
                .list(&InventoryFilter {
                    account_id: account,
                    region,
                    include_removed,
                })
                .await?;
            info!(records = records.len(), store = %store.describe(), "Inventory listed");
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
