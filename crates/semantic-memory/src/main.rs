#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use semantic_memory::{
    memory_db::{MemoryDatabase, MigrationOutcome, MigrationRunner},
    metrics,
    recovery::RecoveryEngine,
    telemetry, Config, MemoryStore, Provider, RecoveryAction, SemanticMemory,
};

/// Inspect and maintain a semantic memory store.
#[cfg(feature = "cli")]
#[derive(Parser, Debug)]
#[command(name = "semantic-memory", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand, Debug)]
enum Commands {
    /// Print row counts and index occupancy as JSON.
    Stats {
        /// Also print the prometheus exposition text.
        #[arg(long)]
        metrics: bool,
    },
    /// Run pending migrations and report each step.
    Migrate,
    /// Rebuild one index (or both) from the database.
    Rebuild {
        /// `remote` or `local`; both when omitted.
        #[arg(long)]
        provider: Option<String>,
    },
    /// Report what startup recovery would do, without loading any index.
    Verify,
    /// ANALYZE the database and run an integrity check.
    Maintain,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    metrics::init_metrics();

    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    if let Commands::Verify = cli.command {
        return verify(&cfg);
    }

    let memory = SemanticMemory::open(cfg)?;
    match cli.command {
        Commands::Stats { metrics: show_metrics } => {
            println!("{}", serde_json::to_string_pretty(&memory.stats()?)?);
            if show_metrics {
                print!("{}", metrics::render());
            }
        }
        Commands::Migrate => {
            for (name, outcome) in &memory.migration_report().steps {
                match outcome {
                    MigrationOutcome::AlreadyCompleted => println!("{}: already completed", name),
                    MigrationOutcome::Applied { rows } => println!("{}: applied ({} rows)", name, rows),
                    MigrationOutcome::Failed(e) => println!("{}: FAILED ({})", name, e),
                }
            }
        }
        Commands::Rebuild { provider } => {
            let providers = match provider {
                Some(p) => vec![p.parse::<Provider>()?],
                None => Provider::ALL.to_vec(),
            };
            for provider in providers {
                let stats = memory.rebuild_index(provider).await?;
                println!(
                    "{}: rebuilt with {} points (capacity {})",
                    provider, stats.count, stats.capacity
                );
            }
        }
        Commands::Maintain => println!("integrity check: {}", memory.maintain()?),
        Commands::Verify => {}
    }

    memory.ensure_save_on_quit().await?;
    Ok(())
}

/// Dry run of startup recovery. Migrations still run since recovery reads
/// the columns they add.
#[cfg(feature = "cli")]
fn verify(cfg: &Config) -> anyhow::Result<()> {
    let db = MemoryDatabase::new(&cfg.database_path(), cfg.pool_size)?;
    MigrationRunner::new(&db, cfg).run_all()?;

    let engine = RecoveryEngine::new(&db, cfg);
    for provider in Provider::ALL {
        let plan = engine.plan(provider)?;
        let snapshot = plan
            .snapshot_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".into());
        let action = match &plan.action {
            RecoveryAction::Load => "load snapshot".to_string(),
            RecoveryAction::Resize { from, to } => format!("resize {} -> {}", from, to),
            RecoveryAction::Rebuild(reason) => format!("rebuild ({})", reason),
        };
        println!(
            "{}: database {}, snapshot {}, {}",
            provider, plan.database_count, snapshot, action
        );
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
