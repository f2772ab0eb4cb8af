use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pumpkin_core::{CounterAction, CounterKind};
use pumpkin_stats::{
    apply_counter_event, build_scheduler, maybe_build_scheduler, read_counters, report, CounterEvent,
    Job, ScheduleFile, StatsConfig, StatsEngine,
};
use pumpkin_storage::{DocumentStore, MemoryStore, PgStore};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pumpkin-cli")]
#[command(about = "Giant pumpkin statistics engine")]
struct Cli {
    /// Run against `<collection>.json` dumps in this directory instead of Postgres.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one job by name, e.g. `calculateGlobalRankings`.
    Run { job: String },
    /// Run every job in dependency order.
    RunAll,
    /// List job names.
    Jobs,
    Migrate,
    Serve,
    /// Run the cron schedule until interrupted.
    Schedule,
    /// Fire a counter trigger.
    Counter {
        kind: CounterKind,
        action: CounterAction,
    },
    Counters,
    /// Print a markdown digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

struct Workspace {
    engine: Arc<StatsEngine>,
    fixtures: Option<(Arc<MemoryStore>, PathBuf)>,
}

impl Workspace {
    async fn open(fixtures: Option<&Path>, config: &StatsConfig) -> Result<Self> {
        let (store, fixtures) = match fixtures {
            Some(dir) => {
                let memory = Arc::new(MemoryStore::load_json_dir(dir).await?);
                let store: Arc<dyn DocumentStore> = memory.clone();
                (store, Some((memory, dir.to_path_buf())))
            }
            None => {
                let pg = PgStore::connect(&config.database_url)
                    .await
                    .context("connecting to DATABASE_URL")?;
                let store: Arc<dyn DocumentStore> = Arc::new(pg);
                (store, None)
            }
        };
        Ok(Self {
            engine: Arc::new(StatsEngine::new(store, config.engine_config())),
            fixtures,
        })
    }

    /// Fixture runs write their results back to the dump directory.
    async fn persist(&self) -> Result<()> {
        if let Some((memory, dir)) = &self.fixtures {
            memory.dump_json_dir(dir).await?;
            info!(dir = %dir.display(), "fixture collections written");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = StatsConfig::from_env();

    match cli.command {
        Commands::Jobs => {
            for job in Job::ALL {
                println!("{:<36} {}", job.name(), job.description());
            }
        }
        Commands::Report { runs } => {
            let Some(dir) = &config.reports_dir else {
                bail!("STATS_REPORTS_DIR is not set");
            };
            println!("{}", report::report_markdown(dir, runs)?);
        }
        Commands::Migrate => {
            if cli.fixtures.is_some() {
                bail!("migrate only applies to the Postgres store");
            }
            let pg = PgStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            pg.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Run { job } => {
            let workspace = Workspace::open(cli.fixtures.as_deref(), &config).await?;
            let summary = workspace.engine.run_by_name(&job).await?;
            workspace.persist().await?;
            println!("{}", summary.acknowledgment());
        }
        Commands::RunAll => {
            let workspace = Workspace::open(cli.fixtures.as_deref(), &config).await?;
            let summaries = workspace.engine.run_all().await?;
            workspace.persist().await?;
            for summary in summaries {
                println!("{}", summary.acknowledgment());
            }
        }
        Commands::Counter { kind, action } => {
            let workspace = Workspace::open(cli.fixtures.as_deref(), &config).await?;
            let value = apply_counter_event(
                workspace.engine.store().as_ref(),
                CounterEvent::new(kind, action),
            )
            .await?;
            workspace.persist().await?;
            println!("{}={}", kind.field(), value.value);
        }
        Commands::Counters => {
            let workspace = Workspace::open(cli.fixtures.as_deref(), &config).await?;
            for (name, value) in read_counters(workspace.engine.store().as_ref()).await? {
                println!("{name}={value}");
            }
        }
        Commands::Serve => {
            let workspace = Workspace::open(cli.fixtures.as_deref(), &config).await?;
            let scheduler = maybe_build_scheduler(&config, workspace.engine.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            pumpkin_web::serve(workspace.engine.clone(), config.web_port).await?;
            workspace.persist().await?;
        }
        Commands::Schedule => {
            let workspace = Workspace::open(cli.fixtures.as_deref(), &config).await?;
            let schedule = ScheduleFile::load(&config.schedule_file).await?;
            let mut sched = build_scheduler(workspace.engine.clone(), &schedule).await?;
            sched.start().await.context("starting scheduler")?;
            info!(file = %config.schedule_file.display(), "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            workspace.persist().await?;
        }
    }

    Ok(())
}
