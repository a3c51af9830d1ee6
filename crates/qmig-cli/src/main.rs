use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use qmig_core::EntityType;
use qmig_sync::{MigrationConfig, MigrationPlan, MigrationReport, RunMode};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "qmig")]
#[command(about = "Questionnaire migration engine")]
#[command(version)]
struct Cli {
    /// Log level: debug, info, warn, error
    #[arg(long, global = true, default_value = "info")]
    verbosity: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Fresh,
    Incremental,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Fresh => RunMode::Fresh,
            ModeArg::Incremental => RunMode::Incremental,
        }
    }
}

#[derive(Debug, Args)]
struct RunFlags {
    /// Resolve and report without writing to the target
    #[arg(long)]
    dry_run: bool,

    /// Cap the number of records fetched per stage
    #[arg(long)]
    limit: Option<usize>,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    output_json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the bundled SQL migrations to DATABASE_URL
    MigrateSchema,
    /// Run the full pipeline
    Run {
        #[arg(long, value_enum, default_value_t = ModeArg::Incremental)]
        mode: ModeArg,
        /// Restrict the run to these entity types
        #[arg(long, num_args = 1..)]
        only: Vec<EntityType>,
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Truncate and reload every entity type
    FreshImport {
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Answers-only phase against already migrated sheets and questions
    Answers {
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Bounded smoke import
    TestSubset {
        #[arg(long, default_value_t = 25)]
        limit: usize,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        output_json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli.verbosity, cli.log_format);

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let config = MigrationConfig::from_env();
    let (plan, output_json) = match command {
        Commands::MigrateSchema => {
            qmig_sync::migrate_schema(&config).await?;
            println!("schema migrations applied");
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Run { mode, only, flags } => (
            MigrationPlan::full(mode.into())
                .with_only(&only)
                .with_dry_run(flags.dry_run)
                .with_limit(flags.limit),
            flags.output_json,
        ),
        Commands::FreshImport { flags } => (
            MigrationPlan::full(RunMode::Fresh)
                .with_dry_run(flags.dry_run)
                .with_limit(flags.limit),
            flags.output_json,
        ),
        Commands::Answers { flags } => (
            MigrationPlan::answers_only()
                .with_dry_run(flags.dry_run)
                .with_limit(flags.limit),
            flags.output_json,
        ),
        Commands::TestSubset {
            limit,
            dry_run,
            output_json,
        } => (MigrationPlan::test_subset(limit).with_dry_run(dry_run), output_json),
    };

    let report = qmig_sync::run_migration(&config, &plan).await?;
    print_report(&report, output_json)?;
    Ok(ExitCode::from(u8::try_from(report.summary.exit_code()).unwrap_or(1)))
}

fn print_report(report: &MigrationReport, output_json: bool) -> Result<()> {
    let summary = &report.summary;
    if output_json {
        let json = serde_json::to_string_pretty(summary).context("serialize run summary")?;
        println!("{json}");
        return Ok(());
    }

    let (migrated, skipped, failed) = summary.totals();
    println!(
        "run complete: run_id={} mode={} dry_run={} migrated={} skipped={} failed={} reports={}",
        summary.run_id,
        summary.mode.as_str(),
        summary.dry_run,
        migrated,
        skipped,
        failed,
        report.reports_dir.display()
    );
    for stage in &summary.stages {
        println!(
            "  {:<18} {:<28} fetched={} migrated={} skipped={} failed={}",
            stage.entity.as_str(),
            stage.status.label(),
            stage.fetched,
            stage.migrated,
            stage.skipped,
            stage.failed
        );
    }
    if let Some(manifest) = &report.snapshot_manifest {
        println!("snapshots: {}", manifest.display());
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: LogFormat) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}
