//! Teller CLI
//!
//! Offline helpers around the session library: everything here works
//! without a running client.
//!
//!   teller generate-password --config teller.yaml
//!   teller inspect-dialog dump.txt
//!   teller verify-export reports/ZBRK_L_DEASHD4_03.02.25.xls --wait
//!   teller plan --project . --date 2025-02-03
//!   teller show-config --config teller.yaml

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;

use teller::export::ExportStatus;
use teller::{
    parse_transcript, CommandConverter, Credentials, DateRange, ExportPlan, ExportTask,
    ExportVerifier, PasswordPolicy, PipelineConfig, ReportPaths, SessionConfig,
};

#[derive(Parser)]
#[command(name = "teller")]
#[command(about = "Session automation helpers for the legacy banking client")]
struct Cli {
    /// Session config file (.json, .yaml or .yml); defaults plus environment otherwise
    #[clap(long, short = 'c', global = true, env = "TELLER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the daily log files
    #[clap(long, global = true, env = "TELLER_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log library internals at debug level (RUST_LOG takes precedence)
    #[clap(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a password satisfying the configured policy
    GeneratePassword(GenerateArgs),
    /// Parse a copied message box transcript and print it as JSON
    InspectDialog {
        /// Transcript file; reads stdin when omitted
        file: Option<PathBuf>,
    },
    /// Check whether an export written by the client is complete
    VerifyExport(VerifyArgs),
    /// Show what a report run would still have to do
    Plan(PlanArgs),
    /// Print the effective session config with secrets redacted
    ShowConfig,
}

#[derive(Parser, Debug)]
struct GenerateArgs {
    /// Overrides the policy length
    #[clap(long)]
    length: Option<usize>,
}

#[derive(Parser, Debug)]
struct VerifyArgs {
    path: PathBuf,
    /// Keep polling until ready instead of checking once
    #[clap(long)]
    wait: bool,
    #[clap(long, default_value = "xls")]
    extension: String,
    #[clap(long, default_value_t = 1800)]
    timeout_secs: u64,
    #[clap(long, default_value_t = 10)]
    poll_secs: u64,
    /// Only check existence, size and locks
    #[clap(long)]
    no_formatting: bool,
    /// Office converter used for the formatting probe
    #[clap(long, default_value = "soffice")]
    converter: String,
}

#[derive(Parser, Debug)]
struct PlanArgs {
    /// Project directory holding `reports/`
    #[clap(long, default_value = ".")]
    project: PathBuf,
    /// Run date (YYYY-MM-DD); today when omitted
    #[clap(long)]
    date: Option<NaiveDate>,
    /// Pipeline config file (.json, .yaml or .yml)
    #[clap(long)]
    pipeline: Option<PathBuf>,
    /// Office converter used to check raw exports
    #[clap(long, default_value = "soffice")]
    converter: String,
}

#[derive(Serialize)]
struct PlanOutput {
    range: DateRange,
    paths: ReportPaths,
    plan: ExportPlan,
    needs_session: bool,
}

#[derive(Serialize)]
struct ConfigOutput<'a> {
    user: Option<String>,
    password_set: bool,
    launch_target: Option<&'a Path>,
    config: &'a SessionConfig,
}

/// Logs to stderr and to a daily file. The returned guard flushes the file
/// writer and has to live until `main` returns.
fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> WorkerGuard {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let log_dir = log_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("teller")
            .join("logs")
    });
    let _ = std::fs::create_dir_all(&log_dir);
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "teller.log"));

    let default_filter = if verbose { "info,teller=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .try_init();
    guard
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

fn load_pipeline_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
        _ => bail!("Unsupported pipeline config format: {}", path.display()),
    };
    Ok(config)
}

fn generate_password(config: &SessionConfig, args: GenerateArgs) -> Result<()> {
    let policy = PasswordPolicy {
        length: args.length.unwrap_or(config.password_policy.length),
        ..config.password_policy.clone()
    };
    let password = policy.generate().context("Password policy cannot be satisfied")?;
    println!("{password}");
    Ok(())
}

fn inspect_dialog(file: Option<PathBuf>) -> Result<()> {
    let transcript = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read transcript {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read transcript from stdin")?;
            buffer
        }
    };
    let content = parse_transcript(&transcript);
    println!("{}", serde_json::to_string_pretty(&content)?);
    Ok(())
}

async fn verify_export(args: VerifyArgs) -> Result<()> {
    let verifier = ExportVerifier::new(Arc::new(office_converter(&args.converter)));
    let mut task = ExportTask::new("cli", &args.path)
        .with_extension(args.extension.clone())
        .with_cadence(Duration::ZERO, Duration::from_secs(args.poll_secs))
        .with_timeout(Duration::from_secs(args.timeout_secs));
    if args.no_formatting {
        task = task.without_formatting_check();
    }

    if args.wait {
        verifier
            .wait_until_ready(&task)
            .await
            .with_context(|| format!("{} did not become ready", args.path.display()))?;
        println!("ready");
        return Ok(());
    }

    match verifier.poll(&task).await? {
        ExportStatus::Ready => println!("ready"),
        ExportStatus::NotReady(reason) => println!("not ready: {reason}"),
        ExportStatus::Corrupt(reason) => bail!("{} is corrupt: {}", args.path.display(), reason),
    }
    Ok(())
}

fn office_converter(program: &str) -> CommandConverter {
    CommandConverter::new(
        program,
        ["--headless", "--convert-to", "xlsx", "--outdir", "{outdir}", "{source}"],
    )
}

async fn plan(args: PlanArgs) -> Result<()> {
    let config = load_pipeline_config(args.pipeline.as_deref())?;
    let date = args.date.unwrap_or_else(|| Local::now().date_naive());
    let range = DateRange::starting(date, config.horizon_days);
    let root = ReportPaths::dated_root(&args.project, date);
    debug!(root = %root.display(), "Resolved report folder");

    let paths = ReportPaths::new(root, &config, &range);
    let verifier = ExportVerifier::new(Arc::new(office_converter(&args.converter)));
    let plan = ExportPlan::assess(&paths, &verifier)
        .await
        .context("Failed to check the report folder")?;
    let output = PlanOutput {
        needs_session: plan.needs_session(),
        range,
        paths,
        plan,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn show_config(config: &SessionConfig) -> Result<()> {
    let credentials = Credentials::from_env().ok();
    let output = ConfigOutput {
        user: credentials.as_ref().map(|c| c.username.clone()),
        password_set: credentials.is_some(),
        launch_target: config.launch_target(),
        config,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the variables may come from the environment.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.clone(), cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    info!(app = %config.app_path.display(), "Loaded session config");

    match cli.command {
        Commands::GeneratePassword(args) => generate_password(&config, args),
        Commands::InspectDialog { file } => inspect_dialog(file),
        Commands::VerifyExport(args) => verify_export(args).await,
        Commands::Plan(args) => plan(args).await,
        Commands::ShowConfig => show_config(&config),
    }
}
