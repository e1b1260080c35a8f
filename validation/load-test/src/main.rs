//! Load test CLI for the Family Tree backend.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use load_test::HttpTransport;
use loadgen::testing::SimulatedTransport;
use loadgen::{
    Check, HumanDuration, LoadRunner, RampMode, RequestDescriptor, RunOptions, RunResult,
    Scenario, ScenarioRunner, Schedule, Stage, Step, SummaryReporter, TestConfig, ThresholdSpec,
    Transport,
};

#[derive(Parser)]
#[command(name = "load-test")]
#[command(about = "Load testing tool for the Family Tree backend", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test from a scenario file
    Run {
        /// Path to scenario YAML file
        #[arg(short, long)]
        scenario: PathBuf,

        /// Override the scenario's base URL
        #[arg(short, long, env = "LOAD_TEST_BASE_URL")]
        base_url: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,

        /// Write the JSON summary to this file
        #[arg(long, default_value = "load-test-summary.json")]
        summary_export: PathBuf,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,

        /// Answer every request locally instead of contacting the target
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a quick smoke test against a single endpoint
    Quick {
        /// Base URL
        #[arg(short, long, default_value = "http://localhost:8080", env = "LOAD_TEST_BASE_URL")]
        url: String,

        /// Path to request
        #[arg(short, long, default_value = "/ping")]
        path: String,

        /// Number of virtual users
        #[arg(long, default_value = "5")]
        vus: u32,

        /// Test duration (e.g. 30s, 2m)
        #[arg(short, long, default_value = "30s")]
        duration: String,
    },

    /// List available scenarios
    List {
        /// Scenarios directory
        #[arg(short, long, default_value = "scenarios")]
        dir: PathBuf,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = load_test::log_filter(std::env::var("RUST_LOG").ok().as_deref(), &cli.log_level);

    // Logs go to stderr so that JSON and CSV output stay machine-readable.
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    let passed = match cli.command {
        Commands::Run {
            scenario,
            base_url,
            output,
            summary_export,
            no_progress,
            dry_run,
        } => {
            run_scenario(
                &scenario,
                base_url,
                output,
                &summary_export,
                !no_progress,
                dry_run,
            )
            .await?
        }
        Commands::Quick {
            url,
            path,
            vus,
            duration,
        } => quick(&url, &path, vus, &duration).await?,
        Commands::List { dir } => {
            list(&dir);
            true
        }
    };

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_scenario(
    path: &Path,
    base_url: Option<String>,
    output: OutputFormat,
    summary_export: &Path,
    show_progress: bool,
    dry_run: bool,
) -> anyhow::Result<bool> {
    info!(scenario = %path.display(), "Loading scenario");

    let mut config = TestConfig::from_file(path)
        .with_context(|| format!("Failed to load scenario {}", path.display()))?;
    if let Some(url) = base_url {
        config.base_url = url;
    }
    config.validate()?;

    let schedule = config.schedule()?;
    let thresholds = config.thresholds()?;
    let scenario = config.scenario()?;

    eprintln!("✓ Configuration loaded successfully");
    eprintln!("  Name: {}", config.name);
    eprintln!("  Description: {}", config.description);
    eprintln!("  Target: {}", config.base_url);
    eprintln!("  Duration: {}", HumanDuration(schedule.total_duration()));
    eprintln!("  Peak VUs: {}", schedule.peak_target());
    eprintln!("  Steps: {}", scenario.steps().len());
    eprintln!();

    let transport: Arc<dyn Transport> = if dry_run {
        warn!("Dry run: requests are answered locally");
        Arc::new(SimulatedTransport::new(200).with_latency(Duration::from_millis(50)))
    } else {
        Arc::new(HttpTransport::new(
            &config.base_url,
            config.request_timeout.0,
            schedule.peak_target().max(1) as usize,
        )?)
    };

    let options = RunOptions {
        show_progress,
        ..config.run_options()
    };
    let runner = LoadRunner::new(
        config.name.clone(),
        schedule,
        thresholds,
        ScenarioRunner::new(scenario, transport),
        options,
    );

    let result = execute(runner).await;
    print_result(&result, output)?;

    let json = SummaryReporter::format_json(&result)?;
    std::fs::write(summary_export, json)
        .with_context(|| format!("Failed to write summary to {}", summary_export.display()))?;
    info!(path = %summary_export.display(), "Summary written");

    Ok(result.thresholds_passed() && !result.is_aborted())
}

async fn quick(url: &str, path: &str, vus: u32, duration: &str) -> anyhow::Result<bool> {
    let duration = HumanDuration::parse(duration)?.0;

    eprintln!("Running quick test:");
    eprintln!("  URL: {}{}", url, path);
    eprintln!("  VUs: {}", vus);
    eprintln!("  Duration: {}", HumanDuration(duration));
    eprintln!();

    let schedule = Schedule::with_mode(vec![Stage::new(duration, vus)], RampMode::Step)?;
    let scenario = Scenario::new(
        "quick",
        vec![Step::new("request", RequestDescriptor::get(path))
            .check(Check::status("status is 200", &[200]))],
    )?;
    let thresholds = vec![ThresholdSpec::parse("http_req_failed", "rate<0.01")?];
    let transport = Arc::new(HttpTransport::new(
        url,
        Duration::from_secs(30),
        vus.max(1) as usize,
    )?);

    let runner = LoadRunner::new(
        "quick",
        schedule,
        thresholds,
        ScenarioRunner::new(scenario, transport),
        RunOptions {
            show_progress: true,
            ..Default::default()
        },
    );

    let result = execute(runner).await;
    print_result(&result, OutputFormat::Table)?;
    Ok(result.thresholds_passed() && !result.is_aborted())
}

/// Run to completion, stopping early on Ctrl-C.
async fn execute(runner: LoadRunner) -> RunResult {
    let stop = runner.stop_signal();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight iterations");
            stop.stop();
        }
    });

    let result = runner.run().await;
    ctrl_c.abort();
    result
}

fn print_result(result: &RunResult, output: OutputFormat) -> anyhow::Result<()> {
    match output {
        OutputFormat::Json => println!("{}", SummaryReporter::format_json(result)?),
        OutputFormat::Csv => {
            println!("{}", SummaryReporter::csv_header());
            print!("{}", SummaryReporter::format_csv(result));
        }
        OutputFormat::Table => println!("{}", SummaryReporter::format_text(result, " ")),
    }
    Ok(())
}

fn list(dir: &Path) {
    println!("Available scenarios in {}:", dir.display());
    println!();

    match load_test::discover_scenarios(dir) {
        Ok(scenarios) if scenarios.is_empty() => println!("No scenario files found"),
        Ok(scenarios) => {
            for s in scenarios {
                println!("  {} - {}", s.file_name, s.name);
                println!("    {}", s.description);
                println!();
            }
        }
        Err(e) => {
            eprintln!("Error reading directory: {}", e);
            eprintln!("Make sure the directory exists and is readable");
        }
    }
}
