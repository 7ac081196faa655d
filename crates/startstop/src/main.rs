//! startstop - build/start/probe/measure harness
//!
//! Entry point for the `startstop` binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use eyre::{bail, WrapErr};
use startstop::Orchestrator;
use startstop_core::{AppRegistry, HarnessConfig, Mode, ScenarioReport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_FILE: &str = "startstop.conf";

/// Build, start, probe and measure applications.
#[derive(Parser)]
#[command(name = "startstop", version)]
#[command(about = "Start/stop and dev-loop measurement harness")]
struct Cli {
    /// Harness config file (default: ./startstop.conf when present)
    #[arg(long, global = true, env = "STARTSTOP_CONFIG")]
    config: Option<PathBuf>,

    /// Application registry
    #[arg(long, global = true)]
    apps: Option<PathBuf>,

    /// Start/stop cycles per scenario
    #[arg(long, global = true)]
    iterations: Option<u32>,

    /// Drop the page cache before every start
    #[arg(long, global = true)]
    cold_start: bool,

    /// Keep the scenario workspace after the run
    #[arg(long, global = true)]
    no_cleanup: bool,

    /// HTTP port the application listens on
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build once, then start and stop the application repeatedly
    StartStop {
        /// Application name from the registry
        #[arg(long)]
        app: String,

        /// Mode: jvm or native
        #[arg(long, value_parser = parse_mode, default_value = "jvm")]
        mode: Mode,
    },

    /// Start in dev mode and measure a live reload
    DevLoop {
        /// Application name from the registry
        #[arg(long)]
        app: String,
    },

    /// List registered applications
    List,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    Mode::parse(s).ok_or_else(|| {
        format!("invalid mode '{s}', expected: jvm, native, dev, generator")
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the scenario passed.
async fn run(cli: Cli) -> eyre::Result<bool> {
    let config = load_config(&cli)?;
    let registry = AppRegistry::load(&config.apps_file)
        .wrap_err_with(|| format!("loading {}", config.apps_file.display()))?;

    let app_name = match &cli.command {
        Command::List => {
            for app in registry.iter() {
                let urls: Vec<&str> = app.urls.iter().map(|u| u.path.as_str()).collect();
                println!("{:<24} {:<32} {}", app.name, app.dir.display(), urls.join(" "));
            }
            return Ok(true);
        }
        Command::StartStop { app, .. } | Command::DevLoop { app } => app.clone(),
    };
    let app = registry.get(&app_name)?;
    let orchestrator = Orchestrator::new(config, startstop::detect())?;

    let result = match cli.command {
        Command::StartStop { mode, .. } => {
            if mode.is_dev_loop() {
                bail!("mode {mode} runs through the dev-loop command");
            }
            orchestrator.run_start_stop(app, mode).await
        }
        Command::DevLoop { .. } => orchestrator.run_dev_loop(app).await,
        Command::List => return Ok(true),
    };

    match result {
        Ok(report) => {
            print_summary(&report);
            Ok(true)
        }
        Err(e) => {
            error!(app = %app.name, error = %e, "scenario failed");
            eprintln!("FAILED {}: {e}", app.name);
            Ok(false)
        }
    }
}

/// Defaults, then the config file, then `STARTSTOP_*` env, then flags.
fn load_config(cli: &Cli) -> eyre::Result<HarnessConfig> {
    let mut config = HarnessConfig::default();
    let base = std::env::current_dir().wrap_err("reading current directory")?;

    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };
    if let Some(path) = &path {
        config
            .load_file(path)
            .wrap_err_with(|| format!("loading {}", path.display()))?;
    }
    config.apply_env()?;

    if let Some(apps) = &cli.apps {
        config.apps_file = base.join(apps);
    }
    if let Some(iterations) = cli.iterations {
        if iterations == 0 {
            bail!("--iterations must be positive");
        }
        config.iterations = iterations;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.cold_start {
        config.cold_start = true;
    }
    if cli.no_cleanup {
        config.cleanup = false;
    }

    let relative_to = path
        .as_deref()
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| base.clone(), |p| base.join(p));
    config.resolve_paths(&relative_to);
    Ok(config)
}

fn print_summary(report: &ScenarioReport) {
    println!("PASSED {} ({})", report.app, report.mode);
    if let Some(rss) = report.trimmed_rss_kb {
        println!("  rss_kb (trimmed mean):                 {rss}");
    }
    if let Some(ttfr) = report.trimmed_time_to_first_ok_request_ms {
        println!("  time_to_first_ok_request_ms (trimmed): {ttfr}");
    }
    if let Some(first) = report.measurements.first() {
        println!("  {}", first.header_markdown());
        println!("  {}", first.divider_markdown());
        for m in &report.measurements {
            println!("  {}", m.line_markdown());
        }
    }
    if let Some(archive) = &report.archive {
        println!("  logs: {archive}");
    }
}
