mod clock;
mod config;
mod notify;
mod scanner;
mod setup;
mod signals;
mod singleton;
mod stall;
mod status;
mod supervisor;
mod watchdog;

use clap::Parser;
use clock::SystemClock;
use config::{CliOverrides, GuardConfig};
use notify::SystemSuspend;
use signals::ShutdownSignal;
use std::path::PathBuf;
use supervisor::SystemProcesses;
use tracing_subscriber::EnvFilter;
use watchdog::{ExitReason, RenderWatchdog};

/// Watches a frame-by-frame render and restarts the renderer from the next
/// unrendered frame whenever output stops appearing.
#[derive(Parser, Debug)]
#[command(name = "render-guard", version, about)]
pub struct Cli {
    /// Skip interactive setup and use the saved configuration
    #[arg(short = 's', long)]
    skip_setup: bool,

    /// Put the computer to sleep once the last frame has rendered
    #[arg(short = 'z', long)]
    suspend: bool,

    /// Config file path
    #[arg(short, long, default_value = "render-guard.toml")]
    config: PathBuf,

    /// Render output directory (overrides config)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Seconds without a new frame before the renderer is restarted (overrides config)
    #[arg(long)]
    time_limit: Option<u64>,

    /// Last frame of the animation (overrides config)
    #[arg(long)]
    end_frame: Option<u32>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (every poll, process lookups)
    #[arg(short, long)]
    verbose: bool,

    /// Only errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn to_overrides(&self) -> CliOverrides {
        CliOverrides {
            output_dir: self.output_dir.clone(),
            time_limit: self.time_limit,
            end_frame: self.end_frame,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Log level: --quiet = error only, --verbose = debug+, default = info+
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_env_filter(filter)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match GuardConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    if !cli.skip_setup && !cli.dry_run {
        let stdin = std::io::stdin();
        if let Err(e) = setup::collect(&mut config, stdin.lock(), std::io::stdout()) {
            tracing::error!(error = %e, "failed to read setup answers");
            std::process::exit(1);
        }
        match config.save(&cli.config) {
            Ok(()) => tracing::info!(path = %cli.config.display(), "settings saved"),
            Err(e) => tracing::warn!(error = %e, "settings not saved, continuing"),
        }
    }

    config.apply_cli_overrides(&cli.to_overrides());
    tracing::debug!(?config, "resolved configuration");

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        eprintln!("Configuration validation failed:");
        for err in &validation_errors {
            eprintln!("  {err}");
        }
        std::process::exit(1);
    }

    if cli.dry_run {
        print_resolved(&cli, &config);
        return;
    }

    let notifier = cli.suspend.then_some(SystemSuspend);
    let mut watchdog = RenderWatchdog::new(&config, SystemClock, SystemProcesses, notifier);

    if let Err(e) = watchdog.preflight() {
        tracing::error!("{e}");
        std::process::exit(1);
    }

    let _lock = match singleton::try_acquire(&config.output.dir) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let shutdown = match ShutdownSignal::install() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            std::process::exit(1);
        }
    };

    match watchdog.run(&shutdown).await {
        Ok(summary) => match summary.exit_reason {
            ExitReason::Completed => println!(
                "Rendering finished at {}. Total restarts: {}",
                summary.finished_at.format("%Y-%m-%d %H:%M:%S"),
                summary.restart_count
            ),
            ExitReason::Shutdown => println!(
                "Stopped watching at frame {}. Total restarts: {}",
                summary
                    .final_frame
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                summary.restart_count
            ),
        },
        Err(e) => {
            tracing::error!(error = %e, "render guard stopped");
            std::process::exit(1);
        }
    }
}

fn print_resolved(cli: &Cli, config: &GuardConfig) {
    println!("render-guard v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file: {}", cli.config.display());
    println!();
    println!("Resolved configuration:");
    println!(
        "  render.executable = {}",
        config.render.executable.display()
    );
    println!(
        "  render.project_file = {}",
        config.render.project_file.display()
    );
    println!("  render.end_frame = {}", config.render.end_frame);
    println!("  render.args = {:?}", config.render.args);
    println!("  render.process_name = {}", config.render.process_name());
    match config.render.log_file {
        Some(ref p) => println!("  render.log_file = {}", p.display()),
        None => println!("  render.log_file = (discarded)"),
    }
    println!("  output.dir = {}", config.output.dir.display());
    println!("  output.extension = {}", config.output.extension());
    println!("  output.prefix = {:?}", config.output.prefix);
    println!(
        "  watchdog.time_limit_secs = {}",
        config.watchdog.time_limit_secs
    );
    match config.watchdog.status_file {
        Some(ref p) => println!("  watchdog.status_file = {}", p.display()),
        None => println!("  watchdog.status_file = (none)"),
    }
    println!(
        "  lock = {}",
        singleton::lock_path(&config.output.dir).display()
    );
    println!("  suspend on completion = {}", cli.suspend);
}
