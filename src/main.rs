//! build-image - entry point
//!
//! Parses the command line, installs the tracing subscriber and signal
//! handlers, and maps build errors to exit codes.

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use image_builder::cli::{Cli, Commands};
use image_builder::{BuildError, Builder, SessionStore, Step, TerminalConfirm, process_guard};

/// Exit code for an operator declining a pause point, as for Ctrl+C
const EXIT_OPERATOR_ABORT: i32 = 130;

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("warn")
    } else {
        // RUST_LOG overrides the debug default
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logging(&cli);

    if let Err(e) = run(cli.command) {
        let aborted = e
            .downcast_ref::<BuildError>()
            .is_some_and(BuildError::is_operator_abort);
        if aborted {
            warn!("{:#}", e);
            std::process::exit(EXIT_OPERATOR_ABORT);
        }
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Build { ref profiles, .. } => {
            let options = command
                .builder_options()
                .context("build options missing for build command")?;
            let builder =
                Builder::new(profiles.as_slice(), options).context("failed to prepare the build")?;

            if let Err(e) = process_guard::init_signal_handlers(builder.child_registry()) {
                warn!("Failed to initialize signal handlers: {}", e);
            }

            builder.build(TerminalConfirm)?;
        }
        Commands::Status { cache_dir, json } => {
            let mut session = SessionStore::new(&cache_dir);
            let snapshot = session
                .snapshot()
                .with_context(|| format!("failed to read session in {}", cache_dir.display()))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else if !snapshot.in_progress {
                println!("No build in progress in {}", cache_dir.display());
            } else {
                println!("Session: {}", session.session_file().display());
                if let Some(device) = &snapshot.loop_device {
                    println!("Loop device: {}", device);
                }
                println!("Completed:");
                for step in &snapshot.completed {
                    println!("  {}", step);
                }
                println!("Pending:");
                for step in &snapshot.pending {
                    println!("  {}", step);
                }
            }
        }
        Commands::Steps => {
            for step in Step::pipeline() {
                println!("{}", step);
            }
        }
        Commands::Reset { cache_dir } => {
            let mut session = SessionStore::new(&cache_dir);
            if let Some(device) = session.cached_loop_device()? {
                warn!(
                    "session recorded loop device {}; release it and unmount the chroot by hand if still attached",
                    device
                );
            }
            session.end()?;
            info!("session in {} reset", cache_dir.display());
        }
    }
    Ok(())
}
