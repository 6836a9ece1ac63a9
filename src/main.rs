//! imgpress CLI
//!
//! Entry point for the `imgpress` command-line tool.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use imgpress::{Compressor, Config, Dispatcher, Egress, Ingress, StateStore};

/// Default config file path, used when present.
const DEFAULT_CONFIG_PATH: &str = "imgpress.toml";

#[derive(Parser)]
#[command(name = "imgpress")]
#[command(about = "Queued image compression service", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the storage directory layout
    Init {
        /// Path to config file (default: imgpress.toml if present)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Ingest a file and compress the queue until it drains
    Enqueue {
        /// File to ingest
        file: PathBuf,

        /// Stage and record the job without dispatching; a separate
        /// `imgpress run` picks it up
        #[arg(long)]
        stage_only: bool,

        /// Path to config file (default: imgpress.toml if present)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Recover state, then process queued jobs
    Run {
        /// Keep rescanning the queue instead of exiting when it drains
        #[arg(long)]
        watch: bool,

        /// Path to config file (default: imgpress.toml if present)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Report the lifecycle state of a job
    Status {
        /// Job identifier
        id: String,

        /// Path to config file (default: imgpress.toml if present)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Copy a finished artifact out of the images directory
    Retrieve {
        /// Job identifier
        id: String,

        /// Destination path; without it the artifact path is printed
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,

        /// Path to config file (default: imgpress.toml if present)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { config } => run_init(config),
        Commands::Enqueue {
            file,
            stage_only,
            config,
        } => run_enqueue(file, stage_only, config),
        Commands::Run { watch, config } => run_queue(watch, config),
        Commands::Status { id, config } => run_status(&id, config),
        Commands::Retrieve { id, out, config } => run_retrieve(&id, out, config),
    }
}

fn load_config(path: Option<PathBuf>) -> Config {
    let path = path.or_else(|| {
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        default.exists().then_some(default)
    });

    match path {
        Some(path) => match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config: {e}");
                process::exit(1);
            }
        },
        None => Config::default(),
    }
}

/// Service wiring shared by every command that touches the core.
struct Service {
    config: Config,
    store: Arc<StateStore>,
    dispatcher: Arc<Dispatcher>,
}

fn build_service(config: Config) -> Service {
    let layout = config.layout();
    if let Err(e) = layout.ensure() {
        eprintln!("Failed to create storage directories: {e}");
        process::exit(1);
    }

    let store = Arc::new(StateStore::open(layout.state_file()));
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        &layout,
        Compressor::new(&config.compressor, config.timeout()),
        config.max_concurrent,
    );

    Service {
        config,
        store,
        dispatcher,
    }
}

/// Startup recovery: demote stale `compressing` entries back to `queued`.
fn recover(store: &StateStore) {
    match store.reset_in_flight() {
        Ok(demoted) => {
            for id in &demoted {
                tracing::info!(job_id = %id, "recovered stale in-flight job");
            }
        }
        Err(e) => {
            // A state document we cannot trust is fatal, never ignored
            eprintln!("State recovery failed: {e}");
            process::exit(1);
        }
    }
}

/// Install the Ctrl-C handler: first signal requests a graceful drain,
/// second exits immediately.
fn install_shutdown_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let result = ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            process::exit(130);
        }
        eprintln!("Shutting down after in-flight jobs finish (Ctrl-C again to exit now)...");
    });
    if let Err(e) = result {
        eprintln!("Failed to install signal handler: {e}");
        process::exit(1);
    }
    shutdown
}

fn run_init(config: Option<PathBuf>) {
    let config = load_config(config);
    let layout = config.layout();
    if let Err(e) = layout.ensure() {
        eprintln!("Failed to create storage directories: {e}");
        process::exit(1);
    }
    println!("Storage layout ready at {}", layout.root().display());
}

fn run_enqueue(file: PathBuf, stage_only: bool, config: Option<PathBuf>) {
    let service = build_service(load_config(config));

    let filename = match file.file_name().and_then(|name| name.to_str()) {
        Some(name) => name.to_string(),
        None => {
            eprintln!("Not a usable file name: {}", file.display());
            process::exit(1);
        }
    };
    let bytes = match std::fs::read(&file) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read {}: {e}", file.display());
            process::exit(1);
        }
    };

    // Recovery belongs to `run` only: another process may have live workers,
    // and demoting their compressing entries from here would dispatch the
    // same job twice
    let ingress = Ingress::new(
        service.config,
        Arc::clone(&service.store),
        Arc::clone(&service.dispatcher),
    );

    let admission = if stage_only {
        ingress.stage(&bytes, &filename)
    } else {
        ingress.ingest(&bytes, &filename)
    };

    let admission = match admission {
        Ok(admission) => admission,
        Err(e) => {
            eprintln!("Upload rejected: {e}");
            process::exit(1);
        }
    };

    if admission.queued {
        println!(
            "{} queued for compression (position {})",
            admission.id, admission.queue_position
        );
    } else {
        println!("{} uploaded (no compression for this type)", admission.id);
    }

    if !stage_only {
        if let Err(e) = drain_queue(&service.dispatcher) {
            eprintln!("Queue processing failed: {e}");
            process::exit(1);
        }
    }
}

fn run_queue(watch: bool, config: Option<PathBuf>) {
    let service = build_service(load_config(config));
    let shutdown = install_shutdown_handler();

    recover(&service.store);

    if watch {
        let interval = service.config.watch_interval();
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = service.dispatcher.admit() {
                eprintln!("Dispatch failed: {e}");
                process::exit(1);
            }
            std::thread::sleep(interval);
        }
        if let Err(e) = service.dispatcher.drain() {
            eprintln!("Shutdown drain failed: {e}");
            process::exit(1);
        }
        return;
    }

    if let Err(e) = drain_queue(&service.dispatcher) {
        eprintln!("Queue processing failed: {e}");
        process::exit(1);
    }
}

/// Process the queue until nothing is admittable and nothing is in flight.
///
/// Completions re-admit on their own; the loop here only catches jobs that
/// became admittable between a drain finishing and the follow-up check.
fn drain_queue(dispatcher: &Arc<Dispatcher>) -> Result<(), imgpress::DispatchError> {
    loop {
        dispatcher.drain()?;
        if dispatcher.admit()? == 0 && dispatcher.in_flight() == 0 {
            return Ok(());
        }
    }
}

fn run_status(id: &str, config: Option<PathBuf>) {
    let config = load_config(config);
    let store = Arc::new(StateStore::open(config.layout().state_file()));
    let egress = Egress::new(config.layout(), store);

    match egress.status(id) {
        Ok(Some(state)) => println!("{state}"),
        Ok(None) => {
            eprintln!("No such job: {id}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Status lookup failed: {e}");
            process::exit(1);
        }
    }
}

fn run_retrieve(id: &str, out: Option<PathBuf>, config: Option<PathBuf>) {
    let config = load_config(config);
    let store = Arc::new(StateStore::open(config.layout().state_file()));
    let egress = Egress::new(config.layout(), store);

    let artifact = match egress.retrieve(id) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Retrieval failed: {e}");
            process::exit(1);
        }
    };

    match out {
        Some(out) => {
            if let Err(e) = std::fs::copy(&artifact, &out) {
                eprintln!("Failed to copy artifact to {}: {e}", out.display());
                process::exit(1);
            }
            println!("{}", out.display());
        }
        None => println!("{}", artifact.display()),
    }
}
