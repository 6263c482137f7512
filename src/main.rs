//! RelayQ entry point: API server, workers, and administrative commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use relayq::config::Settings;
use relayq::error::{RelayError, Result};
use relayq::handlers::{self, AppState};
use relayq::processor::Processor;
use relayq::queue::create_queue;
use relayq::routing::RoutingEngine;
use relayq::store::create_store;
use relayq::util::shutdown_signal;
use relayq::worker::Worker;

/// RelayQ - asynchronous HTTP-to-queue-to-HTTP router
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (TOML or YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (json, pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ingress API server
    Serve {
        /// Bind host override
        #[arg(long)]
        host: Option<String>,

        /// Bind port override
        #[arg(long)]
        port: Option<u16>,
    },
    /// Start a worker process
    Worker {
        /// Worker identifier (defaults to worker-<index>)
        #[arg(long)]
        id: Option<String>,

        /// This worker's index among the deployment's workers (0-based)
        #[arg(long, default_value = "0")]
        index: usize,

        /// Total worker count (defaults to worker.count from config)
        #[arg(long)]
        count: Option<usize>,
    },
    /// Validate a routing configuration file
    ValidateRoutes {
        /// Routing configuration to validate (YAML or JSON)
        #[arg(short, long, value_name = "FILE")]
        routes: PathBuf,
    },
    /// Generate a sample configuration file
    Config {
        /// Output file path
        #[arg(short, long, value_name = "FILE", default_value = "relayq.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check the health of a running server
    Health {
        /// Server base URL
        #[arg(short, long, default_value = "http://localhost:8000")]
        url: String,

        /// Timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
}

/// Distinguishes configuration/startup failures (exit 1) from failures of
/// an already-running process (exit 2).
enum RunError {
    Startup(RelayError),
    Runtime(RelayError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, &cli.log_format) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("Starting relayq v{}", relayq::VERSION);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(RunError::Startup(e)) => {
            error!("Startup failed: {}", e);
            1
        }
        Err(RunError::Runtime(e)) => {
            error!("Unrecoverable runtime failure: {}", e);
            2
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> std::result::Result<(), RunError> {
    match cli.command {
        Commands::Serve { host, port } => run_serve(cli.config.as_deref(), host, port).await,
        Commands::Worker { id, index, count } => {
            run_worker(cli.config.as_deref(), id, index, count).await
        }
        Commands::ValidateRoutes { routes } => {
            validate_routes(&routes).map_err(RunError::Startup)
        }
        Commands::Config { output, force } => {
            generate_config(&output, force).map_err(RunError::Startup)
        }
        Commands::Health { url, timeout } => {
            check_health(&url, timeout).await.map_err(RunError::Startup)
        }
    }
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let level = level
        .parse::<tracing::Level>()
        .map_err(|_| RelayError::config(format!("invalid log level: {}", level)))?;

    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
    );

    match format {
        "json" => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        "pretty" => subscriber
            .with(tracing_subscriber::fmt::layer().pretty())
            .init(),
        other => {
            return Err(RelayError::config(format!("invalid log format: {}", other)));
        }
    }
    Ok(())
}

fn load_settings(config: Option<&std::path::Path>) -> Result<Arc<Settings>> {
    match config {
        Some(path) => info!("Loading configuration from {}", path.display()),
        None => info!("Loading configuration from environment"),
    }
    Ok(Arc::new(Settings::load(config)?))
}

async fn run_serve(
    config: Option<&std::path::Path>,
    host: Option<String>,
    port: Option<u16>,
) -> std::result::Result<(), RunError> {
    let mut settings = load_settings(config)
        .map_err(RunError::Startup)?
        .as_ref()
        .clone();
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    let settings = Arc::new(settings);

    let store = create_store(&settings.cache)
        .await
        .map_err(RunError::Startup)?;
    let queue = create_queue(&settings.queue).map_err(RunError::Startup)?;
    queue.connect().await.map_err(RunError::Startup)?;

    let state = AppState {
        queue: queue.clone(),
        store: store.clone(),
        settings: settings.clone(),
    };
    let app = handlers::create_router(state);

    let address = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| {
            RunError::Startup(RelayError::config(format!(
                "failed to bind {}: {}",
                address, e
            )))
        })?;
    info!(
        "API server listening on {} ({} workers configured)",
        address, settings.server.workers
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Tear down in reverse order of initialization.
    if let Err(e) = queue.disconnect().await {
        error!("Queue disconnect failed: {}", e);
    }
    if let Err(e) = store.close().await {
        error!("Store close failed: {}", e);
    }

    match served {
        Ok(()) => {
            info!("Server shutdown complete");
            Ok(())
        }
        Err(e) => Err(RunError::Runtime(RelayError::internal(format!(
            "server error: {}",
            e
        )))),
    }
}

async fn run_worker(
    config: Option<&std::path::Path>,
    id: Option<String>,
    index: usize,
    count: Option<usize>,
) -> std::result::Result<(), RunError> {
    let settings = load_settings(config).map_err(RunError::Startup)?;

    let worker_id = id.unwrap_or_else(|| format!("worker-{}", index));
    let worker_count = count.unwrap_or(settings.worker.count).max(1);
    if index >= worker_count {
        return Err(RunError::Startup(RelayError::config(format!(
            "worker index {} out of range for {} workers",
            index, worker_count
        ))));
    }

    let store = create_store(&settings.cache)
        .await
        .map_err(RunError::Startup)?;
    let queue = create_queue(&settings.queue).map_err(RunError::Startup)?;
    queue.connect().await.map_err(RunError::Startup)?;

    // Routing and partitioning configuration problems surface here, before
    // the worker touches the queue.
    let processor = Arc::new(
        Processor::new(settings.clone(), &worker_id).map_err(RunError::Startup)?,
    );
    processor.set_partition_assignments(worker_count, index);

    let worker = Arc::new(Worker::new(
        worker_id,
        queue,
        store,
        processor,
        settings,
    ));
    worker.start().await.map_err(RunError::Runtime)
}

fn validate_routes(path: &std::path::Path) -> Result<()> {
    info!("Validating routing configuration {}", path.display());
    RoutingEngine::from_file(path)?;
    println!("✓ Routing configuration is valid");
    Ok(())
}

fn generate_config(output: &std::path::Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(RelayError::config(format!(
            "{} already exists; use --force to overwrite",
            output.display()
        )));
    }

    let settings = Settings::default();
    let content = toml::to_string_pretty(&settings)
        .map_err(|e| RelayError::config(format!("failed to serialize config: {}", e)))?;
    std::fs::write(output, content)?;
    println!("✓ Sample configuration written to {}", output.display());
    Ok(())
}

async fn check_health(url: &str, timeout: u64) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout))
        .build()?;

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let response = client.get(&health_url).send().await?;

    if response.status().is_success() {
        println!("✓ Server is healthy");
        println!("{}", response.text().await.unwrap_or_default());
        Ok(())
    } else {
        Err(RelayError::service_unavailable(format!(
            "health check failed with status {}",
            response.status()
        )))
    }
}
