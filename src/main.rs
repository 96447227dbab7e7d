use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use folio::{
    Config, api, create_router,
    gallery::{Gallery, LayoutQuery},
    startup_checks,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Global options that apply to all commands
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the web server (default if no command specified)
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Automatically quit after specified number of seconds (useful for testing)
        #[arg(long)]
        quit_after: Option<u64>,
    },

    /// Print the packed layout of the first chunks as JSON
    Layout {
        #[arg(long)]
        columns: Option<usize>,

        /// Viewport width in pixels, used to pick the column count
        #[arg(long)]
        width: Option<u32>,

        /// Number of chunks to reveal
        #[arg(long, default_value_t = 1)]
        chunks: usize,

        #[arg(long)]
        category: Option<String>,
    },

    /// Probe every image and print the measured dimensions as JSON
    Prefetch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging first
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG, when set, overrides the command line level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli.config)?;

    match cli.command {
        Some(Commands::Serve {
            port,
            host,
            quit_after,
        }) => run_server(config, port, host, quit_after).await,
        Some(Commands::Layout {
            columns,
            width,
            chunks,
            category,
        }) => {
            let query = LayoutQuery {
                width,
                columns,
                chunks: Some(chunks),
                category,
            };
            print_layout(config, query).await
        }
        Some(Commands::Prefetch) => run_prefetch(config).await,
        None => {
            // Default to serve command if no subcommand specified
            run_server(config, None, None, None).await
        }
    }
}

fn load_config(config_path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if config_path.exists() {
        let config_content = std::fs::read_to_string(config_path)?;
        let config = toml_edit::de::from_str::<Config>(&config_content)?;
        info!("Configuration loaded from: {:?}", config_path);
        Ok(config)
    } else {
        info!("Config file not found at {:?}, using defaults", config_path);
        Ok(Config::default())
    }
}

async fn print_layout(
    config: Config,
    query: LayoutQuery,
) -> Result<(), Box<dyn std::error::Error>> {
    let gallery = Gallery::load(config.gallery.clone(), config.delivery.clone()).await?;
    let response = api::build_layout(&gallery, &query);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_prefetch(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let gallery = Gallery::load(config.gallery.clone(), config.delivery.clone()).await?;
    let found = gallery.prefetch_all().await;

    let mut dimensions: Vec<_> = found
        .into_iter()
        .map(|(src, entry)| (src, entry.width, entry.height))
        .collect();
    dimensions.sort();

    let output: Vec<serde_json::Value> = dimensions
        .into_iter()
        .map(|(src, width, height)| {
            serde_json::json!({ "src": src, "width": width, "height": height })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&output)?);

    let unknown = gallery.images().len().saturating_sub(output.len());
    if unknown > 0 {
        tracing::warn!("{} images could not be measured", unknown);
    }
    Ok(())
}

async fn run_server(
    config: Config,
    port: Option<u16>,
    host: Option<String>,
    quit_after: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let host = host.unwrap_or(config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    info!("Starting {} server", config.app.name);
    info!(
        "Gallery source directory: {:?}",
        config.gallery.source_directory
    );
    if let Some(manifest) = &config.gallery.manifest {
        info!("Gallery manifest: {:?}", manifest);
    }

    // Perform startup checks
    if let Err(errors) = startup_checks::perform_startup_checks(&config).await {
        for error in &errors {
            tracing::error!("Startup check failed: {}", error);
        }

        if errors.iter().any(|e| e.is_critical()) {
            tracing::error!("Critical startup check failed, exiting");
            return Err("Critical startup check failed".into());
        } else {
            tracing::warn!("Non-critical startup checks failed, continuing");
        }
    }

    let gallery = Arc::new(Gallery::load(config.gallery.clone(), config.delivery.clone()).await?);

    if config.app.prefetch_on_start {
        let scheduled = Gallery::start_background_prefetch(gallery.clone());
        info!("Prefetching dimensions for {} images in the background", scheduled);
    }

    let app = create_router(config.clone(), gallery);

    let addr = SocketAddr::from((host.parse::<std::net::IpAddr>()?, port));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Set up graceful shutdown
    let server = axum::serve(listener, app);
    let graceful = server.with_graceful_shutdown(shutdown_signal(quit_after));

    if let Err(e) = graceful.await {
        tracing::error!("Server error: {}", e);
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(quit_after: Option<u64>) {
    use tokio::signal;
    use tokio::time::{Duration, sleep};

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let quit_timer = async {
        if let Some(seconds) = quit_after {
            info!(
                "Server will automatically shut down after {} seconds",
                seconds
            );
            sleep(Duration::from_secs(seconds)).await;
            info!("Quit timer expired, shutting down");
        } else {
            std::future::pending::<()>().await
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        },
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        },
        _ = quit_timer => {},
    }
}
