//! Crashline server binary

use clap::Parser;
use crashline::{
    api::{server::shutdown_signal, ApiServer},
    config::{generate_sample_config, ConfigLoader, CrashConfig},
    CrashResult, ServiceContainer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "crashline")]
#[command(about = "Multiplayer crash game server", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Override server host
    #[arg(long)]
    host: Option<String>,

    /// Override server port
    #[arg(long)]
    port: Option<u16>,

    /// Development preset: in-memory storage and short rounds
    #[arg(long)]
    dev: bool,

    /// Write a sample configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        match generate_sample_config(path) {
            Ok(()) => println!("Sample configuration written to {}", path),
            Err(e) => {
                eprintln!("Failed to write sample configuration: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    if let Err(e) = run(config).await {
        error!(error = %e, "Server terminated with error");
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> CrashResult<CrashConfig> {
    let loader = match &args.config {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };

    let config = if args.config.is_some() {
        loader.load()?
    } else if args.dev {
        CrashConfig::development()
    } else {
        CrashConfig::production()
    };
    apply_cli_overrides(config, args, &loader)
}

fn apply_cli_overrides(
    mut config: CrashConfig,
    args: &Args,
    loader: &ConfigLoader,
) -> CrashResult<CrashConfig> {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    loader.finish(config)
}

fn init_tracing(config: &CrashConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.monitoring.log_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: CrashConfig) -> CrashResult<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.storage.backend,
        "Starting crashline"
    );

    let services = ServiceContainer::new(config.clone()).await?;
    let handles = services.start();
    let machine = services.machine();

    let server = ApiServer::new(config.server.clone(), services.app_state());
    let result = server.run_until(shutdown_signal()).await;

    // Refund any open round and let the loop finish cleanly
    machine.shutdown();
    match handles.rounds.await {
        Ok(Err(e)) => error!(error = %e, "Round loop failed"),
        Err(e) => error!(error = %e, "Round loop task panicked"),
        Ok(Ok(())) => {}
    }
    handles.sweeper.abort();

    result
}
