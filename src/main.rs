//! overlay-router: overlay network node
//!
//! One binary runs any role of the overlay; the subcommand selects which.
//!
//! # Usage
//!
//! ```bash
//! # Run a relay with the default configuration path
//! overlay-router relay
//!
//! # Run a client with a custom configuration
//! sudo overlay-router -c /path/to/config.json client
//!
//! # Validate the configuration for a role and exit
//! overlay-router --check service
//!
//! # Run with environment overrides
//! OVERLAY_LOG_LEVEL=debug OVERLAY_PUBLIC_IP=203.0.113.7 overlay-router relay
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use overlay_router::config::{create_default_config, load_config_with_env, Config, Role};
use overlay_router::iface::VirtualInterface;
use overlay_router::runtime;

const DEFAULT_CONFIG_PATH: &str = "/etc/overlay-router/config.json";

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "overlay-router", version, about = "Overlay network node")]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(short = 'g', long, global = true)]
    generate_config: bool,

    /// Check configuration and exit
    #[arg(long, global = true)]
    check: bool,

    #[command(subcommand)]
    role: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Bridge the local virtual interface into the overlay
    Client,
    /// Forward overlay traffic between clients and services
    Relay,
    /// Expose a protected service to the overlay
    Service,
    /// Assign clients to live relays
    Scheduler,
}

impl From<Command> for Role {
    fn from(command: Command) -> Self {
        match command {
            Command::Client => Role::Client,
            Command::Relay => Role::Relay,
            Command::Service => Role::Service,
            Command::Scheduler => Role::Scheduler,
        }
    }
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["tokio=warn", "redis=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Create the virtual interface for a bridging role
#[cfg(feature = "tun")]
fn open_interface(config: &Config, role: Role) -> Result<Arc<dyn VirtualInterface>> {
    use overlay_router::iface::TunInterface;

    let (settings, address) = match role {
        Role::Client => (
            &config.client.interface,
            config.client.fleet_config()?.overlay_address,
        ),
        Role::Service => (
            &config.service.interface,
            config
                .service
                .address
                .context("service.address is required for the service role")?,
        ),
        Role::Relay | Role::Scheduler => bail!("role {role} has no virtual interface"),
    };

    let iface = TunInterface::create(&settings.name, address, settings.prefix_len, settings.mtu)
        .with_context(|| format!("failed to create TUN device {}", settings.name))?;
    Ok(Arc::new(iface))
}

#[cfg(not(feature = "tun"))]
fn open_interface(_config: &Config, role: Role) -> Result<Arc<dyn VirtualInterface>> {
    bail!("the {role} role needs a TUN device; rebuild with `--features tun`")
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received SIGINT, initiating shutdown..."),
            () = wait_for_sigterm() => info!("Received SIGTERM, initiating shutdown..."),
        }
        token.cancel();
    });
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config)?;
        println!("Generated default configuration at {:?}", args.config);
        return Ok(());
    }

    let Some(command) = args.role else {
        bail!("no role given; run one of: client, relay, service, scheduler");
    };
    let role = Role::from(command);

    let config = load_config_with_env(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.validate_for(role)?;

    if args.check {
        println!("Configuration for the {role} role is valid");
        return Ok(());
    }

    init_logging(&config);
    info!("overlay-router v{} starting as {}", overlay_router::VERSION, role);

    let registry = runtime::open_registry(&config).await?;
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let result = match role {
        Role::Client => {
            let iface = open_interface(&config, role)?;
            runtime::run_client(&config, iface, registry, cancel).await
        }
        Role::Relay => runtime::run_relay(&config, registry, cancel).await,
        Role::Service => {
            let iface = open_interface(&config, role)?;
            runtime::run_service(&config, iface, registry, cancel).await
        }
        Role::Scheduler => runtime::run_scheduler(&config, registry, cancel).await,
    };

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "{role} stopped with an error");
            Err(e.into())
        }
    }
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
