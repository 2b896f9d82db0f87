//! Role runtimes
//!
//! Each function wires one role's components together and runs them under a
//! single cancellation token. All of them return once `cancel` fires (or the
//! role's main loop fails), after every task they started has stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{bind_transport, Bridge, ClientStrategy, RelayForwarder, ServiceStrategy};
use crate::config::{Config, StatsConfig};
use crate::error::{ConfigError, OverlayError};
use crate::heartbeat::Heartbeat;
use crate::iface::VirtualInterface;
use crate::nexthop::ClientPool;
use crate::registry::{self, resolve_endpoint, CachedRegistry, Registry};
use crate::scheduler::{ControlAgent, FleetScheduler};

/// Open the configured registry backend
///
/// # Errors
///
/// Returns the registry error if the backend cannot be reached.
pub async fn open_registry(config: &Config) -> Result<Arc<dyn Registry>, OverlayError> {
    let registry = registry::connect(&config.registry.url).await?;
    info!(url = %config.registry.url, "registry connected");
    Ok(registry)
}

fn client_pool(capacity: usize, idle_timeout_secs: Option<u64>) -> ClientPool {
    let pool = ClientPool::new(capacity);
    match idle_timeout_secs {
        Some(secs) => pool.with_idle_timeout(Duration::from_secs(secs)),
        None => pool,
    }
}

fn published_endpoint(host: &str, public_port: Option<u16>, local: SocketAddr) -> String {
    format!("{host}:{}", public_port.unwrap_or_else(|| local.port()))
}

fn report_settings(stats: &StatsConfig) -> (Duration, u64) {
    (stats.report_interval(), stats.report_threshold_bytes)
}

/// Run the client role: bridge plus control agent.
///
/// # Errors
///
/// Returns configuration errors at startup, or the bridge error that ended
/// the run.
pub async fn run_client(
    config: &Config,
    iface: Arc<dyn VirtualInterface>,
    registry: Arc<dyn Registry>,
    cancel: CancellationToken,
) -> Result<(), OverlayError> {
    let client = &config.client;
    let fleet = client.fleet_config()?;
    if client.seed_assignment {
        fleet.seed_assignment(registry.as_ref()).await?;
    }

    let relay = resolve_endpoint(&fleet.initial_relay).await.ok_or_else(|| {
        ConfigError::invalid(format!("cannot resolve initial relay {}", fleet.initial_relay))
    })?;
    let socket = Arc::new(bind_transport(client.listen)?);
    let strategy = Arc::new(ClientStrategy::new(relay, fleet.relay_cidrs.clone()));

    info!(
        address = %fleet.overlay_address,
        relay = %relay,
        scheduler = %fleet.scheduler_address,
        "starting client"
    );

    let shutdown = cancel.child_token();
    let agent = ControlAgent::new(fleet.scheduler_address.clone(), Arc::clone(&strategy))
        .with_reconnect_delay(client.reconnect_delay());
    let agent_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    let (interval, threshold) = report_settings(&config.stats);
    let result = Bridge::new(iface, socket, strategy)
        .with_report(interval, threshold)
        .run(shutdown.clone())
        .await;

    shutdown.cancel();
    if let Err(e) = agent_task.await {
        warn!(error = %e, "control agent task failed");
    }
    result.map_err(Into::into)
}

/// Run the relay role: forwarder plus heartbeat.
///
/// # Errors
///
/// Returns configuration or bind errors at startup, or the transport error
/// that ended the run.
pub async fn run_relay(
    config: &Config,
    registry: Arc<dyn Registry>,
    cancel: CancellationToken,
) -> Result<(), OverlayError> {
    let relay = &config.relay;
    let cached = Arc::new(CachedRegistry::with_options(
        Arc::clone(&registry),
        config.registry.cache_ttl(),
        config.registry.cache_capacity,
        config.registry.lookup_timeout(),
    ));

    let socket = Arc::new(bind_transport(relay.listen)?);
    let local = socket.local_addr()?;
    let endpoint = published_endpoint(&relay.public_host, relay.public_port, local);

    let (interval, threshold) = report_settings(&config.stats);
    let forwarder = RelayForwarder::new(
        socket,
        cached,
        relay.public_host.clone(),
        client_pool(relay.client_pool_capacity, relay.client_idle_timeout_secs),
    )
    .with_report(interval, threshold);

    for route in &relay.static_routes {
        forwarder.add_route(route.key()?, route.endpoint);
    }
    if relay.preload_services {
        if let Err(e) = forwarder.preload_services().await {
            warn!(error = %e, "service preload failed, continuing with registry lookups");
        }
    }

    info!(name = %relay.name, local = %local, endpoint = %endpoint, "starting relay");

    let shutdown = cancel.child_token();
    let heartbeat = Heartbeat::relay(registry, relay.name.clone(), endpoint)
        .with_timing(relay.heartbeat_interval(), relay.heartbeat_ttl());
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown.clone()));

    let result = Arc::new(forwarder).run(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = heartbeat_task.await {
        warn!(error = %e, "heartbeat task failed");
    }
    result.map_err(Into::into)
}

/// Run the service endpoint role: bridge plus service heartbeat.
///
/// # Errors
///
/// Returns configuration or bind errors at startup, or the bridge error that
/// ended the run.
pub async fn run_service(
    config: &Config,
    iface: Arc<dyn VirtualInterface>,
    registry: Arc<dyn Registry>,
    cancel: CancellationToken,
) -> Result<(), OverlayError> {
    let service = &config.service;
    let address = service
        .address
        .ok_or_else(|| ConfigError::invalid("service.address is required for the service role"))?;

    let socket = Arc::new(bind_transport(service.listen)?);
    let local = socket.local_addr()?;
    let endpoint = published_endpoint(&service.public_host, service.public_port, local);
    let pool = Arc::new(client_pool(
        service.client_pool_capacity,
        service.client_idle_timeout_secs,
    ));

    info!(address = %address, local = %local, endpoint = %endpoint, "starting service endpoint");

    let shutdown = cancel.child_token();
    let heartbeat = Heartbeat::service(registry, address, endpoint)
        .with_timing(service.heartbeat_interval(), service.heartbeat_ttl());
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown.clone()));

    let (interval, threshold) = report_settings(&config.stats);
    let result = Bridge::new(iface, socket, Arc::new(ServiceStrategy::new(pool)))
        .with_report(interval, threshold)
        .run(shutdown.clone())
        .await;

    shutdown.cancel();
    if let Err(e) = heartbeat_task.await {
        warn!(error = %e, "heartbeat task failed");
    }
    result.map_err(Into::into)
}

/// Run the scheduler role.
///
/// # Errors
///
/// Returns the I/O error if the control listener cannot be bound.
pub async fn run_scheduler(
    config: &Config,
    registry: Arc<dyn Registry>,
    cancel: CancellationToken,
) -> Result<(), OverlayError> {
    let settings = &config.scheduler;
    let listener = TcpListener::bind(settings.listen).await?;
    let scheduler = Arc::new(
        FleetScheduler::new(registry)
            .with_interval(settings.interval())
            .with_ack_timeout(settings.ack_timeout()),
    );
    scheduler.run(listener, cancel).await;
    Ok(())
}
