//! Configuration types for overlay-router
//!
//! One JSON document configures every role; each process reads the shared
//! sections (`log`, `registry`, `stats`) and the section of the role it runs.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fleet::{FleetConfig, FleetRecord};
use crate::iface::DEFAULT_MTU;
use crate::nexthop::RouteKey;

/// Process role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Client bridge plus control agent
    Client,
    /// Relay forwarder plus heartbeat
    Relay,
    /// Service endpoint bridge plus heartbeat
    Service,
    /// Fleet scheduler
    Scheduler,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Relay => write!(f, "relay"),
            Self::Service => write!(f, "service"),
            Self::Scheduler => write!(f, "scheduler"),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Shared registry connection
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Throughput reporting
    #[serde(default)]
    pub stats: StatsConfig,

    /// Client role
    #[serde(default)]
    pub client: ClientConfig,

    /// Relay role
    #[serde(default)]
    pub relay: RelayConfig,

    /// Service endpoint role
    #[serde(default)]
    pub service: ServiceConfig,

    /// Scheduler role
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Validate the shared sections
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.registry.validate()?;
        self.stats.validate()?;
        Ok(())
    }

    /// Validate the shared sections and everything `role` needs
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first problem.
    pub fn validate_for(&self, role: Role) -> Result<(), ConfigError> {
        self.validate()?;
        match role {
            Role::Client => self.client.validate(),
            Role::Relay => self.relay.validate(),
            Role::Service => self.service.validate(),
            Role::Scheduler => self.scheduler.validate(),
        }
    }

    /// Configuration with every default, suitable as a starting template
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate log settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::invalid(format!(
                "Invalid log level '{}', expected one of {LEVELS:?}",
                self.level
            )));
        }
        if self.format != "json" && self.format != "text" {
            return Err(ConfigError::invalid(format!(
                "Invalid log format '{}', expected \"json\" or \"text\"",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Registry connection and cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Backend URL: `redis://host:port` or `memory://`
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Deadline for registry reads on the forwarding path, in milliseconds
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    /// Lifetime of cached registry answers, in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum number of cached registry answers
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl RegistryConfig {
    /// Validate registry settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let known = ["redis://", "rediss://", "memory://"];
        if !known.iter().any(|scheme| self.url.starts_with(scheme)) {
            return Err(ConfigError::invalid(format!(
                "Unsupported registry URL '{}'",
                self.url
            )));
        }
        if self.lookup_timeout_ms == 0 {
            return Err(ConfigError::invalid("lookup_timeout_ms must be greater than 0"));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::invalid("cache_capacity must be greater than 0"));
        }
        Ok(())
    }

    /// Lookup deadline as Duration
    #[must_use]
    pub const fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Cache TTL as Duration
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Throughput reporting
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    /// Interval between throughput checks, in milliseconds
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,

    /// Bytes in either direction before an interval is logged
    #[serde(default = "default_report_threshold")]
    pub report_threshold_bytes: u64,
}

impl StatsConfig {
    /// Validate stats settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.report_interval_ms == 0 {
            return Err(ConfigError::invalid("report_interval_ms must be greater than 0"));
        }
        Ok(())
    }

    /// Report interval as Duration
    #[must_use]
    pub const fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: default_report_interval_ms(),
            report_threshold_bytes: default_report_threshold(),
        }
    }
}

/// Virtual interface settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterfaceConfig {
    /// Device name
    #[serde(default = "default_interface_name")]
    pub name: String,

    /// Device MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Prefix length assigned with the overlay address
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
}

impl InterfaceConfig {
    /// Validate interface settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("interface name cannot be empty"));
        }
        if self.mtu < 576 {
            return Err(ConfigError::invalid(format!(
                "interface MTU {} is below the IPv4 minimum of 576",
                self.mtu
            )));
        }
        if self.prefix_len > 32 {
            return Err(ConfigError::invalid(format!(
                "invalid prefix length {}",
                self.prefix_len
            )));
        }
        Ok(())
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            mtu: default_mtu(),
            prefix_len: default_prefix_len(),
        }
    }
}

/// Client role
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Local transport address
    #[serde(default = "default_client_listen")]
    pub listen: SocketAddr,

    /// Virtual interface
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Fleet record as issued by the identity service
    #[serde(default)]
    pub fleet: Option<FleetRecord>,

    /// Write the initial relay assignment to the registry at startup
    #[serde(default)]
    pub seed_assignment: bool,

    /// Wait before reconnecting to the scheduler, in seconds
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl ClientConfig {
    /// Validate client settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.interface.validate()?;
        self.fleet_config()?;
        Ok(())
    }

    /// Parsed fleet configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the record is missing or
    /// invalid.
    pub fn fleet_config(&self) -> Result<FleetConfig, ConfigError> {
        let record = self
            .fleet
            .clone()
            .ok_or_else(|| ConfigError::invalid("client.fleet is required for the client role"))?;
        record
            .into_config()
            .map_err(|e| ConfigError::invalid(format!("client.fleet: {e}")))
    }

    /// Reconnect delay as Duration
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: default_client_listen(),
            interface: InterfaceConfig::default(),
            fleet: None,
            seed_assignment: false,
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

/// Static relay route
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StaticRoute {
    /// Overlay address or CIDR
    pub destination: String,
    /// Endpoint packets for `destination` are sent to
    pub endpoint: SocketAddr,
}

impl StaticRoute {
    /// Parsed destination
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the destination is neither
    /// an address nor a CIDR.
    pub fn key(&self) -> Result<RouteKey, ConfigError> {
        self.destination
            .parse()
            .map_err(|e| ConfigError::invalid(format!("static route {}: {e}", self.destination)))
    }
}

/// Relay role
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Relay name, the key of its liveness record
    #[serde(default = "default_relay_name")]
    pub name: String,

    /// Transport listen address
    #[serde(default = "default_relay_listen")]
    pub listen: SocketAddr,

    /// Public host clients reach this relay at; admission compares against it
    #[serde(default)]
    pub public_host: String,

    /// Public port, if different from the listen port
    #[serde(default)]
    pub public_port: Option<u16>,

    /// Maximum learned endpoints
    #[serde(default = "default_pool_capacity")]
    pub client_pool_capacity: usize,

    /// Forget learned endpoints idle for this long, in seconds
    #[serde(default)]
    pub client_idle_timeout_secs: Option<u64>,

    /// Load registered services into the route table at startup
    #[serde(default = "default_true")]
    pub preload_services: bool,

    /// Additional fixed routes
    #[serde(default)]
    pub static_routes: Vec<StaticRoute>,

    /// Heartbeat interval, in milliseconds
    #[serde(default = "default_relay_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Liveness record TTL, in milliseconds
    #[serde(default = "default_relay_heartbeat_ttl_ms")]
    pub heartbeat_ttl_ms: u64,
}

impl RelayConfig {
    /// Validate relay settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("relay.name cannot be empty"));
        }
        if self.public_host.is_empty() {
            return Err(ConfigError::invalid("relay.public_host should not be empty"));
        }
        if self.client_pool_capacity == 0 {
            return Err(ConfigError::invalid("relay.client_pool_capacity must be greater than 0"));
        }
        for route in &self.static_routes {
            route.key()?;
        }
        validate_heartbeat("relay", self.heartbeat_interval_ms, self.heartbeat_ttl_ms)
    }

    /// Endpoint published in the liveness record
    #[must_use]
    pub fn public_endpoint(&self) -> String {
        let port = self.public_port.unwrap_or_else(|| self.listen.port());
        format!("{}:{port}", self.public_host)
    }

    /// Heartbeat interval as Duration
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat TTL as Duration
    #[must_use]
    pub const fn heartbeat_ttl(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ttl_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: default_relay_name(),
            listen: default_relay_listen(),
            public_host: String::new(),
            public_port: None,
            client_pool_capacity: default_pool_capacity(),
            client_idle_timeout_secs: None,
            preload_services: true,
            static_routes: Vec::new(),
            heartbeat_interval_ms: default_relay_heartbeat_interval_ms(),
            heartbeat_ttl_ms: default_relay_heartbeat_ttl_ms(),
        }
    }
}

/// Service endpoint role
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Overlay address of the protected service
    #[serde(default)]
    pub address: Option<Ipv4Addr>,

    /// Transport listen address
    #[serde(default = "default_service_listen")]
    pub listen: SocketAddr,

    /// Public host relays reach this endpoint at
    #[serde(default)]
    pub public_host: String,

    /// Public port, if different from the listen port
    #[serde(default)]
    pub public_port: Option<u16>,

    /// Virtual interface
    #[serde(default = "default_service_interface")]
    pub interface: InterfaceConfig,

    /// Maximum learned client endpoints
    #[serde(default = "default_pool_capacity")]
    pub client_pool_capacity: usize,

    /// Forget client endpoints idle for this long, in seconds
    #[serde(default)]
    pub client_idle_timeout_secs: Option<u64>,

    /// Heartbeat interval, in milliseconds
    #[serde(default = "default_service_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Service record TTL, in milliseconds
    #[serde(default = "default_service_heartbeat_ttl_ms")]
    pub heartbeat_ttl_ms: u64,
}

impl ServiceConfig {
    /// Validate service settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_none() {
            return Err(ConfigError::invalid("service.address is required for the service role"));
        }
        if self.public_host.is_empty() {
            return Err(ConfigError::invalid("service.public_host should not be empty"));
        }
        if self.client_pool_capacity == 0 {
            return Err(ConfigError::invalid("service.client_pool_capacity must be greater than 0"));
        }
        self.interface.validate()?;
        validate_heartbeat("service", self.heartbeat_interval_ms, self.heartbeat_ttl_ms)
    }

    /// Endpoint published in the service record
    #[must_use]
    pub fn public_endpoint(&self) -> String {
        let port = self.public_port.unwrap_or_else(|| self.listen.port());
        format!("{}:{port}", self.public_host)
    }

    /// Heartbeat interval as Duration
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat TTL as Duration
    #[must_use]
    pub const fn heartbeat_ttl(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ttl_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            address: None,
            listen: default_service_listen(),
            public_host: String::new(),
            public_port: None,
            interface: default_service_interface(),
            client_pool_capacity: default_pool_capacity(),
            client_idle_timeout_secs: None,
            heartbeat_interval_ms: default_service_heartbeat_interval_ms(),
            heartbeat_ttl_ms: default_service_heartbeat_ttl_ms(),
        }
    }
}

/// Scheduler role
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Control channel listen address
    #[serde(default = "default_scheduler_listen")]
    pub listen: SocketAddr,

    /// Interval between assignments, in seconds
    #[serde(default = "default_schedule_interval_secs")]
    pub interval_secs: u64,

    /// Time a client has to acknowledge a switch, in milliseconds
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl SchedulerConfig {
    /// Validate scheduler settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::invalid("scheduler.interval_secs must be greater than 0"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::invalid("scheduler.ack_timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    /// Schedule interval as Duration
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Ack timeout as Duration
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen: default_scheduler_listen(),
            interval_secs: default_schedule_interval_secs(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

fn validate_heartbeat(section: &str, interval_ms: u64, ttl_ms: u64) -> Result<(), ConfigError> {
    if interval_ms == 0 {
        return Err(ConfigError::invalid(format!(
            "{section}.heartbeat_interval_ms must be greater than 0"
        )));
    }
    if ttl_ms <= interval_ms {
        return Err(ConfigError::invalid(format!(
            "{section}.heartbeat_ttl_ms ({ttl_ms}) must exceed \
             heartbeat_interval_ms ({interval_ms})"
        )));
    }
    Ok(())
}

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

fn default_registry_url() -> String {
    "redis://127.0.0.1:6379".into()
}

const fn default_lookup_timeout_ms() -> u64 {
    100
}

const fn default_cache_ttl_secs() -> u64 {
    30
}

const fn default_cache_capacity() -> u64 {
    65_536
}

const fn default_report_interval_ms() -> u64 {
    1000
}

const fn default_report_threshold() -> u64 {
    1024
}

fn default_interface_name() -> String {
    "ov0".into()
}

fn default_service_interface() -> InterfaceConfig {
    InterfaceConfig {
        name: "ovs0".into(),
        ..InterfaceConfig::default()
    }
}

const fn default_mtu() -> u16 {
    DEFAULT_MTU
}

const fn default_prefix_len() -> u8 {
    8
}

fn default_client_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

const fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_relay_name() -> String {
    "relay1".into()
}

fn default_relay_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5114))
}

fn default_service_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 32000))
}

fn default_scheduler_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5525))
}

const fn default_pool_capacity() -> usize {
    1024
}

const fn default_relay_heartbeat_interval_ms() -> u64 {
    1000
}

const fn default_relay_heartbeat_ttl_ms() -> u64 {
    2000
}

const fn default_service_heartbeat_interval_ms() -> u64 {
    5000
}

const fn default_service_heartbeat_ttl_ms() -> u64 {
    10_000
}

const fn default_schedule_interval_secs() -> u64 {
    5
}

const fn default_ack_timeout_ms() -> u64 {
    3000
}
