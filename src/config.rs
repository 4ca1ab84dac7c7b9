use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::hub::spatial::DEFAULT_CELL_SIZE;
use crate::net::framing::DEFAULT_MAX_FRAME_SIZE;

/// Physical transport the server accepts connections on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// WebTransport bidirectional stream (TLS required)
    WebTransport,
    /// Plain TCP, for development and load testing
    Tcp,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webtransport" | "wt" => Ok(Self::WebTransport),
            "tcp" => Ok(Self::Tcp),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Per-connection timing and queue settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded outbound queue length; sends beyond it are shed
    pub outbound_queue_capacity: usize,
    /// Interval between server liveness pings
    pub ping_interval: Duration,
    /// Read deadline, refreshed by every ping/pong from the peer
    pub read_timeout: Duration,
    /// Upper bound on a single outbound flush
    pub write_timeout: Duration,
    /// Largest frame (kind byte + body) accepted or produced
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Hub control loop settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Pending control-loop operations before submitters wait
    pub command_queue_capacity: usize,
    /// Pending inbound messages before connection readers wait
    pub inbound_queue_capacity: usize,
    /// Spatial index cell edge, roughly the typical area broadcast radius
    pub spatial_cell_size: f32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_queue_capacity: 1024,
            inbound_queue_capacity: 1024,
            spatial_cell_size: DEFAULT_CELL_SIZE,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    pub transport: TransportKind,
    /// Port for the Prometheus endpoint
    pub metrics_port: u16,
    pub connection: ConnectionConfig,
    pub hub: HubConfig,
    /// Path to TLS certificate file (if not using self-signed)
    pub tls_cert_path: Option<String>,
    /// Path to TLS key file (if not using self-signed)
    pub tls_key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4433,
            transport: TransportKind::WebTransport,
            metrics_port: 9090,
            connection: ConnectionConfig::default(),
            hub: HubConfig::default(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

/// Read and parse an environment variable, warning and returning `None`
/// when it is present but unusable.
fn env_parse<T: FromStr>(name: &str, accept: impl Fn(&T) -> bool, rule: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(parsed) if accept(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} {}, using default", name, rule);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name, |ms| *ms > 0, "must be > 0").map(Duration::from_millis)
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse("BIND_ADDRESS", |_: &IpAddr| true, "") {
            config.bind_address = addr;
        }
        if let Some(port) = env_parse("PORT", |p: &u16| *p > 0, "must be > 0") {
            config.port = port;
        }
        if let Some(port) = env_parse("METRICS_PORT", |p: &u16| *p > 0, "must be > 0") {
            config.metrics_port = port;
        }
        if let Ok(raw) = std::env::var("TRANSPORT") {
            match raw.parse() {
                Ok(kind) => config.transport = kind,
                Err(e) => tracing::warn!("Invalid TRANSPORT: {}, using default", e),
            }
        }

        let conn = &mut config.connection;
        if let Some(cap) = env_parse(
            "OUTBOUND_QUEUE_CAPACITY",
            |c: &usize| (1..=65536).contains(c),
            "must be 1-65536",
        ) {
            conn.outbound_queue_capacity = cap;
        }
        if let Some(interval) = env_millis("PING_INTERVAL_MS") {
            conn.ping_interval = interval;
        }
        if let Some(timeout) = env_millis("READ_TIMEOUT_MS") {
            conn.read_timeout = timeout;
        }
        if let Some(timeout) = env_millis("WRITE_TIMEOUT_MS") {
            conn.write_timeout = timeout;
        }
        if let Some(size) = env_parse(
            "MAX_FRAME_SIZE",
            |s: &usize| (64..=16 * 1024 * 1024).contains(s),
            "must be 64 bytes to 16 MiB",
        ) {
            conn.max_frame_size = size;
        }

        let hub = &mut config.hub;
        if let Some(cap) = env_parse("HUB_QUEUE_CAPACITY", |c: &usize| *c > 0, "must be > 0") {
            hub.command_queue_capacity = cap;
        }
        if let Some(cap) = env_parse("INBOUND_QUEUE_CAPACITY", |c: &usize| *c > 0, "must be > 0") {
            hub.inbound_queue_capacity = cap;
        }
        if let Some(size) = env_parse(
            "SPATIAL_CELL_SIZE",
            |s: &f32| s.is_finite() && *s > 0.0,
            "must be a positive number",
        ) {
            hub.spatial_cell_size = size;
        }

        if let Ok(cert_path) = std::env::var("TLS_CERT_PATH") {
            config.tls_cert_path = Some(cert_path);
        }

        if let Ok(key_path) = std::env::var("TLS_KEY_PATH") {
            config.tls_key_path = Some(key_path);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.metrics_port == self.port && self.transport == TransportKind::Tcp {
            return Err("METRICS_PORT must differ from PORT".to_string());
        }
        let conn = &self.connection;
        if conn.outbound_queue_capacity == 0 {
            return Err("outbound_queue_capacity must be at least 1".to_string());
        }
        if conn.read_timeout <= conn.ping_interval {
            return Err("read_timeout must exceed ping_interval".to_string());
        }
        if self.hub.command_queue_capacity == 0 || self.hub.inbound_queue_capacity == 0 {
            return Err("hub queue capacities must be at least 1".to_string());
        }
        if !(self.hub.spatial_cell_size.is_finite() && self.hub.spatial_cell_size > 0.0) {
            return Err("spatial_cell_size must be positive".to_string());
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err("TLS_CERT_PATH and TLS_KEY_PATH must be set together".to_string());
        }
        Ok(())
    }
}
