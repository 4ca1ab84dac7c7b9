//! Prometheus-compatible metrics endpoint
//!
//! Exposes connection-layer metrics in Prometheus format for Grafana dashboards.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Samples kept for area query percentiles
const QUERY_HISTORY_LEN: usize = 1000;

/// Metrics registry for the connection layer
#[derive(Debug)]
pub struct Metrics {
    // Connections
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub liveness_timeouts: AtomicU64,
    pub session_takeovers: AtomicU64,

    // Traffic
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decode_errors: AtomicU64,

    // Shedding
    pub dropped_full: AtomicU64,
    pub dropped_closed: AtomicU64,

    // Broadcasts
    pub broadcasts_all: AtomicU64,
    pub broadcasts_group: AtomicU64,
    pub broadcasts_area: AtomicU64,
    pub broadcast_targets: AtomicU64,

    // Last area query time (microseconds)
    pub area_query_us: AtomicU64,

    start_time: Instant,

    // Rolling area query times for percentile calculation
    query_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            liveness_timeouts: AtomicU64::new(0),
            session_takeovers: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            dropped_full: AtomicU64::new(0),
            dropped_closed: AtomicU64::new(0),
            broadcasts_all: AtomicU64::new(0),
            broadcasts_group: AtomicU64::new(0),
            broadcasts_area: AtomicU64::new(0),
            broadcast_targets: AtomicU64::new(0),
            area_query_us: AtomicU64::new(0),
            start_time: Instant::now(),
            query_history: RwLock::new(VecDeque::with_capacity(QUERY_HISTORY_LEN)),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturate so a double decrement can never wrap the gauge
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Record an area query duration. Runs on the hub control loop, so
    /// percentiles are left to the readers.
    #[cfg(feature = "metrics_extended")]
    pub fn record_area_query(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.area_query_us.store(us, Ordering::Relaxed);

        let mut history = self.query_history.write();
        if history.len() == QUERY_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(us);
    }

    #[cfg(not(feature = "metrics_extended"))]
    pub fn record_area_query(&self, duration: Duration) {
        self.area_query_us.store(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// (p95, max) over the recent area query window, in microseconds.
    /// Zero until at least 10 samples are in.
    pub fn area_query_percentiles(&self) -> (u64, u64) {
        let mut sorted: Vec<u64> = {
            let history = self.query_history.read();
            if history.len() < 10 {
                return (0, 0);
            }
            history.iter().copied().collect()
        };
        sorted.sort_unstable();

        let p95_idx = ((sorted.len() as f32 * 0.95) as usize).min(sorted.len() - 1);
        (sorted[p95_idx], sorted[sorted.len() - 1])
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);
        let (query_p95, query_max) = self.area_query_percentiles();

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("worldlink_connections_active", "Registered connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("worldlink_connections_total", "Connections registered since start", "counter",
            self.connections_total.load(Ordering::Relaxed));
        metric!("worldlink_liveness_timeouts_total", "Connections dropped for missing liveness", "counter",
            self.liveness_timeouts.load(Ordering::Relaxed));
        metric!("worldlink_session_takeovers_total", "Connections displaced by a newer login", "counter",
            self.session_takeovers.load(Ordering::Relaxed));

        metric!("worldlink_frames_sent_total", "Frames written", "counter",
            self.frames_sent.load(Ordering::Relaxed));
        metric!("worldlink_frames_received_total", "Frames read", "counter",
            self.frames_received.load(Ordering::Relaxed));
        metric!("worldlink_messages_sent_total", "Outbound messages written", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("worldlink_messages_received_total", "Inbound messages decoded", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("worldlink_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("worldlink_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("worldlink_decode_errors_total", "Malformed inbound frames", "counter",
            self.decode_errors.load(Ordering::Relaxed));

        metric!("worldlink_dropped_full_total", "Messages shed on a full outbound queue", "counter",
            self.dropped_full.load(Ordering::Relaxed));
        metric!("worldlink_dropped_closed_total", "Messages sent to closed connections", "counter",
            self.dropped_closed.load(Ordering::Relaxed));

        metric!("worldlink_broadcasts_all_total", "Broadcasts to every connection", "counter",
            self.broadcasts_all.load(Ordering::Relaxed));
        metric!("worldlink_broadcasts_group_total", "Broadcasts to a group", "counter",
            self.broadcasts_group.load(Ordering::Relaxed));
        metric!("worldlink_broadcasts_area_total", "Broadcasts to an area", "counter",
            self.broadcasts_area.load(Ordering::Relaxed));
        metric!("worldlink_broadcast_targets_total", "Connections targeted by broadcasts", "counter",
            self.broadcast_targets.load(Ordering::Relaxed));

        metric!("worldlink_area_query_microseconds", "Last area query time", "gauge",
            self.area_query_us.load(Ordering::Relaxed));
        metric!("worldlink_area_query_p95_microseconds", "95th percentile area query time", "gauge",
            query_p95);
        metric!("worldlink_area_query_max_microseconds", "Maximum area query time", "gauge",
            query_max);

        metric!("worldlink_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let (query_p95, query_max) = self.area_query_percentiles();
        let value = serde_json::json!({
            "connections": {
                "active": load(&self.connections_active),
                "total": load(&self.connections_total),
                "liveness_timeouts": load(&self.liveness_timeouts),
                "session_takeovers": load(&self.session_takeovers),
            },
            "network": {
                "frames_sent": load(&self.frames_sent),
                "frames_received": load(&self.frames_received),
                "messages_sent": load(&self.messages_sent),
                "messages_received": load(&self.messages_received),
                "bytes_sent": load(&self.bytes_sent),
                "bytes_received": load(&self.bytes_received),
                "decode_errors": load(&self.decode_errors),
                "dropped_full": load(&self.dropped_full),
                "dropped_closed": load(&self.dropped_closed),
            },
            "broadcasts": {
                "all": load(&self.broadcasts_all),
                "group": load(&self.broadcasts_group),
                "area": load(&self.broadcasts_area),
                "targets": load(&self.broadcast_targets),
                "area_query_us": load(&self.area_query_us),
                "area_query_p95_us": query_p95,
                "area_query_max_us": query_max,
            },
            "uptime_seconds": self.uptime_seconds(),
        });
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    // JSON route first: "/metrics" is a prefix of it
                    let response = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
                        let body = metrics.to_json();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /metrics") {
                        let body = metrics.to_prometheus();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
                        let body = "OK";
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.connections_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.messages_sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_connection_gauge_saturates() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.connection_closed();

        assert_eq!(metrics.connections_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.connections_total.load(Ordering::Relaxed), 1);
    }

    #[cfg(feature = "metrics_extended")]
    #[test]
    fn test_record_area_query() {
        let metrics = Metrics::new();

        for i in 0..5 {
            metrics.record_area_query(Duration::from_micros(10 + i));
        }
        assert_eq!(metrics.area_query_percentiles(), (0, 0));

        for i in 5..100 {
            metrics.record_area_query(Duration::from_micros(10 + i));
        }

        let (p95, max) = metrics.area_query_percentiles();
        assert!(p95 >= 90);
        assert_eq!(max, 109);
        assert_eq!(metrics.area_query_us.load(Ordering::Relaxed), 109);
    }

    #[cfg(feature = "metrics_extended")]
    #[test]
    fn test_area_query_window_is_bounded() {
        let metrics = Metrics::new();

        // One slow outlier, then a full window of fast queries pushes it out
        metrics.record_area_query(Duration::from_micros(5000));
        for _ in 0..QUERY_HISTORY_LEN {
            metrics.record_area_query(Duration::from_micros(4));
        }

        assert_eq!(metrics.query_history.read().len(), QUERY_HISTORY_LEN);
        assert_eq!(metrics.area_query_percentiles(), (4, 4));
        assert!(metrics.to_prometheus().contains("worldlink_area_query_max_microseconds 4"));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.connections_active.store(50, Ordering::Relaxed);
        metrics.dropped_full.store(3, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("worldlink_connections_active 50"));
        assert!(output.contains("worldlink_dropped_full_total 3"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.connections_active.store(100, Ordering::Relaxed);

        let output = metrics.to_json();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["connections"]["active"], 100);
        assert!(parsed["broadcasts"].is_object());
    }
}
