//! Listeners that turn physical connections into registered clients
//!
//! WebTransport is the production path: one bidirectional stream per
//! session carries the framed protocol. Plain TCP speaks the same framing
//! and exists for development, load tools and tests.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ServerConfig};
use crate::hub::{HubError, HubHandle};
use crate::net::client;
use crate::net::tls::TlsConfig;

fn log_rejected(remote: Option<SocketAddr>, e: &HubError) {
    match e {
        HubError::ShuttingDown | HubError::Stopped => {
            debug!("Connection from {:?} refused: {}", remote, e)
        }
        _ => warn!("Connection from {:?} refused: {}", remote, e),
    }
}

/// WebTransport server
pub struct WebTransportServer {
    config: ServerConfig,
    tls_config: TlsConfig,
    hub: HubHandle,
}

impl WebTransportServer {
    /// Create a new WebTransport server
    pub async fn new(config: ServerConfig, hub: HubHandle) -> anyhow::Result<Self> {
        let tls_config = TlsConfig::load(&config).await?;
        Ok(Self {
            config,
            tls_config,
            hub,
        })
    }

    /// Get the certificate hash for client configuration
    pub fn cert_hash(&self) -> &str {
        self.tls_config.cert_hash()
    }

    /// Accept sessions until the process exits
    pub async fn run(self) -> anyhow::Result<()> {
        use wtransport::Endpoint;

        let bind_addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let server = Endpoint::server(endpoint_config(bind_addr, self.tls_config.identity))?;

        info!("WebTransport server listening on {}", bind_addr);
        info!("Certificate hash: {}", self.tls_config.cert_hash);

        let connection_config = Arc::new(self.config.connection.clone());

        loop {
            let incoming = server.accept().await;
            let hub = self.hub.clone();
            let config = connection_config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_session(incoming, hub, config).await {
                    debug!("Session error: {:#}", e);
                }
            });
        }
    }
}

fn endpoint_config(bind_addr: SocketAddr, identity: wtransport::Identity) -> wtransport::ServerConfig {
    let builder = wtransport::ServerConfig::builder();
    // Unspecified address keeps the dual-stack (IPv4 + IPv6) bind
    let builder = if bind_addr.ip().is_unspecified() {
        builder.with_bind_default(bind_addr.port())
    } else {
        builder.with_bind_address(bind_addr)
    };
    builder.with_identity(identity).build()
}

/// Await a handshake step, giving up after `limit`
async fn within<T, E>(limit: Duration, step: impl Future<Output = Result<T, E>>) -> anyhow::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match tokio::time::timeout(limit, step).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow::anyhow!("handshake step timed out after {:?}", limit)),
    }
}

/// Handle a single WebTransport session
async fn handle_session(
    incoming: wtransport::endpoint::IncomingSession,
    hub: HubHandle,
    config: Arc<ConnectionConfig>,
) -> anyhow::Result<()> {
    let session_request = incoming.await?;

    debug!(
        "New session from {}, path: {}",
        session_request.authority(),
        session_request.path()
    );

    let connection = session_request.accept().await?;
    let remote = Some(connection.remote_address());

    // Same budget as a silent peer on an open stream
    let (send, recv) = within(config.read_timeout, connection.accept_bi())
        .await
        .context("peer opened no bidirectional stream")?;

    match client::spawn(&hub, &config, BufReader::new(recv), send, remote).await {
        // The QUIC connection must outlive both loops
        Ok(running) => running.wait().await,
        Err(e) => log_rejected(remote, &e),
    }

    drop(connection);
    Ok(())
}

/// Plain TCP listener speaking the same framing
pub struct TcpServer {
    listener: TcpListener,
    config: ConnectionConfig,
    hub: HubHandle,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, config: ConnectionConfig, hub: HubHandle) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        Ok(Self {
            listener,
            config,
            hub,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> anyhow::Result<()> {
        info!("TCP server listening on {}", self.local_addr()?);

        let config = Arc::new(self.config);
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually EMFILE; keep serving existing connections
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let hub = self.hub.clone();
            let config = config.clone();
            tokio::spawn(async move {
                handle_stream(stream, remote, hub, config).await;
            });
        }
    }
}

async fn handle_stream(stream: TcpStream, remote: SocketAddr, hub: HubHandle, config: Arc<ConnectionConfig>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", remote, e);
    }
    let (reader, writer) = stream.into_split();

    match client::spawn(&hub, &config, BufReader::new(reader), writer, Some(remote)).await {
        Ok(running) => running.wait().await,
        Err(e) => log_rejected(Some(remote), &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::Hub;
    use crate::metrics::Metrics;
    use crate::net::framing::{self, FrameKind};
    use crate::net::protocol::{self, OutboundMessage};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl crate::consumer::CommandConsumer for Echo {
        async fn handle(&self, session: &crate::consumer::Session, message: protocol::InboundMessage) {
            let _ = session.send(&OutboundMessage::info(message.action));
        }
    }

    #[tokio::test]
    async fn test_webtransport_binds_configured_address() {
        let identity = crate::net::tls::TlsConfig::self_signed().unwrap().identity;
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let endpoint = wtransport::Endpoint::server(endpoint_config(addr, identity)).unwrap();
        let bound = endpoint.local_addr().unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_step_times_out() {
        let never = std::future::pending::<Result<(), std::io::Error>>();
        let err = within(Duration::from_secs(60), never).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let ready = async { Ok::<_, std::io::Error>(7) };
        assert_eq!(within(Duration::from_secs(60), ready).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let (hub, _task) = Hub::spawn(HubConfig::default(), Arc::new(Metrics::new()), Arc::new(Echo));
        let config = ConnectionConfig::default();
        let max = config.max_frame_size;

        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), config, hub.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        framing::write_frame(&mut stream, FrameKind::Data, br#"{"action":"hello"}"#, max)
            .await
            .unwrap();

        let frame = framing::read_frame(&mut stream, max).await.unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(
            protocol::decode_outbound(&frame.body).unwrap(),
            OutboundMessage::info("hello")
        );
        assert_eq!(hub.stats().await.unwrap().connections, 1);

        framing::write_frame(&mut stream, FrameKind::Close, b"", max).await.unwrap();
        let close = framing::read_frame(&mut stream, max).await.unwrap();
        assert_eq!(close.kind, FrameKind::Close);
        assert_eq!(hub.stats().await.unwrap().connections, 0);
    }
}
