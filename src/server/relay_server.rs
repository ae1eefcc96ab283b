//! QUIC relay server
//!
//! Accepts connections and feeds them into the relay core. The server
//! object owns the core (session table, registry, room index) for its
//! lifetime; there is no ambient global state.

use std::sync::Arc;
use std::time::Duration;

use quinn::Endpoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{error, info, warn};

use crate::RelayConfig;
use crate::error::{RelayError, Result};
use crate::server::connection::ConnectionHandler;
use crate::server::router::RelayCore;

/// QUIC-based presence and fanout relay server
pub struct RelayServer {
    config: RelayConfig,
    core: Arc<RelayCore>,
    endpoint: Option<Endpoint>,
}

impl RelayServer {
    /// Create a new relay server with the given configuration
    pub fn new(config: RelayConfig) -> Self {
        let core = Arc::new(RelayCore::new(&config));
        Self {
            config,
            core,
            endpoint: None,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Get the relay core
    pub fn core(&self) -> Arc<RelayCore> {
        Arc::clone(&self.core)
    }

    /// Start the server
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting relay server on {}", self.config.bind_addr);

        // Generate self-signed certificate for development
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| RelayError::config(format!("Failed to generate certificate: {}", e)))?;

        let cert_der = CertificateDer::from(cert.serialize_der().map_err(|e| {
            RelayError::config(format!("Failed to serialize certificate: {}", e))
        })?);
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        // Configure rustls
        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| RelayError::config(format!("Failed to configure TLS: {}", e)))?;

        server_config.alpn_protocols = vec![b"ripple".to_vec()];
        server_config.max_early_data_size = 0;

        // Configure QUIC
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(4u32.into());
        transport_config.max_idle_timeout(Some(
            Duration::from_secs(self.config.idle_timeout_secs)
                .try_into()
                .map_err(|_| RelayError::config("Idle timeout out of range"))?,
        ));

        let mut quic_server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_config)
                .map_err(|e| RelayError::config(format!("Failed to create QUIC config: {}", e)))?,
        ));
        quic_server_config.transport_config(Arc::new(transport_config));

        // Create endpoint
        let endpoint = Endpoint::server(quic_server_config, self.config.bind_addr)
            .map_err(|e| RelayError::network(format!("Failed to create endpoint: {}", e)))?;

        info!("Relay server listening on {}", endpoint.local_addr()?);

        self.endpoint = Some(endpoint.clone());

        // Accept connections
        self.accept_connections(endpoint).await
    }

    /// Accept incoming connections
    async fn accept_connections(&self, endpoint: Endpoint) -> Result<()> {
        loop {
            match endpoint.accept().await {
                Some(incoming) => {
                    // Check connection limit
                    if self.core.sessions().len().await >= self.config.max_connections {
                        warn!("Connection limit reached, rejecting connection");
                        incoming.refuse();
                        continue;
                    }

                    let core = Arc::clone(&self.core);
                    tokio::spawn(async move {
                        match incoming.await {
                            Ok(connection) => {
                                let handler = ConnectionHandler::new(connection, core);
                                if let Err(e) = handler.run().await {
                                    error!("Connection handling failed: {}", e);
                                }
                            }
                            Err(e) => {
                                error!("Connection handshake failed: {}", e);
                            }
                        }
                    });
                }
                None => {
                    warn!("Endpoint stopped accepting connections");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Get server statistics
    pub async fn get_stats(&self) -> RelayStats {
        RelayStats {
            sessions: self.core.sessions().len().await,
            identities: self.core.registry().identity_count().await,
            rooms: self.core.rooms().room_count().await,
            bind_address: self.config.bind_addr,
        }
    }

    /// Shutdown the server
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"Server shutdown");
            info!("Relay server shutdown complete");
        }
        Ok(())
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub sessions: usize,
    pub identities: usize,
    pub rooms: usize,
    pub bind_address: std::net::SocketAddr,
}
