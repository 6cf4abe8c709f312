//! API Server
//!
//! Binds the REST router and serves it until shutdown is signalled.

use crate::controlplane::node::RegistryNode;
use crate::error::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::rest::RestRouter;

/// Default REST port
pub const DEFAULT_REST_PORT: u16 = 8761;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Timeout for registry and peer requests; streaming routes are exempt
    pub request_timeout_secs: u64,
    /// Allow any origin
    pub cors_permissive: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_REST_PORT)),
            request_timeout_secs: 5,
            cors_permissive: false,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST server for one node
pub struct ApiServer {
    config: ApiServerConfig,
    node: Arc<RegistryNode>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, node: Arc<RegistryNode>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            node,
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ApiServerConfig {
        &self.config
    }

    /// Bind and serve until [`ApiServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.rest_addr).await.map_err(|e| {
            Error::Internal(format!("Failed to bind REST server on {}: {}", self.config.rest_addr, e))
        })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let app = RestRouter::new(
            self.node.clone(),
            Duration::from_secs(self.config.request_timeout_secs),
        )
        .with_permissive_cors(self.config.cors_permissive)
        .build();

        let addr = listener.local_addr()?;
        info!(addr = %addr, "REST API listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let node_token = self.node.shutdown_token();

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_rx.recv() => {}
                    _ = node_token.cancelled() => {}
                }
                info!("REST server shutting down");
            })
            .await;

        if let Err(e) = &result {
            error!(error = %e, "REST server error");
        }
        result.map_err(|e| Error::Internal(format!("REST server error: {}", e)))
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
