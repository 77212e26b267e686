//! TCP accept loop and dialing.

use std::net::SocketAddr;
use std::sync::Arc;

use distobj_common::protocol::Result;
use distobj_common::transport::TcpTransport;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::registry::ConnectionRegistry;
use crate::target::RemoteObject;

/// Accepts TCP peers and attaches each one as a connection exporting the
/// same root object.
pub struct Server {
    listener: TcpListener,
    registry: ConnectionRegistry,
    config: ConnectionConfig,
    root: Arc<dyn RemoteObject>,
}

impl Server {
    /// Binds the listening socket.
    ///
    /// # Arguments
    /// * `addr` - The address to bind to (e.g., "0.0.0.0:7400")
    /// * `registry` - Registry the accepted connections join
    /// * `config` - Configuration applied to every accepted connection
    /// * `root` - Object each peer reaches through its root proxy
    pub async fn bind(
        addr: &str,
        registry: ConnectionRegistry,
        config: ConnectionConfig,
        root: Arc<dyn RemoteObject>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry,
            config,
            root,
        })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Accepts peers until the listener fails.
    pub async fn run(&self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    return Err(err.into());
                }
            };
            let transport = TcpTransport::from_stream(stream).with_max_frame_size(self.config.max_message_size);
            let connection = self
                .registry
                .attach_with_root(transport, self.config.clone(), self.root.clone());
            info!(connection = connection.id(), %peer, "accepted peer");
        }
    }
}

/// Dials `addr` and attaches the stream to `registry`.
pub async fn connect(addr: &str, registry: &ConnectionRegistry, config: ConnectionConfig) -> Result<Connection> {
    let transport = TcpTransport::connect(addr).await?.with_max_frame_size(config.max_message_size);
    Ok(registry.attach(transport, config))
}
