use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A byte stream opened through the overlay.
pub trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

pub type DialFuture = Pin<Box<dyn Future<Output = Result<BoxConn>> + Send>>;

/// Connector-backed dial function handed to higher layers. Takes a
/// `host:port` destination reachable only inside the overlay.
pub type DialFn = Arc<dyn Fn(String) -> DialFuture + Send + Sync>;

/// Local view of the overlay join, as reported by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayStatus {
    /// Address assigned to this node on the overlay, if resolved.
    pub addr: Option<String>,
    /// Resolvable overlay name for this node, if any.
    pub name: Option<String>,
}

impl OverlayStatus {
    /// True once the node is reachable by address or name.
    pub fn resolved(&self) -> bool {
        self.addr.as_deref().is_some_and(|a| !a.is_empty())
            || self.name.as_deref().is_some_and(|n| !n.is_empty())
    }
}

/// The overlay-network boundary. Joining, peer-key exchange, routing, and
/// encryption all live behind this trait; the connector only drives the
/// lifecycle and hands out connections.
#[async_trait]
pub trait OverlayClient: Send + Sync + 'static {
    /// Join the overlay, redeeming the one-time credential when no
    /// persisted identity exists yet.
    async fn bring_up(&self, auth_key: Option<&str>) -> Result<()>;

    /// Current join status. Errors indicate the overlay session is
    /// unhealthy, not that it was never started.
    async fn status(&self) -> Result<OverlayStatus>;

    /// Open a connection to `addr` (`host:port`) through the overlay.
    /// Only `"tcp"` is supported as the network.
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxConn>;

    /// Leave the overlay and release resources.
    async fn close(&self) -> Result<()>;
}
