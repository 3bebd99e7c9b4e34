//! Per-cluster overlay network identity.
//!
//! A [`Connector`] owns exactly one joined identity on a private overlay
//! network and is the only path to it: start, dial, health, stop. The
//! overlay protocol itself lives behind [`OverlayClient`]; the production
//! implementation ([`GatewayClient`]) tunnels through the cluster's
//! gateway peer over QUIC.

pub mod client;
pub mod connector;
pub mod gateway;
pub mod transport;

pub use client::{BoxConn, Conn, DialFn, DialFuture, OverlayClient, OverlayStatus};
pub use connector::{Connector, HealthReport, HealthState};
pub use gateway::GatewayClient;
pub use transport::HttpTransport;
