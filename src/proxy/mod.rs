//! Allowlist-gated HTTP tunnel proxy.
//!
//! Inbound requests name a cluster-private destination (`to=host:port`)
//! and an absolute sub-path. The destination is validated against the
//! operator allowlist before any byte leaves the process; the round trip
//! itself runs through a connector-backed dial function.

pub mod allowlist;
pub mod reverse_proxy;

pub use allowlist::Allowlist;
pub use reverse_proxy::{router, serve, serve_with_signals, ProxyState};
