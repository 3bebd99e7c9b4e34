//! Integration tests for the overlay connector lifecycle.
//!
//! These tests validate:
//! - concurrent `start` calls result in exactly one overlay join
//! - the first start requires a join credential unless identity persists
//! - a failed start is memoized and the connector stays unusable
//! - health walks stopped → ok → starting → degraded as the overlay does
//! - dial fails before start and round-trips bytes after it
//! - stop tears down exactly once


use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use gridlink::config::ConnectorConfig;
use gridlink::error::GridlinkError;
use gridlink::overlay::{Connector, HealthState, OverlayClient};
use test_harness::FakeOverlay;

fn config(dir: &Path) -> ConnectorConfig {
    ConnectorConfig::new("prod-1", "https://login.example.com")
        .with_auth_key("one-time-join-key")
        .with_state_dir(dir)
}

fn connector(cfg: ConnectorConfig, overlay: Arc<FakeOverlay>) -> Arc<Connector> {
    Arc::new(Connector::new(cfg, overlay).unwrap())
}

#[tokio::test]
async fn concurrent_starts_join_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(FakeOverlay::new().with_bring_up_delay(Duration::from_millis(100)));
    let conn = connector(config(dir.path()), overlay.clone());

    let a = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.start().await })
    };
    let b = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.start().await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(overlay.bring_up_calls.load(Ordering::SeqCst), 1);
    // Both observers see the same resulting health.
    assert_eq!(conn.health().await.state, HealthState::Ok);
}

#[tokio::test]
async fn first_start_requires_a_credential() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(FakeOverlay::new());
    let cfg = ConnectorConfig::new("prod-1", "https://login.example.com").with_state_dir(dir.path());
    let conn = connector(cfg, overlay.clone());

    let err = conn.start().await.unwrap_err();
    assert!(matches!(err, GridlinkError::Validation(_)), "{err}");
    // Rejected before the overlay client is ever touched.
    assert_eq!(overlay.bring_up_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn persisted_identity_replaces_the_credential() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("identity.json"), b"{}").unwrap();

    let overlay = Arc::new(FakeOverlay::new());
    let cfg = ConnectorConfig::new("prod-1", "https://login.example.com").with_state_dir(dir.path());
    let conn = connector(cfg, overlay.clone());

    conn.start().await.unwrap();
    assert_eq!(overlay.bring_up_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_start_is_memoized() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(FakeOverlay::new().with_bring_up_error("login server rejected key"));
    let conn = connector(config(dir.path()), overlay.clone());

    let err = conn.start().await.unwrap_err();
    assert!(err.to_string().contains("login server rejected key"));

    // The second attempt reports the memoized failure without re-joining.
    let err = conn.start().await.unwrap_err();
    assert!(err.to_string().contains("previous start failed"), "{err}");
    assert_eq!(overlay.bring_up_calls.load(Ordering::SeqCst), 1);

    let health = conn.health().await;
    assert_eq!(health.state, HealthState::Degraded);
    assert!(health.error.is_some());
}

#[tokio::test]
async fn start_times_out_without_a_resolved_address() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(FakeOverlay::new().unresolved());
    let mut cfg = config(dir.path());
    cfg.start_timeout = Duration::from_millis(300);
    cfg.poll_interval = Duration::from_millis(50);
    let conn = connector(cfg, overlay.clone());

    let err = conn.start().await.unwrap_err();
    assert!(matches!(err, GridlinkError::Connectivity(_)), "{err}");
    assert!(err.to_string().contains("timed out"), "{err}");
}

#[tokio::test]
async fn start_waits_for_late_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(FakeOverlay::new().unresolved());
    let mut cfg = config(dir.path());
    cfg.poll_interval = Duration::from_millis(20);
    let conn = connector(cfg, overlay.clone());

    let resolver = overlay.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        resolver.resolve();
    });

    conn.start().await.unwrap();
    assert_eq!(conn.health().await.state, HealthState::Ok);
}

#[tokio::test]
async fn dial_fails_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connector(config(dir.path()), Arc::new(FakeOverlay::new()));

    let err = conn.dial("tcp", "10.0.0.1:80").await.unwrap_err();
    assert!(matches!(err, GridlinkError::Connectivity(_)), "{err}");
    assert!(err.to_string().contains("not started"), "{err}");
}

#[tokio::test]
async fn dial_round_trips_bytes_after_start() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let conn = connector(config(dir.path()), Arc::new(FakeOverlay::new()));
    conn.start().await.unwrap();

    let mut stream = conn.dial("tcp", &addr.to_string()).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn health_walks_the_state_ladder() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(FakeOverlay::new());
    let conn = connector(config(dir.path()), overlay.clone());

    let health = conn.health().await;
    assert_eq!(health.state, HealthState::Stopped);
    assert_eq!(health.cluster_id, "prod-1");
    assert_eq!(health.login_server, "https://login.example.com");

    conn.start().await.unwrap();
    let health = conn.health().await;
    assert_eq!(health.state, HealthState::Ok);
    assert_eq!(health.addr.as_deref(), Some("100.80.0.7"));
    assert_eq!(health.name.as_deref(), Some("gridlink-test.grid.internal"));

    // Address lost again: started but unresolved.
    overlay.unresolve();
    assert_eq!(conn.health().await.state, HealthState::Starting);

    // Status query failing means degraded, with the error surfaced.
    overlay.fail_status();
    let health = conn.health().await;
    assert_eq!(health.state, HealthState::Degraded);
    assert!(health.error.as_deref().is_some_and(|e| e.contains("status")));

    conn.stop().await.unwrap();
    assert_eq!(conn.health().await.state, HealthState::Stopped);
}

#[tokio::test]
async fn stop_tears_down_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(FakeOverlay::new());
    let conn = connector(config(dir.path()), overlay.clone());
    conn.start().await.unwrap();

    conn.stop().await.unwrap();
    conn.stop().await.unwrap();
    assert_eq!(overlay.close_calls.load(Ordering::SeqCst), 1);
    assert!(overlay.closed.load(Ordering::SeqCst));

    // A stopped connector stays down.
    assert!(conn.start().await.is_err());
    assert!(conn.dial("tcp", "10.0.0.1:80").await.is_err());
}

#[tokio::test]
async fn stop_before_start_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let overlay = Arc::new(FakeOverlay::new());
    let conn = connector(config(dir.path()), overlay.clone());

    conn.stop().await.unwrap();
    assert_eq!(overlay.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(overlay.bring_up_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn construction_rejects_blank_identifiers() {
    let overlay: Arc<dyn OverlayClient> = Arc::new(FakeOverlay::new());
    let cfg = ConnectorConfig::new("", "https://login.example.com").with_state_dir("/tmp/unused");
    assert!(Connector::new(cfg, overlay.clone()).is_err());
    let cfg = ConnectorConfig::new("prod-1", "").with_state_dir("/tmp/unused");
    assert!(Connector::new(cfg, overlay).is_err());
}
