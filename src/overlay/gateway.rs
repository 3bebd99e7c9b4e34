use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::RwLock;
use url::Url;

use crate::config::ConnectorConfig;
use crate::error::{GridlinkError, Result};
use crate::overlay::client::{BoxConn, OverlayClient, OverlayStatus};

const IDENTITY_FILE: &str = "identity.json";
const OVERLAY_ALPN: &[u8] = b"gridlink-overlay/1";
const CONNECT_REPLY_LIMIT: usize = 256;

/// Identity handed out by the login server on a successful join and
/// persisted under the state directory, so restarts rejoin without a
/// credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GatewayIdentity {
    /// Public address of the cluster's overlay gateway.
    gateway_addr: SocketAddr,
    /// TLS server name the gateway presents.
    server_name: String,
    /// PEM trust anchor for the gateway certificate.
    ca_pem: String,
    /// Name assigned to this node on the overlay.
    node_name: String,
    /// Address assigned to this node on the overlay.
    overlay_addr: String,
}

#[derive(Serialize)]
struct JoinRequest<'a> {
    cluster: &'a str,
    hostname: &'a str,
    auth_key: &'a str,
}

struct Joined {
    endpoint: quinn::Endpoint,
    conn: quinn::Connection,
    identity: GatewayIdentity,
}

/// Production [`OverlayClient`]: redeems the one-time credential at the
/// login server, then keeps a QUIC session to the cluster's gateway peer.
/// Dials open a bidirectional stream and ask the gateway to connect to the
/// target; all routing beyond that handshake is the gateway's concern.
pub struct GatewayClient {
    cluster_id: String,
    login_server: Url,
    hostname: String,
    state_dir: PathBuf,
    http: reqwest::Client,
    joined: RwLock<Option<Joined>>,
}

impl GatewayClient {
    pub fn new(cfg: &ConnectorConfig) -> Result<Self> {
        cfg.validate()?;
        let login_server = Url::parse(cfg.login_server.trim())
            .map_err(|e| GridlinkError::Validation(format!("login server URL: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| GridlinkError::Validation(format!("http client: {e}")))?;
        Ok(Self {
            cluster_id: cfg.cluster_id.clone(),
            login_server,
            hostname: cfg.effective_hostname(),
            state_dir: cfg.effective_state_dir()?,
            http,
            joined: RwLock::new(None),
        })
    }

    fn identity_path(&self) -> PathBuf {
        self.state_dir.join(IDENTITY_FILE)
    }

    fn load_identity(&self) -> Option<GatewayIdentity> {
        let raw = std::fs::read(self.identity_path()).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::warn!(path = %self.identity_path().display(), error = %e, "unreadable overlay identity");
                None
            }
        }
    }

    fn store_identity(&self, identity: &GatewayIdentity) -> Result<()> {
        let path = self.identity_path();
        let raw = serde_json::to_vec_pretty(identity)
            .map_err(|e| GridlinkError::Persistence(e.to_string()))?;
        std::fs::create_dir_all(&self.state_dir)
            .and_then(|()| std::fs::write(&path, raw))
            .map_err(|e| GridlinkError::Persistence(format!("{}: {e}", path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    /// Redeem the one-time credential for a gateway identity.
    async fn join(&self, auth_key: &str) -> Result<GatewayIdentity> {
        let endpoint = self
            .login_server
            .join("api/v1/join")
            .map_err(|e| GridlinkError::Validation(format!("login server URL: {e}")))?;
        let response = self
            .http
            .post(endpoint)
            .json(&JoinRequest {
                cluster: &self.cluster_id,
                hostname: &self.hostname,
                auth_key,
            })
            .send()
            .await
            .map_err(|e| GridlinkError::Connectivity(format!("login server: {e}")))?;
        if !response.status().is_success() {
            return Err(GridlinkError::Connectivity(format!(
                "join rejected by login server: {}",
                response.status()
            )));
        }
        response
            .json::<GatewayIdentity>()
            .await
            .map_err(|e| GridlinkError::Connectivity(format!("join response: {e}")))
    }

    fn client_config(identity: &GatewayIdentity) -> Result<quinn::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut identity.ca_pem.as_bytes()) {
            let cert =
                cert.map_err(|e| GridlinkError::Validation(format!("gateway trust anchor: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| GridlinkError::Validation(format!("gateway trust anchor: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(GridlinkError::Validation(
                "gateway trust anchor contains no certificates".into(),
            ));
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| GridlinkError::Validation(format!("tls config: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.alpn_protocols = vec![OVERLAY_ALPN.to_vec()];
        let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| GridlinkError::Validation(format!("quic tls config: {e}")))?;
        Ok(quinn::ClientConfig::new(Arc::new(quic)))
    }
}

#[async_trait]
impl OverlayClient for GatewayClient {
    async fn bring_up(&self, auth_key: Option<&str>) -> Result<()> {
        let mut joined = self.joined.write().await;
        if joined.is_some() {
            return Ok(());
        }

        let identity = match self.load_identity() {
            Some(identity) => identity,
            None => {
                let key = auth_key.map(str::trim).filter(|k| !k.is_empty()).ok_or_else(|| {
                    GridlinkError::Validation("join credential required for first start".into())
                })?;
                let identity = self.join(key).await?;
                self.store_identity(&identity)?;
                tracing::info!(
                    cluster = %self.cluster_id,
                    node = %identity.node_name,
                    "joined overlay"
                );
                identity
            }
        };

        let config = Self::client_config(&identity)?;
        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().expect("wildcard addr"))
            .map_err(|e| GridlinkError::Connectivity(format!("udp socket: {e}")))?;
        endpoint.set_default_client_config(config);
        let conn = endpoint
            .connect(identity.gateway_addr, &identity.server_name)
            .map_err(|e| GridlinkError::Connectivity(format!("gateway connect: {e}")))?
            .await
            .map_err(|e| GridlinkError::Connectivity(format!("gateway handshake: {e}")))?;
        tracing::debug!(
            cluster = %self.cluster_id,
            gateway = %identity.gateway_addr,
            "overlay session established"
        );
        *joined = Some(Joined {
            endpoint,
            conn,
            identity,
        });
        Ok(())
    }

    async fn status(&self) -> Result<OverlayStatus> {
        let joined = self.joined.read().await;
        let Some(joined) = joined.as_ref() else {
            return Err(GridlinkError::Connectivity("overlay not joined".into()));
        };
        if let Some(reason) = joined.conn.close_reason() {
            return Err(GridlinkError::Connectivity(format!(
                "gateway session closed: {reason}"
            )));
        }
        Ok(OverlayStatus {
            addr: Some(joined.identity.overlay_addr.clone()),
            name: Some(joined.identity.node_name.clone()),
        })
    }

    async fn dial(&self, network: &str, addr: &str) -> Result<BoxConn> {
        if network != "tcp" {
            return Err(GridlinkError::Validation(format!(
                "unsupported network {network:?}"
            )));
        }
        let conn = {
            let joined = self.joined.read().await;
            match joined.as_ref() {
                Some(joined) => joined.conn.clone(),
                None => return Err(GridlinkError::Connectivity("overlay not joined".into())),
            }
        };
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| GridlinkError::Connectivity(format!("open stream: {e}")))?;

        send.write_all(format!("CONNECT {addr}\n").as_bytes())
            .await
            .map_err(|e| GridlinkError::Connectivity(format!("connect request: {e}")))?;

        // The gateway answers with one line before any payload bytes.
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match recv
                .read(&mut byte)
                .await
                .map_err(|e| GridlinkError::Connectivity(format!("connect reply: {e}")))?
            {
                Some(n) if n > 0 => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                    if line.len() > CONNECT_REPLY_LIMIT {
                        return Err(GridlinkError::Connectivity(
                            "gateway reply exceeds protocol limit".into(),
                        ));
                    }
                }
                _ => {
                    return Err(GridlinkError::Connectivity(
                        "gateway closed stream during connect".into(),
                    ))
                }
            }
        }
        let reply = String::from_utf8_lossy(&line);
        if reply.trim() != "OK" {
            return Err(GridlinkError::Connectivity(format!(
                "gateway refused dial to {addr}: {}",
                reply.trim()
            )));
        }
        Ok(Box::new(GatewayStream { recv, send }))
    }

    async fn close(&self) -> Result<()> {
        let joined = self.joined.write().await.take();
        if let Some(joined) = joined {
            joined.conn.close(0u32.into(), b"closed");
            joined.endpoint.close(0u32.into(), b"closed");
            joined.endpoint.wait_idle().await;
            tracing::debug!(cluster = %self.cluster_id, "overlay session closed");
        }
        Ok(())
    }
}

/// One proxied connection: the two halves of a gateway stream presented as
/// a single duplex byte stream.
struct GatewayStream {
    recv: quinn::RecvStream,
    send: quinn::SendStream,
}

impl AsyncRead for GatewayStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for GatewayStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}
