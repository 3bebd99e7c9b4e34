use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::header::{HeaderMap, HeaderName};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ProxyOptions;
use crate::error::{GridlinkError, Result};
use crate::overlay::{Connector, HttpTransport};
use crate::proxy::allowlist::Allowlist;

/// Request headers mirrored to the upstream. Everything else, cookies and
/// authorization included, stays on the caller's side of the tunnel.
const FORWARDED_HEADERS: [HeaderName; 3] = [
    axum::http::header::ACCEPT,
    axum::http::header::CONTENT_TYPE,
    axum::http::header::USER_AGENT,
];

/// Response headers never mirrored back: hop-by-hop, plus Content-Length,
/// which is recomputed after the body cap is applied.
const STRIPPED_HEADERS: [HeaderName; 8] = [
    axum::http::header::CONTENT_LENGTH,
    axum::http::header::CONNECTION,
    axum::http::header::TRANSFER_ENCODING,
    axum::http::header::PROXY_AUTHENTICATE,
    axum::http::header::PROXY_AUTHORIZATION,
    axum::http::header::TE,
    axum::http::header::TRAILER,
    axum::http::header::UPGRADE,
];

#[derive(Clone)]
pub struct ProxyState {
    pub allowlist: Arc<Allowlist>,
    pub transport: Arc<HttpTransport>,
    /// Connector surfaced on `/healthz`; the transport already carries its
    /// dial function.
    pub connector: Option<Arc<Connector>>,
    pub options: ProxyOptions,
}

/// Routes for the tunnel boundary: `/tunnel?to=host:port&path=/...` plus
/// `/healthz` for the connector.
pub fn router(state: ProxyState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tunnel", any(tunnel_handler))
        .route("/healthz", get(health_handler))
        .layer(cors)
        .with_state(state)
}

/// [`serve`] with the shutdown token wired to SIGTERM/SIGINT.
pub async fn serve_with_signals(addr: SocketAddr, state: ProxyState) -> Result<()> {
    serve(addr, state, crate::shutdown::signal_shutdown()).await
}

/// Serve the tunnel routes until the shutdown token fires.
pub async fn serve(addr: SocketAddr, state: ProxyState, shutdown: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GridlinkError::Connectivity(format!("bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "tunnel proxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| GridlinkError::Connectivity(format!("proxy server: {e}")))
}

async fn health_handler(State(state): State<ProxyState>) -> Response {
    match &state.connector {
        Some(connector) => Json(connector.health().await).into_response(),
        None => (StatusCode::NOT_FOUND, "no connector configured").into_response(),
    }
}

struct TunnelTarget {
    /// Verbatim `host:port` authority, used for dialing and the Host header.
    to: String,
    /// Host with any IPv6 brackets stripped, used for allowlist checks.
    host: String,
    port: u16,
    path: String,
    /// Query string forwarded upstream (`to`/`path` removed).
    rest_query: Option<String>,
}

fn parse_target(raw_query: Option<&str>) -> std::result::Result<TunnelTarget, String> {
    let raw = raw_query.unwrap_or("");
    let mut to = None;
    let mut path = None;
    let mut rest = url::form_urlencoded::Serializer::new(String::new());
    let mut has_rest = false;
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            "to" => to = Some(value.into_owned()),
            "path" => path = Some(value.into_owned()),
            _ => {
                rest.append_pair(&key, &value);
                has_rest = true;
            }
        }
    }

    let to = to.filter(|t| !t.is_empty()).ok_or("missing to")?;
    let path = path.filter(|p| !p.is_empty()).ok_or("missing path")?;
    if !path.starts_with('/') {
        return Err("path must be absolute".into());
    }
    let (host, port) = to.rsplit_once(':').ok_or("invalid to (want host:port)")?;
    let port: u16 = port
        .parse()
        .ok()
        .filter(|p| *p != 0)
        .ok_or("invalid port")?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err("invalid to (empty host)".into());
    }

    Ok(TunnelTarget {
        host: host.to_string(),
        port,
        to,
        path,
        rest_query: has_rest.then(|| rest.finish()),
    })
}

async fn tunnel_handler(
    State(state): State<ProxyState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Response {
    let target = match parse_target(raw_query.as_deref()) {
        Ok(target) => target,
        Err(reason) => {
            tracing::warn!(query = raw_query.as_deref().unwrap_or(""), %reason, "tunnel bad request");
            return (StatusCode::BAD_REQUEST, reason).into_response();
        }
    };

    // Policy before any network I/O.
    if let Err(denied) = state.allowlist.check(&target.host, target.port) {
        tracing::warn!(to = %target.to, path = %target.path, "tunnel destination denied");
        return (StatusCode::FORBIDDEN, denied.to_string()).into_response();
    }

    let uri: Uri = match &target.rest_query {
        Some(rest) => format!("{}?{}", target.path, rest),
        None => target.path.clone(),
    }
    .parse()
    .unwrap_or_else(|_| Uri::from_static("/"));

    let mut builder = Request::builder()
        .method(method.clone())
        .uri(uri)
        .header(axum::http::header::HOST, &target.to);
    for name in &FORWARDED_HEADERS {
        if let Some(value) = headers.get(name) {
            builder = builder.header(name, value);
        }
    }
    let request = match builder.body(Full::new(body)) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(to = %target.to, error = %e, "tunnel request build failed");
            return (StatusCode::BAD_REQUEST, "invalid request").into_response();
        }
    };

    let attempt = tokio::time::timeout(state.options.upstream_timeout, async {
        let response = state.transport.round_trip(&target.to, request).await?;
        let (parts, body) = response.into_parts();
        let bytes = read_capped(body, state.options.max_body).await;
        Ok::<_, GridlinkError>((parts, bytes))
    })
    .await;

    let (parts, bytes) = match attempt {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::warn!(to = %target.to, path = %target.path, error = %e, "tunnel upstream failed");
            return (StatusCode::BAD_GATEWAY, format!("upstream error: {e}")).into_response();
        }
        Err(_) => {
            tracing::warn!(to = %target.to, path = %target.path, "tunnel upstream timed out");
            return (StatusCode::BAD_GATEWAY, "upstream timeout").into_response();
        }
    };

    tracing::info!(
        to = %target.to,
        path = %target.path,
        status = parts.status.as_u16(),
        bytes = bytes.len(),
        "tunnel proxied"
    );

    let mut builder = Response::builder().status(parts.status);
    for (name, value) in parts.headers.iter() {
        if STRIPPED_HEADERS.iter().any(|s| s == name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Collect at most `cap` bytes of the upstream body, silently discarding
/// the rest. A mid-body read error terminates the copy with whatever has
/// arrived; the status line and headers are already committed by then.
async fn read_capped(mut body: hyper::body::Incoming, cap: usize) -> Bytes {
    let mut buf = BytesMut::new();
    while buf.len() < cap {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    let remaining = cap - buf.len();
                    if data.len() > remaining {
                        buf.extend_from_slice(&data[..remaining]);
                        break;
                    }
                    buf.extend_from_slice(data);
                }
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "upstream body ended early");
                break;
            }
            None => break,
        }
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_target_requires_to_and_path() {
        assert!(parse_target(None).is_err());
        assert!(parse_target(Some("to=db.local:5432")).is_err());
        assert!(parse_target(Some("path=/metrics")).is_err());
    }

    #[test]
    fn parse_target_rejects_relative_path() {
        assert!(parse_target(Some("to=db.local:5432&path=metrics")).is_err());
    }

    #[test]
    fn parse_target_rejects_bad_ports() {
        assert!(parse_target(Some("to=db.local&path=/")).is_err());
        assert!(parse_target(Some("to=db.local:0&path=/")).is_err());
        assert!(parse_target(Some("to=db.local:99999&path=/")).is_err());
    }

    #[test]
    fn parse_target_keeps_other_query_params() {
        let target = parse_target(Some("to=db.local:5432&path=/q&limit=5&order=asc")).unwrap();
        assert_eq!(target.to, "db.local:5432");
        assert_eq!(target.path, "/q");
        let rest = target.rest_query.unwrap();
        assert!(rest.contains("limit=5"));
        assert!(rest.contains("order=asc"));
    }

    #[test]
    fn parse_target_strips_ipv6_brackets_for_policy() {
        let target = parse_target(Some("to=%5Bfd00%3A%3A1%5D:80&path=/")).unwrap();
        assert_eq!(target.host, "fd00::1");
        assert_eq!(target.port, 80);
        assert_eq!(target.to, "[fd00::1]:80");
    }
}
