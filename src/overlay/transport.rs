use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;

use crate::config::TransportSettings;
use crate::error::{GridlinkError, Result};
use crate::overlay::client::DialFn;

/// HTTP/1.1 transport that reaches upstreams exclusively through a
/// connector-backed dial function. One dial and one in-flight request per
/// round trip; HTTP/2 is never negotiated, so upstream behavior does not
/// depend on ALPN.
pub struct HttpTransport {
    dial: DialFn,
    settings: TransportSettings,
}

impl HttpTransport {
    /// Build a transport over `dial`. Safe settings are cloned from
    /// `base`; everything transport-defining (the dialer, the protocol)
    /// is fixed here.
    pub fn new(dial: DialFn, base: Option<&TransportSettings>) -> Self {
        Self {
            dial,
            settings: base.cloned().unwrap_or_default(),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Dial `authority` through the overlay and perform one request.
    /// The response body is returned unread so the caller can bound how
    /// much of it is consumed.
    pub async fn round_trip(
        &self,
        authority: &str,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>> {
        let conn = tokio::time::timeout(
            self.settings.connect_timeout,
            (self.dial)(authority.to_string()),
        )
        .await
        .map_err(|_| {
            GridlinkError::Connectivity(format!("connect to {authority} timed out"))
        })??;

        let io = TokioIo::new(conn);
        let (mut sender, driver) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| GridlinkError::Connectivity(format!("handshake with {authority}: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                tracing::debug!(error = %e, "upstream connection closed");
            }
        });

        let send = sender.send_request(req);
        let response = match self.settings.response_header_timeout {
            Some(deadline) => tokio::time::timeout(deadline, send).await.map_err(|_| {
                GridlinkError::Connectivity(format!("response from {authority} timed out"))
            })?,
            None => send.await,
        };
        response.map_err(|e| GridlinkError::Connectivity(format!("request to {authority}: {e}")))
    }
}
