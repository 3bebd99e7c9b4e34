use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GridlinkError, Result};

/// Configuration for one per-cluster overlay connector.
///
/// `cluster_id` and `login_server` are required. The join credential may be
/// omitted when the state directory already holds a persisted identity from
/// an earlier join; first-time starts fail without one.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Identifier of the remote cluster this connector represents.
    pub cluster_id: String,
    /// URL of the overlay login/control server.
    pub login_server: String,
    /// One-time join credential. Supplied by the secrets collaborator;
    /// never read from the process environment.
    pub auth_key: Option<String>,
    /// Directory persisting the overlay identity across restarts.
    /// Defaults to `~/.gridlink/overlay/cluster-<id>`.
    pub state_dir: Option<PathBuf>,
    /// Overlay hostname label. Defaults to `gridlink-<cluster-id>`.
    pub hostname: Option<String>,
    /// How long `start` waits for an overlay address to resolve.
    pub start_timeout: Duration,
    /// Interval between status polls during `start`.
    pub poll_interval: Duration,
}

impl ConnectorConfig {
    pub fn new(cluster_id: impl Into<String>, login_server: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            login_server: login_server.into(),
            auth_key: None,
            state_dir: None,
            hostname: None,
            start_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.trim().is_empty() {
            return Err(GridlinkError::Validation("cluster id required".into()));
        }
        if self.login_server.trim().is_empty() {
            return Err(GridlinkError::Validation("login server required".into()));
        }
        Ok(())
    }

    /// Resolve the effective state directory without creating it.
    pub fn effective_state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| GridlinkError::Validation("no home directory for state".into()))?;
        Ok(home
            .join(".gridlink")
            .join("overlay")
            .join(format!("cluster-{}", sanitize_id(&self.cluster_id))))
    }

    /// Resolve the effective overlay hostname label.
    pub fn effective_hostname(&self) -> String {
        match self.hostname.as_deref().map(str::trim) {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => format!("gridlink-{}", sanitize_id(&self.cluster_id)),
        }
    }
}

/// Lowercase a label and keep only `[a-z0-9-]`, mapping separator
/// characters to `-`. Empty results become `"default"`.
pub(crate) fn sanitize_id(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.trim().to_ascii_lowercase().chars() {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            '-' | '_' | '.' => out.push('-'),
            _ => {}
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Settings the connector-backed HTTP transport is willing to inherit from
/// a caller-supplied base. Dialing is always overridden to route through
/// the connector, and the upstream protocol is always HTTP/1.1.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Deadline for establishing the overlay connection to the target.
    pub connect_timeout: Duration,
    /// Optional deadline for the upstream response head.
    pub response_header_timeout: Option<Duration>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            response_header_timeout: None,
        }
    }
}

/// Options for the tunnel reverse proxy.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Maximum number of upstream body bytes mirrored to the caller.
    /// Anything beyond the cap is silently truncated.
    pub max_body: usize,
    /// Overall deadline for the upstream round trip.
    pub upstream_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            max_body: 10 * 1024 * 1024,
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_config_requires_cluster_id() {
        let cfg = ConnectorConfig::new("", "https://login.example.com");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn connector_config_requires_login_server() {
        let cfg = ConnectorConfig::new("prod-1", "  ");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn connector_config_valid() {
        let cfg = ConnectorConfig::new("prod-1", "https://login.example.com");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.start_timeout, Duration::from_secs(30));
        assert_eq!(cfg.poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn effective_hostname_defaults_to_sanitized_cluster() {
        let cfg = ConnectorConfig::new("Prod_1", "https://login.example.com");
        assert_eq!(cfg.effective_hostname(), "gridlink-prod-1");
    }

    #[test]
    fn effective_hostname_prefers_explicit_value() {
        let cfg = ConnectorConfig::new("prod-1", "https://login.example.com")
            .with_hostname("edge-07");
        assert_eq!(cfg.effective_hostname(), "edge-07");
    }

    #[test]
    fn effective_state_dir_prefers_explicit_value() {
        let cfg = ConnectorConfig::new("prod-1", "https://login.example.com")
            .with_state_dir("/tmp/overlay-state");
        assert_eq!(
            cfg.effective_state_dir().unwrap(),
            PathBuf::from("/tmp/overlay-state")
        );
    }

    #[test]
    fn sanitize_id_strips_and_lowercases() {
        assert_eq!(sanitize_id("Prod_US.east"), "prod-us-east");
        assert_eq!(sanitize_id("--"), "default");
        assert_eq!(sanitize_id("!!!"), "default");
    }

    #[test]
    fn proxy_options_default() {
        let opts = ProxyOptions::default();
        assert_eq!(opts.max_body, 10 * 1024 * 1024);
        assert_eq!(opts.upstream_timeout, Duration::from_secs(30));
    }
}
