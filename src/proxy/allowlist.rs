use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{GridlinkError, Result};

#[derive(Debug, Clone)]
enum Rule {
    /// Matches any port on an IP inside the block.
    Cidr(IpNet),
    /// Matches exactly one host (case-insensitive) and port.
    HostPort { host: String, port: u16 },
}

/// Operator-approved proxy destinations. Immutable once constructed; an
/// empty rule set denies everything. Loopback and private ranges get no
/// implicit trust; they need an explicit rule like any other range.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    rules: Vec<Rule>,
}

impl Allowlist {
    /// Parse operator rule strings: either a CIDR block (`10.0.0.0/8`) or
    /// an exact `host:port` pair. Blank entries are skipped; anything else
    /// malformed fails construction.
    pub fn parse<I, S>(items: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for item in items {
            let item = item.as_ref().trim();
            if item.is_empty() {
                continue;
            }
            if item.contains('/') {
                let net: IpNet = item.parse().map_err(|e| {
                    GridlinkError::Validation(format!("invalid CIDR {item:?}: {e}"))
                })?;
                rules.push(Rule::Cidr(net));
                continue;
            }
            let Some((host, port)) = item.rsplit_once(':') else {
                return Err(GridlinkError::Validation(format!(
                    "invalid allowlist entry {item:?} (want host:port or CIDR)"
                )));
            };
            if host.is_empty() {
                return Err(GridlinkError::Validation(format!(
                    "invalid allowlist entry {item:?}: empty host"
                )));
            }
            let port: u16 = port
                .parse()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    GridlinkError::Validation(format!("invalid port in allowlist entry {item:?}"))
                })?;
            rules.push(Rule::HostPort {
                host: host.to_string(),
                port,
            });
        }
        Ok(Self { rules })
    }

    /// True when at least one rule matches the destination.
    pub fn allowed(&self, host: &str, port: u16) -> bool {
        let ip: Option<IpAddr> = host.parse().ok();
        self.rules.iter().any(|rule| match rule {
            Rule::Cidr(net) => ip.map_or(false, |ip| net.contains(&ip)),
            Rule::HostPort { host: h, port: p } => *p == port && h.eq_ignore_ascii_case(host),
        })
    }

    /// Like [`allowed`](Self::allowed), but yields the policy error the
    /// taxonomy names for a denied destination.
    pub fn check(&self, host: &str, port: u16) -> Result<()> {
        if self.allowed(host, port) {
            Ok(())
        } else {
            Err(GridlinkError::PolicyDenied {
                host: host.to_string(),
                port,
            })
        }
    }

    /// `allowed` over a combined `host:port` string.
    pub fn allowed_addr(&self, addr: &str) -> bool {
        let Some((host, port)) = addr.rsplit_once(':') else {
            return false;
        };
        match port.parse::<u16>() {
            Ok(port) if port != 0 => self.allowed(host, port),
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}
