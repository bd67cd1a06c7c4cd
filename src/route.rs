//! Route records and backend target parsing

use crate::error::{Result, RouteError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Opaque key/value data attached to a route by the caller
pub type Metadata = BTreeMap<String, String>;

/// A path-prefix to backend binding owned by this service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Path prefix, unique per route
    pub id: String,
    /// Backend as given by the caller (`host:port` or URI)
    pub target: String,
    /// Passed through untouched
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Route {
    /// Build a validated route stamped with the current time
    pub fn new(id: impl Into<String>, target: impl Into<String>, metadata: Metadata) -> Result<Self> {
        let route = Self {
            id: id.into(),
            target: target.into(),
            metadata,
            created_at: Utc::now(),
        };
        route.validate()?;
        Ok(route)
    }

    /// Check the id is a usable path prefix and the target parses
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RouteError::validation("route id (path prefix) is empty"));
        }
        if !self.id.starts_with('/') {
            return Err(RouteError::validation(format!(
                "route id '{}' must start with '/'",
                self.id
            )));
        }
        if self.id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(RouteError::validation(format!(
                "route id '{}' contains whitespace or control characters",
                self.id
            )));
        }
        self.parsed_target().map(|_| ())
    }

    pub fn parsed_target(&self) -> Result<Target> {
        Target::parse(&self.target)
    }
}

/// Parsed backend address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name or IP literal (IPv6 without brackets)
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Parse `host:port`, `http://host[:port][/path]` or `https://...`
    ///
    /// Paths, queries and fragments are ignored; the port defaults from the
    /// scheme (80 when absent).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RouteError::validation("target is empty"));
        }

        let (rest, default_port) = match raw.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "http" | "ws" => (rest, 80),
                "https" | "wss" => (rest, 443),
                other => {
                    return Err(RouteError::validation(format!(
                        "target '{}' has unsupported scheme '{}'",
                        raw, other
                    )))
                }
            },
            None => (raw, 80),
        };

        let authority = rest
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default();
        // userinfo is never meaningful for a mesh destination
        let authority = authority.rsplit('@').next().unwrap_or(authority);

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(|| {
                RouteError::validation(format!("target '{}' has an unterminated IPv6 literal", raw))
            })?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => {
                    return Err(RouteError::validation(format!(
                        "target '{}' is malformed",
                        raw
                    )))
                }
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(RouteError::validation(format!("target '{}' has no host", raw)));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| RouteError::validation(format!("target '{}' has an invalid port", raw)))?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Address suitable for a TCP connect
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve into the fully qualified mesh destination
    ///
    /// Bare service names get the namespace and cluster domain appended,
    /// `name.ns` and `name.ns.svc` forms get completed, IP literals and any
    /// other dotted name stay as they are.
    pub fn resolve(&self, namespace: &str, cluster_domain: &str) -> Destination {
        let suffix = format!(".{}", cluster_domain);
        let dots = self.host.matches('.').count();

        let host = if self.is_ip() || self.host.ends_with(&suffix) {
            self.host.clone()
        } else if self.host.ends_with(".svc") {
            format!("{}.{}", self.host, cluster_domain)
        } else if dots == 0 {
            format!("{}.{}.svc.{}", self.host, namespace, cluster_domain)
        } else if dots == 1 {
            format!("{}.svc.{}", self.host, cluster_domain)
        } else {
            self.host.clone()
        };

        Destination {
            host,
            port: self.port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_addr())
    }
}

/// Where the mesh sends traffic for a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}
