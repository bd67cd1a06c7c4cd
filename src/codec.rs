//! Projection of routes into the shared routing resource
//!
//! Everything here is pure: the reconciler fetches a resource, runs it
//! through [`merge`] or [`remove`] and writes the result back.

use crate::config::MeshConfig;
use crate::error::{Result, RouteError};
use crate::route::{Destination, Route};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Placeholder in the host template replaced by the `user` metadata value
pub const USER_PLACEHOLDER: &str = "{user}";

/// Identity of one shared routing resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub namespace: String,
    pub host: String,
    pub gateway: String,
    /// Object name in the store, derived from host and gateway
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: &str, host: &str, gateway: &str, name_prefix: &str) -> Self {
        let digest = hex_digest(&format!("{}/{}", host, gateway));
        Self {
            namespace: namespace.to_string(),
            host: host.to_string(),
            gateway: gateway.to_string(),
            name: format!("{}-{}", name_prefix, &digest[..10]),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One rule in the shared resource, the projection of a single route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEntry {
    /// Stable name derived from the route id
    pub name: String,
    pub path_prefix: String,
    pub destination: Destination,
}

/// The rule list shared by every route published under one host/gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingResource {
    pub key: ResourceKey,
    /// Longest prefix first; equal lengths keep insertion order
    pub rules: Vec<RuleEntry>,
}

impl RoutingResource {
    pub fn empty(key: ResourceKey) -> Self {
        Self {
            key,
            rules: Vec::new(),
        }
    }

    pub fn rule(&self, route_id: &str) -> Option<&RuleEntry> {
        let name = rule_name(route_id);
        self.rules.iter().find(|r| r.name == name)
    }
}

fn hex_digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Derived rule name for a route id
pub fn rule_name(route_id: &str) -> String {
    format!("r-{}", &hex_digest(route_id)[..16])
}

/// Host the route is published under
pub fn host_for(route: &Route, mesh: &MeshConfig) -> Result<String> {
    let template = &mesh.sub_domain_host;
    if !template.contains(USER_PLACEHOLDER) {
        return Ok(template.clone());
    }

    let user = route
        .metadata
        .get("user")
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            RouteError::validation(format!(
                "route '{}' has no 'user' metadata required by host template '{}'",
                route.id, template
            ))
        })?;
    Ok(template.replace(USER_PLACEHOLDER, &user.to_ascii_lowercase()))
}

/// Key of the resource a route belongs to
pub fn resource_key(route: &Route, mesh: &MeshConfig) -> Result<ResourceKey> {
    let host = host_for(route, mesh)?;
    Ok(ResourceKey::new(
        &mesh.namespace,
        &host,
        &mesh.gateway,
        &mesh.resource_name_prefix,
    ))
}

/// Path prefix the mesh matches for a route
///
/// With a base URL configured the root route is published under it.
pub fn path_prefix(route_id: &str, mesh: &MeshConfig) -> String {
    match mesh.base_url.as_deref() {
        Some(base) if route_id == "/" => base.to_string(),
        _ => route_id.to_string(),
    }
}

/// Project a route into its rule entry
pub fn project(route: &Route, mesh: &MeshConfig) -> Result<RuleEntry> {
    let target = route.parsed_target()?;
    Ok(RuleEntry {
        name: rule_name(&route.id),
        path_prefix: path_prefix(&route.id, mesh),
        destination: target.resolve(&mesh.namespace, &mesh.cluster_domain),
    })
}

/// Put a rule into the resource
///
/// An existing rule with the same name is overwritten where it stands.
/// A new rule is appended and the list re-sorted (stable) by descending
/// prefix length, so equal-length prefixes keep their insertion order.
pub fn merge(resource: &RoutingResource, entry: RuleEntry) -> RoutingResource {
    let mut rules = resource.rules.clone();
    match rules.iter_mut().find(|r| r.name == entry.name) {
        Some(existing) => *existing = entry,
        None => {
            rules.push(entry);
            rules.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        }
    }

    RoutingResource {
        key: resource.key.clone(),
        rules,
    }
}

/// Drop the rule for a route id; absent rules are not an error
pub fn remove(resource: &RoutingResource, route_id: &str) -> RoutingResource {
    let name = rule_name(route_id);
    RoutingResource {
        key: resource.key.clone(),
        rules: resource
            .rules
            .iter()
            .filter(|r| r.name != name)
            .cloned()
            .collect(),
    }
}
