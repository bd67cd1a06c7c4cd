//! Istio VirtualService objects through the Kubernetes API
//!
//! Each routing resource is one `VirtualService`. Its `spec.http` list is
//! owned entirely by this service and rebuilt from the rule list on every
//! write; optimistic concurrency rides on `metadata.resourceVersion`.

use super::{ResourceStore, StoreError, Version, Versioned};
use crate::codec::{ResourceKey, RoutingResource, RuleEntry};
use crate::config::StoreConfig;
use crate::route::Destination;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const API_VERSION: &str = "networking.istio.io/v1beta1";
const KIND: &str = "VirtualService";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "routegate";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualService {
    api_version: String,
    kind: String,
    metadata: ObjectMeta,
    #[serde(default)]
    spec: VirtualServiceSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VirtualServiceSpec {
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    gateways: Vec<String>,
    #[serde(default)]
    http: Vec<HttpRoute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HttpRoute {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "match")]
    matches: Vec<HttpMatch>,
    #[serde(default)]
    route: Vec<RouteDestination>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HttpMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uri: Option<StringMatch>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StringMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RouteDestination {
    destination: DestinationRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DestinationRef {
    host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<PortSelector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PortSelector {
    number: u32,
}

fn to_virtual_service(resource: &RoutingResource, version: Option<&Version>) -> VirtualService {
    let key = &resource.key;
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());

    VirtualService {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        metadata: ObjectMeta {
            name: key.name.clone(),
            namespace: key.namespace.clone(),
            resource_version: version.map(|v| v.0.clone()),
            labels,
        },
        spec: VirtualServiceSpec {
            hosts: vec![key.host.clone()],
            gateways: vec![key.gateway.clone()],
            http: resource
                .rules
                .iter()
                .map(|rule| HttpRoute {
                    name: rule.name.clone(),
                    matches: vec![HttpMatch {
                        uri: Some(StringMatch {
                            prefix: Some(rule.path_prefix.clone()),
                        }),
                    }],
                    route: vec![RouteDestination {
                        destination: DestinationRef {
                            host: rule.destination.host.clone(),
                            port: Some(PortSelector {
                                number: u32::from(rule.destination.port),
                            }),
                        },
                    }],
                })
                .collect(),
        },
    }
}

fn from_virtual_service(vs: VirtualService, key: &ResourceKey) -> Versioned {
    let rules = vs
        .spec
        .http
        .into_iter()
        .filter_map(|http| {
            let prefix = http
                .matches
                .iter()
                .find_map(|m| m.uri.as_ref().and_then(|u| u.prefix.clone()));
            let destination = http.route.into_iter().next().map(|r| r.destination);

            match (prefix, destination) {
                (Some(path_prefix), Some(dest)) if !http.name.is_empty() => Some(RuleEntry {
                    name: http.name,
                    path_prefix,
                    destination: Destination {
                        host: dest.host,
                        port: dest
                            .port
                            .and_then(|p| u16::try_from(p.number).ok())
                            .unwrap_or(80),
                    },
                }),
                _ => {
                    warn!(resource = %key, rule = %http.name, "Dropping unrecognized http rule");
                    None
                }
            }
        })
        .collect();

    Versioned {
        resource: RoutingResource {
            key: key.clone(),
            rules,
        },
        version: Version(vs.metadata.resource_version.unwrap_or_default()),
    }
}

/// Map a failed API response onto a store error
fn classify(status: StatusCode, body: &str) -> StoreError {
    // 404 on update means the object vanished since it was read
    if status == StatusCode::CONFLICT || status == StatusCode::NOT_FOUND {
        StoreError::Conflict
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        StoreError::Unavailable(format!("{}: {}", status, body.trim()))
    } else {
        StoreError::Rejected(format!("{}: {}", status, body.trim()))
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Kubernetes API client for VirtualService routing resources
pub struct KubeStore {
    client: reqwest::Client,
    api_server: String,
    token: Option<String>,
}

impl KubeStore {
    pub fn new(
        api_server: &str,
        token: Option<String>,
        ca_pem: Option<&[u8]>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(pem) = ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            api_server: api_server.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build from config, reading the service account token and CA bundle
    ///
    /// Missing files are tolerated so the store also works against an
    /// unauthenticated endpoint such as `kubectl proxy`.
    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        let token = match std::fs::read_to_string(&config.token_path) {
            Ok(token) => Some(token.trim().to_string()),
            Err(e) => {
                warn!(path = %config.token_path, error = %e, "No service account token, using unauthenticated requests");
                None
            }
        };

        let ca = if Path::new(&config.ca_path).exists() {
            Some(std::fs::read(&config.ca_path)?)
        } else {
            None
        };

        let store = Self::new(&config.api_server, token, ca.as_deref(), config.request_timeout())?;
        info!(api_server = %store.api_server, "Kubernetes routing store configured");
        Ok(store)
    }

    fn collection_url(&self, namespace: &str) -> String {
        format!(
            "{}/apis/{}/namespaces/{}/virtualservices",
            self.api_server, API_VERSION, namespace
        )
    }

    fn object_url(&self, key: &ResourceKey) -> String {
        format!("{}/{}", self.collection_url(&key.namespace), key.name)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Versioned>, StoreError> {
        let url = self.object_url(key);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(resource = %key, "VirtualService does not exist yet");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match classify(status, &body) {
                // a 409 on read is not a version conflict
                StoreError::Conflict => StoreError::Rejected(format!("{}: {}", status, body.trim())),
                other => other,
            });
        }

        let vs: VirtualService = response
            .json()
            .await
            .map_err(|e| StoreError::Unavailable(format!("invalid VirtualService body: {}", e)))?;
        Ok(Some(from_virtual_service(vs, key)))
    }

    async fn conditional_put(
        &self,
        resource: &RoutingResource,
        expected: Option<&Version>,
    ) -> Result<Version, StoreError> {
        let body = to_virtual_service(resource, expected);
        let request = match expected {
            Some(_) => self.client.put(self.object_url(&resource.key)),
            None => self.client.post(self.collection_url(&resource.key.namespace)),
        };

        let response = self
            .authorize(request)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let stored: VirtualService = response
            .json()
            .await
            .map_err(|e| StoreError::Unavailable(format!("invalid VirtualService body: {}", e)))?;
        Ok(Version(stored.metadata.resource_version.unwrap_or_default()))
    }

    fn name(&self) -> &'static str {
        "kubernetes"
    }
}
