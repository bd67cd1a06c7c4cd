use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variables understood on top of the config file
pub const ENV_AUTH_TOKEN: &str = "CONFIGPROXY_AUTH_TOKEN";
pub const ENV_GATEWAY: &str = "ISTIO_GATEWAY";
pub const ENV_NAMESPACE: &str = "K8S_NAMESPACE";
pub const ENV_SUB_DOMAIN_HOST: &str = "SUB_DOMAIN_HOST";
pub const ENV_WAIT_FOR_WARMUP: &str = "WAIT_FOR_WARMUP";
pub const ENV_RESOURCE_PREFIX: &str = "VIRTUAL_SERVICE_PREFIX";
pub const ENV_CLUSTER_DOMAIN: &str = "CLUSTER_DOMAIN";
pub const ENV_BASE_URL: &str = "JUPYTERHUB_BASE_URL";

/// Global configuration, built once at startup and shared read-only
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// API server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Where and how routes are published in the mesh
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Retry and warm-up policy
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Routing store connection
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 8000)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Shared secret callers present as `Authorization: token <secret>`
    #[serde(default)]
    pub api_token: String,

    /// How long in-flight route operations may run after a shutdown signal
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl ServerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            api_token: String::new(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MeshConfig {
    /// Gateway the routing resources bind to, e.g. `istio-system/jupyter-gateway`
    #[serde(default)]
    pub gateway: String,

    /// Namespace the routing resources live in
    #[serde(default)]
    pub namespace: String,

    /// Host routes are published under; may contain `{user}`
    #[serde(default)]
    pub sub_domain_host: String,

    /// Probe backends before publishing their routes (default: true)
    #[serde(default = "default_wait_for_warmup")]
    pub wait_for_warmup: bool,

    /// Name prefix for created routing resources (default: jupyter)
    #[serde(default = "default_resource_name_prefix")]
    pub resource_name_prefix: String,

    /// DNS suffix used to qualify service targets (default: cluster.local)
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,

    /// Path prefix the root route is published under
    pub base_url: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            gateway: String::new(),
            namespace: String::new(),
            sub_domain_host: String::new(),
            wait_for_warmup: default_wait_for_warmup(),
            resource_name_prefix: default_resource_name_prefix(),
            cluster_domain: default_cluster_domain(),
            base_url: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    /// Fetch/merge/write attempts per operation (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay in milliseconds, doubled per attempt (default: 50)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Retry delay cap in milliseconds (default: 2000)
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// How long a backend gets to answer before its route is refused (default: 60)
    #[serde(default = "default_warmup_timeout")]
    pub warmup_timeout_secs: u64,

    /// First warm-up probe interval in milliseconds (default: 250)
    #[serde(default = "default_warmup_interval")]
    pub warmup_interval_ms: u64,

    /// Warm-up probe interval cap in milliseconds (default: 2000)
    #[serde(default = "default_warmup_max_interval")]
    pub warmup_max_interval_ms: u64,
}

impl ReconcileConfig {
    /// Delay before retry number `attempt` (0-based), exponential and capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.backoff_max_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_secs(self.warmup_timeout_secs)
    }

    pub fn warmup_interval(&self) -> Duration {
        Duration::from_millis(self.warmup_interval_ms)
    }

    pub fn warmup_max_interval(&self) -> Duration {
        Duration::from_millis(self.warmup_max_interval_ms)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            warmup_timeout_secs: default_warmup_timeout(),
            warmup_interval_ms: default_warmup_interval(),
            warmup_max_interval_ms: default_warmup_max_interval(),
        }
    }
}

/// Routing store implementation
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Istio VirtualService objects through the Kubernetes API (default)
    #[default]
    #[serde(alias = "k8s")]
    Kubernetes,
    /// Process-local store, for standalone runs and development
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Kubernetes API server URL (default: https://kubernetes.default.svc)
    #[serde(default = "default_api_server")]
    pub api_server: String,

    /// Service account token file
    #[serde(default = "default_token_path")]
    pub token_path: String,

    /// CA bundle used to verify the API server
    #[serde(default = "default_ca_path")]
    pub ca_path: String,

    /// Timeout per store request in seconds (default: 10)
    #[serde(default = "default_store_timeout")]
    pub request_timeout_secs: u64,
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            api_server: default_api_server(),
            token_path: default_token_path(),
            ca_path: default_ca_path(),
            request_timeout_secs: default_store_timeout(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_wait_for_warmup() -> bool {
    true
}

fn default_resource_name_prefix() -> String {
    "jupyter".to_string()
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    50
}

fn default_backoff_max() -> u64 {
    2000
}

fn default_warmup_timeout() -> u64 {
    60
}

fn default_warmup_interval() -> u64 {
    250
}

fn default_warmup_max_interval() -> u64 {
    2000
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_ca_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()
}

fn default_store_timeout() -> u64 {
    10
}

/// DNS-1123 label with room left for the generated suffix
fn is_valid_name_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix.len() <= 40
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !prefix.starts_with('-')
}

impl Config {
    /// Load configuration: file (if given), then environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment overrides as set by the JupyterHub deployment
    ///
    /// Empty values are ignored; `WAIT_FOR_WARMUP` disables warm-up only
    /// when set to exactly `false`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(token) = non_empty(ENV_AUTH_TOKEN) {
            self.server.api_token = token;
        }
        if let Some(gateway) = non_empty(ENV_GATEWAY) {
            self.mesh.gateway = gateway;
        }
        if let Some(namespace) = non_empty(ENV_NAMESPACE) {
            self.mesh.namespace = namespace;
        }
        if let Some(host) = non_empty(ENV_SUB_DOMAIN_HOST) {
            self.mesh.sub_domain_host = host;
        }
        if let Some(warmup) = lookup(ENV_WAIT_FOR_WARMUP) {
            self.mesh.wait_for_warmup = warmup != "false";
        }
        if let Some(prefix) = non_empty(ENV_RESOURCE_PREFIX) {
            self.mesh.resource_name_prefix = prefix;
        }
        if let Some(domain) = non_empty(ENV_CLUSTER_DOMAIN) {
            self.mesh.cluster_domain = domain;
        }
        if let Some(base_url) = non_empty(ENV_BASE_URL) {
            self.mesh.base_url = Some(base_url);
        }
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.api_token.is_empty() {
            errors.push(format!("missing required param {}", ENV_AUTH_TOKEN));
        }
        if self.mesh.gateway.is_empty() {
            errors.push(format!("missing required param {}", ENV_GATEWAY));
        }
        if self.mesh.namespace.is_empty() {
            errors.push(format!("missing required param {}", ENV_NAMESPACE));
        }
        if self.mesh.sub_domain_host.is_empty() {
            errors.push(format!("missing required param {}", ENV_SUB_DOMAIN_HOST));
        }
        if !is_valid_name_prefix(&self.mesh.resource_name_prefix) {
            errors.push(format!(
                "resource name prefix '{}' must be a lowercase DNS label of at most 40 characters",
                self.mesh.resource_name_prefix
            ));
        }
        if self.mesh.cluster_domain.is_empty() {
            errors.push("cluster domain must not be empty".to_string());
        }
        if let Some(base_url) = &self.mesh.base_url {
            if !base_url.starts_with('/') {
                errors.push(format!("base url '{}' must start with '/'", base_url));
            }
        }
        if self.reconcile.max_retries == 0 {
            errors.push("reconcile.max_retries must be greater than 0".to_string());
        }
        if self.reconcile.backoff_base_ms > self.reconcile.backoff_max_ms {
            errors.push("reconcile.backoff_base_ms must not exceed backoff_max_ms".to_string());
        }
        if self.reconcile.warmup_interval_ms == 0 {
            errors.push("reconcile.warmup_interval_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
