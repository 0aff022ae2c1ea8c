//! Suite configuration
//!
//! Built programmatically, optionally seeded from environment variables.
//! No config files needed.
//!
//! # Example
//!
//! ```
//! use proxy_e2e::config::SuiteConfig;
//! use std::time::Duration;
//!
//! let config = SuiteConfig::new()
//!     .namespace("default")
//!     .probe_image("quay.io/brancz/krp-curl:v0.0.2")
//!     .manifest_dir("test/e2e")
//!     .condition_timeout(Duration::from_secs(120));
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Default image for probe workloads
pub const DEFAULT_PROBE_IMAGE: &str = "quay.io/brancz/krp-curl:v0.0.2";

/// Default secret holding the client certificate for certificate probes
pub const DEFAULT_CLIENT_CERT_SECRET: &str = "kube-rbac-proxy-client-certificates";

/// Environment variables read by [`SuiteConfig::from_env`]
pub mod env {
    pub const NAMESPACE: &str = "E2E_NAMESPACE";
    pub const PROBE_IMAGE: &str = "E2E_PROBE_IMAGE";
    pub const MANIFEST_DIR: &str = "E2E_MANIFEST_DIR";
    pub const CLIENT_CERT_SECRET: &str = "E2E_CLIENT_CERT_SECRET";
    pub const PROBE_SERVICE_ACCOUNT: &str = "E2E_PROBE_SERVICE_ACCOUNT";
    pub const CONDITION_TIMEOUT_SECS: &str = "E2E_CONDITION_TIMEOUT_SECS";
    pub const PROBE_TIMEOUT_SECS: &str = "E2E_PROBE_TIMEOUT_SECS";
    pub const KEEP_RESOURCES: &str = "E2E_KEEP_RESOURCES";
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Shared defaults for every scenario in a suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteConfig {
    /// Namespace for namespaced objects and probe pods
    pub namespace: String,

    /// Image used by probe workloads
    pub probe_image: String,

    /// Directory relative manifest paths are resolved against
    pub manifest_dir: PathBuf,

    /// Secret mounted when a probe asks for client certificates
    pub client_cert_secret: String,

    /// Service account probe pods run as (namespace default if unset)
    pub probe_service_account: Option<String>,

    /// Cadence of readiness condition polling
    pub poll_interval: Duration,

    /// Default deadline for each readiness condition
    pub condition_timeout: Duration,

    /// Cadence of probe completion polling
    pub probe_interval: Duration,

    /// Deadline for a probe workload to terminate
    pub probe_timeout: Duration,

    /// Skip deleting applied manifests after each scenario
    pub keep_resources: bool,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            probe_image: DEFAULT_PROBE_IMAGE.to_string(),
            manifest_dir: PathBuf::from("manifests"),
            client_cert_secret: DEFAULT_CLIENT_CERT_SECRET.to_string(),
            probe_service_account: None,
            poll_interval: Duration::from_secs(1),
            condition_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(60),
            keep_resources: false,
        }
    }
}

impl SuiteConfig {
    /// Create a config with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup
    ///
    /// Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ns) = lookup(env::NAMESPACE) {
            config.namespace = ns;
        }
        if let Some(image) = lookup(env::PROBE_IMAGE) {
            config.probe_image = image;
        }
        if let Some(dir) = lookup(env::MANIFEST_DIR) {
            config.manifest_dir = PathBuf::from(dir);
        }
        if let Some(secret) = lookup(env::CLIENT_CERT_SECRET) {
            config.client_cert_secret = secret;
        }
        if let Some(sa) = lookup(env::PROBE_SERVICE_ACCOUNT) {
            config.probe_service_account = Some(sa);
        }
        if let Some(secs) = lookup(env::CONDITION_TIMEOUT_SECS) {
            config.condition_timeout = parse_secs(env::CONDITION_TIMEOUT_SECS, &secs)?;
        }
        if let Some(secs) = lookup(env::PROBE_TIMEOUT_SECS) {
            config.probe_timeout = parse_secs(env::PROBE_TIMEOUT_SECS, &secs)?;
        }
        if let Some(keep) = lookup(env::KEEP_RESOURCES) {
            config.keep_resources = parse_bool(env::KEEP_RESOURCES, &keep)?;
        }

        Ok(config)
    }

    /// Set the namespace
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the probe image
    #[must_use]
    pub fn probe_image(mut self, image: impl Into<String>) -> Self {
        self.probe_image = image.into();
        self
    }

    /// Set the manifest directory
    #[must_use]
    pub fn manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = dir.into();
        self
    }

    /// Set the client certificate secret
    #[must_use]
    pub fn client_cert_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_cert_secret = secret.into();
        self
    }

    /// Set the service account probe pods run as
    #[must_use]
    pub fn probe_service_account(mut self, account: impl Into<String>) -> Self {
        self.probe_service_account = Some(account.into());
        self
    }

    /// Set the condition polling interval
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the default condition timeout
    #[must_use]
    pub fn condition_timeout(mut self, timeout: Duration) -> Self {
        self.condition_timeout = timeout;
        self
    }

    /// Set the probe polling interval
    #[must_use]
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the probe timeout
    #[must_use]
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Keep applied manifests after each scenario
    #[must_use]
    pub fn keep_resources(mut self, keep: bool) -> Self {
        self.keep_resources = keep;
        self
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
