use serde::Deserialize;

use crate::resources::ComputeConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub native: NativeConfig,
    #[serde(default)]
    pub bus: BusConfig,
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8090".to_string()
}

/// Where the webhook signing secret is fetched from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretSource {
    /// `secret_name` is an environment variable.
    #[default]
    Env,
    /// `secret_name` is looked up on the control plane.
    ControlPlane,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_path")]
    pub path: String,
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
    #[serde(default)]
    pub secret_source: SecretSource,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            path: default_webhook_path(),
            secret_name: default_secret_name(),
            secret_source: SecretSource::default(),
        }
    }
}

fn default_webhook_path() -> String {
    "/webhook".to_string()
}

fn default_secret_name() -> String {
    "GITHUB_WEBHOOK_SECRET".to_string()
}

/// Native reference hook: `POST {path}/created` and `POST {path}/deleted`.
/// Off unless enabled, and enabling it requires `token_env`.
#[derive(Debug, Clone, Deserialize)]
pub struct NativeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_native_path")]
    pub path: String,
    /// Env var holding the bearer token callers must present.
    #[serde(default)]
    pub token_env: Option<String>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_native_path(),
            token_env: None,
        }
    }
}

fn default_native_path() -> String {
    "/hooks/reference".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_name")]
    pub name: String,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_redelivery_delay_secs")]
    pub redelivery_delay_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: default_bus_name(),
            capacity: default_capacity(),
            max_delivery_attempts: default_max_delivery_attempts(),
            redelivery_delay_secs: default_redelivery_delay_secs(),
        }
    }
}

fn default_bus_name() -> String {
    "default".to_string()
}

fn default_capacity() -> usize {
    256
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_redelivery_delay_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    /// Prefix for every build job name: `{prefix}-{branch}-create|destroy`.
    pub prefix: String,
    pub account_id: String,
    pub region: String,
    pub service_role_arn: String,
    pub artifact_bucket: String,
    /// Per-branch application stack is `{stack_prefix}-{branch}`.
    #[serde(default = "default_stack_prefix")]
    pub stack_prefix: String,
    /// Infrastructure stack deleted on teardown is `{dev_stage_name}-{branch}`.
    #[serde(default = "default_dev_stage_name")]
    pub dev_stage_name: String,
    /// Used when an event does not name its repository.
    #[serde(default)]
    pub default_repository: Option<String>,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    /// Delete the stack and artifact prefix from this process instead of the
    /// teardown build script.
    #[serde(default)]
    pub direct_cleanup: bool,
    #[serde(default)]
    pub compute: ComputeConfig,
}

fn default_stack_prefix() -> String {
    "cdk-pipelines-multi-branch".to_string()
}

fn default_dev_stage_name() -> String {
    "DEV-InfraStack".to_string()
}

fn default_install_command() -> String {
    "npm install -g aws-cdk && pip install -r requirements.txt".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_control_plane_url")]
    pub base_url: String,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: default_control_plane_url(),
            token_env: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_control_plane_url() -> String {
    "http://127.0.0.1:8600".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.provisioning;
        let required = [
            ("provisioning.prefix", &p.prefix),
            ("provisioning.account_id", &p.account_id),
            ("provisioning.region", &p.region),
            ("provisioning.service_role_arn", &p.service_role_arn),
            ("provisioning.artifact_bucket", &p.artifact_bucket),
            ("webhook.secret_name", &self.webhook.secret_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{field} must not be empty")));
            }
        }
        for (field, path) in [
            ("webhook.path", &self.webhook.path),
            ("native.path", &self.native.path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!("{field} must start with '/'")));
            }
        }
        if self.native.enabled
            && self
                .native
                .token_env
                .as_deref()
                .filter(|env| !env.trim().is_empty())
                .is_none()
        {
            return Err(ConfigError::Invalid(
                "native.token_env is required when native.enabled = true".into(),
            ));
        }
        if self.native.enabled && self.native.path == self.webhook.path {
            return Err(ConfigError::Invalid(
                "native.path and webhook.path must differ".into(),
            ));
        }
        Ok(())
    }
}
