use crate::device::Credentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the relay service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Scheduling and failure policy
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Camera HTTP client configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Camera credentials shared by every authenticated model
    #[serde(default)]
    pub camera: CameraConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Device roster source
    pub roster: RosterConfig,
    /// Placeholder published when no snapshot is available
    #[serde(default = "default_fallback_image_path")]
    pub fallback_image_path: PathBuf,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Worker topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// One task per device with its own sleep
    PerDevice,
    /// Fixed worker pool over a rotating queue
    Pool,
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    /// Pool size (pool strategy only)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds between cycles of the same device
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound of the random start-up delay in seconds
    #[serde(default = "default_initial_jitter_secs")]
    pub initial_jitter_secs: u64,
    /// Consecutive failures before a device is disabled
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
    /// Whether store write failures count toward `failure_limit`
    #[serde(default = "default_true")]
    pub count_publish_failures: bool,
}

/// Camera HTTP client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Largest snapshot accepted, in bytes
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

/// Camera credentials (RELAY__CAMERA__USERNAME / RELAY__CAMERA__PASSWORD)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for snapshots
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Namespace prepended to object keys
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Upper bound on one object write, in seconds
    #[serde(default = "default_s3_timeout_secs")]
    pub timeout_secs: u64,
}

/// Where the device roster comes from. Exactly one of `file` / `url`.
#[derive(Debug, Clone, Deserialize)]
pub struct RosterConfig {
    pub file: Option<PathBuf>,
    pub url: Option<String>,
    /// Extra request headers for `url` (API keys, application ids)
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub fields: FieldMapping,
}

/// Names of the roster record fields holding device attributes
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldMapping {
    #[serde(default = "default_id_field")]
    pub id: String,
    #[serde(default = "default_address_field")]
    pub address: String,
    #[serde(default = "default_model_field")]
    pub model: String,
    /// Boolean field; records where it is `true` are not polled
    #[serde(default)]
    pub disable_publish: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "cctv-relay".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_strategy() -> StrategyKind {
    StrategyKind::PerDevice
}

fn default_workers() -> usize {
    10
}

fn default_interval_secs() -> u64 {
    120
}

fn default_initial_jitter_secs() -> u64 {
    300
}

fn default_failure_limit() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_max_image_bytes() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_s3_timeout_secs() -> u64 {
    30
}

fn default_region() -> String {
    "us-east-2".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_address_field() -> String {
    "ip".to_string()
}

fn default_model_field() -> String {
    "model".to_string()
}

fn default_fallback_image_path() -> PathBuf {
    PathBuf::from("unavailable.jpg")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            workers: default_workers(),
            interval_secs: default_interval_secs(),
            initial_jitter_secs: default_initial_jitter_secs(),
            failure_limit: default_failure_limit(),
            count_publish_failures: true,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            id: default_id_field(),
            address: default_address_field(),
            model: default_model_field(),
            disable_publish: None,
        }
    }
}

impl Config {
    /// Load configuration from config files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/relay.{toml,yaml,json}`
    /// 2. `/etc/cctv-relay/relay.*`
    /// 3. `extra_file`, if given on the command line
    /// 4. Environment (`RELAY__S3__BUCKET` -> `s3.bucket`)
    pub fn load(extra_file: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/relay").required(false))
            .add_source(config::File::with_name("/etc/cctv-relay/relay").required(false));

        if let Some(path) = extra_file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        if self.scheduler.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.s3.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.timeout_secs".to_string(),
                message: "Store timeout must be greater than 0".to_string(),
            });
        }

        if self.scheduler.failure_limit == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.failure_limit".to_string(),
                message: "Failure limit must be greater than 0".to_string(),
            });
        }

        if self.scheduler.strategy == StrategyKind::Pool && self.scheduler.workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.workers".to_string(),
                message: "Pool needs at least one worker".to_string(),
            });
        }

        match (&self.roster.file, &self.roster.url) {
            (None, None) => {
                return Err(ConfigValidationError::MissingField(
                    "roster.file or roster.url".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "roster".to_string(),
                    message: "Set only one of roster.file and roster.url".to_string(),
                })
            }
            _ => {}
        }

        Ok(())
    }

    /// Get polling interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.interval_secs)
    }

    /// Get start-up jitter bound as Duration
    pub fn initial_jitter(&self) -> Duration {
        Duration::from_secs(self.scheduler.initial_jitter_secs)
    }

    /// Get camera request timeout as Duration
    pub fn fetch_timeout(&self) -> Duration {
        self.http.timeout()
    }
}

impl S3Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CameraConfig {
    /// Credentials, if both halves are configured.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            scheduler: SchedulerConfig::default(),
            http: HttpConfig::default(),
            camera: CameraConfig::default(),
            s3: S3Config {
                bucket: "thumbnails".to_string(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                key_prefix: Some("cctv".to_string()),
                timeout_secs: default_s3_timeout_secs(),
            },
            roster: RosterConfig {
                file: Some(PathBuf::from("cameras.json")),
                url: None,
                headers: HashMap::new(),
                fields: FieldMapping::default(),
            },
            fallback_image_path: default_fallback_image_path(),
        }
    }

    #[test]
    fn test_default_values() {
        let config = create_test_config();
        assert_eq!(config.interval(), Duration::from_secs(120));
        assert_eq!(config.initial_jitter(), Duration::from_secs(300));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(180));
        assert_eq!(config.scheduler.failure_limit, 3);
        assert_eq!(config.scheduler.strategy, StrategyKind::PerDevice);
        assert!(config.scheduler.count_publish_failures);
    }

    #[test]
    fn test_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_missing_bucket() {
        let mut config = create_test_config();
        config.s3.bucket = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_zero_failure_limit() {
        let mut config = create_test_config();
        config.scheduler.failure_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_pool_without_workers() {
        let mut config = create_test_config();
        config.scheduler.strategy = StrategyKind::Pool;
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());

        config.scheduler.strategy = StrategyKind::PerDevice;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_roster_source_must_be_unique() {
        let mut config = create_test_config();
        config.roster.url = Some("https://inventory.example/records".to_string());
        assert!(config.validate().is_err());

        config.roster.file = None;
        assert!(config.validate().is_ok());

        config.roster.url = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_need_both_halves() {
        let mut camera = CameraConfig {
            username: Some("viewer".to_string()),
            password: None,
        };
        assert!(camera.credentials().is_none());

        camera.password = Some("secret".to_string());
        assert_eq!(camera.credentials().unwrap().username, "viewer");
    }

    #[test]
    fn test_deserialize_from_source() {
        let source = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [scheduler]
                strategy = "pool"
                workers = 4

                [s3]
                bucket = "thumbs"

                [roster]
                url = "https://inventory.example/records"

                [roster.fields]
                id = "field_947"
                address = "field_638"
                model = "field_639"
                disable_publish = "field_1866"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();

        let config: Config = source.try_deserialize().unwrap();

        assert_eq!(config.scheduler.strategy, StrategyKind::Pool);
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.scheduler.interval_secs, 120);
        assert_eq!(config.roster.fields.address, "field_638");
        assert_eq!(config.roster.fields.disable_publish.as_deref(), Some("field_1866"));
        assert_eq!(config.s3.region, "us-east-2");
        assert_eq!(config.s3.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }
}
