use anyhow::{ensure, Context};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Longest validity S3 accepts for a SigV4 presigned URL.
pub const MAX_PRESIGNED_URL_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Smallest part S3 accepts for all but the last part of a multipart upload.
pub const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Main configuration for the adaptation relay
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Message broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Object store configuration
    pub storage: StorageConfig,
    /// Relay loop tuning
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus exporter port, 0 disables the exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// AMQP broker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_broker_user")]
    pub username: String,
    #[serde(default = "default_broker_user")]
    pub password: String,
    /// Virtual host name, `/` by default
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Connect with `amqps://`
    #[serde(default)]
    pub use_tls: bool,
    /// Consumer tag announced to the broker
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,
    /// Where adaptation requests are consumed from
    #[serde(default = "InboundBinding::default")]
    pub inbound: InboundBinding,
    /// Where enriched requests are published to
    #[serde(default = "OutboundTarget::default")]
    pub outbound: OutboundTarget,
}

/// Queue bound to an exchange with a routing key
#[derive(Debug, Clone, Deserialize)]
pub struct InboundBinding {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

/// Publish target, with an optional queue declared and bound on startup
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundTarget {
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub queue: Option<String>,
}

/// Object store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// `host:port` or a full URL (for MinIO, LocalStack, etc.)
    pub endpoint: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Scheme used when `endpoint` has none
    #[serde(default)]
    pub use_tls: bool,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Force path-style access (required for MinIO)
    #[serde(default = "default_true")]
    pub force_path_style: bool,
    /// Bucket source files are staged into
    pub source_bucket: String,
    /// Bucket reserved for rebuilt files, provisioned on startup when set
    #[serde(default)]
    pub clean_bucket: Option<String>,
    /// Root that relative `source-file-location` values resolve against
    #[serde(default)]
    pub input_mount: Option<PathBuf>,
    /// Presigned URL validity in seconds
    #[serde(default = "default_presigned_url_ttl_secs")]
    pub presigned_url_ttl_secs: u64,
    /// Multipart upload threshold in bytes
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    /// Part size for multipart uploads in bytes
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Relay loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Deliveries handled concurrently, also used as the AMQP prefetch
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    /// How deliveries that could not be relayed are settled
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// How long in-flight deliveries may run after shutdown is requested
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Settlement of deliveries that were not relayed
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Ack and forget
    #[default]
    Drop,
    /// Reject without requeue so a dead-letter exchange can pick it up
    DeadLetter,
    /// Requeue transient failures once, then reject
    Requeue,
}

// Default value functions
fn default_service_name() -> String {
    "adaptation-relay".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_user() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_consumer_tag() -> String {
    "adaptation-relay".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_presigned_url_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_multipart_threshold() -> u64 {
    8 * 1024 * 1024 // 8MB
}

fn default_part_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_max_in_flight() -> usize {
    16
}

fn default_upload_timeout_secs() -> u64 {
    300
}

fn default_publish_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

/// Environment variable names used by the original deployment manifests,
/// mapped onto their configuration keys.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("ADAPTATION_REQUEST_QUEUE_HOSTNAME", "broker.host"),
    ("ADAPTATION_REQUEST_QUEUE_PORT", "broker.port"),
    ("MESSAGE_BROKER_USER", "broker.username"),
    ("MESSAGE_BROKER_PASSWORD", "broker.password"),
    ("MINIO_ENDPOINT", "storage.endpoint"),
    ("MINIO_ACCESS_KEY", "storage.access_key"),
    ("MINIO_SECRET_KEY", "storage.secret_key"),
    ("MINIO_SOURCE_BUCKET", "storage.source_bucket"),
    ("MINIO_CLEAN_BUCKET", "storage.clean_bucket"),
    ("MINIO_USE_TLS", "storage.use_tls"),
    ("INPUT_MOUNT", "storage.input_mount"),
];

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(File::with_name("config/relay").required(false))
            .add_source(File::with_name("/etc/adaptation/relay").required(false))
            .add_source(environment());

        let builder = with_legacy_env(builder, |name| std::env::var(name).ok())?;

        Self::from_builder(builder)
    }

    /// Build, deserialize and validate
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> anyhow::Result<Self> {
        let config: Self = builder
            .build()
            .context("Failed to assemble configuration sources")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.relay.max_in_flight > 0,
            "relay.max_in_flight must be at least 1"
        );
        ensure!(
            self.relay.max_in_flight <= usize::from(u16::MAX),
            "relay.max_in_flight must fit the AMQP prefetch count ({})",
            u16::MAX
        );
        ensure!(
            self.storage.presigned_url_ttl_secs > 0
                && self.storage.presigned_url_ttl_secs <= MAX_PRESIGNED_URL_TTL_SECS,
            "storage.presigned_url_ttl_secs must be within 1..={MAX_PRESIGNED_URL_TTL_SECS}"
        );
        ensure!(
            self.storage.part_size_bytes >= MIN_PART_SIZE_BYTES,
            "storage.part_size_bytes must be at least {MIN_PART_SIZE_BYTES}"
        );
        ensure!(
            !self.storage.source_bucket.is_empty(),
            "storage.source_bucket must not be empty"
        );
        Ok(())
    }

    /// Buckets provisioned before consuming starts
    pub fn buckets(&self) -> Vec<&str> {
        let mut buckets = vec![self.storage.source_bucket.as_str()];
        if let Some(clean) = self.storage.clean_bucket.as_deref() {
            if !clean.is_empty() && clean != self.storage.source_bucket {
                buckets.push(clean);
            }
        }
        buckets
    }

    /// Get presigned URL validity as Duration
    pub fn presigned_url_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.presigned_url_ttl_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.upload_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.publish_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.relay.shutdown_grace_secs)
    }
}

/// Layer the legacy variables on top of everything else
fn with_legacy_env<F>(
    mut builder: ConfigBuilder<DefaultState>,
    lookup: F,
) -> anyhow::Result<ConfigBuilder<DefaultState>>
where
    F: Fn(&str) -> Option<String>,
{
    for (name, key) in LEGACY_ENV {
        let value = lookup(name).filter(|v| !v.is_empty());
        builder = builder
            .set_override_option(*key, value)
            .with_context(|| format!("Failed to apply {name}"))?;
    }
    Ok(builder)
}

/// `RELAY__BROKER__HOST` -> `broker.host`
fn environment() -> Environment {
    Environment::with_prefix("RELAY")
        .separator("__")
        .try_parsing(true)
}

impl BrokerConfig {
    /// Connection target with credentials and vhost kept as structured
    /// values, so reserved URI characters in them need no escaping
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: if self.use_tls {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString::default(),
        }
    }
}

impl StorageConfig {
    /// Endpoint with an explicit scheme
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else {
            let scheme = if self.use_tls { "https" } else { "http" };
            format!("{scheme}://{}", self.endpoint)
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: default_broker_user(),
            password: default_broker_user(),
            vhost: default_vhost(),
            use_tls: false,
            consumer_tag: default_consumer_tag(),
            inbound: InboundBinding::default(),
            outbound: OutboundTarget::default(),
        }
    }
}

impl Default for InboundBinding {
    fn default() -> Self {
        Self {
            exchange: "adaptation-exchange".to_string(),
            routing_key: "adaptation-request".to_string(),
            queue: "adaptation-request-queue".to_string(),
        }
    }
}

impl Default for OutboundTarget {
    fn default() -> Self {
        Self {
            exchange: "processing-exchange".to_string(),
            routing_key: "processing-request".to_string(),
            queue: Some("processing-queue".to_string()),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            upload_timeout_secs: default_upload_timeout_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
            failure_policy: FailurePolicy::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
        [storage]
        endpoint = "minio:9000"
        source_bucket = "sources"
    "#;

    fn builder(toml: &str) -> ConfigBuilder<DefaultState> {
        config::Config::builder().add_source(File::from_str(toml, FileFormat::Toml))
    }

    #[test]
    fn test_default_values() {
        let config = Config::from_builder(builder(MINIMAL)).unwrap();

        assert_eq!(config.broker.inbound.queue, "adaptation-request-queue");
        assert_eq!(config.broker.outbound.exchange, "processing-exchange");
        assert_eq!(config.broker.outbound.routing_key, "processing-request");
        assert_eq!(config.presigned_url_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.relay.failure_policy, FailurePolicy::Drop);
        assert_eq!(config.relay.max_in_flight, 16);
        assert_eq!(config.buckets(), vec!["sources"]);
    }

    #[test]
    fn test_missing_source_bucket_is_rejected() {
        let result = Config::from_builder(builder(
            r#"
            [storage]
            endpoint = "minio:9000"
            "#,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_limits() {
        let zero_concurrency = format!("{MINIMAL}\n[relay]\nmax_in_flight = 0\n");
        assert!(Config::from_builder(builder(&zero_concurrency)).is_err());

        let long_ttl = r#"
            [storage]
            endpoint = "minio:9000"
            source_bucket = "sources"
            presigned_url_ttl_secs = 604801
        "#;
        assert!(Config::from_builder(builder(long_ttl)).is_err());

        let small_parts = r#"
            [storage]
            endpoint = "minio:9000"
            source_bucket = "sources"
            part_size_bytes = 1024
        "#;
        assert!(Config::from_builder(builder(small_parts)).is_err());
    }

    #[test]
    fn test_legacy_env_overrides_files() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ADAPTATION_REQUEST_QUEUE_HOSTNAME", "rabbitmq"),
            ("ADAPTATION_REQUEST_QUEUE_PORT", "5673"),
            ("MINIO_SOURCE_BUCKET", "legacy-sources"),
            ("MINIO_CLEAN_BUCKET", "legacy-clean"),
            ("MINIO_USE_TLS", "true"),
            ("INPUT_MOUNT", "/var/input"),
            ("MESSAGE_BROKER_USER", ""),
        ]);

        let builder = with_legacy_env(builder(MINIMAL), |name| {
            env.get(name).map(|v| v.to_string())
        })
        .unwrap();
        let config = Config::from_builder(builder).unwrap();

        assert_eq!(config.broker.host, "rabbitmq");
        assert_eq!(config.broker.port, 5673);
        // Empty variables are ignored
        assert_eq!(config.broker.username, "guest");
        assert_eq!(config.storage.source_bucket, "legacy-sources");
        assert!(config.storage.use_tls);
        assert_eq!(config.storage.input_mount, Some(PathBuf::from("/var/input")));
        assert_eq!(config.buckets(), vec!["legacy-sources", "legacy-clean"]);
    }

    #[test]
    fn test_failure_policy_parsing() {
        let toml = format!("{MINIMAL}\n[relay]\nfailure_policy = \"dead_letter\"\n");
        let config = Config::from_builder(builder(&toml)).unwrap();
        assert_eq!(config.relay.failure_policy, FailurePolicy::DeadLetter);
    }

    #[test]
    fn test_broker_uri() {
        let mut broker = BrokerConfig::default();
        let uri = broker.amqp_uri();
        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.vhost, "/");

        broker.use_tls = true;
        broker.vhost = "pipeline".to_string();
        broker.port = 5671;
        let uri = broker.amqp_uri();
        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.vhost, "pipeline");
    }

    #[test]
    fn test_broker_credentials_with_reserved_characters() {
        let broker = BrokerConfig {
            username: "relay:svc".to_string(),
            password: "p@ss/w#rd:1?".to_string(),
            vhost: "team/a".to_string(),
            ..BrokerConfig::default()
        };

        let uri = broker.amqp_uri();
        assert_eq!(uri.authority.userinfo.username, "relay:svc");
        assert_eq!(uri.authority.userinfo.password, "p@ss/w#rd:1?");
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "team/a");
    }

    #[test]
    fn test_relay_env_overrides_files() {
        let env = HashMap::from([
            ("RELAY__BROKER__HOST".to_string(), "rabbit-env".to_string()),
            ("RELAY__RELAY__MAX_IN_FLIGHT".to_string(), "4".to_string()),
            ("RELAY__RELAY__FAILURE_POLICY".to_string(), "requeue".to_string()),
            ("RELAY__STORAGE__SOURCE_BUCKET".to_string(), "env-sources".to_string()),
        ]);
        let toml = format!("{MINIMAL}\n[broker]\nhost = \"rabbit-file\"\nport = 5673\n");

        let builder = builder(&toml).add_source(environment().source(Some(env)));
        let config = Config::from_builder(builder).unwrap();

        assert_eq!(config.broker.host, "rabbit-env");
        // Keys the environment does not set still come from the file
        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.relay.max_in_flight, 4);
        assert_eq!(config.relay.failure_policy, FailurePolicy::Requeue);
        assert_eq!(config.storage.source_bucket, "env-sources");
    }

    #[test]
    fn test_legacy_env_overrides_relay_env() {
        let env = HashMap::from([(
            "RELAY__BROKER__HOST".to_string(),
            "rabbit-env".to_string(),
        )]);
        let builder = builder(MINIMAL).add_source(environment().source(Some(env)));

        let builder = with_legacy_env(builder, |name| {
            (name == "ADAPTATION_REQUEST_QUEUE_HOSTNAME").then(|| "rabbit-legacy".to_string())
        })
        .unwrap();
        let config = Config::from_builder(builder).unwrap();

        assert_eq!(config.broker.host, "rabbit-legacy");
    }

    #[test]
    fn test_storage_endpoint_url() {
        let config = Config::from_builder(builder(MINIMAL)).unwrap();
        assert_eq!(config.storage.endpoint_url(), "http://minio:9000");

        let mut storage = config.storage.clone();
        storage.use_tls = true;
        assert_eq!(storage.endpoint_url(), "https://minio:9000");

        storage.endpoint = "http://localhost:9000".to_string();
        assert_eq!(storage.endpoint_url(), "http://localhost:9000");
    }
}
