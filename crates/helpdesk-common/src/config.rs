//! Configuration for the helpdesk pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Attachment object storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Mailbox polling and push settings
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Spam scoring
    #[serde(default)]
    pub spam: SpamConfig,

    /// Thread reconstruction heuristics
    #[serde(default)]
    pub threading: ThreadingConfig,

    /// Attachment acceptance rules
    #[serde(default)]
    pub attachments: AttachmentConfig,

    /// Outbound delivery
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Webhook intake
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// OAuth2 client registrations
    #[serde(default)]
    pub oauth: OAuthConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend: only "fs" is supported
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Base path for local filesystem storage
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Base URL under which stored objects are served
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Secret used to sign download URLs
    #[serde(default)]
    pub signing_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
            public_base_url: default_public_base_url(),
            signing_secret: String::new(),
        }
    }
}

fn default_storage_backend() -> String {
    "fs".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/helpdesk/attachments")
}

fn default_public_base_url() -> String {
    "http://localhost:8080/files".to_string()
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Hash of the admin API token (Argon2 PHC string or SHA-256 hex)
    #[serde(default)]
    pub token_hash: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            cors_origins: Vec::new(),
            token_hash: None,
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Default polling interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Interval of the loop that brings new channels online
    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval_secs: u64,

    /// Maximum messages fetched per poll
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,

    /// Folder watched on every mailbox
    #[serde(default = "default_folder")]
    pub folder: String,

    /// Upper bound of a single IDLE wait
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Consecutive failures before a channel is marked degraded
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Ceiling for the per-channel reconnect backoff
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Optional endpoint notified after each ingested message
    #[serde(default)]
    pub forward_url: Option<String>,

    /// Secret for signing forwarded payloads
    #[serde(default)]
    pub forward_secret: Option<String>,

    /// Permit a forward endpoint on a private or loopback address
    #[serde(default)]
    pub forward_allow_private: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            supervisor_interval_secs: default_supervisor_interval(),
            fetch_limit: default_fetch_limit(),
            folder: default_folder(),
            idle_timeout_secs: default_idle_timeout(),
            failure_threshold: default_failure_threshold(),
            max_backoff_secs: default_max_backoff(),
            forward_url: None,
            forward_secret: None,
            forward_allow_private: false,
        }
    }
}

fn default_poll_interval() -> u64 {
    60
}

fn default_supervisor_interval() -> u64 {
    300
}

fn default_fetch_limit() -> usize {
    50
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_max_backoff() -> u64 {
    300
}

/// Spam configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamConfig {
    /// Score at or above which a message is spam (1-10)
    #[serde(default = "default_spam_threshold")]
    pub threshold: f64,

    /// Sender domains always treated as spam
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Sender domains that receive a score bias
    #[serde(default)]
    pub allowlist: Vec<String>,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            threshold: default_spam_threshold(),
            blacklist: Vec::new(),
            allowlist: Vec::new(),
        }
    }
}

impl SpamConfig {
    /// Threshold clamped to the supported range
    pub fn effective_threshold(&self) -> f64 {
        self.threshold.clamp(1.0, 10.0)
    }
}

fn default_spam_threshold() -> f64 {
    5.0
}

/// Thread reconstruction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadingConfig {
    /// Trailing window for subject matching, in days
    #[serde(default = "default_window_days")]
    pub window_days: i64,

    /// Minimum word-set overlap for two subjects to match
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Interval of the orphan regrouping sweep
    #[serde(default = "default_regroup_interval")]
    pub regroup_interval_secs: u64,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            similarity_threshold: default_similarity_threshold(),
            regroup_interval_secs: default_regroup_interval(),
        }
    }
}

fn default_window_days() -> i64 {
    7
}

fn default_similarity_threshold() -> f64 {
    0.7
}

fn default_regroup_interval() -> u64 {
    3600
}

/// Attachment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Maximum accepted attachment size in bytes
    #[serde(default = "default_max_attachment_size")]
    pub max_size: usize,

    /// Accepted content types
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,

    /// Age after which attachments are swept
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Attachments expected per inbound or outbound request, used to size
    /// HTTP body limits
    #[serde(default = "default_max_per_message")]
    pub max_per_message: usize,
}

impl AttachmentConfig {
    /// Largest JSON body that can carry `max_per_message` base64 attachments
    /// at the size cap, plus headroom for the rest of the payload
    pub fn request_body_limit(&self) -> usize {
        let encoded = self.max_size.saturating_add(2) / 3 * 4;
        encoded
            .saturating_mul(self.max_per_message.max(1))
            .saturating_add(1024 * 1024)
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_attachment_size(),
            allowed_types: default_allowed_types(),
            retention_days: default_retention_days(),
            max_per_message: default_max_per_message(),
        }
    }
}

fn default_max_per_message() -> usize {
    5
}

fn default_max_attachment_size() -> usize {
    10 * 1024 * 1024
}

fn default_allowed_types() -> Vec<String> {
    [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "application/pdf",
        "application/msword",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/vnd.ms-excel",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "application/vnd.ms-powerpoint",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "text/plain",
        "text/csv",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_retention_days() -> i64 {
    365
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Send attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base of the exponential backoff, in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// SMTP command timeout
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    2
}

fn default_smtp_timeout() -> u64 {
    30
}

/// Webhook intake configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookConfig {
    /// Shared HMAC-SHA256 secret; validation is skipped when unset
    #[serde(default)]
    pub secret: Option<String>,

    /// Reject unsigned intake when no secret is configured
    #[serde(default)]
    pub require_signature: bool,
}

/// OAuth2 client registrations per provider
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OAuthConfig {
    #[serde(default)]
    pub google: Option<OAuthClientConfig>,

    #[serde(default)]
    pub microsoft: Option<OAuthClientConfig>,

    /// Key signing the consent `state`; a per-process key is used when unset
    #[serde(default)]
    pub state_secret: Option<String>,
}

/// A registered OAuth2 client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,

    /// Override of the provider's consent endpoint
    #[serde(default)]
    pub auth_url: Option<String>,

    /// Override of the provider's token endpoint
    #[serde(default)]
    pub token_url: Option<String>,

    /// Override of the default scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Config {
    /// Load configuration from a file, with `HELPDESK__SECTION__KEY`
    /// environment overrides layered on top
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("HELPDESK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var("HELPDESK_CONFIG") {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("./helpdesk.toml"));
        paths.push(PathBuf::from("/etc/helpdesk/helpdesk.toml"));

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let ingestion = IngestionConfig::default();
        assert_eq!(ingestion.poll_interval_secs, 60);
        assert_eq!(ingestion.supervisor_interval_secs, 300);

        let threading = ThreadingConfig::default();
        assert_eq!(threading.window_days, 7);
        assert!((threading.similarity_threshold - 0.7).abs() < f64::EPSILON);

        let attachments = AttachmentConfig::default();
        assert_eq!(attachments.max_size, 10 * 1024 * 1024);
        assert!(attachments.allowed_types.contains(&"text/csv".to_string()));
        assert!(attachments.request_body_limit() > 5 * 10 * 1024 * 1024 * 4 / 3);

        let outbound = OutboundConfig::default();
        assert_eq!(outbound.max_attempts, 3);
    }

    #[test]
    fn test_spam_threshold_is_clamped() {
        let mut spam = SpamConfig::default();
        assert_eq!(spam.effective_threshold(), 5.0);
        spam.threshold = 42.0;
        assert_eq!(spam.effective_threshold(), 10.0);
        spam.threshold = 0.0;
        assert_eq!(spam.effective_threshold(), 1.0);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "support.example.com"

[database]
url = "postgres://localhost/helpdesk"

[spam]
threshold = 6.0
blacklist = ["spam.example"]

[oauth.google]
client_id = "id"
client_secret = "secret"
redirect_uri = "https://support.example.com/api/v1/oauth/callback"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.hostname, "support.example.com");
        assert_eq!(config.spam.blacklist, vec!["spam.example".to_string()]);
        assert_eq!(config.oauth.google.unwrap().client_id, "id");
        assert!(config.oauth.microsoft.is_none());
        assert_eq!(config.ingestion.folder, "INBOX");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[database]\nurl = \"postgres://db/helpdesk\"\n[ingestion]\npoll_interval_secs = 15"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.database.url, "postgres://db/helpdesk");
        assert_eq!(config.ingestion.poll_interval_secs, 15);
    }
}
