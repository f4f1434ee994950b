//! # Director Configuration
//!
//! ## Where Settings Come From
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Who Wins                                             │
//! │                                                                         │
//! │  1. FLEET_* variables (always win)                                     │
//! │     FLEET_COMMANDS_URL=https://mdm.example.com                         │
//! │     FLEET_COMMANDS_DIALECT=legacy                                      │
//! │                                                                         │
//! │  2. director.toml                                                      │
//! │     ~/.config/fleet-director/director.toml (Linux)                     │
//! │     ~/Library/Application Support/com.fleet.director/director.toml     │
//! │                                                                         │
//! │  3. Built-in defaults                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example `director.toml`
//! ```toml
//! [commands]
//! url = "https://mdm.example.com"
//! api_key = "secret"
//! dialect = "enqueue"          # enqueue | legacy
//!
//! [declarations]
//! url = "https://ddm.example.com"
//! api_key = "secret"
//! namespace = "com.example.director"
//! profile_base_url = "https://director.example.com/profiles"
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 500
//!
//! [scheduler]
//! delay_window_secs = 7200
//! debug = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::transport::RetryConfig;
use fleet_core::validation::validate_server_url;
use fleet_core::DEFAULT_DECLARATION_NAMESPACE;

// =============================================================================
// Command Dialect
// =============================================================================

/// Which wire dialect the downstream command server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandDialect {
    /// Structured enqueue API: plist command bodies, per-ID results.
    #[default]
    Enqueue,
    /// Legacy command server: JSON command bodies, no queue inspection.
    Legacy,
}

impl std::fmt::Display for CommandDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandDialect::Enqueue => write!(f, "enqueue"),
            CommandDialect::Legacy => write!(f, "legacy"),
        }
    }
}

impl std::str::FromStr for CommandDialect {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "enqueue" | "structured" => Ok(CommandDialect::Enqueue),
            "legacy" => Ok(CommandDialect::Legacy),
            _ => Err(SyncError::InvalidConfig(format!(
                "Unknown command dialect: {}",
                s
            ))),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Downstream command server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSettings {
    /// Base URL. No URL means no command client: sends fail with
    /// `ClientNotInitialized`.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub dialect: CommandDialect,
}

impl Default for CommandSettings {
    fn default() -> Self {
        CommandSettings {
            url: None,
            username: default_username(),
            api_key: String::new(),
            dialect: CommandDialect::default(),
        }
    }
}

/// Downstream declaration server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclarationSettings {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub api_key: String,

    /// Prefix of every declaration and set identifier.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Where devices download profile bytes from.
    #[serde(default)]
    pub profile_base_url: String,
}

impl Default for DeclarationSettings {
    fn default() -> Self {
        DeclarationSettings {
            url: None,
            username: default_username(),
            api_key: String::new(),
            namespace: default_namespace(),
            profile_base_url: String::new(),
        }
    }
}

/// Backoff for every downstream HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Additional attempts after the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Per-attempt request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            factor: default_factor(),
            max_delay_ms: default_max_delay(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Enrollment discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentSettings {
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Pages fetched concurrently per batch.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Restrict discovery to these enrollment types (empty = all).
    #[serde(default)]
    pub types: Vec<String>,

    #[serde(default)]
    pub enabled_only: bool,
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        EnrollmentSettings {
            page_size: default_page_size(),
            parallelism: default_parallelism(),
            refresh_interval_secs: default_refresh_interval(),
            types: Vec::new(),
            enabled_only: false,
        }
    }
}

/// Push scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Seconds between cycle starts.
    #[serde(default = "default_scheduler_interval")]
    pub interval_secs: u64,

    /// Window eligible pushes are spread across, and the expiry of each push.
    #[serde(default = "default_delay_window")]
    pub delay_window_secs: u64,

    /// Shortens the dedup window for testing.
    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_debug_unique")]
    pub debug_unique_secs: u64,

    #[serde(default = "default_startup_attempts")]
    pub startup_poll_attempts: u32,

    #[serde(default = "default_startup_interval")]
    pub startup_poll_interval_secs: u64,

    /// Push tasks run concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            interval_secs: default_scheduler_interval(),
            delay_window_secs: default_delay_window(),
            debug: false,
            debug_unique_secs: default_debug_unique(),
            startup_poll_attempts: default_startup_attempts(),
            startup_poll_interval_secs: default_startup_interval(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl SchedulerSettings {
    /// How long a submitted push suppresses resubmission for the same device.
    pub fn unique_for(&self) -> Duration {
        if self.debug {
            Duration::from_secs(self.debug_unique_secs)
        } else {
            Duration::from_secs(self.delay_window_secs)
        }
    }
}

/// Command queue policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Re-enrollment also forgets per-device profiles and applications.
    #[serde(default)]
    pub clear_on_enroll: bool,

    /// Seconds between dead-letter sweeps.
    #[serde(default = "default_expire_interval")]
    pub expire_interval_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            clear_on_enroll: false,
            expire_interval_secs: default_expire_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_username() -> String {
    "fleet".to_string()
}

fn default_namespace() -> String {
    DEFAULT_DECLARATION_NAMESPACE.to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    500
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_page_size() -> usize {
    100
}

fn default_parallelism() -> usize {
    4
}

fn default_refresh_interval() -> u64 {
    600
}

fn default_scheduler_interval() -> u64 {
    60
}

fn default_delay_window() -> u64 {
    7200
}

fn default_debug_unique() -> u64 {
    20
}

fn default_startup_attempts() -> u32 {
    30
}

fn default_startup_interval() -> u64 {
    10
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_expire_interval() -> u64 {
    3600
}

// =============================================================================
// Director Config
// =============================================================================

/// Complete director configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorConfig {
    #[serde(default)]
    pub commands: CommandSettings,

    #[serde(default)]
    pub declarations: DeclarationSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub enrollment: EnrollmentSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl DirectorConfig {
    /// Builds the director configuration.
    ///
    /// ## Precedence (lowest first)
    /// 1. Default values
    /// 2. Config file (director.toml)
    /// 3. `FLEET_*` environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading director config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "No director config file, starting from defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Like [`DirectorConfig::load`], but a broken file falls back to defaults with a warning.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load director config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Writes the configuration back as TOML, creating the directory if needed.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Director config saved");
        Ok(())
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(ref url) = self.commands.url {
            validate_server_url("commands.url", url)
                .map_err(|e| SyncError::InvalidUrl(e.to_string()))?;
        }

        if let Some(ref url) = self.declarations.url {
            validate_server_url("declarations.url", url)
                .map_err(|e| SyncError::InvalidUrl(e.to_string()))?;

            if self.declarations.profile_base_url.is_empty() {
                return Err(SyncError::InvalidConfig(
                    "declarations.profile_base_url is required when a declaration server is configured".into(),
                ));
            }
        }

        if self.declarations.namespace.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "declarations.namespace must not be empty".into(),
            ));
        }

        if self.enrollment.page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "enrollment.page_size must be greater than 0".into(),
            ));
        }

        if self.retry.factor < 1.0 {
            return Err(SyncError::InvalidConfig(
                "retry.factor must be at least 1.0".into(),
            ));
        }

        if self.scheduler.delay_window_secs == 0 || self.scheduler.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "scheduler intervals must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Overlays `FLEET_*` variables onto the parsed file.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("FLEET_COMMANDS_URL") {
            debug!(url = %url, "Overriding command server URL from environment");
            self.commands.url = Some(url);
        }

        if let Some(key) = lookup("FLEET_COMMANDS_API_KEY") {
            self.commands.api_key = key;
        }

        if let Some(dialect) = lookup("FLEET_COMMANDS_DIALECT") {
            match dialect.parse() {
                Ok(parsed) => self.commands.dialect = parsed,
                Err(_) => warn!(dialect = %dialect, "Unknown command dialect in environment"),
            }
        }

        if let Some(url) = lookup("FLEET_DECLARATIONS_URL") {
            debug!(url = %url, "Overriding declaration server URL from environment");
            self.declarations.url = Some(url);
        }

        if let Some(key) = lookup("FLEET_DECLARATIONS_API_KEY") {
            self.declarations.api_key = key;
        }

        if let Some(namespace) = lookup("FLEET_DECLARATIONS_NAMESPACE") {
            self.declarations.namespace = namespace;
        }

        if let Some(base) = lookup("FLEET_PROFILE_BASE_URL") {
            self.declarations.profile_base_url = base;
        }

        if let Some(path) = lookup("FLEET_DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }

        if let Some(debug) = lookup("FLEET_SCHEDULER_DEBUG") {
            self.scheduler.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }

        if let Some(clear) = lookup("FLEET_CLEAR_ON_ENROLL") {
            self.queue.clear_on_enroll = matches!(clear.as_str(), "1" | "true" | "yes");
        }
    }

    /// `<platform config dir>/fleet-director/director.toml`.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "fleet", "director")
            .map(|dirs| dirs.config_dir().join("director.toml"))
    }

    /// Database file, falling back to the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "fleet", "director")
                .map(|dirs| dirs.data_dir().join("director.db"))
                .unwrap_or_else(|| PathBuf::from("director.db"))
        })
    }
}
