use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "EUR";
const DEFAULT_COUNTRY_CODE: &str = "NL";
const DEFAULT_SHOPPER_LOCALE: &str = "nl-NL";
const DEFAULT_PSP_CHECKOUT_URL: &str = "https://checkout-test.adyen.com/v52";
const DEFAULT_PSP_MODIFICATION_URL: &str = "https://pal-test.adyen.com/pal/servlet/Payment/v52";
const DEFAULT_PSP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CORRELATION_TTL_SECS: u64 = 10_800; // 3 hours
const DEFAULT_CORRELATION_PURGE_INTERVAL_SECS: u64 = 600;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Request timeout applied by the HTTP server (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Currency carried on every amount sent to the PSP
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Country code sent with payment requests
    #[serde(default = "default_country_code")]
    pub country_code: String,

    /// Shopper locale sent with payment requests
    #[serde(default = "default_shopper_locale")]
    pub shopper_locale: String,

    /// PSP API key for the checkout API
    pub psp_api_key: String,

    /// PSP merchant account identifier
    pub psp_merchant_account: String,

    /// PSP client-side key, relayed to the front end widget
    #[serde(default)]
    pub psp_client_key: Option<String>,

    /// Base URL of the PSP checkout API
    #[serde(default = "default_psp_checkout_url")]
    pub psp_checkout_url: String,

    /// Base URL of the PSP modification (cancel/refund) API
    #[serde(default = "default_psp_modification_url")]
    pub psp_modification_url: String,

    /// Timeout for outbound PSP calls (seconds)
    #[serde(default = "default_psp_timeout_secs")]
    pub psp_timeout_secs: u64,

    /// Hex-encoded HMAC key for verifying PSP notification signatures
    #[serde(default)]
    pub psp_hmac_key: Option<String>,

    /// How long a redirect correlation entry stays valid (seconds)
    #[serde(default = "default_correlation_ttl_secs")]
    pub correlation_ttl_secs: u64,

    /// How often expired correlation entries are purged (seconds)
    #[serde(default = "default_correlation_purge_interval_secs")]
    pub correlation_purge_interval_secs: u64,
}

impl AppConfig {
    /// Creates a new configuration
    pub fn new(
        database_url: String,
        psp_api_key: String,
        psp_merchant_account: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            default_currency: default_currency(),
            country_code: default_country_code(),
            shopper_locale: default_shopper_locale(),
            psp_api_key,
            psp_merchant_account,
            psp_client_key: None,
            psp_checkout_url: default_psp_checkout_url(),
            psp_modification_url: default_psp_modification_url(),
            psp_timeout_secs: default_psp_timeout_secs(),
            psp_hmac_key: None,
            correlation_ttl_secs: default_correlation_ttl_secs(),
            correlation_purge_interval_secs: default_correlation_purge_interval_secs(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        // Outside development an unverifiable refund notification would be
        // silently dropped, so the key is mandatory there.
        if !self.is_development() && self.psp_hmac_key.as_deref().map_or(true, str::is_empty) {
            let mut err = ValidationError::new("psp_hmac_key_required");
            err.message = Some(
                "Set APP__PSP_HMAC_KEY for non-development environments so notification signatures can be verified".into(),
            );
            errors.add("psp_hmac_key", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_country_code() -> String {
    DEFAULT_COUNTRY_CODE.to_string()
}

fn default_shopper_locale() -> String {
    DEFAULT_SHOPPER_LOCALE.to_string()
}

fn default_psp_checkout_url() -> String {
    DEFAULT_PSP_CHECKOUT_URL.to_string()
}

fn default_psp_modification_url() -> String {
    DEFAULT_PSP_MODIFICATION_URL.to_string()
}

fn default_psp_timeout_secs() -> u64 {
    DEFAULT_PSP_TIMEOUT_SECS
}

fn default_correlation_ttl_secs() -> u64 {
    DEFAULT_CORRELATION_TTL_SECS
}

fn default_correlation_purge_interval_secs() -> u64 {
    DEFAULT_CORRELATION_PURGE_INTERVAL_SECS
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Docker config (config/docker.toml) if DOCKER env var is set
/// 4. Environment variables (APP_*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // NOTE: the PSP credentials have no defaults - they MUST be provided via
    // environment variables or a config file.
    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false));

    if env::var("DOCKER").is_ok() {
        info!("Docker environment detected");
        builder =
            builder.add_source(File::with_name(&format!("{}/docker", CONFIG_DIR)).required(false));
    }

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    // Check the PSP credentials before deserialization for a clear message
    for key in ["psp_api_key", "psp_merchant_account"] {
        if config.get_string(key).is_err() {
            error!(
                "PSP credential '{}' is not configured. Set APP__{} or add it to a config file.",
                key,
                key.to_uppercase()
            );
            return Err(AppConfigError::Load(ConfigError::NotFound(format!(
                "{} is required but not configured",
                key
            ))));
        }
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
