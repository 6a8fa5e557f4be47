//! Startup configuration, loaded from `MOKURO_ONLINE_*` environment
//! variables. There is no config-loading crate here: like the rest of
//! this codebase's env-driven settings, values are read directly with
//! `std::env::var` and parsed by hand.

use std::env;
use std::time::Duration;
use thiserror::Error;

const PREFIX: &str = "MOKURO_ONLINE_";

/// Deployment profile selected by `MOKURO_ONLINE_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Production,
    Development,
    Testing,
    Local,
}

impl Profile {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "production" => Profile::Production,
            "testing" => Profile::Testing,
            "local" => Profile::Local,
            _ => Profile::Development,
        }
    }

    /// Whether the OCR model singleton should be warmed eagerly at
    /// process start rather than lazily on first job.
    pub fn eager_warmup(&self) -> bool {
        matches!(self, Profile::Production)
    }
}

/// Which persistent backend the cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    /// File-backed SQLite database.
    Sqlite,
    /// Single-connection in-memory SQLite database.
    Memory,
}

impl CacheBackend {
    fn parse(raw: &str) -> Self {
        match raw {
            "SimpleCache" => CacheBackend::Memory,
            // "app.db.SqliteCache" and "FileSystemCache" both land on the
            // durable backend; a dedicated filesystem-backed cache never
            // shipped, it only ever resolved to the SQLite cache in
            // practice.
            _ => CacheBackend::Sqlite,
        }
    }
}

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub profile: Profile,
    pub cache_backend: CacheBackend,
    pub cache_path: String,
    pub cache_dir: String,
    pub cache_max_size: u64,
    pub cache_threshold: u64,
    pub cache_default_timeout: u64,
    pub cache_ignore_errors: bool,
    pub max_image_size: u64,
    pub strict_new_images: bool,
    pub executor_max_workers: usize,
    pub secret_key: String,
    pub bind_addr: String,
    pub static_dir: String,
}

impl Config {
    /// Load configuration from the environment. Fails only when
    /// `SECRET_KEY` is missing or empty; the process exits non-zero at
    /// startup rather than run without one.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = Profile::parse(&env_var("ENV").unwrap_or_default());

        let secret_key = env_var("SECRET_KEY").unwrap_or_default();
        if secret_key.trim().is_empty() {
            return Err(ConfigError::MissingSecretKey);
        }

        Ok(Self {
            profile,
            cache_backend: CacheBackend::parse(&env_var("OCR_CACHE_TYPE").unwrap_or_default()),
            cache_path: env_var("OCR_CACHE_PATH").unwrap_or_else(|| "mokuro_cache.db".to_string()),
            cache_dir: env_var("OCR_CACHE_DIR").unwrap_or_else(|| ".".to_string()),
            cache_max_size: env_num("OCR_CACHE_MAX_SIZE").unwrap_or(0),
            cache_threshold: env_num("OCR_CACHE_THRESHOLD").unwrap_or(0),
            cache_default_timeout: env_num("OCR_CACHE_DEFAULT_TIMEOUT").unwrap_or(0),
            cache_ignore_errors: env_bool("OCR_CACHE_IGNORE_ERRORS").unwrap_or(false),
            max_image_size: env_num("MAX_IMAGE_SIZE").unwrap_or(20 * 1024 * 1024),
            strict_new_images: env_bool("STRICT_NEW_IMAGES").unwrap_or(false),
            executor_max_workers: env_num("EXECUTOR_MAX_WORKERS").unwrap_or(1).max(1) as usize,
            secret_key,
            bind_addr: env_var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            static_dir: env_var("STATIC_DIR").unwrap_or_else(|| "static".to_string()),
        })
    }

    /// Configuration wired for `#[tokio::test]` integration tests: an
    /// in-memory cache, a non-empty dummy secret, strict mode off.
    pub fn for_tests() -> Self {
        Self {
            profile: Profile::Testing,
            cache_backend: CacheBackend::Memory,
            cache_path: ":memory:".to_string(),
            cache_dir: ".".to_string(),
            cache_max_size: 0,
            cache_threshold: 0,
            cache_default_timeout: 0,
            cache_ignore_errors: false,
            max_image_size: 20 * 1024 * 1024,
            strict_new_images: false,
            executor_max_workers: 1,
            secret_key: "test-secret".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            static_dir: "static".to_string(),
        }
    }

    pub fn cache_acquire_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

fn env_var(suffix: &str) -> Option<String> {
    env::var(format!("{PREFIX}{suffix}")).ok()
}

fn env_num(suffix: &str) -> Option<u64> {
    env_var(suffix).and_then(|v| v.parse().ok())
}

fn env_bool(suffix: &str) -> Option<bool> {
    env_var(suffix).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Startup configuration error. The only variant that exists today is
/// fatal: the process logs it and exits non-zero before serving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MOKURO_ONLINE_SECRET_KEY is required and must be non-empty")]
    MissingSecretKey,
}
