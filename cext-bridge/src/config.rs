//! Bridge Configuration
//!
//! Configuration for the native-extension bridge. Configuration can be set
//! programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `CEXT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `CEXT_MAX_NATIVE_MEMORY` | Native memory ceiling in bytes (0 = unlimited) | 0 |
//! | `CEXT_COLLECTION_RETRIES` | Collection rounds before reporting out-of-memory | 17 |
//! | `CEXT_COLLECTION_BACKOFF_MS` | Delay added per collection round | 50 |
//! | `CEXT_TRACE_NATIVE_MEMORY` | Check native accesses against the ledger | false |
//! | `CEXT_STRICT_MEMORY_DIAGNOSTICS` | Return ledger diagnostics as errors | false |
//! | `CEXT_NATIVE_MODULES` | Load the backend in native form | true |
//! | `CEXT_NATIVE_ACCESS` | Native access is permitted | true |
//! | `CEXT_ALTERNATE_CALLING_CONVENTION` | Mark closure signatures with the alternate dialect | false |
//! | `CEXT_HOME` | Directory holding the backend library | `.` |
//! | `CEXT_BACKEND_LIBRARY` | File name of the backend library | platform specific |
//! | `CEXT_INSTALL_FINALIZER` | Register the backend finalizer as a shutdown hook | true |
//! | `CEXT_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `CEXT_LOG_FORMAT` | Log format (plain/json) | plain |
//!
//! # Example
//!
//! ```rust,ignore
//! use cext_bridge::config::BridgeConfig;
//!
//! let config = BridgeConfig::from_env();
//!
//! let config = BridgeConfig::builder()
//!     .max_native_memory(512 * 1024 * 1024)
//!     .native_modules(false)
//!     .build()?;
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Log level for bridge logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to the directive string understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable text.
    #[default]
    Plain,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// What the ledger does with double frees, untracked frees and invalid
/// accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagnosticPolicy {
    /// Log the diagnostic and continue (default).
    #[default]
    Log,
    /// Log the diagnostic and return it as an error.
    Strict,
}

/// Native memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Native memory ceiling in bytes.
    /// 0 means unlimited (default).
    pub max_native_memory: u64,

    /// Collection rounds attempted before giving up on a reservation.
    /// Default: 17.
    pub collection_retries: u32,

    /// Delay added to the pause after each collection round.
    /// Default: 50ms.
    pub collection_backoff: Duration,

    /// Check native accesses against the ledger.
    /// Default: false.
    pub trace_native_memory: bool,

    /// Ledger diagnostic policy.
    /// Default: Log.
    pub diagnostics: DiagnosticPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_native_memory: 0, // Unlimited
            collection_retries: 17,
            collection_backoff: Duration::from_millis(50),
            trace_native_memory: false,
            diagnostics: DiagnosticPolicy::Log,
        }
    }
}

/// Backend and extension loading configuration.
#[derive(Debug, Clone)]
pub struct LoadingConfig {
    /// Load the backend in native form when possible.
    /// Default: true.
    pub native_modules: bool,

    /// Native access is permitted for this context.
    /// Default: true.
    pub native_access_allowed: bool,

    /// Mark parsed closure signatures with the alternate calling dialect.
    /// Default: false.
    pub alternate_calling_convention: bool,

    /// Directory containing the backend library.
    /// Default: current directory.
    pub backend_home: PathBuf,

    /// File name of the backend library.
    pub backend_library: String,

    /// Backend init entrypoint.
    /// Default: `initialize_capi`.
    pub backend_init_symbol: String,

    /// Optional backend symbol returning the finalizer pointer array.
    /// Default: `get_finalize_capi_pointer_array`.
    pub finalize_symbol: String,

    /// Prefix of extension module init entrypoints.
    /// Default: `PyInit_`.
    pub module_init_prefix: String,

    /// Register the backend finalizer as a process shutdown hook.
    /// Default: true.
    pub install_native_finalizer: bool,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            native_modules: true,
            native_access_allowed: true,
            alternate_calling_convention: false,
            backend_home: PathBuf::from("."),
            backend_library: default_backend_library(),
            backend_init_symbol: "initialize_capi".into(),
            finalize_symbol: "get_finalize_capi_pointer_array".into(),
            module_init_prefix: "PyInit_".into(),
            install_native_finalizer: true,
        }
    }
}

impl LoadingConfig {
    /// Full path of the backend library.
    pub fn backend_path(&self) -> PathBuf {
        self.backend_home.join(&self.backend_library)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Output format.
    /// Default: Plain.
    pub format: LogFormat,
}

/// Complete bridge configuration.
///
/// Use `BridgeConfig::default()` for sensible defaults, or
/// `BridgeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Native memory configuration.
    pub memory: MemoryConfig,

    /// Loading configuration.
    pub loading: LoadingConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl BridgeConfig {
    /// Create a new builder for BridgeConfig.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or unparsable keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Memory configuration
        if let Some(val) = parse_env_u64("CEXT_MAX_NATIVE_MEMORY") {
            config.memory.max_native_memory = val;
        }

        if let Some(val) = parse_env_u64("CEXT_COLLECTION_RETRIES") {
            if val > 0 {
                config.memory.collection_retries = u32::try_from(val).unwrap_or(u32::MAX);
            }
        }

        if let Some(val) = parse_env_u64("CEXT_COLLECTION_BACKOFF_MS") {
            config.memory.collection_backoff = Duration::from_millis(val);
        }

        if let Some(val) = parse_env_bool("CEXT_TRACE_NATIVE_MEMORY") {
            config.memory.trace_native_memory = val;
        }

        if let Some(val) = parse_env_bool("CEXT_STRICT_MEMORY_DIAGNOSTICS") {
            config.memory.diagnostics = if val {
                DiagnosticPolicy::Strict
            } else {
                DiagnosticPolicy::Log
            };
        }

        // Loading configuration
        if let Some(val) = parse_env_bool("CEXT_NATIVE_MODULES") {
            config.loading.native_modules = val;
        }

        if let Some(val) = parse_env_bool("CEXT_NATIVE_ACCESS") {
            config.loading.native_access_allowed = val;
        }

        if let Some(val) = parse_env_bool("CEXT_ALTERNATE_CALLING_CONVENTION") {
            config.loading.alternate_calling_convention = val;
        }

        if let Ok(val) = env::var("CEXT_HOME") {
            if !val.is_empty() {
                config.loading.backend_home = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CEXT_BACKEND_LIBRARY") {
            if !val.is_empty() {
                config.loading.backend_library = val;
            }
        }

        if let Some(val) = parse_env_bool("CEXT_INSTALL_FINALIZER") {
            config.loading.install_native_finalizer = val;
        }

        // Logging configuration
        if let Ok(val) = env::var("CEXT_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        if let Ok(val) = env::var("CEXT_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&val) {
                config.log.format = format;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.collection_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.collection_retries".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.loading.backend_library.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "loading.backend_library".into(),
                message: "must not be empty".into(),
            });
        }

        for (field, symbol) in [
            ("loading.backend_init_symbol", &self.loading.backend_init_symbol),
            ("loading.finalize_symbol", &self.loading.finalize_symbol),
            ("loading.module_init_prefix", &self.loading.module_init_prefix),
        ] {
            if symbol.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    message: "must not be empty".into(),
                });
            }
            if symbol.contains('\0') {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    message: "must not contain a null byte".into(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for BridgeConfig.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the native memory ceiling (0 = unlimited).
    pub fn max_native_memory(mut self, bytes: u64) -> Self {
        self.config.memory.max_native_memory = bytes;
        self
    }

    /// Set the number of collection rounds before out-of-memory.
    pub fn collection_retries(mut self, retries: u32) -> Self {
        self.config.memory.collection_retries = retries;
        self
    }

    /// Set the per-round collection backoff step.
    pub fn collection_backoff(mut self, step: Duration) -> Self {
        self.config.memory.collection_backoff = step;
        self
    }

    /// Enable or disable native access checking.
    pub fn trace_native_memory(mut self, enabled: bool) -> Self {
        self.config.memory.trace_native_memory = enabled;
        self
    }

    /// Set the ledger diagnostic policy.
    pub fn diagnostics(mut self, policy: DiagnosticPolicy) -> Self {
        self.config.memory.diagnostics = policy;
        self
    }

    /// Enable or disable the native backend form.
    pub fn native_modules(mut self, enabled: bool) -> Self {
        self.config.loading.native_modules = enabled;
        self
    }

    /// Allow or forbid native access.
    pub fn native_access_allowed(mut self, allowed: bool) -> Self {
        self.config.loading.native_access_allowed = allowed;
        self
    }

    /// Toggle the alternate calling dialect for closure signatures.
    pub fn alternate_calling_convention(mut self, enabled: bool) -> Self {
        self.config.loading.alternate_calling_convention = enabled;
        self
    }

    /// Set the directory holding the backend library.
    pub fn backend_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.config.loading.backend_home = home.into();
        self
    }

    /// Set the backend library file name.
    pub fn backend_library(mut self, name: impl Into<String>) -> Self {
        self.config.loading.backend_library = name.into();
        self
    }

    /// Set the backend init entrypoint.
    pub fn backend_init_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.config.loading.backend_init_symbol = symbol.into();
        self
    }

    /// Set the backend finalizer-array entrypoint.
    pub fn finalize_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.config.loading.finalize_symbol = symbol.into();
        self
    }

    /// Set the extension init entrypoint prefix.
    pub fn module_init_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.loading.module_init_prefix = prefix.into();
        self
    }

    /// Enable or disable registering the backend finalizer.
    pub fn install_native_finalizer(mut self, enabled: bool) -> Self {
        self.config.loading.install_native_finalizer = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<BridgeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> BridgeConfig {
        self.config
    }
}

/// Platform file name of the native backend.
fn default_backend_library() -> String {
    format!(
        "{}capi-native{}",
        env::consts::DLL_PREFIX,
        env::consts::DLL_SUFFIX
    )
}

/// Parse an environment variable as u64.
fn parse_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| {
        match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}
