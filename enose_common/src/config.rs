//! Configuration loading traits and the instrument configuration.
//!
//! One `enose.toml` file carries every option the core recognizes: link
//! endpoints, bottle geometry, stability defaults, consumable lifetimes and
//! runner policies. Parsing is strict (`deny_unknown_fields`) and every
//! numeric field is bounds-checked by [`EnoseConfig::validate`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::consts::{MOTION_ACK_TIMEOUT_MS, PUMP_COUNT};

/// Log level for configuration.
///
/// Serializes to lowercase strings: "trace", "debug", "info", "warn", "error".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level verbosity.
    Trace,
    /// Debug-level verbosity.
    Debug,
    /// Info-level verbosity (default).
    #[default]
    Info,
    /// Warning-level verbosity.
    Warn,
    /// Error-level verbosity.
    Error,
}

impl LogLevel {
    /// The equivalent `tracing` filter directive.
    pub const fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Unknown field in TOML (strict parsing with `deny_unknown_fields`).
    #[error("Unknown field: {0}")]
    UnknownField(String),
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
/// - Returns `ConfigError::UnknownField` for fields rejected by strict parsing
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("unknown field") {
                ConfigError::UnknownField(format!("{}: {}", path.display(), msg))
            } else {
                ConfigError::ParseError(format!("{}: {}", path.display(), msg))
            }
        })
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

// ─── Link Endpoints ────────────────────────────────────────────────

/// Motion-controller link endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotionConfig {
    /// Controller host.
    pub host: String,
    /// Controller TCP port.
    pub port: u16,
    /// Acknowledgement window per command [ms].
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_ack_timeout_ms() -> u64 {
    MOTION_ACK_TIMEOUT_MS
}

/// Sensor firmware link: two serial ports with live failover.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    /// Primary serial port name.
    pub primary_port: String,
    /// Secondary serial port name.
    pub secondary_port: String,
    /// Baud rate for both ports.
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Reply window per command [ms].
    #[serde(default = "default_sensor_reply_ms")]
    pub reply_timeout_ms: u64,
}

fn default_baud() -> u32 {
    115_200
}
fn default_sensor_reply_ms() -> u64 {
    1_000
}

/// RPC surface endpoint. Recognized by the core, served elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcConfig {
    /// Listen endpoint, e.g. `0.0.0.0:50051`.
    pub listen: String,
}

/// Time-series store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Connection string.
    pub dsn: String,
    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_pool_size() -> u32 {
    4
}

// ─── Instrument Geometry & Feedback Defaults ───────────────────────

/// Sample-bottle geometry and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BottleConfig {
    /// Bottle capacity [ml].
    pub capacity_ml: f64,
    /// Maximum permitted fill per injection program [ml].
    pub max_fill_ml: f64,
    /// Configured empty tare [g].
    #[serde(default)]
    pub empty_tare_g: f64,
}

/// Load-cell stability defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StabilityConfig {
    /// Sliding window for the stability detector [s].
    #[serde(default = "default_window_s")]
    pub window_s: f64,
    /// Peak-to-peak tolerance within the window [g].
    #[serde(default = "default_tolerance_g")]
    pub tolerance_g: f64,
    /// Sampling period [ms].
    #[serde(default = "default_sample_period_ms")]
    pub sample_period_ms: u64,
    /// Default timeout for empty-bottle waits [s].
    #[serde(default = "default_wait_timeout_s")]
    pub wait_timeout_s: f64,
}

fn default_window_s() -> f64 {
    3.0
}
fn default_tolerance_g() -> f64 {
    0.2
}
fn default_sample_period_ms() -> u64 {
    crate::consts::LOAD_CELL_PERIOD_MS
}
fn default_wait_timeout_s() -> f64 {
    60.0
}

/// Injection defaults and the component→pump mapping origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionConfig {
    /// First pump index used by positional component mapping.
    #[serde(default)]
    pub pump_offset: u8,
    /// Tube-travel to volume conversion [ml per mm].
    #[serde(default = "default_mm_to_ml")]
    pub mm_to_ml: f64,
    /// Default pump speed [mm/s].
    #[serde(default = "default_speed")]
    pub default_speed_mm_s: f64,
    /// Default pump acceleration [mm/s²].
    #[serde(default = "default_accel")]
    pub default_accel_mm_s2: f64,
    /// Give up waiting for the weight target after this long [s].
    #[serde(default = "default_stable_timeout_s")]
    pub stable_timeout_s: f64,
}

fn default_mm_to_ml() -> f64 {
    1.0
}
fn default_speed() -> f64 {
    0.5
}
fn default_accel() -> f64 {
    10.0
}
fn default_stable_timeout_s() -> f64 {
    120.0
}

// ─── Runner Policies ───────────────────────────────────────────────

/// What the runner does when a step's preconditions fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreconditionPolicy {
    /// Skip the step and continue.
    Skip,
    /// Surface the failure and end the run as an error.
    #[default]
    Abort,
}

/// What the runner does when the recorder signals overload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverloadPolicy {
    /// Pause between steps until the recorder drains.
    #[default]
    Pause,
    /// Abort the run.
    Abort,
}

/// Runner behavior switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunnerConfig {
    /// Policy on precondition failure.
    pub on_precondition_failure: PreconditionPolicy,
    /// Refuse injections when a charged consumable is critical.
    pub block_on_critical: bool,
    /// Treat a wash fill-phase timeout as a step failure instead of
    /// counting the cycle as completed.
    pub wash_fill_timeout_is_error: bool,
    /// Policy when the recorder signals overload.
    pub overload_policy: OverloadPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            on_precondition_failure: PreconditionPolicy::default(),
            block_on_critical: true,
            wash_fill_timeout_is_error: false,
            overload_policy: OverloadPolicy::default(),
        }
    }
}

// ─── Consumables ───────────────────────────────────────────────────

/// How a consumable's usage is accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumableKind {
    /// Charged by cumulative injected volume [ml].
    Volume,
    /// Charged by wall-clock operation time [s].
    Time,
}

/// Lifetime and thresholds of one wear item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumableSpec {
    /// Counter id, e.g. `pump_tube_2` or `inlet_filter`.
    pub id: String,
    /// Charging family.
    pub kind: ConsumableKind,
    /// Design lifetime in the kind's unit.
    pub lifetime: f64,
    /// Warning threshold as a fraction of lifetime.
    #[serde(default = "default_warning_at")]
    pub warning_at: f64,
    /// Critical threshold as a fraction of lifetime.
    #[serde(default = "default_critical_at")]
    pub critical_at: f64,
}

fn default_warning_at() -> f64 {
    0.8
}
fn default_critical_at() -> f64 {
    0.95
}

// ─── Top-Level Config ──────────────────────────────────────────────

/// Complete instrument configuration — loaded from `enose.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnoseConfig {
    /// Log verbosity for the binary's subscriber.
    #[serde(default)]
    pub log_level: LogLevel,
    /// Motion-controller link.
    pub motion: MotionConfig,
    /// Sensor firmware link.
    pub sensor: SensorConfig,
    /// RPC endpoint (recognized, not served by the core).
    #[serde(default)]
    pub rpc: Option<RpcConfig>,
    /// Time-series store.
    pub store: StoreConfig,
    /// Bottle geometry.
    pub bottle: BottleConfig,
    /// Load-cell stability defaults.
    #[serde(default = "StabilityConfig::builtin")]
    pub stability: StabilityConfig,
    /// Injection defaults.
    #[serde(default = "InjectionConfig::builtin")]
    pub injection: InjectionConfig,
    /// Runner policies.
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Consumable lifetimes.
    #[serde(default)]
    pub consumables: Vec<ConsumableSpec>,
}

impl StabilityConfig {
    /// Built-in defaults, used when the section is omitted.
    pub fn builtin() -> Self {
        Self {
            window_s: default_window_s(),
            tolerance_g: default_tolerance_g(),
            sample_period_ms: default_sample_period_ms(),
            wait_timeout_s: default_wait_timeout_s(),
        }
    }
}

impl InjectionConfig {
    /// Built-in defaults, used when the section is omitted.
    pub fn builtin() -> Self {
        Self {
            pump_offset: 0,
            mm_to_ml: default_mm_to_ml(),
            default_speed_mm_s: default_speed(),
            default_accel_mm_s2: default_accel(),
            stable_timeout_s: default_stable_timeout_s(),
        }
    }
}

impl EnoseConfig {
    /// Validate all fields against allowed bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.motion.ack_timeout_ms == 0 || self.motion.ack_timeout_ms > 60_000 {
            return Err(ConfigError::ValidationError(format!(
                "motion.ack_timeout_ms={} out of range [1, 60000]",
                self.motion.ack_timeout_ms
            )));
        }
        if self.sensor.primary_port == self.sensor.secondary_port {
            return Err(ConfigError::ValidationError(
                "sensor.primary_port and secondary_port must differ".to_string(),
            ));
        }
        if self.bottle.capacity_ml <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "bottle.capacity_ml={} must be > 0",
                self.bottle.capacity_ml
            )));
        }
        if self.bottle.max_fill_ml <= 0.0 || self.bottle.max_fill_ml > self.bottle.capacity_ml {
            return Err(ConfigError::ValidationError(format!(
                "bottle.max_fill_ml={} out of range (0, capacity={}]",
                self.bottle.max_fill_ml, self.bottle.capacity_ml
            )));
        }
        if self.stability.window_s <= 0.0 || self.stability.window_s > 60.0 {
            return Err(ConfigError::ValidationError(format!(
                "stability.window_s={} out of range (0, 60]",
                self.stability.window_s
            )));
        }
        if self.stability.sample_period_ms == 0 || self.stability.sample_period_ms > 1_000 {
            return Err(ConfigError::ValidationError(format!(
                "stability.sample_period_ms={} out of range [1, 1000]",
                self.stability.sample_period_ms
            )));
        }
        let window_samples =
            (self.stability.window_s * 1_000.0 / self.stability.sample_period_ms as f64) as usize;
        if window_samples > crate::consts::WINDOW_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "stability window needs {window_samples} samples, capacity is {}",
                crate::consts::WINDOW_CAPACITY
            )));
        }
        if self.stability.tolerance_g <= 0.0 {
            return Err(ConfigError::ValidationError(
                "stability.tolerance_g must be > 0".to_string(),
            ));
        }
        if usize::from(self.injection.pump_offset) >= PUMP_COUNT {
            return Err(ConfigError::ValidationError(format!(
                "injection.pump_offset={} out of range [0, {}]",
                self.injection.pump_offset,
                PUMP_COUNT - 1
            )));
        }
        if self.injection.mm_to_ml <= 0.0 {
            return Err(ConfigError::ValidationError(
                "injection.mm_to_ml must be > 0".to_string(),
            ));
        }
        if self.injection.default_speed_mm_s <= 0.0 {
            return Err(ConfigError::ValidationError(
                "injection.default_speed_mm_s must be > 0".to_string(),
            ));
        }
        if self.injection.default_accel_mm_s2 <= 0.0 {
            return Err(ConfigError::ValidationError(
                "injection.default_accel_mm_s2 must be > 0".to_string(),
            ));
        }
        if self.store.pool_size == 0 || self.store.pool_size > 64 {
            return Err(ConfigError::ValidationError(format!(
                "store.pool_size={} out of range [1, 64]",
                self.store.pool_size
            )));
        }
        for c in &self.consumables {
            if c.lifetime <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "consumable '{}': lifetime must be > 0",
                    c.id
                )));
            }
            if !(0.0..1.0).contains(&c.warning_at)
                || !(0.0..=1.0).contains(&c.critical_at)
                || c.warning_at >= c.critical_at
            {
                return Err(ConfigError::ValidationError(format!(
                    "consumable '{}': thresholds must satisfy 0 < warning_at < critical_at <= 1",
                    c.id
                )));
            }
        }
        Ok(())
    }

    /// Configuration for tests and simulation runs. No hardware endpoints
    /// are contacted when the sim links are used, but the fields must
    /// still validate.
    pub fn for_testing() -> Self {
        Self {
            log_level: LogLevel::Debug,
            motion: MotionConfig {
                host: "localhost".to_string(),
                port: 7125,
                ack_timeout_ms: 200,
            },
            sensor: SensorConfig {
                primary_port: "/dev/ttyUSB0".to_string(),
                secondary_port: "/dev/ttyUSB1".to_string(),
                baud: default_baud(),
                reply_timeout_ms: 200,
            },
            rpc: None,
            store: StoreConfig {
                dsn: "memory://".to_string(),
                pool_size: 1,
            },
            bottle: BottleConfig {
                capacity_ml: 50.0,
                max_fill_ml: 20.0,
                empty_tare_g: 0.0,
            },
            stability: StabilityConfig {
                window_s: 0.3,
                tolerance_g: 0.2,
                sample_period_ms: 10,
                wait_timeout_s: 5.0,
            },
            injection: InjectionConfig::builtin(),
            runner: RunnerConfig::default(),
            consumables: default_consumables(),
        }
    }
}

/// The standard consumable set: one tube per pump, inlet filter, cleaning
/// pump.
pub fn default_consumables() -> Vec<ConsumableSpec> {
    let mut out: Vec<ConsumableSpec> = (0..PUMP_COUNT)
        .map(|i| ConsumableSpec {
            id: format!("pump_tube_{i}"),
            kind: ConsumableKind::Volume,
            lifetime: 10_000.0,
            warning_at: default_warning_at(),
            critical_at: default_critical_at(),
        })
        .collect();
    out.push(ConsumableSpec {
        id: "inlet_filter".to_string(),
        kind: ConsumableKind::Time,
        lifetime: 360_000.0,
        warning_at: default_warning_at(),
        critical_at: default_critical_at(),
    });
    out.push(ConsumableSpec {
        id: "clean_pump".to_string(),
        kind: ConsumableKind::Time,
        lifetime: 180_000.0,
        warning_at: default_warning_at(),
        critical_at: default_critical_at(),
    });
    out
}
