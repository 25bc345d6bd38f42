//! Startup configuration.
//!
//! Every option is a flag with an environment fallback. Load and timer values
//! are parsed leniently: anything that does not parse is ignored and the
//! default applies.

use clap::Parser;
use serde::Serialize;

use crate::controller::{DrainPolicy, EngineConfig};
use crate::error::ConfigError;
use crate::lifecycle::TimerConfig;
use crate::models::{DynamicLoadState, LoadSettings, MAX_CPU_LOAD_PERCENT};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CRASH_AFTER_MS: i64 = 5000;
pub const DEFAULT_SHUTDOWN_AFTER_MS: i64 = 10000;

/// Environment variables shown on the overview page.
pub const CONFIG_VARS: [&str; 8] = [
    "CPU_LOAD_PERCENT",
    "MEMORY_MB",
    "DURATION_SEC",
    "PORT",
    "CRASH",
    "CRASH_AFTER_TIME_MS",
    "SHUTDOWN",
    "SHUTDOWN_AFTER_TIME_MS",
];

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "loadsim",
    version,
    about = "Synthetic CPU/memory load and failure injection server"
)]
pub struct Cli {
    #[arg(long, env = "HOST")]
    pub host: Option<String>,
    #[arg(long, env = "PORT")]
    pub port: Option<String>,
    #[arg(long, env = "ENVIRONMENT")]
    pub environment: Option<String>,

    /// Target CPU load percentage, capped at 80.
    #[arg(long, env = "CPU_LOAD_PERCENT")]
    pub cpu_load_percent: Option<String>,
    /// Target memory load in MB.
    #[arg(long, env = "MEMORY_MB")]
    pub memory_mb: Option<String>,
    /// Seconds to run load, 0 runs until stopped.
    #[arg(long, env = "DURATION_SEC")]
    pub duration_sec: Option<String>,

    /// Simulate a crash for crash-loop testing.
    #[arg(long, env = "CRASH")]
    pub crash: Option<String>,
    #[arg(long, env = "CRASH_AFTER_TIME_MS")]
    pub crash_after_time_ms: Option<String>,
    /// Simulate a graceful shutdown for rolling-update testing.
    #[arg(long, env = "SHUTDOWN")]
    pub shutdown: Option<String>,
    #[arg(long, env = "SHUTDOWN_AFTER_TIME_MS")]
    pub shutdown_after_time_ms: Option<String>,

    #[arg(long, env = "DYNAMIC_LOAD_MAX")]
    pub dynamic_load_max: Option<String>,
    #[arg(long, env = "DYNAMIC_LOAD_STEP")]
    pub dynamic_load_step: Option<String>,

    /// CPU workers per session, defaults to the number of logical CPUs.
    #[arg(long, env = "CPU_WORKERS")]
    pub cpu_workers: Option<String>,
    #[arg(long, env = "DRAIN_POLICY", value_enum)]
    pub drain_policy: Option<DrainPolicy>,
    /// Memory a session may commit before it fails, in MB. Unlimited when unset.
    #[arg(long, env = "MEMORY_CAP_MB")]
    pub memory_cap_mb: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub settings: LoadSettings,
    pub ramp: DynamicLoadState,
    pub crash: TimerConfig,
    pub shutdown: TimerConfig,
    pub cpu_workers: usize,
    pub drain: DrainPolicy,
    pub memory_cap_mb: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            environment: "development".to_string(),
            settings: LoadSettings::default(),
            ramp: DynamicLoadState::default(),
            crash: TimerConfig::disabled(DEFAULT_CRASH_AFTER_MS),
            shutdown: TimerConfig::disabled(DEFAULT_SHUTDOWN_AFTER_MS),
            cpu_workers: num_cpus::get(),
            drain: DrainPolicy::default(),
            memory_cap_mb: None,
        }
    }
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let port = match cli.port.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_PORT,
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw.to_string()))?,
        };

        let crash = TimerConfig {
            enabled: lenient_bool(&cli.crash).unwrap_or(false),
            after_ms: lenient_int(&cli.crash_after_time_ms).unwrap_or(DEFAULT_CRASH_AFTER_MS),
        };
        let shutdown = TimerConfig {
            enabled: lenient_bool(&cli.shutdown).unwrap_or(false),
            after_ms: lenient_int(&cli.shutdown_after_time_ms)
                .unwrap_or(DEFAULT_SHUTDOWN_AFTER_MS),
        };

        let settings = LoadSettings {
            cpu_load_percent: lenient_int(&cli.cpu_load_percent)
                .map(|v| v.clamp(0, i64::from(MAX_CPU_LOAD_PERCENT)) as u8)
                .unwrap_or(defaults.settings.cpu_load_percent),
            memory_mb: lenient_int(&cli.memory_mb)
                .map(|v| v.max(0) as u64)
                .unwrap_or(defaults.settings.memory_mb),
            duration_sec: lenient_int(&cli.duration_sec)
                .map(|v| v.max(0) as u64)
                .unwrap_or(defaults.settings.duration_sec),
            crash_after_ms: crash.after_ms,
            shutdown_after_ms: shutdown.after_ms,
        };

        let increment_step = lenient_int(&cli.dynamic_load_step)
            .map(|v| v.clamp(0, i64::from(MAX_CPU_LOAD_PERCENT)) as u8)
            .unwrap_or(defaults.ramp.increment_step);
        if increment_step == 0 {
            return Err(ConfigError::InvalidRampStep);
        }
        let ramp = DynamicLoadState {
            current_cpu_load: 0,
            max_cpu_load: lenient_int(&cli.dynamic_load_max)
                .map(|v| v.clamp(0, i64::from(MAX_CPU_LOAD_PERCENT)) as u8)
                .unwrap_or(defaults.ramp.max_cpu_load),
            increment_step,
        };

        let cpu_workers = lenient_int(&cli.cpu_workers)
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .unwrap_or(defaults.cpu_workers);

        Ok(Self {
            host: non_empty(&cli.host).unwrap_or(defaults.host),
            port,
            environment: non_empty(&cli.environment).unwrap_or(defaults.environment),
            settings,
            ramp,
            crash,
            shutdown,
            cpu_workers,
            drain: cli.drain_policy.unwrap_or(defaults.drain),
            memory_cap_mb: lenient_int(&cli.memory_cap_mb)
                .filter(|v| *v > 0)
                .map(|v| v as u64),
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            cpu_workers: self.cpu_workers,
            drain: self.drain,
            memory_cap_mb: self.memory_cap_mb,
        }
    }

    pub fn bind_addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

fn non_empty(raw: &Option<String>) -> Option<String> {
    raw.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn lenient_int(raw: &Option<String>) -> Option<i64> {
    raw.as_deref()?.trim().parse().ok()
}

/// Accepts `1`/`t`/`true` and `0`/`f`/`false` in lower, upper or title case.
fn lenient_bool(raw: &Option<String>) -> Option<bool> {
    match raw.as_deref()?.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
