use serde::{Deserialize, Serialize};

/// Upper bound applied to every requested CPU target.
pub const MAX_CPU_LOAD_PERCENT: u8 = 80;

/// Desired configuration for one load session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSettings {
    pub cpu_load_percent: u8,
    pub memory_mb: u64,
    /// 0 runs until stopped.
    pub duration_sec: u64,
    #[serde(rename = "crash_after_time_ms")]
    pub crash_after_ms: i64,
    #[serde(rename = "shutdown_after_time_ms")]
    pub shutdown_after_ms: i64,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            cpu_load_percent: 5,
            memory_mb: 1024,
            duration_sec: 0,
            crash_after_ms: 5000,
            shutdown_after_ms: 10000,
        }
    }
}

impl LoadSettings {
    /// Caps the CPU target at [`MAX_CPU_LOAD_PERCENT`]. Never rejects.
    pub fn clamped(self) -> Self {
        Self {
            cpu_load_percent: self.cpu_load_percent.min(MAX_CPU_LOAD_PERCENT),
            ..self
        }
    }
}

/// Observable engine state, served by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStatus {
    pub running: bool,
    /// Active target, 0 while idle.
    pub cpu_load_percent: u8,
    /// Active target, 0 while idle.
    pub memory_mb: u64,
    pub database_status: String,
    #[serde(rename = "crash_after_time_ms")]
    pub crash_after_ms: i64,
    #[serde(rename = "shutdown_after_time_ms")]
    pub shutdown_after_ms: i64,
}

impl LoadStatus {
    pub fn idle(settings: &LoadSettings) -> Self {
        Self {
            running: false,
            cpu_load_percent: 0,
            memory_mb: 0,
            database_status: "Not tested".to_string(),
            crash_after_ms: settings.crash_after_ms,
            shutdown_after_ms: settings.shutdown_after_ms,
        }
    }
}

/// Stepped CPU ramp state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicLoadState {
    pub current_cpu_load: u8,
    pub max_cpu_load: u8,
    pub increment_step: u8,
}

impl Default for DynamicLoadState {
    fn default() -> Self {
        Self {
            current_cpu_load: 0,
            max_cpu_load: 70,
            increment_step: 10,
        }
    }
}

/// Outcome of a successful ramp operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampStep {
    pub previous: u8,
    pub current: u8,
    pub max: u8,
    pub step: u8,
}

/// Wire response of the ramp endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub success: bool,
    pub message: String,
    pub current_load: u8,
    pub max_load: u8,
    pub increment_step: u8,
}

impl LoadResponse {
    pub fn incremented(step: &RampStep) -> Self {
        Self {
            success: true,
            message: format!(
                "CPU load increased from {}% to {}%",
                step.previous, step.current
            ),
            current_load: step.current,
            max_load: step.max,
            increment_step: step.step,
        }
    }

    pub fn reset(step: &RampStep) -> Self {
        Self {
            success: true,
            message: format!("CPU load reset from {}% to 0%", step.previous),
            current_load: step.current,
            max_load: step.max,
            increment_step: step.step,
        }
    }

    pub fn rejected(message: impl Into<String>, ramp: &DynamicLoadState) -> Self {
        Self {
            success: false,
            message: message.into(),
            current_load: ramp.current_cpu_load,
            max_load: ramp.max_cpu_load,
            increment_step: ramp.increment_step,
        }
    }
}

/// Body of `POST /setting`.
///
/// Numbers are signed on the wire so that negative values can be coerced
/// to zero rather than failing deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsRequest {
    pub cpu_load_percent: i64,
    pub memory_mb: i64,
    #[serde(default)]
    pub duration_sec: i64,
    #[serde(default)]
    pub crash_after_time_ms: Option<i64>,
    #[serde(default)]
    pub shutdown_after_time_ms: Option<i64>,
}

impl SettingsRequest {
    /// Builds the next settings, keeping lifecycle delays from `current`
    /// when the request omits them.
    pub fn merge_into(&self, current: &LoadSettings) -> LoadSettings {
        let cpu = self
            .cpu_load_percent
            .clamp(0, i64::from(MAX_CPU_LOAD_PERCENT)) as u8;
        LoadSettings {
            cpu_load_percent: cpu,
            memory_mb: self.memory_mb.max(0) as u64,
            duration_sec: self.duration_sec.max(0) as u64,
            crash_after_ms: self.crash_after_time_ms.unwrap_or(current.crash_after_ms),
            shutdown_after_ms: self
                .shutdown_after_time_ms
                .unwrap_or(current.shutdown_after_ms),
        }
    }
}

/// Body of `POST /database`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseRequest {
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub connection_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseResponse {
    pub success: bool,
    pub message: String,
    pub engine: String,
}
