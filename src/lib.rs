//! Synthetic load generator and failure injector.
//!
//! A [`LoadController`] runs at most one load session at a time. A session
//! keeps CPU workers busy at a duty cycle and holds a block of memory until it
//! is stopped, expires or is replaced by the ramp. The HTTP surface in
//! [`server`] drives the controller; crash and shutdown timers in
//! [`lifecycle`] hand terminations to the binary.

pub mod config;
pub mod controller;
pub mod cpu_stress;
pub mod db_check;
pub mod error;
pub mod lifecycle;
pub mod memory_stress;
pub mod models;
mod ramp;
pub mod server;
pub mod store;
pub mod sys_info;
pub mod thread_manager;

pub use config::{Cli, Config};
pub use controller::{DrainPolicy, EngineConfig, LoadController};
pub use error::{AllocationError, ConfigError, ControlError};
pub use lifecycle::{LifecycleTimer, Termination, TerminationKind, TimerConfig};
pub use models::{DynamicLoadState, LoadResponse, LoadSettings, LoadStatus, RampStep};
pub use server::AppState;
