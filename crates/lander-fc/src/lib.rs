pub mod control;
pub mod engine;
pub mod error;
pub mod mission;
pub mod pid;
pub mod scan;
pub mod sim;
pub mod source;
pub mod state_var;
pub mod telemetry;

#[cfg(feature = "krpc")]
pub mod krpc;

pub use error::{ConnectionKind, FcError};

use serde::Deserialize;

use crate::pid::{PidConfig, PidOverrides};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sim,
    Krpc,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FcConfig {
    pub enable: bool,

    /// "sim" runs against the built-in point-mass provider, "krpc" needs the
    /// `krpc` cargo feature and a running kRPC server.
    #[serde(default)]
    pub backend: Backend,

    pub address: Option<String>,
    pub rpc_port: Option<u16>,
    pub stream_port: Option<u16>,

    /// Shown in the server's client list.
    pub client_name: Option<String>,
}

impl FcConfig {
    pub const DEFAULT_ADDRESS: &'static str = "127.0.0.1";
    pub const DEFAULT_RPC_PORT: u16 = 50000;
    pub const DEFAULT_STREAM_PORT: u16 = 50001;
    pub const DEFAULT_CLIENT_NAME: &'static str = "lander";
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub short_period_ms: u64,
    pub long_period_ms: u64,
    pub xlong_period_ms: u64,

    /// Number of task durations kept for the published means.
    pub timing_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { short_period_ms: 100, long_period_ms: 200, xlong_period_ms: 10_000, timing_window: 20 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(from = "ControllersSection")]
pub struct ControllersConfig {
    pub vertical_speed: PidConfig,
    pub altitude: PidConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ControllersSection {
    vertical_speed: PidOverrides,
    altitude: PidOverrides,
}

impl From<ControllersSection> for ControllersConfig {
    fn from(s: ControllersSection) -> Self {
        Self {
            vertical_speed: s.vertical_speed.over(PidConfig::vertical_speed()),
            altitude: s.altitude.over(PidConfig::altitude()),
        }
    }
}

impl Default for ControllersConfig {
    fn default() -> Self {
        Self { vertical_speed: PidConfig::vertical_speed(), altitude: PidConfig::altitude() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Grid is resolution x resolution cells.
    pub resolution: usize,
    /// Cells sampled per long-period tick.
    pub batch: usize,
    pub spacing_m: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { resolution: 30, batch: 60, spacing_m: 0.5 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    /// Program id activated at startup. Falls back to the catalog default.
    pub default_program: Option<String>,
}
