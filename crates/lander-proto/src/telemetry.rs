use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Cartesian vector in the orbited body's reference frame (metres, m/s).
pub type Vec3 = Vector3<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Mean processing time (seconds) of each scheduler task over its rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerTimings {
    pub st_time: f64,
    pub lt_time: f64,
    pub xlt_time: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PidDiagnostics {
    pub setpoint: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub output: f64,
}

/// Read-only copy of the engine's flight state, published after every
/// short-period tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub ts_unix_ms: i64,
    pub connection: ConnectionState,
    pub game_scene: Option<String>,
    pub active_program: String,

    // Universe / body
    pub ut: f64,
    pub g: f64,
    pub body_name: String,
    pub body_mass: f64,
    pub body_gravity: f64,

    // Vessel
    pub vessel_name: String,
    pub vessel_mass: f64,
    pub vessel_weight: f64,
    pub thrust: f64,
    pub max_thrust: f64,
    pub throttle: f64,

    // Kinematics
    pub position: Vec3,
    pub velocity: Vec3,
    pub vertical_speed: f64,
    pub forward_speed: f64,
    pub lateral_speed: f64,
    pub horizontal_speed: f64,
    pub counter_velocity: Vec3,
    pub stabilize_target: Vec3,

    // Altitudes and position on the surface
    pub mean_altitude: f64,
    pub surface_altitude: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub surface_height: f64,
    /// Terrain heights around the vessel relative to `surface_height`, row major by latitude.
    pub surface_height_map: Vec<Vec<f64>>,

    pub timings: SchedulerTimings,
    pub vertical_speed_ctrl: PidDiagnostics,
    pub altitude_ctrl: PidDiagnostics,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            ts_unix_ms: 0,
            connection: ConnectionState::Disconnected,
            game_scene: None,
            active_program: String::new(),
            ut: 0.0,
            g: 0.0,
            body_name: String::new(),
            body_mass: 0.0,
            body_gravity: 0.0,
            vessel_name: String::new(),
            vessel_mass: 0.0,
            vessel_weight: 0.0,
            thrust: 0.0,
            max_thrust: 0.0,
            throttle: 0.0,
            position: Vec3::zeros(),
            velocity: Vec3::zeros(),
            vertical_speed: 0.0,
            forward_speed: 0.0,
            lateral_speed: 0.0,
            horizontal_speed: 0.0,
            counter_velocity: Vec3::zeros(),
            stabilize_target: Vec3::zeros(),
            mean_altitude: 0.0,
            surface_altitude: 0.0,
            latitude: 0.0,
            longitude: 0.0,
            surface_height: 0.0,
            surface_height_map: Vec::new(),
            timings: SchedulerTimings::default(),
            vertical_speed_ctrl: PidDiagnostics::default(),
            altitude_ctrl: PidDiagnostics::default(),
        }
    }
}

impl TelemetrySnapshot {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    /// Thrust-to-weight ratio, `None` without usable thrust.
    pub fn thrust_to_weight(&self) -> Option<f64> {
        if self.max_thrust > 0.0 && self.vessel_weight > 0.0 {
            Some(self.max_thrust / self.vessel_weight)
        } else {
            None
        }
    }
}
