//! Deterministic point-mass lander over a spherical body.
//!
//! Body frame: origin at the body centre, +Y through the north pole, the
//! vessel starts on the equator at +X. Drives `lander fly` without a game
//! and backs the engine tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lander_proto::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info};

use crate::control::{Actuation, AutopilotCommand};
use crate::error::{ConnectionKind, FcError, Result};
use crate::mission::ManualControls;
use crate::source::{ConnectParams, Connector, Field, Handle, TelemetrySource, Value};

pub const GRAVITATIONAL_CONSTANT: f64 = 6.674_08e-11;
pub const SIM_VERSION: &str = "sim-0.4";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimBody {
    pub name: String,
    pub mass: f64,
    pub radius: f64,
    /// Peak terrain height above sea level.
    pub terrain_amplitude: f64,
}

impl Default for SimBody {
    fn default() -> Self {
        Self::kerbin()
    }
}

impl SimBody {
    pub fn kerbin() -> Self {
        Self { name: "Kerbin".into(), mass: 5.291_515_8e22, radius: 600_000.0, terrain_amplitude: 40.0 }
    }

    pub fn mun() -> Self {
        Self { name: "Mun".into(), mass: 9.759_906_6e20, radius: 200_000.0, terrain_amplitude: 120.0 }
    }

    pub fn terrain_height(&self, latitude: f64, longitude: f64) -> f64 {
        let lat = latitude.to_radians();
        let lon = longitude.to_radians();
        self.terrain_amplitude * (lat * 400.0).sin() * (lon * 400.0).cos()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub vessel_name: String,
    /// kg
    pub vessel_mass: f64,
    /// N, at full throttle with engines active
    pub max_thrust: f64,
    /// Starting mean altitude, m.
    pub start_altitude: f64,
    pub engines_active: bool,
    pub body: SimBody,

    /// Advance with wall time on every telemetry read instead of through
    /// [`SimHandle::step`].
    pub realtime: bool,
    /// Uniform noise amplitude on vertical speed readings, m/s.
    pub noise: f64,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            vessel_name: "Lander".into(),
            vessel_mass: 2_000.0,
            max_thrust: 60_000.0,
            start_altitude: 85.0,
            engines_active: true,
            body: SimBody::kerbin(),
            realtime: false,
            noise: 0.0,
            seed: 1,
        }
    }
}

#[derive(Debug)]
struct SimWorld {
    cfg: SimConfig,
    body: SimBody,
    ut: f64,
    position: Vec3,
    velocity: Vec3,
    throttle: f64,
    engines_active: bool,
    attitude: ManualControls,
    autopilot_target: Option<Vec3>,

    connected: bool,
    refuse_connections: bool,
    fault: Option<ConnectionKind>,
    heartbeat_fault: Option<ConnectionKind>,
    subscribe_fault: bool,

    generation: u32,
    next_handle: u32,
    subs: HashMap<u32, (Field, u32)>,
    subscribe_calls: u64,
    stale_reads: u64,
    status_calls: u64,
    actuations: u64,

    last_wall: Option<Instant>,
    rng: StdRng,
}

impl SimWorld {
    fn new(cfg: SimConfig) -> Self {
        let body = cfg.body.clone();
        let position = Vec3::new(body.radius + cfg.start_altitude, 0.0, 0.0);
        Self {
            body,
            ut: 0.0,
            position,
            velocity: Vec3::zeros(),
            throttle: 0.0,
            engines_active: cfg.engines_active,
            attitude: ManualControls::default(),
            autopilot_target: None,
            connected: false,
            refuse_connections: false,
            fault: None,
            heartbeat_fault: None,
            subscribe_fault: false,
            generation: 0,
            next_handle: 1,
            subs: HashMap::new(),
            subscribe_calls: 0,
            stale_reads: 0,
            status_calls: 0,
            actuations: 0,
            last_wall: None,
            rng: StdRng::seed_from_u64(cfg.seed),
            cfg,
        }
    }

    fn up(&self) -> Vec3 {
        self.position.try_normalize(1e-9).unwrap_or_else(Vec3::x)
    }

    fn max_thrust(&self) -> f64 {
        if self.engines_active {
            self.cfg.max_thrust
        } else {
            0.0
        }
    }

    fn direction(&self) -> Vec3 {
        self.autopilot_target.unwrap_or_else(|| self.up())
    }

    fn latitude(&self) -> f64 {
        let r = self.position.norm();
        if r <= 0.0 {
            return 0.0;
        }
        (self.position.y / r).clamp(-1.0, 1.0).asin().to_degrees()
    }

    fn longitude(&self) -> f64 {
        self.position.z.atan2(self.position.x).to_degrees()
    }

    fn mean_altitude(&self) -> f64 {
        self.position.norm() - self.body.radius
    }

    fn surface_altitude(&self) -> f64 {
        self.mean_altitude() - self.body.terrain_height(self.latitude(), self.longitude()).max(0.0)
    }

    fn step(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let up = self.up();
        let r2 = self.position.norm_squared().max(1.0);
        let gravity = -up * (GRAVITATIONAL_CONSTANT * self.body.mass / r2);
        let thrust = self.direction() * (self.throttle * self.max_thrust() / self.cfg.vessel_mass);
        self.velocity += (gravity + thrust) * dt;
        self.position += self.velocity * dt;
        self.ut += dt;

        // resting on the ground
        let ground = self.body.radius + self.body.terrain_height(self.latitude(), self.longitude()).max(0.0);
        if self.position.norm() < ground {
            self.position = self.up() * ground;
            if self.velocity.dot(&self.up()) < 0.0 {
                self.velocity = Vec3::zeros();
            }
        }
    }

    fn check_fault(&mut self) -> Result<()> {
        if !self.connected {
            return Err(FcError::connection(ConnectionKind::Closed, "sim connection closed"));
        }
        match self.fault.take() {
            Some(kind) => {
                self.connected = false;
                Err(FcError::connection(kind, "injected fault"))
            }
            None => Ok(()),
        }
    }

    fn field_value(&mut self, field: Field) -> Value {
        match field {
            Field::Ut => Value::Scalar(self.ut),
            Field::GameScene => Value::Text("flight".into()),
            Field::VesselName => Value::Text(self.cfg.vessel_name.clone()),
            Field::BodyName => Value::Text(self.body.name.clone()),
            Field::BodyMass => Value::Scalar(self.body.mass),
            Field::VesselMass => Value::Scalar(self.cfg.vessel_mass),
            Field::Thrust => Value::Scalar(self.throttle * self.max_thrust()),
            Field::MaxThrust => Value::Scalar(self.max_thrust()),
            Field::Throttle => Value::Scalar(self.throttle),
            Field::VerticalSpeed => {
                let mut vs = self.velocity.dot(&self.up());
                if self.cfg.noise > 0.0 {
                    vs += self.rng.gen_range(-self.cfg.noise..self.cfg.noise);
                }
                Value::Scalar(vs)
            }
            Field::MeanAltitude => Value::Scalar(self.mean_altitude()),
            Field::SurfaceAltitude => Value::Scalar(self.surface_altitude()),
            Field::Latitude => Value::Scalar(self.latitude()),
            Field::Longitude => Value::Scalar(self.longitude()),
            Field::Position => Value::Vector(self.position),
            Field::Velocity => Value::Vector(self.velocity),
            Field::Direction => Value::Vector(self.direction()),
        }
    }
}

fn frame_dependent(field: Field) -> bool {
    matches!(
        field,
        Field::BodyName
            | Field::BodyMass
            | Field::VerticalSpeed
            | Field::MeanAltitude
            | Field::SurfaceAltitude
            | Field::Latitude
            | Field::Longitude
            | Field::Position
            | Field::Velocity
            | Field::Direction
    )
}

fn lock(world: &Mutex<SimWorld>) -> MutexGuard<'_, SimWorld> {
    world.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Test and operator side of the simulation: steps physics, injects
/// faults and moves the vessel between bodies.
#[derive(Debug, Clone)]
pub struct SimHandle {
    world: Arc<Mutex<SimWorld>>,
}

impl SimHandle {
    pub fn step(&self, dt: Duration) {
        lock(&self.world).step(dt.as_secs_f64());
    }

    /// Fails the next provider call with `kind` and drops the connection.
    pub fn inject_fault(&self, kind: ConnectionKind) {
        lock(&self.world).fault = Some(kind);
    }

    /// Fails the next status round-trip with `kind` and drops the connection.
    pub fn fail_heartbeat(&self, kind: ConnectionKind) {
        lock(&self.world).heartbeat_fault = Some(kind);
    }

    /// Rejects the next subscription request without dropping the
    /// connection, as a provider does while no vessel is active.
    pub fn fail_next_subscribe(&self) {
        lock(&self.world).subscribe_fault = true;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.world).refuse_connections = refuse;
    }

    /// Moves the vessel into `body`'s sphere of influence at the same
    /// altitude. Existing subscriptions keep reading against the old frame.
    pub fn transfer_to(&self, body: SimBody) {
        let mut w = lock(&self.world);
        let alt = w.mean_altitude();
        let up = w.up();
        info!("sim: {} transfers {} -> {}", w.cfg.vessel_name, w.body.name, body.name);
        w.position = up * (body.radius + alt);
        w.velocity = Vec3::zeros();
        w.body = body;
        w.generation += 1;
    }

    pub fn set_velocity(&self, velocity: Vec3) {
        lock(&self.world).velocity = velocity;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.world).connected
    }

    pub fn throttle(&self) -> f64 {
        lock(&self.world).throttle
    }

    pub fn engines_active(&self) -> bool {
        lock(&self.world).engines_active
    }

    pub fn attitude(&self) -> ManualControls {
        lock(&self.world).attitude
    }

    pub fn autopilot_target(&self) -> Option<Vec3> {
        lock(&self.world).autopilot_target
    }

    pub fn mean_altitude(&self) -> f64 {
        lock(&self.world).mean_altitude()
    }

    pub fn vertical_speed(&self) -> f64 {
        let w = lock(&self.world);
        w.velocity.dot(&w.up())
    }

    pub fn subscribe_calls(&self) -> u64 {
        lock(&self.world).subscribe_calls
    }

    pub fn live_subscriptions(&self) -> usize {
        lock(&self.world).subs.len()
    }

    /// Reads of frame dependent handles created before the last transfer.
    pub fn stale_reads(&self) -> u64 {
        lock(&self.world).stale_reads
    }

    pub fn status_calls(&self) -> u64 {
        lock(&self.world).status_calls
    }

    pub fn actuations(&self) -> u64 {
        lock(&self.world).actuations
    }
}

pub struct SimConnector {
    world: Arc<Mutex<SimWorld>>,
}

impl SimConnector {
    pub fn new(cfg: SimConfig) -> (Self, SimHandle) {
        let world = Arc::new(Mutex::new(SimWorld::new(cfg)));
        (Self { world: world.clone() }, SimHandle { world })
    }
}

impl Connector for SimConnector {
    fn connect(&mut self, params: &ConnectParams) -> Result<Box<dyn TelemetrySource>> {
        let mut w = lock(&self.world);
        if w.refuse_connections {
            return Err(FcError::connection(
                ConnectionKind::Refused,
                format!("{}:{} refused", params.address, params.rpc_port),
            ));
        }
        w.connected = true;
        w.fault = None;
        w.heartbeat_fault = None;
        w.last_wall = None;
        debug!("sim: client '{}' connected", params.name);
        Ok(Box::new(SimSource { world: self.world.clone() }))
    }
}

pub struct SimSource {
    world: Arc<Mutex<SimWorld>>,
}

impl TelemetrySource for SimSource {
    fn subscribe(&mut self, field: Field) -> Result<Handle> {
        let mut w = lock(&self.world);
        w.check_fault()?;
        if std::mem::take(&mut w.subscribe_fault) {
            return Err(FcError::Source(format!("no active vessel to stream {:?}", field)));
        }
        let id = w.next_handle;
        w.next_handle += 1;
        let generation = w.generation;
        w.subs.insert(id, (field, generation));
        w.subscribe_calls += 1;
        Ok(Handle(id))
    }

    fn read(&mut self, handle: Handle) -> Result<Value> {
        let mut w = lock(&self.world);
        w.check_fault()?;
        let Some(&(field, generation)) = w.subs.get(&handle.0) else {
            return Err(FcError::Source(format!("unknown stream handle {}", handle.0)));
        };
        if field == Field::Ut && w.cfg.realtime {
            let now = Instant::now();
            if let Some(last) = w.last_wall {
                let dt = now.duration_since(last).as_secs_f64();
                w.step(dt);
            }
            w.last_wall = Some(now);
        }
        if generation != w.generation && frame_dependent(field) {
            w.stale_reads += 1;
        }
        Ok(w.field_value(field))
    }

    fn unsubscribe_all(&mut self) -> Result<()> {
        let mut w = lock(&self.world);
        w.check_fault()?;
        w.subs.clear();
        Ok(())
    }

    fn active_body(&mut self) -> Result<String> {
        let mut w = lock(&self.world);
        w.check_fault()?;
        Ok(w.body.name.clone())
    }

    fn gravitational_constant(&mut self) -> Result<f64> {
        lock(&self.world).check_fault()?;
        Ok(GRAVITATIONAL_CONSTANT)
    }

    fn surface_height(&mut self, latitude: f64, longitude: f64) -> Result<f64> {
        let mut w = lock(&self.world);
        w.check_fault()?;
        Ok(w.body.terrain_height(latitude, longitude))
    }

    fn status(&mut self) -> Result<String> {
        let mut w = lock(&self.world);
        w.check_fault()?;
        w.status_calls += 1;
        if let Some(kind) = w.heartbeat_fault.take() {
            w.connected = false;
            return Err(FcError::connection(kind, "heartbeat failed"));
        }
        Ok(SIM_VERSION.to_string())
    }

    fn apply(&mut self, act: &Actuation) -> Result<()> {
        let mut w = lock(&self.world);
        w.check_fault()?;
        if let Some(t) = act.throttle {
            w.throttle = t.clamp(0.0, 1.0);
        }
        if let Some(a) = act.attitude {
            w.attitude = a;
        }
        match act.autopilot {
            Some(AutopilotCommand::Engage { target_direction }) => {
                w.autopilot_target = target_direction.try_normalize(1e-9);
            }
            Some(AutopilotCommand::Disengage) => w.autopilot_target = None,
            None => {}
        }
        if let Some(on) = act.engines_active {
            w.engines_active = on;
        }
        w.actuations += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut w = lock(&self.world);
        w.connected = false;
        w.subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectParams {
        ConnectParams { name: "test".into(), address: "sim".into(), rpc_port: 50000, stream_port: 50001 }
    }

    #[test]
    fn free_fall_accelerates_down() {
        let (mut conn, sim) = SimConnector::new(SimConfig { start_altitude: 1000.0, ..Default::default() });
        let _src = conn.connect(&params()).unwrap();
        for _ in 0..10 {
            sim.step(Duration::from_millis(100));
        }
        // about 9.78 m/s^2 at 1 km for one second
        assert!((sim.vertical_speed() + 9.78).abs() < 0.05);
        assert!(sim.mean_altitude() < 1000.0);
    }

    #[test]
    fn full_throttle_climbs() {
        let (mut conn, sim) = SimConnector::new(SimConfig::default());
        let mut src = conn.connect(&params()).unwrap();
        src.apply(&Actuation { throttle: Some(1.0), ..Default::default() }).unwrap();
        sim.step(Duration::from_secs(1));
        assert!(sim.vertical_speed() > 15.0);
    }

    #[test]
    fn lands_and_stays_on_ground() {
        let (mut conn, sim) = SimConnector::new(SimConfig { start_altitude: 2.0, ..Default::default() });
        let _src = conn.connect(&params()).unwrap();
        for _ in 0..50 {
            sim.step(Duration::from_millis(100));
        }
        assert!(sim.mean_altitude().abs() < 1e-6);
        assert_eq!(sim.vertical_speed(), 0.0);
    }

    #[test]
    fn refused_connection_is_not_loss() {
        let (mut conn, sim) = SimConnector::new(SimConfig::default());
        sim.refuse_connections(true);
        let err = conn.connect(&params()).err().unwrap();
        assert!(matches!(err, FcError::Connection { kind: ConnectionKind::Refused, .. }));
        assert!(!err.is_connection_loss());
    }

    #[test]
    fn injected_fault_drops_connection() {
        let (mut conn, sim) = SimConnector::new(SimConfig::default());
        let mut src = conn.connect(&params()).unwrap();
        let h = src.subscribe(Field::Ut).unwrap();
        sim.inject_fault(ConnectionKind::Reset);
        assert!(src.read(h).unwrap_err().is_connection_loss());
        assert!(!sim.is_connected());
        assert!(src.read(h).unwrap_err().is_connection_loss());
    }

    #[test]
    fn transfer_marks_old_handles_stale() {
        let (mut conn, sim) = SimConnector::new(SimConfig::default());
        let mut src = conn.connect(&params()).unwrap();
        let pos = src.subscribe(Field::Position).unwrap();
        let ut = src.subscribe(Field::Ut).unwrap();
        sim.transfer_to(SimBody::mun());
        src.read(ut).unwrap();
        assert_eq!(sim.stale_reads(), 0);
        src.read(pos).unwrap();
        assert_eq!(sim.stale_reads(), 1);
        assert_eq!(src.active_body().unwrap(), "Mun");
        assert!((sim.mean_altitude() - 85.0).abs() < 1e-6);
    }

    #[test]
    fn engines_off_removes_max_thrust() {
        let (mut conn, _sim) = SimConnector::new(SimConfig::default());
        let mut src = conn.connect(&params()).unwrap();
        let h = src.subscribe(Field::MaxThrust).unwrap();
        assert_eq!(src.read(h).unwrap(), Value::Scalar(60_000.0));
        src.apply(&Actuation { engines_active: Some(false), ..Default::default() }).unwrap();
        assert_eq!(src.read(h).unwrap(), Value::Scalar(0.0));
    }
}
