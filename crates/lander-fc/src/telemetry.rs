//! Raw provider readings and the quantities derived from them each tick.

use std::collections::BTreeMap;

use lander_proto::{TelemetrySnapshot, Vec3};

use crate::error::Result;
use crate::source::{Field, Handle, TelemetrySource};

/// Gain from horizontal velocity (m/s) to counter-velocity tilt.
pub const COUNTER_GAIN: f64 = 0.2;
/// Largest counter-velocity magnitude added to the local vertical.
pub const COUNTER_LIMIT: f64 = 0.5;

const MIN_NORM: f64 = 1e-9;

/// One read of every subscribed field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTelemetry {
    pub ut: f64,
    pub game_scene: Option<String>,
    pub vessel_name: String,
    pub body_name: String,
    pub body_mass: f64,
    pub vessel_mass: f64,
    pub thrust: f64,
    pub max_thrust: f64,
    pub throttle: f64,
    pub vertical_speed: f64,
    pub mean_altitude: f64,
    pub surface_altitude: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
}

/// Gravitational acceleration at `position` (body frame, metres).
pub fn body_gravity(g: f64, body_mass: f64, position: &Vec3) -> f64 {
    let d2 = position.norm_squared();
    if d2 <= 0.0 {
        return 0.0;
    }
    g * body_mass / d2
}

/// Component of `v` orthogonal to `normal`.
pub fn project_onto_plane(v: &Vec3, normal: &Vec3) -> Vec3 {
    let n2 = normal.norm_squared();
    if n2 <= 0.0 {
        return *v;
    }
    v - normal * (v.dot(normal) / n2)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizontalVelocity {
    pub forward: f64,
    pub lateral: f64,
    pub magnitude: f64,
    /// Opposes the horizontal velocity, magnitude capped at [`COUNTER_LIMIT`].
    pub counter: Vec3,
}

impl Default for HorizontalVelocity {
    fn default() -> Self {
        Self { forward: 0.0, lateral: 0.0, magnitude: 0.0, counter: Vec3::zeros() }
    }
}

/// Splits `velocity` into components in the local horizontal plane. Forward
/// follows the vessel's nose projected onto the plane; when the nose points
/// straight up it falls back to body north (+Y), then +X.
pub fn horizontal_velocity(position: &Vec3, velocity: &Vec3, direction: &Vec3) -> HorizontalVelocity {
    let Some(up) = position.try_normalize(MIN_NORM) else {
        return HorizontalVelocity::default();
    };
    let v_h = project_onto_plane(velocity, &up);

    let forward = [*direction, Vec3::y(), Vec3::x()]
        .iter()
        .find_map(|axis| project_onto_plane(axis, &up).try_normalize(MIN_NORM))
        .unwrap_or_else(Vec3::zeros);
    let right = forward.cross(&up);

    let mut counter = -v_h * COUNTER_GAIN;
    let n = counter.norm();
    if n > COUNTER_LIMIT {
        counter *= COUNTER_LIMIT / n;
    }

    HorizontalVelocity { forward: v_h.dot(&forward), lateral: v_h.dot(&right), magnitude: v_h.norm(), counter }
}

/// Direction the autopilot holds to bleed off horizontal speed.
pub fn stabilize_target(position: &Vec3, counter: &Vec3) -> Vec3 {
    match position.try_normalize(MIN_NORM) {
        Some(up) => (up + counter).try_normalize(MIN_NORM).unwrap_or(up),
        None => Vec3::zeros(),
    }
}

/// Copies a raw read into the snapshot and recomputes the derived fields.
pub fn apply_raw(snap: &mut TelemetrySnapshot, raw: RawTelemetry, g: f64, surface_height: f64) {
    snap.g = g;
    snap.ut = raw.ut;
    snap.game_scene = raw.game_scene;
    snap.vessel_name = raw.vessel_name;
    snap.body_name = raw.body_name;
    snap.body_mass = raw.body_mass;
    snap.vessel_mass = raw.vessel_mass;
    snap.thrust = raw.thrust;
    snap.max_thrust = raw.max_thrust;
    snap.throttle = raw.throttle;
    snap.vertical_speed = raw.vertical_speed;
    snap.mean_altitude = raw.mean_altitude;
    snap.surface_altitude = raw.surface_altitude;
    snap.latitude = raw.latitude;
    snap.longitude = raw.longitude;
    snap.position = raw.position;
    snap.velocity = raw.velocity;
    snap.surface_height = surface_height;

    snap.body_gravity = body_gravity(g, raw.body_mass, &raw.position);
    snap.vessel_weight = snap.body_gravity * raw.vessel_mass;

    let h = horizontal_velocity(&raw.position, &raw.velocity, &raw.direction);
    snap.forward_speed = h.forward;
    snap.lateral_speed = h.lateral;
    snap.horizontal_speed = h.magnitude;
    snap.counter_velocity = h.counter;
    snap.stabilize_target = stabilize_target(&raw.position, &h.counter);
}

/// Live stream handles, keyed by field.
#[derive(Debug, Default)]
pub struct Subscriptions {
    handles: BTreeMap<Field, Handle>,
}

impl Subscriptions {
    pub fn establish(src: &mut dyn TelemetrySource) -> Result<Self> {
        let mut handles = BTreeMap::new();
        for field in Field::ALL {
            handles.insert(field, src.subscribe(field)?);
        }
        Ok(Self { handles })
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    fn handle(&self, field: Field) -> Result<Handle> {
        self.handles
            .get(&field)
            .copied()
            .ok_or_else(|| crate::FcError::Source(format!("no subscription for {:?}", field)))
    }

    fn scalar(&self, src: &mut dyn TelemetrySource, field: Field) -> Result<f64> {
        src.read(self.handle(field)?)?.scalar()
    }

    fn vector(&self, src: &mut dyn TelemetrySource, field: Field) -> Result<Vec3> {
        src.read(self.handle(field)?)?.vector()
    }

    fn text(&self, src: &mut dyn TelemetrySource, field: Field) -> Result<String> {
        src.read(self.handle(field)?)?.into_text()
    }

    pub fn read_raw(&self, src: &mut dyn TelemetrySource) -> Result<RawTelemetry> {
        Ok(RawTelemetry {
            ut: self.scalar(src, Field::Ut)?,
            game_scene: Some(self.text(src, Field::GameScene)?),
            vessel_name: self.text(src, Field::VesselName)?,
            body_name: self.text(src, Field::BodyName)?,
            body_mass: self.scalar(src, Field::BodyMass)?,
            vessel_mass: self.scalar(src, Field::VesselMass)?,
            thrust: self.scalar(src, Field::Thrust)?,
            max_thrust: self.scalar(src, Field::MaxThrust)?,
            throttle: self.scalar(src, Field::Throttle)?,
            vertical_speed: self.scalar(src, Field::VerticalSpeed)?,
            mean_altitude: self.scalar(src, Field::MeanAltitude)?,
            surface_altitude: self.scalar(src, Field::SurfaceAltitude)?,
            latitude: self.scalar(src, Field::Latitude)?,
            longitude: self.scalar(src, Field::Longitude)?,
            position: self.vector(src, Field::Position)?,
            velocity: self.vector(src, Field::Velocity)?,
            direction: self.vector(src, Field::Direction)?,
        })
    }
}
