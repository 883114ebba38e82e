//! Capability interface over the vehicle telemetry/actuation provider.

use lander_proto::Vec3;

use crate::control::Actuation;
use crate::error::{FcError, Result};

/// Streamed quantities the engine subscribes to. Frame dependent fields are
/// expressed in the reference frame of the body orbited at subscription time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Ut,
    GameScene,
    VesselName,
    BodyName,
    BodyMass,
    VesselMass,
    Thrust,
    MaxThrust,
    Throttle,
    VerticalSpeed,
    MeanAltitude,
    SurfaceAltitude,
    Latitude,
    Longitude,
    Position,
    Velocity,
    /// Unit vector along the vessel's nose.
    Direction,
}

impl Field {
    pub const ALL: [Field; 17] = [
        Field::Ut,
        Field::GameScene,
        Field::VesselName,
        Field::BodyName,
        Field::BodyMass,
        Field::VesselMass,
        Field::Thrust,
        Field::MaxThrust,
        Field::Throttle,
        Field::VerticalSpeed,
        Field::MeanAltitude,
        Field::SurfaceAltitude,
        Field::Latitude,
        Field::Longitude,
        Field::Position,
        Field::Velocity,
        Field::Direction,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Vec3),
    Text(String),
}

impl Value {
    pub fn scalar(&self) -> Result<f64> {
        match self {
            Value::Scalar(v) => Ok(*v),
            other => Err(FcError::Source(format!("expected scalar, got {:?}", other))),
        }
    }

    pub fn vector(&self) -> Result<Vec3> {
        match self {
            Value::Vector(v) => Ok(*v),
            other => Err(FcError::Source(format!("expected vector, got {:?}", other))),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(FcError::Source(format!("expected text, got {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

/// A connected provider. Calls are synchronous and may block briefly.
pub trait TelemetrySource: Send {
    fn subscribe(&mut self, field: Field) -> Result<Handle>;
    fn read(&mut self, handle: Handle) -> Result<Value>;
    fn unsubscribe_all(&mut self) -> Result<()>;

    /// Name of the body the active vessel orbits right now, not a stream.
    fn active_body(&mut self) -> Result<String>;
    fn gravitational_constant(&mut self) -> Result<f64>;
    /// Terrain height above sea level of the active body.
    fn surface_height(&mut self, latitude: f64, longitude: f64) -> Result<f64>;

    /// Lightweight round-trip; returns the server version.
    fn status(&mut self) -> Result<String>;
    fn apply(&mut self, actuation: &Actuation) -> Result<()>;
    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub name: String,
    pub address: String,
    pub rpc_port: u16,
    pub stream_port: u16,
}

pub trait Connector: Send {
    fn connect(&mut self, params: &ConnectParams) -> Result<Box<dyn TelemetrySource>>;
}
