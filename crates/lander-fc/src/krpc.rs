//! `TelemetrySource` over a live kRPC server.

use std::collections::HashMap;
use std::sync::Arc;

use krpc_client::services::krpc::KRPC;
use krpc_client::services::space_center::{AutoPilot, CelestialBody, Control, Flight, ReferenceFrame, SpaceCenter, Vessel};
use krpc_client::stream::Stream;
use krpc_client::Client;
use lander_proto::Vec3;
use tracing::info;

use crate::control::{Actuation, AutopilotCommand};
use crate::error::{ConnectionKind, FcError, Result};
use crate::source::{ConnectParams, Connector, Field, Handle, TelemetrySource, Value};

/// kRPC reports failures as text; the socket errors we care about are
/// recognised by their io::ErrorKind wording.
fn rpc_err(e: impl std::fmt::Display) -> FcError {
    let detail = e.to_string();
    let lower = detail.to_lowercase();
    let kind = if lower.contains("reset") {
        Some(ConnectionKind::Reset)
    } else if lower.contains("abort") {
        Some(ConnectionKind::Aborted)
    } else if lower.contains("broken pipe") || lower.contains("closed") || lower.contains("eof") {
        Some(ConnectionKind::Closed)
    } else if lower.contains("refused") {
        Some(ConnectionKind::Refused)
    } else {
        None
    };
    match kind {
        Some(kind) => FcError::Connection { kind, detail },
        None => FcError::Source(detail),
    }
}

fn vec3((x, y, z): (f64, f64, f64)) -> Vec3 {
    Vec3::new(x, y, z)
}

enum Subscribed {
    Double(Stream<f64>),
    Float(Stream<f32>),
    Vector(Stream<(f64, f64, f64)>),
    /// Not streamed; read on demand.
    Text(Field),
}

pub struct KrpcConnector;

impl Connector for KrpcConnector {
    fn connect(&mut self, p: &ConnectParams) -> Result<Box<dyn TelemetrySource>> {
        let client = Client::new(&p.name, &p.address, p.rpc_port, p.stream_port).map_err(rpc_err)?;
        let src = KrpcSource::new(client)?;
        Ok(Box::new(src))
    }
}

pub struct KrpcSource {
    krpc: KRPC,
    space_center: SpaceCenter,
    vessel: Vessel,
    control: Control,
    autopilot: AutoPilot,
    body: CelestialBody,
    frame: ReferenceFrame,
    flight: Flight,
    streams: HashMap<u32, Subscribed>,
    next_handle: u32,
}

impl KrpcSource {
    fn new(client: Arc<Client>) -> Result<Self> {
        let krpc = KRPC::new(client.clone());
        let space_center = SpaceCenter::new(client);
        let vessel = space_center.get_active_vessel().map_err(rpc_err)?;
        let control = vessel.get_control().map_err(rpc_err)?;
        let autopilot = vessel.get_auto_pilot().map_err(rpc_err)?;
        let body = vessel.get_orbit().map_err(rpc_err)?.get_body().map_err(rpc_err)?;
        let frame = body.get_reference_frame().map_err(rpc_err)?;
        let flight = vessel.flight(Some(&frame)).map_err(rpc_err)?;
        info!("krpc: tracking vessel \"{}\"", vessel.get_name().map_err(rpc_err)?);
        Ok(Self {
            krpc,
            space_center,
            vessel,
            control,
            autopilot,
            body,
            frame,
            flight,
            streams: HashMap::new(),
            next_handle: 1,
        })
    }

    /// Re-binds body, frame and flight to whatever the vessel orbits now.
    fn rebind(&mut self) -> Result<()> {
        self.vessel = self.space_center.get_active_vessel().map_err(rpc_err)?;
        self.control = self.vessel.get_control().map_err(rpc_err)?;
        self.autopilot = self.vessel.get_auto_pilot().map_err(rpc_err)?;
        self.body = self.vessel.get_orbit().map_err(rpc_err)?.get_body().map_err(rpc_err)?;
        self.frame = self.body.get_reference_frame().map_err(rpc_err)?;
        self.flight = self.vessel.flight(Some(&self.frame)).map_err(rpc_err)?;
        Ok(())
    }

    fn open(&self, field: Field) -> Result<Subscribed> {
        let s = match field {
            Field::Ut => Subscribed::Double(self.space_center.get_ut_stream().map_err(rpc_err)?),
            Field::GameScene | Field::VesselName | Field::BodyName => Subscribed::Text(field),
            Field::BodyMass => Subscribed::Float(self.body.get_mass_stream().map_err(rpc_err)?),
            Field::VesselMass => Subscribed::Float(self.vessel.get_mass_stream().map_err(rpc_err)?),
            Field::Thrust => Subscribed::Float(self.vessel.get_thrust_stream().map_err(rpc_err)?),
            Field::MaxThrust => Subscribed::Float(self.vessel.get_max_thrust_stream().map_err(rpc_err)?),
            Field::Throttle => Subscribed::Float(self.control.get_throttle_stream().map_err(rpc_err)?),
            Field::VerticalSpeed => Subscribed::Double(self.flight.get_vertical_speed_stream().map_err(rpc_err)?),
            Field::MeanAltitude => Subscribed::Double(self.flight.get_mean_altitude_stream().map_err(rpc_err)?),
            Field::SurfaceAltitude => {
                Subscribed::Double(self.flight.get_surface_altitude_stream().map_err(rpc_err)?)
            }
            Field::Latitude => Subscribed::Double(self.flight.get_latitude_stream().map_err(rpc_err)?),
            Field::Longitude => Subscribed::Double(self.flight.get_longitude_stream().map_err(rpc_err)?),
            Field::Position => Subscribed::Vector(self.vessel.position_stream(&self.frame).map_err(rpc_err)?),
            Field::Velocity => Subscribed::Vector(self.vessel.velocity_stream(&self.frame).map_err(rpc_err)?),
            Field::Direction => Subscribed::Vector(self.vessel.direction_stream(&self.frame).map_err(rpc_err)?),
        };
        Ok(s)
    }
}

impl TelemetrySource for KrpcSource {
    fn subscribe(&mut self, field: Field) -> Result<Handle> {
        if self.streams.is_empty() {
            self.rebind()?;
        }
        let s = self.open(field)?;
        let id = self.next_handle;
        self.next_handle += 1;
        self.streams.insert(id, s);
        Ok(Handle(id))
    }

    fn read(&mut self, handle: Handle) -> Result<Value> {
        let s = self
            .streams
            .get(&handle.0)
            .ok_or_else(|| FcError::Source(format!("unknown stream handle {}", handle.0)))?;
        let v = match s {
            Subscribed::Double(st) => Value::Scalar(st.get().map_err(rpc_err)?),
            Subscribed::Float(st) => Value::Scalar(f64::from(st.get().map_err(rpc_err)?)),
            Subscribed::Vector(st) => Value::Vector(vec3(st.get().map_err(rpc_err)?)),
            Subscribed::Text(Field::VesselName) => Value::Text(self.vessel.get_name().map_err(rpc_err)?),
            Subscribed::Text(Field::BodyName) => Value::Text(self.body.get_name().map_err(rpc_err)?),
            Subscribed::Text(_) => Value::Text("flight".to_string()),
        };
        Ok(v)
    }

    fn unsubscribe_all(&mut self) -> Result<()> {
        // dropping a Stream removes it server side
        self.streams.clear();
        Ok(())
    }

    fn active_body(&mut self) -> Result<String> {
        let vessel = self.space_center.get_active_vessel().map_err(rpc_err)?;
        vessel.get_orbit().map_err(rpc_err)?.get_body().map_err(rpc_err)?.get_name().map_err(rpc_err)
    }

    fn gravitational_constant(&mut self) -> Result<f64> {
        self.space_center.get_g().map_err(rpc_err)
    }

    fn surface_height(&mut self, latitude: f64, longitude: f64) -> Result<f64> {
        self.body.surface_height(latitude, longitude).map_err(rpc_err)
    }

    fn status(&mut self) -> Result<String> {
        Ok(self.krpc.get_status().map_err(rpc_err)?.version)
    }

    fn apply(&mut self, act: &Actuation) -> Result<()> {
        if let Some(t) = act.throttle {
            self.control.set_throttle(t as f32).map_err(rpc_err)?;
        }
        if let Some(a) = act.attitude {
            self.control.set_yaw(a.yaw as f32).map_err(rpc_err)?;
            self.control.set_pitch(a.pitch as f32).map_err(rpc_err)?;
            self.control.set_roll(a.roll as f32).map_err(rpc_err)?;
        }
        match act.autopilot {
            Some(AutopilotCommand::Engage { target_direction: d }) => {
                self.autopilot.set_reference_frame(&self.frame).map_err(rpc_err)?;
                self.autopilot.set_target_direction((d.x, d.y, d.z)).map_err(rpc_err)?;
                self.autopilot.engage().map_err(rpc_err)?;
            }
            Some(AutopilotCommand::Disengage) => self.autopilot.disengage().map_err(rpc_err)?,
            None => {}
        }
        if let Some(on) = act.engines_active {
            let engines = self.vessel.get_parts().map_err(rpc_err)?.get_engines().map_err(rpc_err)?;
            for e in engines {
                e.set_active(on).map_err(rpc_err)?;
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.streams.clear();
    }
}
