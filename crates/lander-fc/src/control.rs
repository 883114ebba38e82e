//! Per-program control laws over the two cascaded loops.

use std::time::Instant;

use lander_proto::{TelemetrySnapshot, Vec3};

use crate::error::{FcError, Result};
use crate::mission::{ControlLoop, Editability, ManualControls, ProgramId};
use crate::pid::{PidConfig, PidController, PidGains};

/// Vertical speed setpoint for a controlled descent: slows towards -1 m/s
/// as the surface approaches.
pub fn descent_setpoint(surface_altitude: f64) -> f64 {
    surface_altitude / -12.0 - 1.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutopilotCommand {
    Engage { target_direction: Vec3 },
    Disengage,
}

/// Commands for the vessel produced by one control tick. `None` leaves the
/// vessel's current value alone.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Actuation {
    pub throttle: Option<f64>,
    pub attitude: Option<ManualControls>,
    pub autopilot: Option<AutopilotCommand>,
    pub engines_active: Option<bool>,
}

impl Actuation {
    pub fn is_empty(&self) -> bool {
        self.throttle.is_none() && self.attitude.is_none() && self.autopilot.is_none() && self.engines_active.is_none()
    }
}

/// Vertical speed loop (throttle out) fed by the altitude loop (vertical
/// speed setpoint out).
#[derive(Debug, Clone)]
pub struct ControlLoops {
    pub vertical_speed: PidController,
    pub altitude: PidController,
}

impl ControlLoops {
    pub fn new_at(vertical_speed: &PidConfig, altitude: &PidConfig, start: Instant) -> Self {
        Self {
            vertical_speed: PidController::new_at("vertical speed", vertical_speed, start),
            altitude: PidController::new_at("altitude", altitude, start),
        }
    }

    pub fn get(&self, l: ControlLoop) -> &PidController {
        match l {
            ControlLoop::VerticalSpeed => &self.vertical_speed,
            ControlLoop::Altitude => &self.altitude,
        }
    }

    fn get_mut(&mut self, l: ControlLoop) -> &mut PidController {
        match l {
            ControlLoop::VerticalSpeed => &mut self.vertical_speed,
            ControlLoop::Altitude => &mut self.altitude,
        }
    }

    /// Operator setpoint edit, subject to the active program's policy.
    pub fn set_setpoint(&mut self, l: ControlLoop, value: f64, policy: &Editability) -> Result<()> {
        if !policy.setpoint(l) {
            return Err(FcError::EditRejected { control_loop: l, what: "setpoint" });
        }
        self.get_mut(l).set_setpoint(value);
        Ok(())
    }

    /// Operator gain edit, subject to the active program's policy.
    pub fn set_gains(&mut self, l: ControlLoop, gains: PidGains, policy: &Editability) -> Result<()> {
        if !policy.gains(l) {
            return Err(FcError::EditRejected { control_loop: l, what: "gains" });
        }
        self.get_mut(l).set_gains(gains);
        Ok(())
    }

    fn hold_vertical_speed(&mut self, snap: &TelemetrySnapshot, now: Instant) -> f64 {
        self.vertical_speed.update_at(snap.vertical_speed, now)
    }

    fn hold_altitude(&mut self, snap: &TelemetrySnapshot, now: Instant) {
        let vs = self.altitude.update_at(snap.mean_altitude, now);
        self.vertical_speed.set_setpoint(vs);
    }
}

impl ProgramId {
    pub fn manual_attitude(self) -> bool {
        self != ProgramId::HrzStabilize
    }

    pub fn uses_autopilot(self) -> bool {
        self == ProgramId::HrzStabilize
    }

    /// Runs this program's control law for one tick.
    pub fn control(self, snap: &TelemetrySnapshot, loops: &mut ControlLoops, now: Instant) -> Actuation {
        let mut act = Actuation::default();
        if self == ProgramId::FullManual {
            return act;
        }
        // every remaining program needs thrust
        let Some(scheduled) = PidGains::thrust_to_weight(snap.vessel_weight, snap.max_thrust) else {
            return act;
        };

        match self {
            ProgramId::FullManual => {}
            ProgramId::VspeedManual => {
                act.throttle = Some(loops.hold_vertical_speed(snap, now));
            }
            ProgramId::VspeedAuto => {
                loops.vertical_speed.set_gains(scheduled);
                act.throttle = Some(loops.hold_vertical_speed(snap, now));
            }
            ProgramId::AltitudeManual => {
                loops.hold_altitude(snap, now);
                act.throttle = Some(loops.hold_vertical_speed(snap, now));
            }
            ProgramId::AltitudeAuto => {
                loops.hold_altitude(snap, now);
                loops.vertical_speed.set_gains(scheduled);
                act.throttle = Some(loops.hold_vertical_speed(snap, now));
            }
            ProgramId::ControlledDescent => {
                loops.vertical_speed.set_gains(scheduled);
                loops.vertical_speed.set_setpoint(descent_setpoint(snap.surface_altitude));
                act.throttle = Some(loops.hold_vertical_speed(snap, now));
            }
            ProgramId::HrzStabilize => {
                loops.vertical_speed.set_gains(scheduled);
                act.throttle = Some(loops.hold_vertical_speed(snap, now));
                if snap.stabilize_target.norm() > 0.0 {
                    act.autopilot = Some(AutopilotCommand::Engage { target_direction: snap.stabilize_target });
                }
            }
        }
        act
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::MissionProgramDatabase;
    use std::time::Duration;

    const EPSILON: f64 = 1e-6;

    fn loops(t0: Instant) -> ControlLoops {
        ControlLoops::new_at(&PidConfig::vertical_speed(), &PidConfig::altitude(), t0)
    }

    fn hovering() -> TelemetrySnapshot {
        TelemetrySnapshot {
            vessel_weight: 1000.0,
            max_thrust: 2000.0,
            mean_altitude: 80.0,
            surface_altitude: 24.0,
            stabilize_target: Vec3::new(0.0, 1.0, 0.0),
            ..Default::default()
        }
    }

    #[test]
    fn descent_setpoint_from_surface_altitude() {
        assert!((descent_setpoint(24.0) + 3.0).abs() < EPSILON);
        assert!((descent_setpoint(0.0) + 1.0).abs() < EPSILON);
    }

    #[test]
    fn full_manual_does_nothing() {
        let t0 = Instant::now();
        let mut l = loops(t0);
        let act = ProgramId::FullManual.control(&hovering(), &mut l, t0 + Duration::from_millis(100));
        assert!(act.is_empty());
    }

    #[test]
    fn no_thrust_skips_control() {
        let t0 = Instant::now();
        let mut l = loops(t0);
        let snap = TelemetrySnapshot { max_thrust: 0.0, ..hovering() };
        for id in ProgramId::ALL {
            let act = id.control(&snap, &mut l, t0 + Duration::from_millis(100));
            assert!(act.throttle.is_none(), "{} produced throttle", id);
        }
        assert_eq!(l.vertical_speed.output(), 0.0);
    }

    #[test]
    fn auto_programs_schedule_gains() {
        let t0 = Instant::now();
        let snap = hovering();
        let expected = PidGains::thrust_to_weight(snap.vessel_weight, snap.max_thrust).unwrap();
        assert!((expected.kp - 0.35).abs() < EPSILON);
        assert!((expected.kd - 0.01).abs() < EPSILON);

        for id in [
            ProgramId::VspeedAuto,
            ProgramId::AltitudeAuto,
            ProgramId::ControlledDescent,
            ProgramId::HrzStabilize,
        ] {
            let mut l = loops(t0);
            id.control(&snap, &mut l, t0 + Duration::from_millis(100));
            assert_eq!(l.vertical_speed.gains(), expected, "{} gains", id);
            assert_eq!(l.altitude.gains(), PidGains { kp: 1.5, ki: 0.005, kd: 0.005 }, "{} outer gains", id);
        }
    }

    #[test]
    fn altitude_auto_cascades_into_scheduled_inner_loop() {
        let t0 = Instant::now();
        let mut l = loops(t0);
        let snap = hovering();
        let act = ProgramId::AltitudeAuto.control(&snap, &mut l, t0 + Duration::from_secs(1));

        // 5 m low with kp 1.5 is past the +5 m/s bound
        assert!((l.altitude.output() - 5.0).abs() < EPSILON);
        assert!((l.vertical_speed.setpoint() - l.altitude.output()).abs() < EPSILON);
        assert_eq!(Some(l.vertical_speed.gains()), PidGains::thrust_to_weight(snap.vessel_weight, snap.max_thrust));
        let throttle = act.throttle.unwrap();
        assert!((0.0..=1.0).contains(&throttle));
    }

    #[test]
    fn manual_vspeed_keeps_configured_gains() {
        let t0 = Instant::now();
        let mut l = loops(t0);
        let act = ProgramId::VspeedManual.control(&hovering(), &mut l, t0 + Duration::from_millis(100));
        assert!(act.throttle.is_some());
        assert!((l.vertical_speed.gains().kp - 0.181).abs() < EPSILON);
    }

    #[test]
    fn descent_drives_vertical_speed_setpoint() {
        let t0 = Instant::now();
        let mut l = loops(t0);
        ProgramId::ControlledDescent.control(&hovering(), &mut l, t0 + Duration::from_millis(100));
        assert!((l.vertical_speed.setpoint() + 3.0).abs() < EPSILON);
    }

    #[test]
    fn altitude_loop_feeds_vertical_speed_setpoint() {
        let t0 = Instant::now();
        let mut l = loops(t0);
        // 5 m below the 85 m target: kp 1.5 saturates at +5 m/s
        ProgramId::AltitudeManual.control(&hovering(), &mut l, t0 + Duration::from_secs(1));
        assert!((l.vertical_speed.setpoint() - 5.0).abs() < EPSILON);
    }

    #[test]
    fn stabilize_engages_autopilot() {
        let t0 = Instant::now();
        let mut l = loops(t0);
        let act = ProgramId::HrzStabilize.control(&hovering(), &mut l, t0 + Duration::from_millis(100));
        assert_eq!(
            act.autopilot,
            Some(AutopilotCommand::Engage { target_direction: Vec3::new(0.0, 1.0, 0.0) })
        );
        assert!(!ProgramId::HrzStabilize.manual_attitude());
    }

    #[test]
    fn edits_follow_program_policy() {
        let t0 = Instant::now();
        let mut l = loops(t0);
        let db = MissionProgramDatabase::standard();
        let descent = db.by_id(ProgramId::ControlledDescent).editability;
        let err = l.set_setpoint(ControlLoop::VerticalSpeed, 2.0, &descent).unwrap_err();
        assert!(matches!(err, FcError::EditRejected { what: "setpoint", .. }));

        let manual = db.by_id(ProgramId::VspeedManual).editability;
        l.set_setpoint(ControlLoop::VerticalSpeed, 2.0, &manual).unwrap();
        assert!((l.vertical_speed.setpoint() - 2.0).abs() < EPSILON);
        assert!(l.set_gains(ControlLoop::Altitude, PidGains::default(), &manual).is_err());
    }
}
