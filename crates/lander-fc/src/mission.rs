//! Mission program catalog and the controller that tracks the active program
//! and the hand controller's switches.

use std::fmt;
use std::str::FromStr;

use lander_rc::{Axis, RcCommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FcError, Result};
use crate::state_var::StateVariable;

/// Vertical speed change per rocker press, m/s.
pub const ROCKER_STEP: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramId {
    FullManual,
    VspeedManual,
    VspeedAuto,
    AltitudeManual,
    AltitudeAuto,
    ControlledDescent,
    HrzStabilize,
}

impl ProgramId {
    /// Catalog order.
    pub const ALL: [ProgramId; 7] = [
        ProgramId::FullManual,
        ProgramId::VspeedManual,
        ProgramId::VspeedAuto,
        ProgramId::AltitudeManual,
        ProgramId::AltitudeAuto,
        ProgramId::ControlledDescent,
        ProgramId::HrzStabilize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProgramId::FullManual => "full_manual",
            ProgramId::VspeedManual => "vspeed_manual",
            ProgramId::VspeedAuto => "vspeed_auto",
            ProgramId::AltitudeManual => "altitude_manual",
            ProgramId::AltitudeAuto => "altitude_auto",
            ProgramId::ControlledDescent => "controlled_descent",
            ProgramId::HrzStabilize => "hrz_stabilize",
        }
    }

    pub fn ordinal(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgramId {
    type Err = FcError;

    fn from_str(s: &str) -> Result<Self> {
        ProgramId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| FcError::InvalidActivation(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlLoop {
    VerticalSpeed,
    Altitude,
}

impl fmt::Display for ControlLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlLoop::VerticalSpeed => f.write_str("vertical speed"),
            ControlLoop::Altitude => f.write_str("altitude"),
        }
    }
}

/// Which controller parameters the operator may edit while a program runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Editability {
    pub vertical_speed_setpoint: bool,
    pub vertical_speed_gains: bool,
    pub altitude_setpoint: bool,
    pub altitude_gains: bool,
}

impl Editability {
    const fn new(vs_sp: bool, vs_gains: bool, alt_sp: bool, alt_gains: bool) -> Self {
        Self {
            vertical_speed_setpoint: vs_sp,
            vertical_speed_gains: vs_gains,
            altitude_setpoint: alt_sp,
            altitude_gains: alt_gains,
        }
    }

    pub fn setpoint(&self, l: ControlLoop) -> bool {
        match l {
            ControlLoop::VerticalSpeed => self.vertical_speed_setpoint,
            ControlLoop::Altitude => self.altitude_setpoint,
        }
    }

    pub fn gains(&self, l: ControlLoop) -> bool {
        match l {
            ControlLoop::VerticalSpeed => self.vertical_speed_gains,
            ControlLoop::Altitude => self.altitude_gains,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionProgram {
    pub id: ProgramId,
    pub name: &'static str,
    pub description: &'static str,
    pub editability: Editability,
}

/// Activation request as it arrives from the operator: a catalog index or an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramRef {
    Id(String),
    Ordinal(usize),
}

impl From<ProgramId> for ProgramRef {
    fn from(id: ProgramId) -> Self {
        ProgramRef::Id(id.as_str().to_string())
    }
}

impl FromStr for ProgramRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<usize>() {
            Ok(n) => ProgramRef::Ordinal(n),
            Err(_) => ProgramRef::Id(s.to_string()),
        })
    }
}

impl fmt::Display for ProgramRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramRef::Id(s) => write!(f, "'{}'", s),
            ProgramRef::Ordinal(n) => write!(f, "#{}", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct MissionProgramDatabase {
    programs: Vec<MissionProgram>,
    default_id: ProgramId,
}

impl Default for MissionProgramDatabase {
    fn default() -> Self {
        Self::standard()
    }
}

impl MissionProgramDatabase {
    pub fn standard() -> Self {
        let programs = ProgramId::ALL.into_iter().map(catalog_entry).collect();
        Self { programs, default_id: ProgramId::FullManual }
    }

    pub fn with_default(mut self, id: ProgramId) -> Self {
        self.default_id = id;
        self
    }

    pub fn get(&self, r: &ProgramRef) -> Option<&MissionProgram> {
        match r {
            ProgramRef::Ordinal(n) => self.programs.get(*n),
            ProgramRef::Id(s) => self.programs.iter().find(|p| p.id.as_str() == s),
        }
    }

    pub fn by_id(&self, id: ProgramId) -> &MissionProgram {
        &self.programs[id.ordinal()]
    }

    pub fn default_program(&self) -> &MissionProgram {
        self.by_id(self.default_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MissionProgram> {
        self.programs.iter()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

fn catalog_entry(id: ProgramId) -> MissionProgram {
    let (name, description, editability) = match id {
        ProgramId::FullManual => (
            "Manual Flight Control",
            "No controls will be applied to the vessel.",
            Editability::new(true, true, true, true),
        ),
        ProgramId::VspeedManual => (
            "Vertical Speed Control - Manual",
            "Vessel will maintain a specified vertical (relative to the planet surface) speed. PID controller gains are editable.",
            Editability::new(true, true, false, false),
        ),
        ProgramId::VspeedAuto => (
            "Vertical Speed Control - Auto",
            "Vessel will maintain a specified vertical (relative to the planet surface) speed. PID controller gains are automatically adjusted according to the vessel's thrust-to-weight ratio.",
            Editability::new(true, false, true, true),
        ),
        ProgramId::AltitudeManual => (
            "Altitude Control - Manual",
            "Vessel will maintain a specified mean altitude (relative to the planet sea-level). PID controller gains are editable.",
            Editability::new(false, false, true, true),
        ),
        ProgramId::AltitudeAuto => (
            "Altitude Control - Auto",
            "Vessel will maintain a specified mean altitude (relative to the planet sea-level). PID controller gains are automatically adjusted.",
            Editability::new(false, false, true, false),
        ),
        ProgramId::ControlledDescent => (
            "Controlled Descent",
            "Vessel will descend to the planet's surface in a controlled manner.",
            Editability::new(false, false, false, false),
        ),
        ProgramId::HrzStabilize => (
            "Horizontal Stabilize",
            "Vessel will cancel all horizontal (relative to the planet's surface) speed.",
            Editability::new(true, false, false, false),
        ),
    };
    MissionProgram { id, name, description, editability }
}

/// Manual attitude demand from the joystick, each in [-1, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ManualControls {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// What one RC frame asks the engine to do.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RcEffects {
    /// Vertical speed setpoint change, sum of rocker edges in this frame.
    pub setpoint_nudge: f64,
    /// New engine-active state when the engine master switch moved.
    pub engines: Option<bool>,
    /// Set when the frame forced a program change.
    pub program_changed: Option<ProgramId>,
}

#[derive(Debug)]
pub struct MissionController {
    db: MissionProgramDatabase,
    active: ProgramId,
    autopilot_master: StateVariable<bool>,
    engine_master: StateVariable<bool>,
    rocker_up: StateVariable<bool>,
    rocker_down: StateVariable<bool>,
    controls: Option<ManualControls>,
}

impl MissionController {
    pub fn new(db: MissionProgramDatabase) -> Self {
        let active = db.default_program().id;
        Self {
            db,
            active,
            autopilot_master: StateVariable::with_initial(2, false),
            engine_master: StateVariable::with_initial(2, false),
            rocker_up: StateVariable::with_initial(2, false),
            rocker_down: StateVariable::with_initial(2, false),
            controls: None,
        }
    }

    pub fn database(&self) -> &MissionProgramDatabase {
        &self.db
    }

    pub fn active(&self) -> &MissionProgram {
        self.db.by_id(self.active)
    }

    pub fn active_id(&self) -> ProgramId {
        self.active
    }

    /// Looks the request up and makes it the active program. Unknown
    /// references are logged and leave the active program untouched.
    pub fn activate(&mut self, r: &ProgramRef) -> Result<&MissionProgram> {
        let Some(program) = self.db.get(r) else {
            warn!("mission: could not find mission program {}", r);
            return Err(FcError::InvalidActivation(r.to_string()));
        };
        self.active = program.id;
        info!("mission: activated {} ({})", program.id, program.name);
        Ok(program)
    }

    pub fn program_states(&self) -> impl Iterator<Item = (&MissionProgram, ProgramState)> {
        let active = self.active;
        self.db.iter().map(move |p| {
            let state = if p.id == active { ProgramState::Enabled } else { ProgramState::Disabled };
            (p, state)
        })
    }

    pub fn rc_command_update(&mut self, cmd: &RcCommand) -> RcEffects {
        let mut fx = RcEffects::default();

        self.controls = Some(ManualControls {
            yaw: cmd.axis(Axis::X),
            pitch: cmd.axis(Axis::Y),
            roll: cmd.axis(Axis::Z),
        });

        self.engine_master.update(cmd.engine_master());
        if self.engine_master.has_changed() {
            fx.engines = Some(cmd.engine_master());
        }

        self.autopilot_master.update(cmd.autopilot_master());
        if self.autopilot_master.has_changed_to(&false) && self.active != ProgramId::FullManual {
            warn!("mission: autopilot switch released, reverting to {}", ProgramId::FullManual);
            self.active = ProgramId::FullManual;
            fx.program_changed = Some(ProgramId::FullManual);
        }

        self.rocker_up.update(cmd.rocker_up());
        self.rocker_down.update(cmd.rocker_down());
        if self.active().editability.vertical_speed_setpoint {
            if self.rocker_up.has_changed_to(&true) {
                fx.setpoint_nudge += ROCKER_STEP;
            }
            if self.rocker_down.has_changed_to(&true) {
                fx.setpoint_nudge -= ROCKER_STEP;
            }
        }

        fx
    }

    /// Joystick attitude, `None` until the first RC frame arrives.
    pub fn controls(&self) -> Option<ManualControls> {
        self.controls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lander_rc::command::{BTN_ROCKER_DOWN, BTN_ROCKER_UP, BTN_SWITCH_BLUE, BTN_SWITCH_RED};

    const EPSILON: f64 = 1e-9;

    fn frame(buttons: u8) -> RcCommand {
        RcCommand::new(buttons, 512, 512, 512)
    }

    #[test]
    fn catalog_order_and_default() {
        let db = MissionProgramDatabase::standard();
        assert_eq!(db.len(), 7);
        let ids: Vec<ProgramId> = db.iter().map(|p| p.id).collect();
        assert_eq!(ids, ProgramId::ALL.to_vec());
        assert_eq!(db.default_program().id, ProgramId::FullManual);
        assert_eq!(db.get(&ProgramRef::Ordinal(6)).map(|p| p.id), Some(ProgramId::HrzStabilize));
        assert_eq!(db.get(&"vspeed_auto".parse().unwrap()).map(|p| p.id), Some(ProgramId::VspeedAuto));
    }

    #[test]
    fn editability_of_descent_locks_everything() {
        let db = MissionProgramDatabase::standard();
        let e = db.by_id(ProgramId::ControlledDescent).editability;
        for l in [ControlLoop::VerticalSpeed, ControlLoop::Altitude] {
            assert!(!e.setpoint(l));
            assert!(!e.gains(l));
        }
        let e = db.by_id(ProgramId::VspeedAuto).editability;
        assert!(e.setpoint(ControlLoop::VerticalSpeed));
        assert!(!e.gains(ControlLoop::VerticalSpeed));
    }

    #[test]
    fn out_of_range_ordinal_keeps_active_program() {
        let mut mc = MissionController::new(MissionProgramDatabase::standard());
        mc.activate(&ProgramRef::Ordinal(2)).unwrap();
        let err = mc.activate(&ProgramRef::Ordinal(7)).unwrap_err();
        assert!(matches!(err, FcError::InvalidActivation(_)));
        assert_eq!(mc.active_id(), ProgramId::VspeedAuto);
        assert!(mc.activate(&ProgramRef::Id("warp_drive".into())).is_err());
        assert_eq!(mc.active_id(), ProgramId::VspeedAuto);
    }

    #[test]
    fn exactly_one_program_enabled() {
        let mut mc = MissionController::new(MissionProgramDatabase::standard());
        mc.activate(&ProgramId::AltitudeAuto.into()).unwrap();
        let enabled: Vec<ProgramId> = mc
            .program_states()
            .filter(|(_, s)| *s == ProgramState::Enabled)
            .map(|(p, _)| p.id)
            .collect();
        assert_eq!(enabled, vec![ProgramId::AltitudeAuto]);
    }

    #[test]
    fn rocker_nudges_once_per_edge() {
        let mut mc = MissionController::new(MissionProgramDatabase::standard());
        mc.activate(&ProgramId::VspeedManual.into()).unwrap();
        assert!((mc.rc_command_update(&frame(BTN_ROCKER_UP)).setpoint_nudge - 0.5).abs() < EPSILON);
        // held: no further nudge
        assert_eq!(mc.rc_command_update(&frame(BTN_ROCKER_UP)).setpoint_nudge, 0.0);
        assert_eq!(mc.rc_command_update(&frame(0)).setpoint_nudge, 0.0);
        assert!((mc.rc_command_update(&frame(BTN_ROCKER_DOWN)).setpoint_nudge + 0.5).abs() < EPSILON);
    }

    #[test]
    fn rocker_ignored_when_setpoint_locked() {
        let mut mc = MissionController::new(MissionProgramDatabase::standard());
        mc.activate(&ProgramId::ControlledDescent.into()).unwrap();
        assert_eq!(mc.rc_command_update(&frame(BTN_ROCKER_UP)).setpoint_nudge, 0.0);
    }

    #[test]
    fn releasing_autopilot_switch_forces_manual() {
        let mut mc = MissionController::new(MissionProgramDatabase::standard());
        mc.rc_command_update(&frame(BTN_SWITCH_BLUE));
        mc.activate(&ProgramId::AltitudeManual.into()).unwrap();
        let fx = mc.rc_command_update(&frame(BTN_SWITCH_BLUE));
        assert_eq!(fx.program_changed, None);
        let fx = mc.rc_command_update(&frame(0));
        assert_eq!(fx.program_changed, Some(ProgramId::FullManual));
        assert_eq!(mc.active_id(), ProgramId::FullManual);
    }

    #[test]
    fn engine_switch_reports_changes_only() {
        let mut mc = MissionController::new(MissionProgramDatabase::standard());
        assert_eq!(mc.rc_command_update(&frame(0)).engines, None);
        assert_eq!(mc.rc_command_update(&frame(BTN_SWITCH_RED)).engines, Some(true));
        assert_eq!(mc.rc_command_update(&frame(BTN_SWITCH_RED)).engines, None);
        assert_eq!(mc.rc_command_update(&frame(0)).engines, Some(false));
    }

    #[test]
    fn joystick_maps_to_attitude() {
        let mut mc = MissionController::new(MissionProgramDatabase::standard());
        assert!(mc.controls().is_none());
        mc.rc_command_update(&RcCommand::new(0, 1023, 0, 512));
        let c = mc.controls().unwrap();
        assert!((c.yaw - 1.0).abs() < EPSILON);
        assert!((c.pitch - 1.0).abs() < EPSILON);
        assert_eq!(c.roll, 0.0);
    }
}
