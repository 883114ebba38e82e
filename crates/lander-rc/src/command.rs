//! Hand-controller state decoded from a 0x40 state frame.

/// Largest raw reading of a joystick axis (10-bit ADC).
pub const AXIS_RAW_MAX: u16 = 1023;

/// Normalized axis magnitudes strictly inside this band read as exactly zero.
pub const DEAD_ZONE: f64 = 0.04;

pub const BTN_SWITCH_RED: u8 = 1 << 0;
pub const BTN_SWITCH_BLUE: u8 = 1 << 1;
pub const BTN_PUSH_RED: u8 = 1 << 2;
pub const BTN_PUSH_GREEN: u8 = 1 << 3;
pub const BTN_ROCKER_UP: u8 = 1 << 4;
pub const BTN_ROCKER_DOWN: u8 = 1 << 5;
pub const BTN_JOYSTICK: u8 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

/// Raw button bitmask plus the three raw axis readings. Everything else is
/// derived on access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RcCommand {
    pub buttons: u8,
    pub axis_raw: [u16; 3],
}

impl RcCommand {
    pub fn new(buttons: u8, x: u16, y: u16, z: u16) -> Self {
        Self { buttons, axis_raw: [x, y, z] }
    }

    fn button(&self, mask: u8) -> bool {
        self.buttons & mask != 0
    }

    /// Red master switch: engines armed.
    pub fn engine_master(&self) -> bool {
        self.button(BTN_SWITCH_RED)
    }

    /// Blue master switch: autopilot authorized.
    pub fn autopilot_master(&self) -> bool {
        self.button(BTN_SWITCH_BLUE)
    }

    pub fn push_red(&self) -> bool {
        self.button(BTN_PUSH_RED)
    }

    pub fn push_green(&self) -> bool {
        self.button(BTN_PUSH_GREEN)
    }

    pub fn rocker_up(&self) -> bool {
        self.button(BTN_ROCKER_UP)
    }

    pub fn rocker_down(&self) -> bool {
        self.button(BTN_ROCKER_DOWN)
    }

    pub fn joystick_button(&self) -> bool {
        self.button(BTN_JOYSTICK)
    }

    /// Dead-zone filtered axis in [-1, 1]. Y and Z are inverted so that
    /// pushing the stick forward reads positive.
    pub fn axis(&self, axis: Axis) -> f64 {
        let v = normalize_axis(self.axis_raw[axis as usize]);
        let v = match axis {
            Axis::X => v,
            Axis::Y | Axis::Z => -v,
        };
        dead_zone(v)
    }

    pub fn axes(&self) -> [f64; 3] {
        [self.axis(Axis::X), self.axis(Axis::Y), self.axis(Axis::Z)]
    }
}

/// Maps [0, 1023] onto [-1, 1].
pub fn normalize_axis(raw: u16) -> f64 {
    let raw = raw.min(AXIS_RAW_MAX);
    (f64::from(raw) / f64::from(AXIS_RAW_MAX) - 0.5) * 2.0
}

/// Values at exactly +/-DEAD_ZONE pass through unchanged.
pub fn dead_zone(v: f64) -> f64 {
    if v > -DEAD_ZONE && v < DEAD_ZONE {
        0.0
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn buttons_decode_from_bitmask() {
        let cmd = RcCommand::new(BTN_SWITCH_BLUE | BTN_ROCKER_DOWN | BTN_JOYSTICK, 512, 512, 512);
        assert!(!cmd.engine_master());
        assert!(cmd.autopilot_master());
        assert!(!cmd.push_red());
        assert!(!cmd.push_green());
        assert!(!cmd.rocker_up());
        assert!(cmd.rocker_down());
        assert!(cmd.joystick_button());
    }

    #[test]
    fn axis_extremes_map_to_unit_range() {
        let cmd = RcCommand::new(0, 1023, 1023, 0);
        assert!((cmd.axis(Axis::X) - 1.0).abs() < EPSILON);
        assert!((cmd.axis(Axis::Y) + 1.0).abs() < EPSILON);
        assert!((cmd.axis(Axis::Z) - 1.0).abs() < EPSILON);

        let cmd = RcCommand::new(0, 0, 0, 1023);
        assert!((cmd.axis(Axis::X) + 1.0).abs() < EPSILON);
        assert!((cmd.axis(Axis::Y) - 1.0).abs() < EPSILON);
        assert!((cmd.axis(Axis::Z) + 1.0).abs() < EPSILON);
    }

    #[test]
    fn centered_stick_reads_exactly_zero() {
        for raw in 492..=531u16 {
            let cmd = RcCommand::new(0, raw, raw, raw);
            assert_eq!(cmd.axes(), [0.0, 0.0, 0.0], "raw={}", raw);
        }
    }

    #[test]
    fn just_outside_dead_zone_passes_through() {
        // 532/1023 maps to ~0.0401
        let cmd = RcCommand::new(0, 532, 0, 0);
        let x = cmd.axis(Axis::X);
        assert!(x >= DEAD_ZONE && x < 0.041);

        // 491/1023 maps to ~-0.0401
        let cmd = RcCommand::new(0, 491, 0, 0);
        assert!(cmd.axis(Axis::X) <= -DEAD_ZONE);
    }

    #[test]
    fn dead_zone_boundary_is_deterministic() {
        assert_eq!(dead_zone(DEAD_ZONE), DEAD_ZONE);
        assert_eq!(dead_zone(-DEAD_ZONE), -DEAD_ZONE);
        assert_eq!(dead_zone(0.039_999), 0.0);
        assert_eq!(dead_zone(-0.039_999), 0.0);
    }

    #[test]
    fn out_of_range_raw_is_saturated() {
        assert!((normalize_axis(4000) - 1.0).abs() < EPSILON);
    }
}
