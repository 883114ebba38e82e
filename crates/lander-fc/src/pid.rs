use std::time::Instant;

use lander_proto::PidDiagnostics;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub output_min: f64,
    pub output_max: f64,
    pub setpoint: f64,
}

impl PidConfig {
    /// Throttle loop: output is a throttle fraction.
    pub fn vertical_speed() -> Self {
        Self { kp: 0.181, ki: 0.09, kd: 0.005, output_min: 0.0, output_max: 1.0, setpoint: 0.0 }
    }

    /// Outer altitude loop: output is a vertical speed setpoint in m/s.
    pub fn altitude() -> Self {
        Self { kp: 1.5, ki: 0.005, kd: 0.005, output_min: -5.0, output_max: 5.0, setpoint: 85.0 }
    }
}

/// A `[controllers.*]` table as written in the config file. Missing keys
/// keep the loop's stock tuning.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct PidOverrides {
    pub kp: Option<f64>,
    pub ki: Option<f64>,
    pub kd: Option<f64>,
    pub output_min: Option<f64>,
    pub output_max: Option<f64>,
    pub setpoint: Option<f64>,
}

impl PidOverrides {
    pub fn over(self, base: PidConfig) -> PidConfig {
        PidConfig {
            kp: self.kp.unwrap_or(base.kp),
            ki: self.ki.unwrap_or(base.ki),
            kd: self.kd.unwrap_or(base.kd),
            output_min: self.output_min.unwrap_or(base.output_min),
            output_max: self.output_max.unwrap_or(base.output_max),
            setpoint: self.setpoint.unwrap_or(base.setpoint),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    /// Gain schedule from the thrust-to-weight ratio `ku = weight / max_thrust`.
    /// None when there is no usable thrust.
    pub fn thrust_to_weight(weight: f64, max_thrust: f64) -> Option<Self> {
        if max_thrust.is_nan() || max_thrust <= 0.0 {
            return None;
        }
        let ku = weight / max_thrust;
        Some(Self { kp: 0.70 * ku, ki: ku / 3.0, kd: ku / 50.0 })
    }
}

/// NaN tolerant clamp that never panics on reversed bounds.
fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}

#[derive(Debug, Clone)]
pub struct PidController {
    name: &'static str,
    gains: PidGains,
    output_min: f64,
    output_max: f64,
    setpoint: f64,

    integral: f64,
    prev_value: f64,
    prev_error: f64,
    prev_time: Instant,

    p: f64,
    i: f64,
    d: f64,
    u: f64,
}

impl PidController {
    pub fn new(name: &'static str, cfg: &PidConfig) -> Self {
        Self::new_at(name, cfg, Instant::now())
    }

    pub fn new_at(name: &'static str, cfg: &PidConfig, start: Instant) -> Self {
        let mut pid = Self {
            name,
            gains: PidGains { kp: cfg.kp, ki: cfg.ki, kd: cfg.kd },
            output_min: cfg.output_min,
            output_max: cfg.output_max,
            setpoint: cfg.setpoint,
            integral: 0.0,
            prev_value: 0.0,
            prev_error: 0.0,
            prev_time: start,
            p: 0.0,
            i: 0.0,
            d: 0.0,
            u: 0.0,
        };
        pid.set_output_limits(cfg.output_min, cfg.output_max);
        pid
    }

    pub fn update(&mut self, process_value: f64) -> f64 {
        self.update_at(process_value, Instant::now())
    }

    /// One control step at `now`. A zero or backwards timestep returns the
    /// previous output and leaves all state untouched.
    pub fn update_at(&mut self, process_value: f64, now: Instant) -> f64 {
        let dt = match now.checked_duration_since(self.prev_time) {
            Some(d) if !d.is_zero() => d.as_secs_f64(),
            _ => return self.u,
        };

        let error = self.setpoint - process_value;
        self.p = self.gains.kp * error;
        self.i = self.integral;
        self.d = -self.gains.kd * (process_value - self.prev_value) / dt;
        self.u = clamp(self.p + self.i + self.d, self.output_min, self.output_max);

        self.integral = clamp(self.integral + self.gains.ki * error * dt, self.output_min, self.output_max);

        self.prev_value = process_value;
        self.prev_error = error;
        self.prev_time = now;
        self.u
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    pub fn output_limits(&self) -> (f64, f64) {
        (self.output_min, self.output_max)
    }

    /// Reversed bounds are swapped. The integral is pulled into the new range.
    pub fn set_output_limits(&mut self, min: f64, max: f64) {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        self.output_min = lo;
        self.output_max = hi;
        self.integral = clamp(self.integral, lo, hi);
    }

    pub fn output(&self) -> f64 {
        self.u
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_error(&self) -> f64 {
        self.prev_error
    }

    /// Clears the accumulated state and restarts the clock at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.integral = 0.0;
        self.prev_value = 0.0;
        self.prev_error = 0.0;
        self.prev_time = now;
        self.p = 0.0;
        self.i = 0.0;
        self.d = 0.0;
        self.u = 0.0;
    }

    pub fn diagnostics(&self) -> PidDiagnostics {
        PidDiagnostics {
            setpoint: self.setpoint,
            kp: self.gains.kp,
            ki: self.gains.ki,
            kd: self.gains.kd,
            p: self.p,
            i: self.i,
            d: self.d,
            output: self.u,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    const EPSILON: f64 = 1e-6;

    fn cfg(kp: f64, ki: f64, kd: f64, min: f64, max: f64, sp: f64) -> PidConfig {
        PidConfig { kp, ki, kd, output_min: min, output_max: max, setpoint: sp }
    }

    #[test]
    fn output_and_integral_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let lo = rng.gen_range(-10.0..0.0);
            let hi = rng.gen_range(0.0..10.0);
            let c = cfg(
                rng.gen_range(-50.0..50.0),
                rng.gen_range(-50.0..50.0),
                rng.gen_range(-50.0..50.0),
                lo,
                hi,
                rng.gen_range(-1000.0..1000.0),
            );
            let t0 = Instant::now();
            let mut pid = PidController::new_at("fuzz", &c, t0);
            let mut t = t0;
            for _ in 0..100 {
                t += Duration::from_micros(rng.gen_range(1..2_000_000));
                let u = pid.update_at(rng.gen_range(-1e4..1e4), t);
                assert!(u >= lo && u <= hi, "u={} outside [{}, {}]", u, lo, hi);
                assert!(pid.integral() >= lo && pid.integral() <= hi);
                assert!(pid.diagnostics().i >= lo && pid.diagnostics().i <= hi);
            }
        }
    }

    #[test]
    fn integral_saturates_at_output_bound() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at("vs", &cfg(0.0, 100.0, 0.0, 0.0, 1.0, 50.0), t0);
        pid.update_at(0.0, t0 + Duration::from_secs(10));
        assert!((pid.integral() - 1.0).abs() < EPSILON);
        pid.update_at(0.0, t0 + Duration::from_secs(20));
        assert!((pid.output() - 1.0).abs() < EPSILON);
    }

    #[test]
    fn stale_timestep_returns_last_output() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at("vs", &cfg(0.1, 0.0, 0.0, -10.0, 10.0, 5.0), t0);
        let t1 = t0 + Duration::from_millis(100);
        let u1 = pid.update_at(0.0, t1);
        assert!((u1 - 0.5).abs() < EPSILON);
        assert_eq!(pid.update_at(-40.0, t1), u1);
        assert_eq!(pid.update_at(-40.0, t0), u1);
        assert!((pid.last_error() - 5.0).abs() < EPSILON);
    }

    #[test]
    fn derivative_acts_on_measurement() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at("alt", &cfg(0.0, 0.0, 1.0, -100.0, 100.0, 0.0), t0);
        pid.update_at(0.0, t0 + Duration::from_secs(1));
        // rising measurement pushes the output down
        let u = pid.update_at(2.0, t0 + Duration::from_secs(2));
        assert!((u + 2.0).abs() < EPSILON);

        // a setpoint jump alone does not kick the D term
        pid.set_setpoint(500.0);
        pid.update_at(2.0, t0 + Duration::from_secs(3));
        assert!(pid.diagnostics().d.abs() < EPSILON);
    }

    #[test]
    fn integral_lags_one_step() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at("vs", &cfg(0.0, 1.0, 0.0, -10.0, 10.0, 1.0), t0);
        let u1 = pid.update_at(0.0, t0 + Duration::from_secs(1));
        assert!(u1.abs() < EPSILON);
        let u2 = pid.update_at(0.0, t0 + Duration::from_secs(2));
        assert!((u2 - 1.0).abs() < EPSILON);
    }

    #[test]
    fn thrust_to_weight_schedule() {
        let g = PidGains::thrust_to_weight(1000.0, 2000.0).unwrap();
        assert!((g.kp - 0.35).abs() < EPSILON);
        assert!((g.ki - 0.166_666_7).abs() < EPSILON);
        assert!((g.kd - 0.01).abs() < EPSILON);
        assert!(PidGains::thrust_to_weight(1000.0, 0.0).is_none());
        assert!(PidGains::thrust_to_weight(1000.0, f64::NAN).is_none());
    }

    #[test]
    fn overrides_keep_stock_tuning_for_missing_keys() {
        let o = PidOverrides { kp: Some(2.0), setpoint: Some(120.0), ..Default::default() };
        let c = o.over(PidConfig::altitude());
        assert_eq!(c.kp, 2.0);
        assert_eq!(c.setpoint, 120.0);
        assert_eq!((c.ki, c.kd, c.output_min, c.output_max), (0.005, 0.005, -5.0, 5.0));
        assert_eq!(PidOverrides::default().over(PidConfig::vertical_speed()), PidConfig::vertical_speed());
    }

    #[test]
    fn reversed_limits_are_swapped() {
        let t0 = Instant::now();
        let mut pid = PidController::new_at("vs", &cfg(1.0, 0.0, 0.0, 1.0, -1.0, 0.0), t0);
        assert_eq!(pid.output_limits(), (-1.0, 1.0));
        let u = pid.update_at(-100.0, t0 + Duration::from_millis(10));
        assert!((u - 1.0).abs() < EPSILON);
    }
}
