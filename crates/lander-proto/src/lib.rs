pub mod telemetry;

pub use telemetry::{ConnectionState, PidDiagnostics, SchedulerTimings, TelemetrySnapshot, Vec3};
