//! Flight control engine: a single-threaded scheduler running three
//! periodic tasks over one owned telemetry snapshot.
//!
//! * short period: telemetry refresh, control law, actuation
//! * long period: body-change detection and the budgeted surface scan
//! * extra-long period: provider heartbeat
//!
//! Consumers talk to the engine through an [`EngineLink`]: commands go in on
//! an mpsc queue, state changes come out on a broadcast channel and every
//! short tick publishes a fresh snapshot on a watch channel. None of these
//! can block the scheduler.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lander_proto::{ConnectionState, SchedulerTimings, TelemetrySnapshot};
use lander_rc::RcCommand;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::control::{Actuation, AutopilotCommand, ControlLoops};
use crate::error::{FcError, Result};
use crate::mission::{
    ControlLoop, Editability, MissionController, MissionProgram, MissionProgramDatabase, ProgramId, ProgramRef,
};
use crate::pid::{PidConfig, PidGains};
use crate::scan::{ScanProgress, SurfaceScan};
use crate::source::{ConnectParams, Connector, TelemetrySource};
use crate::state_var::StateVariable;
use crate::telemetry::{self, Subscriptions};
use crate::{ControllersConfig, FcConfig, MissionConfig, ScanConfig, SchedulerConfig};

pub const COMMAND_QUEUE: usize = 64;
pub const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub connect: ConnectParams,
    /// Connect as soon as [`FlightEngine::run`] starts.
    pub auto_connect: bool,
    pub short_period: Duration,
    pub long_period: Duration,
    pub xlong_period: Duration,
    pub timing_window: usize,
    pub vertical_speed: PidConfig,
    pub altitude: PidConfig,
    pub scan: ScanConfig,
    pub default_program: ProgramId,
}

impl EngineConfig {
    pub fn new(connect: ConnectParams) -> Self {
        Self::from_sections(
            connect,
            &SchedulerConfig::default(),
            &ControllersConfig::default(),
            &ScanConfig::default(),
            ProgramId::FullManual,
        )
    }

    pub fn from_sections(
        connect: ConnectParams,
        sched: &SchedulerConfig,
        controllers: &ControllersConfig,
        scan: &ScanConfig,
        default_program: ProgramId,
    ) -> Self {
        Self {
            connect,
            auto_connect: false,
            short_period: Duration::from_millis(sched.short_period_ms.max(1)),
            long_period: Duration::from_millis(sched.long_period_ms.max(1)),
            xlong_period: Duration::from_millis(sched.xlong_period_ms.max(1)),
            timing_window: sched.timing_window,
            vertical_speed: controllers.vertical_speed.clone(),
            altitude: controllers.altitude.clone(),
            scan: scan.clone(),
            default_program,
        }
    }

    /// Engine settings from the config file sections.
    pub fn from_config(
        fc: &FcConfig,
        sched: &SchedulerConfig,
        controllers: &ControllersConfig,
        scan: &ScanConfig,
        mission: &MissionConfig,
    ) -> Result<Self> {
        let default_program = match mission.default_program.as_deref() {
            Some(id) => id.parse()?,
            None => ProgramId::FullManual,
        };
        let connect = ConnectParams {
            name: fc.client_name.clone().unwrap_or_else(|| FcConfig::DEFAULT_CLIENT_NAME.to_string()),
            address: fc.address.clone().unwrap_or_else(|| FcConfig::DEFAULT_ADDRESS.to_string()),
            rpc_port: fc.rpc_port.unwrap_or(FcConfig::DEFAULT_RPC_PORT),
            stream_port: fc.stream_port.unwrap_or(FcConfig::DEFAULT_STREAM_PORT),
        };
        let mut cfg = Self::from_sections(connect, sched, controllers, scan, default_program);
        cfg.auto_connect = fc.enable;
        Ok(cfg)
    }
}

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Connect,
    Disconnect,
    Activate(ProgramRef),
    SetSetpoint { control_loop: ControlLoop, value: f64 },
    SetGains { control_loop: ControlLoop, gains: PidGains },
    Rc(RcCommand),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Short,
    Long,
    XLong,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Short => f.write_str("ST"),
            TaskKind::Long => f.write_str("LT"),
            TaskKind::XLong => f.write_str("XLT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connected { version: String },
    Disconnected { reason: String },
    ProgramActivated { id: ProgramId, name: &'static str, editability: Editability },
    BodyChanged { from: String, to: String },
    Overrun { task: TaskKind, elapsed: Duration, period: Duration },
    ScanCompleted,
}

impl EngineEvent {
    fn activated(p: &MissionProgram) -> Self {
        EngineEvent::ProgramActivated { id: p.id, name: p.name, editability: p.editability }
    }
}

/// Consumer side of a running engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EngineLink {
    commands: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    snapshots: watch::Receiver<TelemetrySnapshot>,
    stop: Arc<AtomicBool>,
}

impl EngineLink {
    /// Queues a command without waiting. Returns false when the queue is full
    /// or the engine is gone.
    pub fn send(&self, cmd: EngineCommand) -> bool {
        match self.commands.try_send(cmd) {
            Ok(()) => true,
            Err(e) => {
                debug!("engine: command dropped: {}", e);
                false
            }
        }
    }

    pub async fn send_async(&self, cmd: EngineCommand) -> bool {
        self.commands.send(cmd).await.is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn snapshots(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> TelemetrySnapshot {
        self.snapshots.borrow().clone()
    }

    /// Asks the scheduler loop to finish its current pass and shut down.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct PeriodicTask {
    kind: TaskKind,
    period: Duration,
    next_due: Instant,
    timings: StateVariable<f64>,
}

impl PeriodicTask {
    fn new(kind: TaskKind, period: Duration, window: usize, start: Instant) -> Self {
        Self { kind, period, next_due: start + period, timings: StateVariable::new(window) }
    }

    fn due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// Advances to the first slot after `now`; missed slots are skipped.
    fn schedule_next(&mut self, now: Instant) {
        self.next_due += self.period;
        if self.next_due <= now {
            let behind = now.duration_since(self.next_due).as_nanos();
            let skip = behind / self.period.as_nanos().max(1) + 1;
            self.next_due += self.period * u32::try_from(skip).unwrap_or(u32::MAX);
        }
    }

    /// Records a processing time; returns the overrun amount if any.
    fn record(&mut self, elapsed: Duration) -> Option<Duration> {
        self.timings.update(elapsed.as_secs_f64());
        elapsed.checked_sub(self.period).filter(|d| !d.is_zero())
    }

    fn mean(&self) -> f64 {
        self.timings.get_mean().unwrap_or(0.0)
    }
}

pub struct FlightEngine {
    cfg: EngineConfig,
    connector: Box<dyn Connector>,
    source: Option<Box<dyn TelemetrySource>>,
    subs: Subscriptions,
    g: f64,

    snapshot: TelemetrySnapshot,
    mission: MissionController,
    loops: ControlLoops,
    scan: SurfaceScan,
    body: StateVariable<String>,
    autopilot_engaged: bool,
    pending_engines: Option<bool>,

    tasks: [PeriodicTask; 3],
    last_heartbeat: Option<Instant>,

    commands: mpsc::Receiver<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    snapshots: watch::Sender<TelemetrySnapshot>,
    stop: Arc<AtomicBool>,
}

impl FlightEngine {
    pub fn new(cfg: EngineConfig, connector: Box<dyn Connector>) -> (Self, EngineLink) {
        Self::new_at(cfg, connector, Instant::now())
    }

    pub fn new_at(cfg: EngineConfig, connector: Box<dyn Connector>, start: Instant) -> (Self, EngineLink) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let mission = MissionController::new(MissionProgramDatabase::standard().with_default(cfg.default_program));
        let snapshot = TelemetrySnapshot { active_program: mission.active_id().to_string(), ..Default::default() };
        let (snap_tx, snap_rx) = watch::channel(snapshot.clone());
        let stop = Arc::new(AtomicBool::new(false));

        let w = cfg.timing_window;
        let tasks = [
            PeriodicTask::new(TaskKind::Short, cfg.short_period, w, start),
            PeriodicTask::new(TaskKind::Long, cfg.long_period, w, start),
            PeriodicTask::new(TaskKind::XLong, cfg.xlong_period, w, start),
        ];

        let engine = Self {
            loops: ControlLoops::new_at(&cfg.vertical_speed, &cfg.altitude, start),
            scan: SurfaceScan::new(&cfg.scan),
            cfg,
            connector,
            source: None,
            subs: Subscriptions::default(),
            g: 0.0,
            snapshot,
            mission,
            body: StateVariable::new(2),
            autopilot_engaged: false,
            pending_engines: None,
            tasks,
            last_heartbeat: None,
            commands: cmd_rx,
            events: events.clone(),
            snapshots: snap_tx,
            stop: stop.clone(),
        };
        let link = EngineLink { commands: cmd_tx, events, snapshots: snap_rx, stop };
        (engine, link)
    }

    pub fn is_connected(&self) -> bool {
        self.source.is_some()
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    pub fn mission(&self) -> &MissionController {
        &self.mission
    }

    pub fn loops(&self) -> &ControlLoops {
        &self.loops
    }

    /// Scheduler loop. Returns after a stop request, disconnecting first.
    pub fn run(mut self) {
        info!(
            "engine: scheduler started (ST {:?}, LT {:?}, XLT {:?})",
            self.cfg.short_period, self.cfg.long_period, self.cfg.xlong_period
        );
        if self.cfg.auto_connect {
            // failure is logged; the operator can retry with a Connect command
            let _ = self.connect(Instant::now());
        }
        while !self.stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            self.tick_at(now);
            let next = self.tasks.iter().map(|t| t.next_due).min().unwrap_or(now);
            std::thread::sleep(next.saturating_duration_since(Instant::now()));
        }
        self.disconnect("engine shutdown");
        info!("engine: scheduler stopped");
    }

    /// One scheduler pass at `now`: drain queued commands, then run every
    /// task that is due, fastest first.
    pub fn tick_at(&mut self, now: Instant) {
        while let Ok(cmd) = self.commands.try_recv() {
            self.handle_command(cmd, now);
        }

        for i in 0..self.tasks.len() {
            if !self.tasks[i].due(now) {
                continue;
            }
            let kind = self.tasks[i].kind;
            let started = Instant::now();
            let res = match kind {
                TaskKind::Short => self.short_term(now),
                TaskKind::Long => self.long_term(),
                TaskKind::XLong => self.xlong_term(now),
            };
            if let Err(e) = res {
                self.task_failed(kind, e);
            }
            let elapsed = started.elapsed();

            let task = &mut self.tasks[i];
            task.schedule_next(now);
            if let Some(over) = task.record(elapsed) {
                let period = task.period;
                warn!(
                    "engine: {} processing overrun: process time = {:.1} ms, overrun by {:.1} ms",
                    kind,
                    elapsed.as_secs_f64() * 1000.0,
                    over.as_secs_f64() * 1000.0
                );
                self.emit(EngineEvent::Overrun { task: kind, elapsed, period });
            }
            if kind == TaskKind::Short {
                self.publish();
            }
        }
    }

    fn handle_command(&mut self, cmd: EngineCommand, now: Instant) {
        match cmd {
            EngineCommand::Connect => {
                let _ = self.connect(now);
            }
            EngineCommand::Disconnect => self.disconnect("operator request"),
            EngineCommand::Activate(r) => {
                if let Ok(p) = self.mission.activate(&r) {
                    let ev = EngineEvent::activated(p);
                    self.emit(ev);
                }
            }
            EngineCommand::SetSetpoint { control_loop, value } => {
                let policy = self.mission.active().editability;
                match self.loops.set_setpoint(control_loop, value, &policy) {
                    Ok(()) => info!("engine: {} setpoint = {:.3}", self.loops.get(control_loop).name(), value),
                    Err(e) => warn!("engine: {}", e),
                }
            }
            EngineCommand::SetGains { control_loop, gains } => {
                let policy = self.mission.active().editability;
                match self.loops.set_gains(control_loop, gains, &policy) {
                    Ok(()) => info!(
                        "engine: {} gains kp={:.4} ki={:.4} kd={:.4}",
                        self.loops.get(control_loop).name(),
                        gains.kp,
                        gains.ki,
                        gains.kd
                    ),
                    Err(e) => warn!("engine: {}", e),
                }
            }
            EngineCommand::Rc(rc) => {
                let fx = self.mission.rc_command_update(&rc);
                if fx.setpoint_nudge != 0.0 {
                    let sp = self.loops.vertical_speed.setpoint() + fx.setpoint_nudge;
                    self.loops.vertical_speed.set_setpoint(sp);
                    debug!("engine: rc vertical speed setpoint = {:.1}", sp);
                }
                if let Some(on) = fx.engines {
                    info!("engine: engine master switch {}", if on { "on" } else { "off" });
                    self.pending_engines = Some(on);
                }
                if let Some(id) = fx.program_changed {
                    let ev = EngineEvent::activated(self.mission.database().by_id(id));
                    self.emit(ev);
                }
            }
            EngineCommand::Shutdown => self.stop.store(true, Ordering::Relaxed),
        }
    }

    /// Opens the provider and sets up telemetry. No-op when already connected.
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.source.is_some() {
            return Ok(());
        }
        let p = &self.cfg.connect;
        info!("engine: connecting to {}:{} (stream {}) as '{}'", p.address, p.rpc_port, p.stream_port, p.name);
        let mut src = match self.connector.connect(p) {
            Ok(src) => src,
            Err(e) => {
                warn!("engine: unable to connect: {}", e);
                return Err(e);
            }
        };
        let (g, subs, body, version) = match setup(src.as_mut()) {
            Ok(v) => v,
            Err(e) => {
                warn!("engine: telemetry setup failed: {}", e);
                src.close();
                return Err(e);
            }
        };

        self.source = Some(src);
        self.subs = subs;
        self.g = g;
        self.body.clear();
        self.body.update(body);
        self.scan.reset();
        self.loops.vertical_speed.reset(now);
        self.loops.altitude.reset(now);
        self.last_heartbeat = None;
        self.snapshot.connection = ConnectionState::Connected;

        info!("engine: connected to provider version {}", version);
        self.emit(EngineEvent::Connected { version });
        self.publish();
        Ok(())
    }

    /// Closes the provider and drops all subscriptions.
    pub fn disconnect(&mut self, reason: &str) {
        let Some(mut src) = self.source.take() else {
            return;
        };
        if let Err(e) = src.unsubscribe_all() {
            debug!("engine: unsubscribe on disconnect: {}", e);
        }
        src.close();
        self.subs.clear();
        self.autopilot_engaged = false;
        self.snapshot.connection = ConnectionState::Disconnected;
        info!("engine: disconnected ({})", reason);
        self.emit(EngineEvent::Disconnected { reason: reason.to_string() });
        self.publish();
    }

    fn task_failed(&mut self, kind: TaskKind, e: FcError) {
        if e.is_connection_loss() {
            warn!("engine: {} lost connection: {}", kind, e);
            self.disconnect(&e.to_string());
        } else {
            warn!("engine: {} processing failed: {}", kind, e);
        }
    }

    fn short_term(&mut self, now: Instant) -> Result<()> {
        let Some(src) = self.source.as_mut() else {
            return Ok(());
        };
        if self.subs.is_empty() {
            // re-subscription pending on the long task
            return Ok(());
        }
        let raw = self.subs.read_raw(src.as_mut())?;
        let surface_height = src.surface_height(raw.latitude, raw.longitude)?;
        telemetry::apply_raw(&mut self.snapshot, raw, self.g, surface_height);

        let program = self.mission.active_id();
        let mut act: Actuation = program.control(&self.snapshot, &mut self.loops, now);
        if program.manual_attitude() {
            act.attitude = self.mission.controls();
        }
        if !program.uses_autopilot() && self.autopilot_engaged {
            act.autopilot = Some(AutopilotCommand::Disengage);
        }
        act.engines_active = self.pending_engines;

        if !act.is_empty() {
            src.apply(&act)?;
        }
        self.pending_engines = None;
        match act.autopilot {
            Some(AutopilotCommand::Engage { .. }) => self.autopilot_engaged = true,
            Some(AutopilotCommand::Disengage) => self.autopilot_engaged = false,
            None => {}
        }
        Ok(())
    }

    fn long_term(&mut self) -> Result<()> {
        let Some(src) = self.source.as_mut() else {
            return Ok(());
        };

        self.body.update(src.active_body()?);
        if self.body.has_changed() {
            let from = self.body.previous().cloned().unwrap_or_default();
            let to = self.body.get().cloned().unwrap_or_default();
            info!("engine: orbiting body changed {} -> {}, re-subscribing", from, to);
            self.subs.clear();
            self.scan.reset();
            let _ = self.events.send(EngineEvent::BodyChanged { from, to });
        }

        // An empty table means the streams are stale; retried every pass
        // until the provider accepts them again.
        if self.subs.is_empty() {
            src.unsubscribe_all()?;
            self.subs = Subscriptions::establish(src.as_mut())?;
            info!("engine: subscribed {} telemetry streams", self.subs.len());
            return Ok(());
        }

        let distance = self.snapshot.position.norm();
        if distance <= 0.0 {
            // nothing read yet
            return Ok(());
        }
        let progress = self.scan.step(
            self.snapshot.latitude,
            self.snapshot.longitude,
            distance,
            self.snapshot.surface_height,
            |lat, lon| src.surface_height(lat, lon),
        )?;
        if progress == ScanProgress::Completed {
            debug!("engine: surface scan completed");
            self.emit(EngineEvent::ScanCompleted);
        }
        Ok(())
    }

    fn xlong_term(&mut self, now: Instant) -> Result<()> {
        let Some(src) = self.source.as_mut() else {
            return Ok(());
        };
        let period = self.cfg.xlong_period;
        if let Some(last) = self.last_heartbeat {
            if now.saturating_duration_since(last) < period {
                return Ok(());
            }
        }
        self.last_heartbeat = Some(now);
        match src.status() {
            Ok(version) => {
                debug!("engine: heartbeat ok ({})", version);
                Ok(())
            }
            Err(e) => {
                warn!("engine: heartbeat failed: {}", e);
                Err(e)
            }
        }
    }

    fn timings(&self) -> SchedulerTimings {
        SchedulerTimings {
            st_time: self.tasks[0].mean(),
            lt_time: self.tasks[1].mean(),
            xlt_time: self.tasks[2].mean(),
        }
    }

    fn publish(&mut self) {
        self.snapshot.ts_unix_ms = time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000;
        self.snapshot.active_program = self.mission.active_id().to_string();
        self.snapshot.timings = self.timings();
        self.snapshot.vertical_speed_ctrl = self.loops.vertical_speed.diagnostics();
        self.snapshot.altitude_ctrl = self.loops.altitude.diagnostics();
        self.snapshot.surface_height_map = self.scan.heights().to_vec();
        self.snapshots.send_replace(self.snapshot.clone());
    }

    fn emit(&self, ev: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(ev);
    }
}

type Setup = (f64, Subscriptions, String, String);

fn setup(src: &mut dyn TelemetrySource) -> Result<Setup> {
    let g = src.gravitational_constant()?;
    let subs = Subscriptions::establish(src)?;
    let body = src.active_body()?;
    let version = src.status()?;
    Ok((g, subs, body, version))
}
