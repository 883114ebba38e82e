use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use lander_fc::engine::{EngineCommand, EngineConfig, EngineEvent, FlightEngine};
use lander_fc::mission::{MissionController, MissionProgram, MissionProgramDatabase, ProgramId, ProgramRef, ProgramState};
use lander_fc::sim::{SimConfig, SimConnector};
use lander_fc::source::Connector;
use lander_fc::{Backend, ControllersConfig, FcConfig, MissionConfig, ScanConfig, SchedulerConfig};
use lander_proto::TelemetrySnapshot;
use lander_rc::{Axis, RcConfig, RcLink};

use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Parser)]
#[command(name = "lander", version, about = "Lander - vertical flight control for kRPC vessels")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    /// List the mission program catalog.
    Programs {
        #[arg(long)]
        json: bool,
    },
    /// Connect and run the flight control engine.
    Fly {
        /// Program id or catalog index to activate after connecting.
        #[arg(long)]
        program: Option<String>,
        /// Stop after this many seconds (default: until Ctrl-C).
        #[arg(long)]
        duration_s: Option<u64>,
        /// Print one JSON snapshot per second on stdout.
        #[arg(long)]
        json: bool,
    },
    Rc { #[command(subcommand)] cmd: RcCmd },
}

#[derive(Debug, Subcommand)]
enum RcCmd {
    /// Print decoded hand-controller frames.
    Monitor {
        #[arg(long)]
        duration_s: Option<u64>,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    krpc: FcConfig,
    serial: Option<RcConfig>,

    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    controllers: ControllersConfig,
    #[serde(default)]
    scan: ScanConfig,
    #[serde(default)]
    mission: MissionConfig,
    #[serde(default)]
    sim: SimConfig,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg).await?,
        Command::Programs { json } => programs(&cfg, json)?,
        Command::Fly { program, duration_s, json } => fly(&cfg, program, duration_s, json).await?,
        Command::Rc { cmd } => rc_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let k = &cfg.krpc;
    if k.enable {
        let rpc = k.rpc_port.unwrap_or(FcConfig::DEFAULT_RPC_PORT);
        let stream = k.stream_port.unwrap_or(FcConfig::DEFAULT_STREAM_PORT);
        anyhow::ensure!(rpc > 0, "krpc.rpc_port invalid");
        anyhow::ensure!(stream > 0, "krpc.stream_port invalid");
        anyhow::ensure!(rpc != stream, "krpc.rpc_port and krpc.stream_port must differ");
        anyhow::ensure!(k.address.as_deref().map(|a| !a.is_empty()).unwrap_or(true), "krpc.address empty");
        if k.backend == Backend::Krpc && !cfg!(feature = "krpc") {
            warn!("doctor: krpc backend selected but this build lacks --features krpc");
        }
    } else {
        info!("doctor: krpc disabled, `fly` will not connect");
    }

    let s = &cfg.scheduler;
    anyhow::ensure!(s.short_period_ms > 0, "scheduler.short_period_ms must be > 0");
    anyhow::ensure!(
        s.short_period_ms <= s.long_period_ms && s.long_period_ms <= s.xlong_period_ms,
        "scheduler periods must satisfy short <= long <= xlong"
    );
    anyhow::ensure!(s.timing_window > 0, "scheduler.timing_window must be > 0");

    for (name, pid) in [("vertical_speed", &cfg.controllers.vertical_speed), ("altitude", &cfg.controllers.altitude)] {
        anyhow::ensure!(pid.output_min < pid.output_max, "controllers.{}: output_min must be below output_max", name);
        anyhow::ensure!(
            [pid.kp, pid.ki, pid.kd, pid.setpoint].iter().all(|v| v.is_finite()),
            "controllers.{}: gains and setpoint must be finite",
            name
        );
    }

    anyhow::ensure!(cfg.scan.resolution > 0 && cfg.scan.batch > 0, "scan.resolution and scan.batch must be > 0");
    anyhow::ensure!(cfg.scan.spacing_m > 0.0, "scan.spacing_m must be > 0");

    if let Some(serial) = &cfg.serial {
        if serial.enable {
            anyhow::ensure!(serial.device.as_ref().map(|s| !s.is_empty()).unwrap_or(false), "serial.device missing");
            anyhow::ensure!(serial.baud.unwrap_or(RcConfig::DEFAULT_BAUD) > 0, "serial.baud invalid");
        }
    }

    if let Some(id) = &cfg.mission.default_program {
        id.parse::<ProgramId>().with_context(|| format!("mission.default_program '{}'", id))?;
    }

    info!("doctor: OK");
    Ok(())
}

#[derive(Debug, serde::Serialize)]
struct ProgramListing<'a> {
    index: usize,
    #[serde(flatten)]
    program: &'a MissionProgram,
    state: ProgramState,
}

/// Catalog as a freshly started engine would see it: the configured
/// default program is the enabled one.
fn mission_controller(cfg: &Config) -> Result<MissionController> {
    let default = match cfg.mission.default_program.as_deref() {
        Some(id) => id.parse().with_context(|| format!("mission.default_program '{}'", id))?,
        None => ProgramId::FullManual,
    };
    Ok(MissionController::new(MissionProgramDatabase::standard().with_default(default)))
}

fn program_listing(mc: &MissionController) -> Vec<ProgramListing<'_>> {
    mc.program_states()
        .enumerate()
        .map(|(index, (program, state))| ProgramListing { index, program, state })
        .collect()
}

fn programs(cfg: &Config, json: bool) -> Result<()> {
    let mc = mission_controller(cfg)?;
    let list = program_listing(&mc);
    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }
    for l in &list {
        let p = l.program;
        let e = p.editability;
        let mark = if l.state == ProgramState::Enabled { '*' } else { ' ' };
        println!(
            "{}{} {:<20} {:<34} vs_sp={} vs_gains={} alt_sp={} alt_gains={}",
            mark, l.index, p.id, p.name, e.vertical_speed_setpoint, e.vertical_speed_gains, e.altitude_setpoint, e.altitude_gains
        );
        println!("   {}", p.description);
    }
    Ok(())
}

fn connector(cfg: &Config) -> Result<Box<dyn Connector>> {
    match cfg.krpc.backend {
        Backend::Sim => {
            let (conn, _world) = SimConnector::new(SimConfig { realtime: true, ..cfg.sim.clone() });
            Ok(Box::new(conn))
        }
        Backend::Krpc => krpc_connector(),
    }
}

#[cfg(feature = "krpc")]
fn krpc_connector() -> Result<Box<dyn Connector>> {
    Ok(Box::new(lander_fc::krpc::KrpcConnector))
}

#[cfg(not(feature = "krpc"))]
fn krpc_connector() -> Result<Box<dyn Connector>> {
    anyhow::bail!("krpc backend not available; build with --features krpc");
}

async fn fly(cfg: &Config, program: Option<String>, duration_s: Option<u64>, json: bool) -> Result<()> {
    anyhow::ensure!(cfg.krpc.enable, "krpc.enable=false");
    info!("fly: starting ({:?} backend)", cfg.krpc.backend);

    let ecfg = EngineConfig::from_config(&cfg.krpc, &cfg.scheduler, &cfg.controllers, &cfg.scan, &cfg.mission)
        .context("engine config")?;
    let (engine, link) = FlightEngine::new(ecfg, connector(cfg)?);
    let mut events = link.subscribe();

    // The scheduler makes blocking provider calls; keep it off the async workers.
    let engine_task = tokio::task::spawn_blocking(move || engine.run());

    if let Some(p) = program {
        let r: ProgramRef = p.parse()?;
        link.send_async(EngineCommand::Activate(r)).await;
    }

    let rc = match cfg.serial.as_ref() {
        Some(s) if s.enable => {
            let rc_link = RcLink::from_config(s).context("RC open")?;
            let engine_link = link.clone();
            Some(rc_link.spawn(move |cmd| {
                engine_link.send(EngineCommand::Rc(cmd));
            }))
        }
        _ => None,
    };

    let mut snapshots = link.snapshots();
    let mut status_tick = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = async {
        match duration_s {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("fly: interrupted");
                break;
            }
            _ = &mut deadline => {
                info!("fly: duration elapsed");
                break;
            }
            ev = events.recv() => match ev {
                Ok(ev) => log_event(&ev),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("fly: missed {} engine events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = status_tick.tick() => {
                let snap = snapshots.borrow_and_update().clone();
                if json {
                    println!("{}", serde_json::to_string(&snap)?);
                } else {
                    log_status(&snap);
                }
            }
        }
    }

    link.stop();
    if let Some(rc) = rc {
        rc.shutdown().await;
    }
    engine_task.await.context("join engine")?;
    info!("fly: done");
    Ok(())
}

fn log_event(ev: &EngineEvent) {
    match ev {
        EngineEvent::Connected { version } => info!("fly: connected (provider {})", version),
        EngineEvent::Disconnected { reason } => warn!("fly: disconnected: {}", reason),
        EngineEvent::ProgramActivated { id, name, editability: e } => info!(
            "fly: program {} ({}) vs_sp={} vs_gains={} alt_sp={} alt_gains={}",
            id, name, e.vertical_speed_setpoint, e.vertical_speed_gains, e.altitude_setpoint, e.altitude_gains
        ),
        EngineEvent::BodyChanged { from, to } => info!("fly: body {} -> {}", from, to),
        EngineEvent::Overrun { .. } => {}
        EngineEvent::ScanCompleted => debug!("fly: surface scan completed"),
    }
}

fn log_status(s: &TelemetrySnapshot) {
    if !s.is_connected() {
        info!("fly: waiting for connection");
        return;
    }
    info!(
        "fly: {} alt={:.1}m radar={:.1}m vs={:+.2}m/s hs={:.2}m/s thr={:.2} twr={} [{}] st={:.1}ms",
        s.vessel_name,
        s.mean_altitude,
        s.surface_altitude,
        s.vertical_speed,
        s.horizontal_speed,
        s.throttle,
        s.thrust_to_weight().map(|t| format!("{:.2}", t)).unwrap_or_else(|| "-".into()),
        s.active_program,
        s.timings.st_time * 1000.0
    );
}

async fn rc_cmd(cfg: &Config, cmd: RcCmd) -> Result<()> {
    match cmd {
        RcCmd::Monitor { duration_s } => {
            let s = cfg.serial.as_ref().context("no [serial] config section")?;
            anyhow::ensure!(s.enable, "serial.enable=false");
            let link = RcLink::from_config(s).context("RC open")?;
            let handle = link.spawn(|cmd| {
                println!(
                    "buttons={:07b} red={} blue={} x={:+.3} y={:+.3} z={:+.3}",
                    cmd.buttons,
                    cmd.engine_master(),
                    cmd.autopilot_master(),
                    cmd.axis(Axis::X),
                    cmd.axis(Axis::Y),
                    cmd.axis(Axis::Z)
                );
            });

            match duration_s {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => tokio::signal::ctrl_c().await.context("wait for ctrl-c")?,
            }
            info!("rc: {} bytes discarded while resyncing on {}", handle.discarded_bytes(), handle.device());
            handle.shutdown().await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses() {
        let cfg: Config = toml::from_str(include_str!("../../../config/lander.example.toml")).unwrap();
        assert_eq!(cfg.krpc.backend, Backend::Sim);
        assert_eq!(cfg.scheduler.xlong_period_ms, 10_000);
        assert_eq!(cfg.controllers.altitude.setpoint, 85.0);
        assert_eq!(cfg.sim.body.name, "Kerbin");
        assert!(!cfg.serial.unwrap().enable);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: Config = toml::from_str("[krpc]\nenable = true\n").unwrap();
        assert_eq!(cfg.scheduler.short_period_ms, 100);
        assert_eq!(cfg.controllers.vertical_speed.kp, 0.181);
        assert_eq!(cfg.scan.batch, 60);
        assert!(cfg.serial.is_none());
        assert!(cfg.mission.default_program.is_none());
    }

    #[test]
    fn partial_controller_section_keeps_stock_tuning() {
        let cfg: Config = toml::from_str("[krpc]\nenable = true\n\n[controllers.altitude]\nkp = 2.0\n").unwrap();
        let alt = &cfg.controllers.altitude;
        assert_eq!(alt.kp, 2.0);
        assert_eq!(alt.setpoint, 85.0);
        assert_eq!((alt.output_min, alt.output_max), (-5.0, 5.0));
        assert_eq!(cfg.controllers.vertical_speed.kp, 0.181);
    }

    #[test]
    fn listing_marks_configured_default_enabled() {
        let mut cfg: Config = toml::from_str("[krpc]\nenable = false\n").unwrap();
        let mc = mission_controller(&cfg).unwrap();
        let list = program_listing(&mc);
        assert_eq!(list.len(), 7);
        assert_eq!(list[0].state, ProgramState::Enabled);
        assert!(list[1..].iter().all(|l| l.state == ProgramState::Disabled));

        cfg.mission.default_program = Some("altitude_auto".into());
        let mc = mission_controller(&cfg).unwrap();
        let enabled: Vec<_> = program_listing(&mc)
            .into_iter()
            .filter(|l| l.state == ProgramState::Enabled)
            .map(|l| l.program.id)
            .collect();
        assert_eq!(enabled, vec![ProgramId::AltitudeAuto]);

        let json = serde_json::to_value(program_listing(&mc)).unwrap();
        assert_eq!(json[4]["state"], "enabled");
        assert_eq!(json[4]["index"], 4);
    }

    #[tokio::test]
    async fn doctor_rejects_unordered_periods() {
        let mut cfg: Config = toml::from_str("[krpc]\nenable = true\n").unwrap();
        doctor(&cfg).await.unwrap();
        cfg.scheduler.long_period_ms = 50;
        assert!(doctor(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn doctor_rejects_unknown_default_program() {
        let mut cfg: Config = toml::from_str("[krpc]\nenable = false\n").unwrap();
        cfg.mission.default_program = Some("orbit_insertion".into());
        assert!(doctor(&cfg).await.is_err());
    }
}
