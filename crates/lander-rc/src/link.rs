use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

use crate::command::RcCommand;
use crate::frame::FrameBuffer;
use crate::RcConfig;

/// Serial link to the hand controller.
///
/// A reader task appends arriving bytes to a bounded [`FrameBuffer`]; a
/// separate parser task drains complete frames on a fixed period, so the
/// byte arrival rate never dictates how often commands are delivered.
pub struct RcLink {
    port: SerialStream,
    device: String,
    parser_period: Duration,
}

pub struct RcLinkHandle {
    device: String,
    rx: Arc<Mutex<FrameBuffer>>,
    stop: watch::Sender<bool>,
    reader: JoinHandle<()>,
    parser: JoinHandle<()>,
}

impl RcLink {
    pub fn open(dev: &str, baud: u32, parser_period: Duration) -> Result<Self> {
        let port = tokio_serial::new(dev, baud)
            .open_native_async()
            .with_context(|| format!("open rc serial device {}", dev))?;
        info!("rc: opened {} @ {}", dev, baud);
        Ok(Self { port, device: dev.to_string(), parser_period })
    }

    pub fn from_config(cfg: &RcConfig) -> Result<Self> {
        let dev = cfg.device.as_deref().context("serial.device missing")?;
        let baud = cfg.baud.unwrap_or(RcConfig::DEFAULT_BAUD);
        let period = Duration::from_millis(cfg.parser_period_ms.unwrap_or(RcConfig::DEFAULT_PARSER_PERIOD_MS).max(1));
        Self::open(dev, baud, period)
    }

    /// Starts the reader and parser tasks. `on_command` is called from the
    /// parser task for every decoded state frame and must not block.
    pub fn spawn<F>(self, mut on_command: F) -> RcLinkHandle
    where
        F: FnMut(RcCommand) + Send + 'static,
    {
        let rx = Arc::new(Mutex::new(FrameBuffer::default()));
        let (stop, stop_rx) = watch::channel(false);

        let mut port = self.port;
        let reader_rx = rx.clone();
        let mut reader_stop = stop_rx.clone();
        let device = self.device.clone();
        let reader = tokio::spawn(async move {
            let mut chunk = [0u8; 64];
            loop {
                tokio::select! {
                    _ = reader_stop.changed() => break,
                    res = port.read(&mut chunk) => match res {
                        Ok(0) => {
                            warn!("rc: {} closed", device);
                            break;
                        }
                        Ok(n) => lock(&reader_rx).push(&chunk[..n]),
                        Err(e) => {
                            warn!("rc: read failed on {}: {}", device, e);
                            break;
                        }
                    },
                }
            }
        });

        let parser_rx = rx.clone();
        let mut parser_stop = stop_rx;
        let period = self.parser_period;
        let parser = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = parser_stop.changed() => break,
                    _ = tick.tick() => {
                        let cmds = lock(&parser_rx).drain_commands();
                        for cmd in cmds {
                            on_command(cmd);
                        }
                    }
                }
            }
        });

        RcLinkHandle { device: self.device, rx, stop, reader, parser }
    }
}

impl RcLinkHandle {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn discarded_bytes(&self) -> u64 {
        lock(&self.rx).discarded()
    }

    /// Stops both tasks and clears the receive buffer.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.reader.await;
        let _ = self.parser.await;
        lock(&self.rx).clear();
        info!("rc: closed {}", self.device);
    }
}

fn lock(rx: &Mutex<FrameBuffer>) -> MutexGuard<'_, FrameBuffer> {
    rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
