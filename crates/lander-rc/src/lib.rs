pub mod command;
pub mod frame;
pub mod link;

pub use command::{Axis, RcCommand};
pub use frame::FrameBuffer;
pub use link::{RcLink, RcLinkHandle};

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RcConfig {
    pub enable: bool,

    /// Serial device of the hand controller, e.g. "/dev/ttyUSB0" or "COM4".
    pub device: Option<String>,

    /// Controller firmware default is 250000.
    pub baud: Option<u32>,

    /// Frame parser period. Default 5ms.
    pub parser_period_ms: Option<u64>,
}

impl RcConfig {
    pub const DEFAULT_BAUD: u32 = 250_000;
    pub const DEFAULT_PARSER_PERIOD_MS: u64 = 5;
}
