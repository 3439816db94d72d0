//! Collaborator interfaces: the AT link driver and the RF multiplexer.
//!
//! Both are consumed as trait objects so the stack can run against real
//! hardware drivers or the scripted simulator in `chester-lte-sim`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Notification raised by the link driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete line arrived while no dialog was active. Ownership of the
    /// line passes to the handler.
    RxLine(String),
    /// Raw bytes are waiting while in data mode.
    RxData,
    /// The driver dropped input because its buffers were full.
    Overrun,
}

pub type LinkHandler = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Line-oriented AT channel with a raw data sub-mode.
///
/// While a dialog is active the driver queues received lines for
/// [`Link::recv_line`]; outside a dialog it hands them to the registered
/// handler instead. Lines still queued when the dialog exits are handed to
/// the handler as well.
pub trait Link: Send + Sync {
    fn set_handler(&self, handler: Option<LinkHandler>);

    /// Pulses the modem reset line.
    fn reset(&self) -> Result<(), LinkError>;
    /// Pulses the wake-up line. The modem answers with a `Ready` line.
    fn wake_up(&self) -> Result<(), LinkError>;
    fn enable(&self) -> Result<(), LinkError>;
    fn disable(&self) -> Result<(), LinkError>;

    fn enter_dialog(&self) -> Result<(), LinkError>;
    fn exit_dialog(&self) -> Result<(), LinkError>;
    fn enter_data_mode(&self) -> Result<(), LinkError>;
    fn exit_data_mode(&self) -> Result<(), LinkError>;

    fn send_line(&self, timeout: Duration, line: &str) -> Result<(), LinkError>;
    /// Returns `Ok(None)` when no line arrived within `timeout`.
    fn recv_line(&self, timeout: Duration) -> Result<Option<String>, LinkError>;
    fn send_data(&self, timeout: Duration, data: &[u8]) -> Result<(), LinkError>;
    /// Reads up to `buf.len()` bytes, returning how many were read.
    fn recv_data(&self, timeout: Duration, buf: &mut [u8]) -> Result<usize, LinkError>;
}

// ─── RF multiplexer ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Antenna {
    #[default]
    Int,
    Ext,
}

impl std::fmt::Display for Antenna {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Antenna::Int => "int",
            Antenna::Ext => "ext",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfInterface {
    None,
    Lte,
    LoRaWan,
}

/// Shared antenna switch. Acquired for as long as the LTE stack is enabled.
pub trait RfMux: Send {
    fn acquire(&mut self) -> anyhow::Result<()>;
    fn release(&mut self) -> anyhow::Result<()>;
    fn set_antenna(&mut self, antenna: Antenna) -> anyhow::Result<()>;
    fn set_interface(&mut self, interface: RfInterface) -> anyhow::Result<()>;
}
