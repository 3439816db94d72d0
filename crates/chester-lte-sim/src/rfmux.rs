//! Recording RF multiplexer.

use std::sync::{Arc, Mutex};

use chester_lte::{Antenna, RfInterface, RfMux};

/// Call made on a [`ScriptedRfMux`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxCall {
    Acquire,
    Release,
    Antenna(Antenna),
    Interface(RfInterface),
}

/// [`RfMux`] that records every call. Clones share the same record, so a
/// test can keep one clone after boxing another into the stack.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRfMux {
    calls: Arc<Mutex<Vec<MuxCall>>>,
}

impl ScriptedRfMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MuxCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether the last acquire has not been released yet.
    pub fn is_held(&self) -> bool {
        self.calls()
            .iter()
            .rev()
            .find(|c| matches!(c, MuxCall::Acquire | MuxCall::Release))
            == Some(&MuxCall::Acquire)
    }

    fn record(&self, call: MuxCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

impl RfMux for ScriptedRfMux {
    fn acquire(&mut self) -> anyhow::Result<()> {
        self.record(MuxCall::Acquire);
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.record(MuxCall::Release);
        Ok(())
    }

    fn set_antenna(&mut self, antenna: Antenna) -> anyhow::Result<()> {
        self.record(MuxCall::Antenna(antenna));
        Ok(())
    }

    fn set_interface(&mut self, interface: RfInterface) -> anyhow::Result<()> {
        self.record(MuxCall::Interface(interface));
        Ok(())
    }
}
