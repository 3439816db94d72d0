//! Shared unit-test fixtures.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::LteConfig;
use crate::error::FlowError;
use crate::flow::{Sequencer, TestOp, Uplink};
use crate::fsm::{event_queue, EventSender};
use crate::parse::{ConnEvalParams, NetworkTime};
use crate::stack::LteStack;
use crate::state::StateStore;

// ─── Mock Infrastructure ───

/// Sequencer that succeeds at everything. Receives take `recv_delay` and
/// return `pong`.
pub(crate) struct IdleSeq {
    pub recv_delay: Duration,
}

impl Sequencer for IdleSeq {
    fn rfmux_acquire(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn rfmux_release(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn reset(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn start(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn stop(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn prepare(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn cfun(&mut self, _mode: u8) -> Result<(), FlowError> {
        Ok(())
    }
    fn sim_info(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn sim_fplmn(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn open_socket(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn close_socket(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn check_health(&mut self) -> Result<(), FlowError> {
        Ok(())
    }
    fn send(&mut self, _uplink: &Uplink<'_>) -> Result<(), FlowError> {
        Ok(())
    }
    fn recv(&mut self, _capacity: usize, _rai: bool) -> Result<Vec<u8>, FlowError> {
        thread::sleep(self.recv_delay);
        Ok(b"pong".to_vec())
    }
    fn coneval(&mut self) -> Result<ConnEvalParams, FlowError> {
        Ok(ConnEvalParams {
            valid: true,
            rsrp: -95,
            band: 20,
            ..Default::default()
        })
    }
    fn gnss(&mut self, _enable: bool) -> Result<(), FlowError> {
        Ok(())
    }
    fn network_time(&mut self) -> Result<NetworkTime, FlowError> {
        Err(FlowError::NoTransaction)
    }
    fn test(&mut self, op: &TestOp) -> Result<String, FlowError> {
        Ok(format!("{op:?}"))
    }
}

/// A stack over [`IdleSeq`], plus the sender for injecting modem events.
pub(crate) fn idle_stack(config: LteConfig, recv_delay: Duration) -> (LteStack, EventSender) {
    let (events, event_rx) = event_queue();
    let config = Arc::new(ArcSwap::from_pointee(config));
    let store = Arc::new(StateStore::new());
    let stack = LteStack::start(IdleSeq { recv_delay }, event_rx, config, store)
        .expect("spawn worker");
    (stack, events)
}
