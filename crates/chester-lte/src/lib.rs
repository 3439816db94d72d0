//! # chester-lte
//!
//! Control stack for an nRF91-class LTE-M / NB-IoT modem driven over an AT
//! command link with a serial-LTE firmware. Brings the modem up, attaches,
//! keeps one UDP socket open and moves single request/response payloads
//! while letting the modem sleep in between.
//!
//! ## Crate structure
//!
//! - [`tok`]: comma-separated AT response tokenizer
//! - [`parse`]: typed decoders for responses and notifications
//! - [`link`]: link-driver and RF mux traits
//! - [`talk`]: dialog transport with typed commands
//! - [`flow`]: multi-step AT sequences and notification routing
//! - [`fsm`]: connectivity state machine
//! - [`stack`]: public handle and worker thread
//! - [`config`], [`policy`], [`metrics`], [`state`], [`shell`]

pub mod config;
pub mod error;
pub mod flow;
pub mod fsm;
pub mod link;
pub mod metrics;
pub mod parse;
pub mod policy;
pub mod shell;
pub mod stack;
pub mod state;
pub mod talk;
pub mod tok;

#[cfg(test)]
mod testing;

pub use config::LteConfig;
pub use error::{ConfigError, FlowError, LinkError, SendRecvError, StackError, TalkError};
pub use fsm::{Event, FsmState, GnssHandler};
pub use link::{Antenna, Link, LinkEvent, LinkHandler, RfInterface, RfMux};
pub use metrics::Metrics;
pub use stack::{LteStack, SendRecvRequest};
