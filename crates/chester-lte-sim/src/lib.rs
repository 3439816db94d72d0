//! Scripted modem simulator for exercising `chester-lte` without hardware.
//!
//! Provides an in-memory AT link that plays modem conversations from a
//! script, a recording RF multiplexer, and ready-made scripts for the usual
//! connection phases (bring-up, transfer, PSM sleep, flight mode).

pub mod link;
pub mod rfmux;
pub mod scenario;

pub use link::{ScriptedLink, Step};
pub use rfmux::{MuxCall, ScriptedRfMux};
