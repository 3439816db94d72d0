//! Latest-value cache shared between the worker and API callers.
//!
//! One lock per logical group; readers get a clone. Nothing here is ever
//! invalidated individually: a fresh bring-up simply overwrites it.

use std::sync::Mutex;

use compact_str::CompactString;
use serde::Serialize;

use crate::error::StackError;
use crate::parse::{ConnEvalParams, GnssFix, NetworkTime, RegistrationParams};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Identity {
    pub imei: u64,
    pub imsi: u64,
    pub iccid: CompactString,
    pub fw_version: CompactString,
}

#[derive(Debug, Default)]
pub struct StateStore {
    identity: Mutex<Identity>,
    conn: Mutex<ConnEvalParams>,
    registration: Mutex<RegistrationParams>,
    gnss: Mutex<Option<GnssFix>>,
    time: Mutex<Option<NetworkTime>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Identity ────────────────────────────────────────────────────

    pub fn set_imei(&self, imei: u64) {
        lock(&self.identity).imei = imei;
    }

    pub fn set_imsi(&self, imsi: u64) {
        lock(&self.identity).imsi = imsi;
    }

    pub fn set_iccid(&self, iccid: &str) {
        lock(&self.identity).iccid = CompactString::from(iccid);
    }

    pub fn set_fw_version(&self, version: &str) {
        lock(&self.identity).fw_version = CompactString::from(version);
    }

    pub fn identity(&self) -> Identity {
        lock(&self.identity).clone()
    }

    pub fn imei(&self) -> Result<u64, StackError> {
        match lock(&self.identity).imei {
            0 => Err(StackError::NoData),
            v => Ok(v),
        }
    }

    pub fn imsi(&self) -> Result<u64, StackError> {
        match lock(&self.identity).imsi {
            0 => Err(StackError::NoData),
            v => Ok(v),
        }
    }

    // ── Connection evaluation ───────────────────────────────────────

    pub fn set_conn_params(&self, params: ConnEvalParams) {
        *lock(&self.conn) = params;
    }

    pub fn conn_params(&self) -> ConnEvalParams {
        lock(&self.conn).clone()
    }

    // ── Registration ────────────────────────────────────────────────

    pub fn set_registration(&self, params: RegistrationParams) {
        *lock(&self.registration) = params;
    }

    pub fn registration(&self) -> RegistrationParams {
        lock(&self.registration).clone()
    }

    /// Marks the cached registration stale ahead of a fresh bring-up.
    pub fn invalidate_registration(&self) {
        lock(&self.registration).valid = false;
    }

    pub fn is_registered(&self) -> bool {
        let r = lock(&self.registration);
        r.valid && r.status.is_registered()
    }

    pub fn psm_supported(&self) -> bool {
        lock(&self.registration).psm_supported()
    }

    // ── GNSS / time ─────────────────────────────────────────────────

    pub fn set_gnss_fix(&self, fix: GnssFix) {
        *lock(&self.gnss) = Some(fix);
    }

    pub fn gnss_fix(&self) -> Result<GnssFix, StackError> {
        lock(&self.gnss).clone().ok_or(StackError::NoData)
    }

    pub fn set_network_time(&self, time: NetworkTime) {
        *lock(&self.time) = Some(time);
    }

    pub fn network_time(&self) -> Result<NetworkTime, StackError> {
        lock(&self.time).ok_or(StackError::NoData)
    }
}
