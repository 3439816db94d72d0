//! # Response Parser
//!
//! Typed decoders for the AT responses and URCs the stack consumes. Each
//! decoder builds a fresh value from a response body (prefix already
//! stripped) and either returns it whole or returns a [`ParseError`];
//! callers never observe a partially populated structure.

use compact_str::CompactString;
use serde::Serialize;

use crate::error::ParseError;
use crate::tok::{hex_u32, unquote, Tokenizer};

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, ParseError> {
    value.ok_or(ParseError::Missing(field))
}

/// Consumes `,<num>` where the number is mandatory.
fn next_num(t: &mut Tokenizer<'_>, field: &'static str) -> Result<i64, ParseError> {
    t.sep(field)?;
    required(t.num(field)?, field)
}

// ─── Registration ───────────────────────────────────────────────────────────

/// EPS registration status as reported by `+CEREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationStatus {
    #[default]
    NotRegistered,
    RegisteredHome,
    Searching,
    RegistrationDenied,
    Unknown,
    RegisteredRoaming,
    SimFailure,
}

impl RegistrationStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => RegistrationStatus::NotRegistered,
            1 => RegistrationStatus::RegisteredHome,
            2 => RegistrationStatus::Searching,
            3 => RegistrationStatus::RegistrationDenied,
            4 => RegistrationStatus::Unknown,
            5 => RegistrationStatus::RegisteredRoaming,
            90 => RegistrationStatus::SimFailure,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            RegistrationStatus::NotRegistered => 0,
            RegistrationStatus::RegisteredHome => 1,
            RegistrationStatus::Searching => 2,
            RegistrationStatus::RegistrationDenied => 3,
            RegistrationStatus::Unknown => 4,
            RegistrationStatus::RegisteredRoaming => 5,
            RegistrationStatus::SimFailure => 90,
        }
    }

    pub fn is_registered(self) -> bool {
        matches!(
            self,
            RegistrationStatus::RegisteredHome | RegistrationStatus::RegisteredRoaming
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::NotRegistered => "not-registered",
            RegistrationStatus::RegisteredHome => "registered-home",
            RegistrationStatus::Searching => "searching",
            RegistrationStatus::RegistrationDenied => "registration-denied",
            RegistrationStatus::Unknown => "unknown",
            RegistrationStatus::RegisteredRoaming => "registered-roaming",
            RegistrationStatus::SimFailure => "sim-failure",
        }
    }

    /// Operator-facing description.
    pub fn describe(self) -> &'static str {
        match self {
            RegistrationStatus::NotRegistered => "Not registered",
            RegistrationStatus::RegisteredHome => "Registered, home network",
            RegistrationStatus::Searching => "Not registered, searching",
            RegistrationStatus::RegistrationDenied => "Registration denied",
            RegistrationStatus::Unknown => "Unknown (out of coverage)",
            RegistrationStatus::RegisteredRoaming => "Registered, roaming",
            RegistrationStatus::SimFailure => "Not registered, UICC failure",
        }
    }
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessTechnology {
    #[default]
    Unknown,
    LteM,
    NbIot,
}

impl AccessTechnology {
    /// Codes other than 7 (LTE-M) and 9 (NB-IoT) map to `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            7 => AccessTechnology::LteM,
            9 => AccessTechnology::NbIot,
            _ => AccessTechnology::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessTechnology::Unknown => "unknown",
            AccessTechnology::LteM => "lte-m",
            AccessTechnology::NbIot => "nb-iot",
        }
    }
}

impl std::fmt::Display for AccessTechnology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded GPRS timer (3GPP TS 24.008 §10.5.7.3/.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GprsTimer {
    Seconds(u32),
    Deactivated,
    /// The field was not an 8-character binary string.
    Invalid,
}

impl GprsTimer {
    pub fn seconds(self) -> Option<u32> {
        match self {
            GprsTimer::Seconds(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for GprsTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GprsTimer::Seconds(s) => write!(f, "{s} s"),
            GprsTimer::Deactivated => f.write_str("deactivated"),
            GprsTimer::Invalid => f.write_str("invalid"),
        }
    }
}

fn split_timer(bits: &str) -> Option<(&str, u32)> {
    if bits.len() != 8 || !bits.bytes().all(|b| b == b'0' || b == b'1') {
        return None;
    }
    let value = u32::from_str_radix(&bits[3..], 2).ok()?;
    Some((&bits[..3], value))
}

/// GPRS Timer 2, used for the PSM active time (T3324).
pub fn decode_gprs_timer2(bits: &str) -> GprsTimer {
    let Some((unit, value)) = split_timer(bits) else {
        return GprsTimer::Invalid;
    };
    let step = match unit {
        "000" => 2,
        "001" => 60,
        "010" => 360,
        "111" => return GprsTimer::Deactivated,
        // Remaining unit codes are interpreted as minutes.
        _ => 60,
    };
    GprsTimer::Seconds(value * step)
}

/// GPRS Timer 3, used for the extended periodic TAU (T3412 ext).
pub fn decode_gprs_timer3(bits: &str) -> GprsTimer {
    let Some((unit, value)) = split_timer(bits) else {
        return GprsTimer::Invalid;
    };
    let step = match unit {
        "000" => 600,
        "001" => 3600,
        "010" => 36000,
        "011" => 2,
        "100" => 30,
        "101" => 60,
        "110" => 1_152_000,
        _ => return GprsTimer::Deactivated,
    };
    GprsTimer::Seconds(value * step)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RegistrationParams {
    pub valid: bool,
    pub status: RegistrationStatus,
    pub tac: CompactString,
    pub cell_id: u32,
    pub act: AccessTechnology,
    pub cause_type: u8,
    pub reject_cause: u16,
    /// PSM active time, `None` when the network did not report it.
    pub active_time: Option<GprsTimer>,
    /// PSM periodic TAU, `None` when the network did not report it.
    pub periodic_tau_ext: Option<GprsTimer>,
}

impl RegistrationParams {
    /// The network granted both PSM timers.
    pub fn psm_supported(&self) -> bool {
        self.valid
            && matches!(self.active_time, Some(GprsTimer::Seconds(_)))
            && matches!(self.periodic_tau_ext, Some(GprsTimer::Seconds(_)))
    }
}

/// Decodes a `+CEREG` notification body:
/// `<stat>[,<tac>,<ci>,<AcT>[,<cause_type>,<reject_cause>[,<active>,<tau>]]]`.
pub fn parse_cereg(s: &str) -> Result<RegistrationParams, ParseError> {
    let mut t = Tokenizer::new(s);
    let stat = required(t.num("stat")?, "stat")?;
    let status = RegistrationStatus::from_code(stat).ok_or(ParseError::Malformed("stat"))?;

    let mut params = RegistrationParams {
        valid: true,
        status,
        ..Default::default()
    };

    if !t.more()? {
        return Ok(params);
    }
    if let Some(tac) = t.string_max("tac", 4)? {
        params.tac = CompactString::from(tac);
    }
    if !t.more()? {
        return Ok(params);
    }
    if let Some(ci) = t.string("cell_id")? {
        params.cell_id = hex_u32(ci, "cell_id")?;
    }
    if !t.more()? {
        return Ok(params);
    }
    if let Some(act) = t.num("act")? {
        params.act = AccessTechnology::from_code(act);
    }
    if !t.more()? {
        return Ok(params);
    }
    params.cause_type = t.num_as("cause_type")?.unwrap_or(0);
    if !t.more()? {
        return Ok(params);
    }
    params.reject_cause = t.num_as("reject_cause")?.unwrap_or(0);
    if !t.more()? {
        return Ok(params);
    }
    params.active_time = t.string("active_time")?.map(decode_gprs_timer2);
    if !t.more()? {
        return Ok(params);
    }
    params.periodic_tau_ext = t.string("periodic_tau_ext")?.map(decode_gprs_timer3);
    t.finish()?;
    Ok(params)
}

/// Decodes an `AT+CEREG?` read response, which carries the report mode
/// `<n>` ahead of the notification fields. Returns `(n, params)`.
pub fn parse_cereg_query(s: &str) -> Result<(u8, RegistrationParams), ParseError> {
    let (n, rest) = s.split_once(',').ok_or(ParseError::Missing("stat"))?;
    let n = n.parse().map_err(|_| ParseError::Malformed("n"))?;
    Ok((n, parse_cereg(rest)?))
}

// ─── Connection evaluation ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnEvalParams {
    pub valid: bool,
    pub result: u8,
    pub energy_estimate: i32,
    pub ce_level: i32,
    pub rsrp: i32,
    pub rsrq: i32,
    pub snr: i32,
    pub plmn: u32,
    pub cell_id: u32,
    pub phys_cell_id: u32,
    pub band: u16,
    pub earfcn: u32,
    pub tx_power: i32,
}

/// Operator-facing text for a `%CONEVAL` result code.
pub fn coneval_result_str(result: u8) -> &'static str {
    match result {
        0 => "Connection pre-evaluation successful",
        1 => "Evaluation failed, no cell available",
        2 => "Evaluation failed, UICC not available",
        3 => "Evaluation failed, only barred cells available",
        4 => "Evaluation failed, busy",
        5 => "Evaluation failed, aborted because of higher priority operation",
        6 => "Evaluation failed, not registered",
        7 => "Evaluation failed, unspecified",
        _ => "Evaluation failed, unknown result",
    }
}

/// Decodes a `%CONEVAL` response:
///
/// ```text
/// result,rrc_state,energy_estimate,rsrp,rsrq,snr,"cell_id","plmn",phys_cell_id,
/// earfcn,band,tau_triggered,ce_level,tx_power,tx_rep,rx_rep,dl_pathloss
/// ```
///
/// A failed evaluation may consist of the result code alone; that yields
/// `valid == false` with only `result` set.
pub fn parse_coneval(s: &str) -> Result<ConnEvalParams, ParseError> {
    let mut t = Tokenizer::new(s);
    let result = required(t.num_as::<u8>("result")?, "result")?;
    if result != 0 && t.end() {
        return Ok(ConnEvalParams {
            result,
            ..Default::default()
        });
    }

    let _rrc_state = next_num(&mut t, "rrc_state")?;
    let energy_estimate = next_num(&mut t, "energy_estimate")?;
    let rsrp = next_num(&mut t, "rsrp")?;
    let rsrq = next_num(&mut t, "rsrq")?;
    let snr = next_num(&mut t, "snr")?;

    t.sep("cell_id")?;
    let cell_id = hex_u32(required(t.string("cell_id")?, "cell_id")?, "cell_id")?;
    t.sep("plmn")?;
    let plmn = required(t.string_max("plmn", 6)?, "plmn")?
        .parse()
        .map_err(|_| ParseError::Malformed("plmn"))?;

    let phys_cell_id = next_num(&mut t, "phys_cell_id")?;
    let earfcn = next_num(&mut t, "earfcn")?;
    let band = next_num(&mut t, "band")?;
    let _tau_triggered = next_num(&mut t, "tau_triggered")?;
    let ce_level = next_num(&mut t, "ce_level")?;
    let tx_power = next_num(&mut t, "tx_power")?;
    let _tx_rep = next_num(&mut t, "tx_repetitions")?;
    let _rx_rep = next_num(&mut t, "rx_repetitions")?;
    let _dl_pathloss = next_num(&mut t, "dl_pathloss")?;
    t.finish()?;

    let narrow = |v: i64, field| i32::try_from(v).map_err(|_| ParseError::Overflow(field));
    Ok(ConnEvalParams {
        valid: result == 0,
        result,
        energy_estimate: narrow(energy_estimate, "energy_estimate")?,
        ce_level: narrow(ce_level, "ce_level")?,
        rsrp: narrow(rsrp - 140, "rsrp")?,
        rsrq: narrow((rsrq - 39) / 2, "rsrq")?,
        snr: narrow(snr - 24, "snr")?,
        plmn,
        cell_id,
        phys_cell_id: u32::try_from(phys_cell_id).map_err(|_| ParseError::Overflow("phys_cell_id"))?,
        band: u16::try_from(band).map_err(|_| ParseError::Overflow("band"))?,
        earfcn: u32::try_from(earfcn).map_err(|_| ParseError::Overflow("earfcn"))?,
        tx_power: narrow(tx_power, "tx_power")?,
    })
}

// ─── Sockets ────────────────────────────────────────────────────────────────

pub const SOCKET_FAMILY_INET: i64 = 1;
pub const SOCKET_TYPE_DGRAM: i64 = 2;
pub const SOCKET_PROTOCOL_UDP: i64 = 17;
pub const SOCKET_ROLE_CLIENT: i64 = 0;

/// Reply to `AT#XSOCKET=<op>,<type>,<role>`: `<handle>,<type>,<protocol>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketDescriptor {
    pub handle: i64,
    pub kind: i64,
    pub protocol: i64,
}

pub fn parse_xsocket_set(s: &str) -> Result<SocketDescriptor, ParseError> {
    let mut t = Tokenizer::new(s);
    let handle = required(t.num("handle")?, "handle")?;
    if handle < 0 {
        return Err(ParseError::Closed);
    }
    t.sep("type")?;
    let kind = required(t.num("type")?, "type")?;
    t.sep("protocol")?;
    let protocol = required(t.num("protocol")?, "protocol")?;
    t.finish()?;
    Ok(SocketDescriptor {
        handle,
        kind,
        protocol,
    })
}

/// Reply to `AT#XSOCKET?`: `<handle>,<family>,<role>,<type>,<cid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketInfo {
    pub handle: i64,
    pub family: i64,
    pub role: i64,
    pub kind: i64,
    pub cid: i64,
}

pub fn parse_xsocket_get(s: &str) -> Result<SocketInfo, ParseError> {
    let mut t = Tokenizer::new(s);
    let handle = required(t.num("handle")?, "handle")?;
    if handle < 0 {
        return Err(ParseError::Closed);
    }
    let family = next_num(&mut t, "family")?;
    let role = next_num(&mut t, "role")?;
    let kind = next_num(&mut t, "type")?;
    let cid = next_num(&mut t, "cid")?;
    t.finish()?;
    Ok(SocketInfo {
        handle,
        family,
        role,
        kind,
        cid,
    })
}

// ─── GNSS ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GnssFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub accuracy: f64,
    pub speed: f64,
    pub heading: f64,
    pub datetime: String,
}

/// `#XGPS` notifications are either a service status or a position fix.
#[derive(Debug, Clone, PartialEq)]
pub enum XgpsLine {
    Status { service: i64, status: i64 },
    Fix(GnssFix),
}

pub fn parse_xgps(s: &str) -> Result<XgpsLine, ParseError> {
    if !s.contains('"') {
        let mut t = Tokenizer::new(s);
        let service = required(t.num("service")?, "service")?;
        t.sep("status")?;
        let status = required(t.num("status")?, "status")?;
        t.finish()?;
        return Ok(XgpsLine::Status { service, status });
    }

    fn float(t: &mut Tokenizer<'_>, field: &'static str) -> Result<f64, ParseError> {
        let v = required(t.float(field)?, field)?;
        t.sep(field)?;
        Ok(v)
    }

    let mut t = Tokenizer::new(s);
    let latitude = float(&mut t, "latitude")?;
    let longitude = float(&mut t, "longitude")?;
    let altitude = float(&mut t, "altitude")?;
    let accuracy = float(&mut t, "accuracy")?;
    let speed = float(&mut t, "speed")?;
    let heading = float(&mut t, "heading")?;
    let datetime = required(t.string_max("datetime", 31)?, "datetime")?.to_string();
    t.finish()?;
    Ok(XgpsLine::Fix(GnssFix {
        latitude,
        longitude,
        altitude,
        accuracy,
        speed,
        heading,
        datetime,
    }))
}

// ─── Miscellaneous ──────────────────────────────────────────────────────────

/// `%XMODEMSLEEP: <type>[,<time ms>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemSleep {
    pub kind: u8,
    pub duration_ms: u64,
}

pub fn parse_xmodemsleep(s: &str) -> Result<ModemSleep, ParseError> {
    let mut t = Tokenizer::new(s);
    let kind = required(t.num_as("type")?, "type")?;
    let duration_ms = if t.more()? {
        t.num_as("time")?.unwrap_or(0)
    } else {
        0
    };
    t.finish()?;
    Ok(ModemSleep { kind, duration_ms })
}

/// One line of `AT+CGDCONT?`: `<cid>,"<type>","<apn>","<addr>",...`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PdnContext {
    pub cid: u8,
    pub pdp_type: String,
    pub apn: String,
    pub address: String,
}

pub fn parse_cgdcont(s: &str) -> Result<PdnContext, ParseError> {
    let mut t = Tokenizer::new(s);
    let cid = required(t.num_as("cid")?, "cid")?;
    t.sep("pdp_type")?;
    let pdp_type = t.string("pdp_type")?.unwrap_or_default().to_string();
    t.sep("apn")?;
    let apn = t.string("apn")?.unwrap_or_default().to_string();
    let address = if t.more()? {
        t.string("address")?.unwrap_or_default().to_string()
    } else {
        String::new()
    };
    // Remaining fields (compression flags) are not used.
    Ok(PdnContext {
        cid,
        pdp_type,
        apn,
        address,
    })
}

/// Network time from `+CCLK: "yy/MM/dd,hh:mm:ss±zz"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Offset from UTC in quarter hours.
    pub tz_quarters: i8,
}

pub fn parse_cclk(s: &str) -> Result<NetworkTime, ParseError> {
    let s = unquote(s);
    let b = s.as_bytes();
    if b.len() != 20 || b[2] != b'/' || b[5] != b'/' || b[8] != b',' || b[11] != b':' || b[14] != b':'
    {
        return Err(ParseError::Malformed("cclk"));
    }
    let two = |at: usize, field: &'static str| -> Result<u8, ParseError> {
        s.get(at..at + 2)
            .filter(|d| d.bytes().all(|c| c.is_ascii_digit()))
            .and_then(|d| d.parse().ok())
            .ok_or(ParseError::Malformed(field))
    };
    let sign: i8 = match b[17] {
        b'+' => 1,
        b'-' => -1,
        _ => return Err(ParseError::Malformed("tz")),
    };
    let time = NetworkTime {
        year: 2000 + u16::from(two(0, "year")?),
        month: two(3, "month")?,
        day: two(6, "day")?,
        hour: two(9, "hour")?,
        minute: two(12, "minute")?,
        second: two(15, "second")?,
        tz_quarters: sign * two(18, "tz")? as i8,
    };
    if !(1..=12).contains(&time.month)
        || !(1..=31).contains(&time.day)
        || time.hour > 23
        || time.minute > 59
        || time.second > 59
    {
        return Err(ParseError::Overflow("cclk"));
    }
    Ok(time)
}
