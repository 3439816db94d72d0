//! # Configuration
//!
//! TOML-backed settings for the LTE stack. [`LteConfigInput`] is the
//! serialized shape (every field optional); [`LteConfigInput::resolve`]
//! validates it into an [`LteConfig`].
//!
//! Operator access goes through the [`ITEMS`] descriptor table: each item
//! names itself, describes its bounds and provides a getter and setter, so
//! `show`, `set`, load and save all work from the same table.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::link::Antenna;
use crate::policy::AttachPolicy;
use crate::talk::{AuthProtocol, TalkTimeouts};

pub const CONFIG_VERSION: u32 = 1;

/// Highest LTE band addressable by `%XBANDLOCK`.
pub const MAX_BAND: u8 = 88;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Auth {
    #[default]
    None,
    Pap,
    Chap,
}

impl Auth {
    pub fn protocol(self) -> Option<AuthProtocol> {
        match self {
            Auth::None => None,
            Auth::Pap => Some(AuthProtocol::Pap),
            Auth::Chap => Some(AuthProtocol::Chap),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RadioMode {
    LteM,
    #[default]
    NbIot,
}

// ─── Serialized form ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LteConfigInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modemtrace: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub antenna: Option<Antenna>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nb_iot_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lte_m_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_preference: Option<RadioMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gnss: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bands: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoconn: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plmnid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clksync: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach_policy: Option<AttachPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psm_tau: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psm_active: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingInput>,
}

/// Timing overrides in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simdetect_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wakeup_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_loop_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactivity_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_short_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_long_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coneval_ms: Option<u64>,
}

// ─── Resolved form ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Wait for `Ready` after reset and wake-up.
    pub boot: Duration,
    /// Wait for `%XSIM: 1` after `+CFUN=1`.
    pub simdetect: Duration,
    /// Wait for `Ready` when leaving sleep.
    pub wakeup: Duration,
    /// Cooldown after the modem reports a reset loop.
    pub reset_loop: Duration,
    /// Idle time in Ready before powering down when PSM is unavailable.
    pub inactivity: Duration,
    /// First backoff after a failed recovery; doubles up to the cap.
    pub error_backoff: Duration,
    /// Grace period a timed-out caller waits for the worker to finish.
    pub stop_timeout: Duration,
    /// Receive window handed to `#XRECV`.
    pub recv_window: Duration,
    pub talk: TalkTimeouts,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            boot: Duration::from_secs(5),
            simdetect: Duration::from_secs(10),
            wakeup: Duration::from_secs(5),
            reset_loop: Duration::from_secs(30 * 60),
            inactivity: Duration::from_secs(30),
            error_backoff: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(2),
            recv_window: Duration::from_secs(5),
            talk: TalkTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LteConfig {
    pub version: u32,
    /// Bypass mode: the state machine stays disabled and the link is
    /// driven manually through the shell.
    pub test: bool,
    pub modemtrace: bool,
    pub antenna: Antenna,
    pub nb_iot_mode: bool,
    pub lte_m_mode: bool,
    /// Preferred technology when both are enabled.
    pub mode_preference: RadioMode,
    pub gnss: bool,
    /// Locked bands, ascending. Empty means no lock.
    pub bands: Vec<u8>,
    pub autoconn: bool,
    pub plmnid: String,
    pub apn: String,
    pub auth: Auth,
    pub username: String,
    pub password: String,
    pub addr: Ipv4Addr,
    pub port: u16,
    pub clksync: bool,
    pub attach_policy: AttachPolicy,
    pub psm_tau: String,
    pub psm_active: String,
    pub timing: Timing,
}

impl Default for LteConfig {
    fn default() -> Self {
        LteConfig {
            version: CONFIG_VERSION,
            test: false,
            modemtrace: false,
            antenna: Antenna::Int,
            nb_iot_mode: true,
            lte_m_mode: false,
            mode_preference: RadioMode::NbIot,
            gnss: false,
            bands: Vec::new(),
            autoconn: true,
            plmnid: "23003".into(),
            apn: String::new(),
            auth: Auth::None,
            username: String::new(),
            password: String::new(),
            addr: Ipv4Addr::new(192, 168, 192, 4),
            port: 5003,
            clksync: true,
            attach_policy: AttachPolicy::Progressive,
            psm_tau: "00111000".into(),
            psm_active: "00000000".into(),
            timing: Timing::default(),
        }
    }
}

fn invalid(item: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        item,
        reason: reason.into(),
    }
}

fn check_plmnid(s: &str) -> Result<(), String> {
    if (5..=6).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err("expected 5 or 6 digits".into())
    }
}

fn check_timer_bits(s: &str) -> Result<(), String> {
    if s.len() == 8 && s.bytes().all(|b| b == b'0' || b == b'1') {
        Ok(())
    } else {
        Err("expected 8 binary digits".into())
    }
}

fn check_quotable(s: &str, max_len: usize) -> Result<(), String> {
    if s.len() > max_len {
        return Err(format!("longer than {max_len} characters"));
    }
    if s.contains(['"', '\r', '\n']) {
        return Err("must not contain quotes or line breaks".into());
    }
    Ok(())
}

fn normalize_bands(mut bands: Vec<u8>) -> Result<Vec<u8>, String> {
    if let Some(b) = bands.iter().find(|b| **b == 0 || **b > MAX_BAND) {
        return Err(format!("band {b} outside 1..={MAX_BAND}"));
    }
    bands.sort_unstable();
    bands.dedup();
    Ok(bands)
}

impl LteConfigInput {
    pub fn resolve(self) -> Result<LteConfig, ConfigError> {
        let d = LteConfig::default();
        let version = self.version.unwrap_or(CONFIG_VERSION);
        if version != CONFIG_VERSION {
            return Err(ConfigError::Version(version));
        }

        let plmnid = self.plmnid.unwrap_or(d.plmnid);
        check_plmnid(&plmnid).map_err(|r| invalid("plmnid", r))?;
        let apn = self.apn.unwrap_or(d.apn);
        check_quotable(&apn, 63).map_err(|r| invalid("apn", r))?;
        let username = self.username.unwrap_or(d.username);
        check_quotable(&username, 32).map_err(|r| invalid("username", r))?;
        let password = self.password.unwrap_or(d.password);
        check_quotable(&password, 32).map_err(|r| invalid("password", r))?;
        let psm_tau = self.psm_tau.unwrap_or(d.psm_tau);
        check_timer_bits(&psm_tau).map_err(|r| invalid("psm-tau", r))?;
        let psm_active = self.psm_active.unwrap_or(d.psm_active);
        check_timer_bits(&psm_active).map_err(|r| invalid("psm-active", r))?;
        let bands = normalize_bands(self.bands.unwrap_or_default())
            .map_err(|r| invalid("bands", r))?;

        let nb_iot_mode = self.nb_iot_mode.unwrap_or(d.nb_iot_mode);
        let lte_m_mode = self.lte_m_mode.unwrap_or(d.lte_m_mode);
        if !nb_iot_mode && !lte_m_mode {
            return Err(invalid("nb-iot-mode", "at least one radio mode must be enabled"));
        }
        let port = self.port.unwrap_or(d.port);
        if port == 0 {
            return Err(invalid("port", "must be non-zero"));
        }

        let t = self.timing.unwrap_or_default();
        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);
        let dt = d.timing;
        let timing = Timing {
            boot: ms(t.boot_ms, dt.boot),
            simdetect: ms(t.simdetect_ms, dt.simdetect),
            wakeup: ms(t.wakeup_ms, dt.wakeup),
            reset_loop: ms(t.reset_loop_ms, dt.reset_loop),
            inactivity: ms(t.inactivity_ms, dt.inactivity),
            error_backoff: ms(t.error_backoff_ms, dt.error_backoff).max(Duration::from_millis(1)),
            stop_timeout: ms(t.stop_timeout_ms, dt.stop_timeout),
            recv_window: ms(t.recv_window_ms, dt.recv_window),
            talk: TalkTimeouts {
                send: ms(t.send_ms, dt.talk.send),
                response_short: ms(t.response_short_ms, dt.talk.response_short),
                response_long: ms(t.response_long_ms, dt.talk.response_long),
                coneval: ms(t.coneval_ms, dt.talk.coneval),
            },
        };

        Ok(LteConfig {
            version,
            test: self.test.unwrap_or(d.test),
            modemtrace: self.modemtrace.unwrap_or(d.modemtrace),
            antenna: self.antenna.unwrap_or(d.antenna),
            nb_iot_mode,
            lte_m_mode,
            mode_preference: self.mode_preference.unwrap_or(d.mode_preference),
            gnss: self.gnss.unwrap_or(d.gnss),
            bands,
            autoconn: self.autoconn.unwrap_or(d.autoconn),
            plmnid,
            apn,
            auth: self.auth.unwrap_or(d.auth),
            username,
            password,
            addr: self.addr.unwrap_or(d.addr),
            port,
            clksync: self.clksync.unwrap_or(d.clksync),
            attach_policy: self.attach_policy.unwrap_or(d.attach_policy),
            psm_tau,
            psm_active,
            timing,
        })
    }
}

impl From<&LteConfig> for LteConfigInput {
    fn from(c: &LteConfig) -> Self {
        let ms = |d: Duration| Some(u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let t = &c.timing;
        LteConfigInput {
            version: Some(c.version),
            test: Some(c.test),
            modemtrace: Some(c.modemtrace),
            antenna: Some(c.antenna),
            nb_iot_mode: Some(c.nb_iot_mode),
            lte_m_mode: Some(c.lte_m_mode),
            mode_preference: Some(c.mode_preference),
            gnss: Some(c.gnss),
            bands: Some(c.bands.clone()),
            autoconn: Some(c.autoconn),
            plmnid: Some(c.plmnid.clone()),
            apn: Some(c.apn.clone()),
            auth: Some(c.auth),
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            addr: Some(c.addr),
            port: Some(c.port),
            clksync: Some(c.clksync),
            attach_policy: Some(c.attach_policy),
            psm_tau: Some(c.psm_tau.clone()),
            psm_active: Some(c.psm_active.clone()),
            timing: Some(TimingInput {
                boot_ms: ms(t.boot),
                simdetect_ms: ms(t.simdetect),
                wakeup_ms: ms(t.wakeup),
                reset_loop_ms: ms(t.reset_loop),
                inactivity_ms: ms(t.inactivity),
                error_backoff_ms: ms(t.error_backoff),
                stop_timeout_ms: ms(t.stop_timeout),
                recv_window_ms: ms(t.recv_window),
                send_ms: ms(t.talk.send),
                response_short_ms: ms(t.talk.response_short),
                response_long_ms: ms(t.talk.response_long),
                coneval_ms: ms(t.talk.coneval),
            }),
        }
    }
}

impl LteConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(LteConfig::default());
        }
        let parsed: LteConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Toml(e.to_string()))?;
        parsed.resolve()
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(&LteConfigInput::from(self)).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// `%XSYSTEMMODE` preference: 0 none, 1 LTE-M first, 2 NB-IoT first.
    pub fn system_mode_preference(&self) -> u8 {
        if !(self.lte_m_mode && self.nb_iot_mode) {
            return 0;
        }
        match self.mode_preference {
            RadioMode::LteM => 1,
            RadioMode::NbIot => 2,
        }
    }

    /// `%XBANDLOCK` bitmap with band 88 in the first character and band 1
    /// in the last, or `None` when no band is locked.
    pub fn band_lock_bitmap(&self) -> Option<String> {
        if self.bands.is_empty() {
            return None;
        }
        let bitmap = (1..=MAX_BAND)
            .rev()
            .map(|band| if self.bands.contains(&band) { '1' } else { '0' })
            .collect();
        Some(bitmap)
    }

    pub fn get_item(&self, name: &str) -> Result<String, ConfigError> {
        let item = find_item(name).ok_or_else(|| ConfigError::UnknownItem(name.into()))?;
        Ok((item.get)(self))
    }

    /// Validates `value` against the item's bounds, then assigns it.
    pub fn set_item(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let item = find_item(name).ok_or_else(|| ConfigError::UnknownItem(name.into()))?;
        item.kind.check(value).map_err(|r| invalid(item.name, r))?;
        let mut next = self.clone();
        (item.set)(&mut next, value).map_err(|r| invalid(item.name, r))?;
        // Cross-field rules are enforced by a full resolve.
        *self = LteConfigInput::from(&next).resolve()?;
        Ok(())
    }

    /// `(name, value)` for every item, in table order.
    pub fn show(&self) -> Vec<(&'static str, String)> {
        ITEMS.iter().map(|i| (i.name, (i.get)(self))).collect()
    }
}

// ─── Descriptor table ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum ItemKind {
    Bool,
    Enum(&'static [&'static str]),
    Text { max_len: usize },
    Int { min: i64, max: i64 },
    Ipv4,
    BandList,
}

impl ItemKind {
    pub fn check(&self, value: &str) -> Result<(), String> {
        match self {
            ItemKind::Bool => parse_bool(value).map(|_| ()),
            ItemKind::Enum(choices) => {
                if choices.contains(&value) {
                    Ok(())
                } else {
                    Err(format!("expected one of {}", choices.join("|")))
                }
            }
            ItemKind::Text { max_len } => check_quotable(value, *max_len),
            ItemKind::Int { min, max } => match value.parse::<i64>() {
                Ok(v) if (*min..=*max).contains(&v) => Ok(()),
                _ => Err(format!("expected integer in {min}..={max}")),
            },
            ItemKind::Ipv4 => value
                .parse::<Ipv4Addr>()
                .map(|_| ())
                .map_err(|_| "expected IPv4 address".into()),
            ItemKind::BandList => parse_bands(value).map(|_| ()),
        }
    }

    /// Short hint for help output.
    pub fn hint(&self) -> String {
        match self {
            ItemKind::Bool => "true|false".into(),
            ItemKind::Enum(choices) => choices.join("|"),
            ItemKind::Text { max_len } => format!("text, max {max_len}"),
            ItemKind::Int { min, max } => format!("{min}..{max}"),
            ItemKind::Ipv4 => "a.b.c.d".into(),
            ItemKind::BandList => "comma-separated bands, empty for none".into(),
        }
    }
}

pub struct ConfigItem {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: ItemKind,
    pub get: fn(&LteConfig) -> String,
    pub set: fn(&mut LteConfig, &str) -> Result<(), String>,
}

fn parse_bool(v: &str) -> Result<bool, String> {
    match v {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err("expected true|false".into()),
    }
}

fn parse_bands(v: &str) -> Result<Vec<u8>, String> {
    let bands = v
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u8>().map_err(|_| format!("invalid band `{s}`")))
        .collect::<Result<Vec<_>, _>>()?;
    normalize_bands(bands)
}

fn parse_enum<T: for<'de> Deserialize<'de>>(v: &str) -> Result<T, String> {
    T::deserialize(serde::de::value::StrDeserializer::<serde::de::value::Error>::new(v))
        .map_err(|e| e.to_string())
}

fn enum_name<T: Serialize>(v: &T) -> String {
    toml::Value::try_from(v)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

pub static ITEMS: &[ConfigItem] = &[
    ConfigItem {
        name: "test",
        help: "Bypass the state machine for manual link control",
        kind: ItemKind::Bool,
        get: |c| c.test.to_string(),
        set: |c, v| parse_bool(v).map(|b| c.test = b),
    },
    ConfigItem {
        name: "modemtrace",
        help: "Enable modem trace output",
        kind: ItemKind::Bool,
        get: |c| c.modemtrace.to_string(),
        set: |c, v| parse_bool(v).map(|b| c.modemtrace = b),
    },
    ConfigItem {
        name: "antenna",
        help: "Antenna selection",
        kind: ItemKind::Enum(&["int", "ext"]),
        get: |c| c.antenna.to_string(),
        set: |c, v| parse_enum(v).map(|a| c.antenna = a),
    },
    ConfigItem {
        name: "nb-iot-mode",
        help: "Enable NB-IoT",
        kind: ItemKind::Bool,
        get: |c| c.nb_iot_mode.to_string(),
        set: |c, v| parse_bool(v).map(|b| c.nb_iot_mode = b),
    },
    ConfigItem {
        name: "lte-m-mode",
        help: "Enable LTE-M",
        kind: ItemKind::Bool,
        get: |c| c.lte_m_mode.to_string(),
        set: |c, v| parse_bool(v).map(|b| c.lte_m_mode = b),
    },
    ConfigItem {
        name: "mode-preference",
        help: "Preferred technology when both are enabled",
        kind: ItemKind::Enum(&["lte-m", "nb-iot"]),
        get: |c| enum_name(&c.mode_preference),
        set: |c, v| parse_enum(v).map(|m| c.mode_preference = m),
    },
    ConfigItem {
        name: "gnss",
        help: "Enable GNSS support",
        kind: ItemKind::Bool,
        get: |c| c.gnss.to_string(),
        set: |c, v| parse_bool(v).map(|b| c.gnss = b),
    },
    ConfigItem {
        name: "bands",
        help: "Band lock list",
        kind: ItemKind::BandList,
        get: |c| {
            c.bands
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(",")
        },
        set: |c, v| parse_bands(v).map(|b| c.bands = b),
    },
    ConfigItem {
        name: "autoconn",
        help: "Select the operator automatically",
        kind: ItemKind::Bool,
        get: |c| c.autoconn.to_string(),
        set: |c, v| parse_bool(v).map(|b| c.autoconn = b),
    },
    ConfigItem {
        name: "plmnid",
        help: "Operator PLMN used when autoconn is off",
        kind: ItemKind::Text { max_len: 6 },
        get: |c| c.plmnid.clone(),
        set: |c, v| check_plmnid(v).map(|_| c.plmnid = v.into()),
    },
    ConfigItem {
        name: "apn",
        help: "Access point name",
        kind: ItemKind::Text { max_len: 63 },
        get: |c| c.apn.clone(),
        set: |c, v| {
            c.apn = v.into();
            Ok(())
        },
    },
    ConfigItem {
        name: "auth",
        help: "PDN authentication protocol",
        kind: ItemKind::Enum(&["none", "pap", "chap"]),
        get: |c| enum_name(&c.auth),
        set: |c, v| parse_enum(v).map(|a| c.auth = a),
    },
    ConfigItem {
        name: "username",
        help: "PDN user name",
        kind: ItemKind::Text { max_len: 32 },
        get: |c| c.username.clone(),
        set: |c, v| {
            c.username = v.into();
            Ok(())
        },
    },
    ConfigItem {
        name: "password",
        help: "PDN password",
        kind: ItemKind::Text { max_len: 32 },
        get: |c| c.password.clone(),
        set: |c, v| {
            c.password = v.into();
            Ok(())
        },
    },
    ConfigItem {
        name: "addr",
        help: "Remote UDP address",
        kind: ItemKind::Ipv4,
        get: |c| c.addr.to_string(),
        set: |c, v| {
            v.parse()
                .map(|a| c.addr = a)
                .map_err(|_| "expected IPv4 address".into())
        },
    },
    ConfigItem {
        name: "port",
        help: "Remote UDP port",
        kind: ItemKind::Int { min: 1, max: 65535 },
        get: |c| c.port.to_string(),
        set: |c, v| {
            v.parse()
                .map(|p| c.port = p)
                .map_err(|_| "expected port number".into())
        },
    },
    ConfigItem {
        name: "clksync",
        help: "Fetch network time when the modem announces it",
        kind: ItemKind::Bool,
        get: |c| c.clksync.to_string(),
        set: |c, v| parse_bool(v).map(|b| c.clksync = b),
    },
    ConfigItem {
        name: "attach-policy",
        help: "Attach retry schedule",
        kind: ItemKind::Enum(&["fixed", "periodic", "progressive"]),
        get: |c| c.attach_policy.to_string(),
        set: |c, v| v.parse().map(|p| c.attach_policy = p),
    },
    ConfigItem {
        name: "psm-tau",
        help: "Requested periodic TAU (GPRS Timer 3 bits)",
        kind: ItemKind::Text { max_len: 8 },
        get: |c| c.psm_tau.clone(),
        set: |c, v| check_timer_bits(v).map(|_| c.psm_tau = v.into()),
    },
    ConfigItem {
        name: "psm-active",
        help: "Requested active time (GPRS Timer 2 bits)",
        kind: ItemKind::Text { max_len: 8 },
        get: |c| c.psm_active.clone(),
        set: |c, v| check_timer_bits(v).map(|_| c.psm_active = v.into()),
    },
];

pub fn find_item(name: &str) -> Option<&'static ConfigItem> {
    ITEMS.iter().find(|i| i.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let cfg = LteConfig::from_toml_str("  ").unwrap();
        assert_eq!(cfg, LteConfig::default());
        assert_eq!(cfg.port, 5003);
        assert!(cfg.band_lock_bitmap().is_none());
        assert_eq!(cfg.system_mode_preference(), 0);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1
            antenna = "ext"
            lte-m-mode = true
            mode-preference = "lte-m"
            bands = [20, 8, 20, 3]
            apn = "iot.example"
            auth = "chap"
            username = "user"
            password = "secret"
            addr = "10.1.2.3"
            port = 7000
            attach-policy = "fixed"

            [timing]
            boot_ms = 250
            response_long_ms = 800
        "#;

        let cfg = LteConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.antenna, Antenna::Ext);
        assert_eq!(cfg.bands, vec![3, 8, 20]);
        assert_eq!(cfg.system_mode_preference(), 1);
        assert_eq!(cfg.auth, Auth::Chap);
        assert_eq!(cfg.addr, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(cfg.attach_policy, AttachPolicy::Fixed);
        assert_eq!(cfg.timing.boot, Duration::from_millis(250));
        assert_eq!(cfg.timing.talk.response_long, Duration::from_millis(800));
        assert_eq!(cfg.timing.wakeup, Timing::default().wakeup);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            LteConfig::from_toml_str("version = 2"),
            Err(ConfigError::Version(2))
        ));
        assert!(LteConfig::from_toml_str("plmnid = \"23x03\"").is_err());
        assert!(LteConfig::from_toml_str("bands = [0]").is_err());
        assert!(LteConfig::from_toml_str("bands = [89]").is_err());
        assert!(LteConfig::from_toml_str("nb-iot-mode = false").is_err());
        assert!(LteConfig::from_toml_str("psm-tau = \"0011\"").is_err());
        assert!(matches!(
            LteConfig::from_toml_str("port = \"x\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn band_lock_bitmap_places_band_one_last() {
        let cfg = LteConfig {
            bands: vec![2, 4, 5, 8, 12, 13, 17, 18, 19, 20, 25, 26, 28, 66],
            ..Default::default()
        };
        assert_eq!(
            cfg.band_lock_bitmap().unwrap(),
            "0000000000000000000000100000000000000000000000000000000000001011000011110001100010011010"
        );
    }

    #[test]
    fn descriptor_table_drives_get_and_set() {
        let mut cfg = LteConfig::default();
        cfg.set_item("antenna", "ext").unwrap();
        cfg.set_item("bands", "20, 8").unwrap();
        cfg.set_item("auth", "pap").unwrap();
        cfg.set_item("mode-preference", "lte-m").unwrap();
        cfg.set_item("port", "6000").unwrap();
        assert_eq!(cfg.get_item("antenna").unwrap(), "ext");
        assert_eq!(cfg.get_item("bands").unwrap(), "8,20");
        assert_eq!(cfg.get_item("auth").unwrap(), "pap");
        assert_eq!(cfg.get_item("mode-preference").unwrap(), "lte-m");
        assert_eq!(cfg.port, 6000);

        assert!(matches!(
            cfg.set_item("port", "0"),
            Err(ConfigError::InvalidValue { item: "port", .. })
        ));
        assert!(matches!(
            cfg.set_item("antenna", "both"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            cfg.set_item("nope", "1"),
            Err(ConfigError::UnknownItem(_))
        ));
        // Disabling the only enabled mode violates a cross-field rule.
        assert!(cfg.set_item("nb-iot-mode", "false").is_err());
        assert!(cfg.nb_iot_mode);
    }

    #[test]
    fn every_item_reads_back_its_default() {
        let cfg = LteConfig::default();
        for item in ITEMS {
            let value = (item.get)(&cfg);
            let mut copy = cfg.clone();
            copy.set_item(item.name, &value)
                .unwrap_or_else(|e| panic!("{}: {e}", item.name));
            assert_eq!(copy, cfg, "{} did not round trip", item.name);
        }
    }

    #[test]
    fn saved_config_loads_back() {
        let mut cfg = LteConfig::default();
        cfg.set_item("apn", "internet").unwrap();
        cfg.set_item("bands", "3,20").unwrap();
        cfg.timing.boot = Duration::from_millis(1234);
        let text = cfg.to_toml_string().unwrap();
        let loaded = LteConfig::from_toml_str(&text).unwrap();
        assert_eq!(loaded, cfg);
    }
}
