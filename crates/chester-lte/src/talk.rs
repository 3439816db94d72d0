//! # Dialog Transport
//!
//! Request/response exchanges over the shared AT link.
//!
//! A [`Dialog`] holds the link in dialog mode for its lifetime, so
//! unsolicited lines are queued for us instead of being dispatched to the
//! link handler. Lines a matcher does not consume are forwarded to the URC
//! sink, which keeps notifications that interleave with a reply from being
//! lost. [`DataMode`] does the same for the raw byte sub-mode. Both guards
//! leave their mode in `Drop`, so every return path restores line mode.
//!
//! ```text
//!   send_line ──► recv_line ─┬─ ERROR / +CME ERROR ──► Rejected
//!                            ├─ matcher: Break ──────► done
//!                            ├─ matcher: Consumed ───► next line
//!                            └─ matcher: Pass ───────► URC sink, next line
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::TalkError;
use crate::link::Link;

/// Callback receiving lines that are not part of the current reply.
pub type UrcSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Longest single response line we collect.
pub const MAX_RESPONSE_LEN: usize = 256;

/// Escape sequence leaving data mode.
const DATA_MODE_ESCAPE: &[u8] = b"+++";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TalkTimeouts {
    /// Writing one command line.
    pub send: Duration,
    /// Replies to ordinary commands.
    pub response_short: Duration,
    /// Replies to commands that touch the radio or the network.
    pub response_long: Duration,
    /// `%CONEVAL`, which may wait for a cell search.
    pub coneval: Duration,
}

impl Default for TalkTimeouts {
    fn default() -> Self {
        TalkTimeouts {
            send: Duration::from_secs(1),
            response_short: Duration::from_secs(3),
            response_long: Duration::from_secs(30),
            coneval: Duration::from_secs(30),
        }
    }
}

// ─── Command set ────────────────────────────────────────────────────────────

/// How the reply to a command is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Just `OK`.
    Ok,
    /// One line starting with the prefix, then `OK`. The prefix is stripped.
    Prefixed(&'static str),
    /// One line not starting with `+`, `%` or `#`, then `OK`.
    Plain,
}

/// Release assistance indication applied to the data socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiOption {
    NoData = 50,
    Last = 51,
    OneResponse = 52,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Pap = 1,
    Chap = 2,
}

/// The AT commands this stack issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand<'a> {
    At,
    Ceppi,
    CeinfoRead,
    Cereg(u8),
    CeregRead,
    Cfun(u8),
    CfunRead,
    CgactRead,
    CgattRead,
    Cgauth(Option<(AuthProtocol, &'a str, &'a str)>),
    Cgdcont(&'a str),
    CgdcontRead,
    Cgerep,
    Cgsn,
    Cimi,
    CclkRead,
    Cmee,
    Cnec,
    Coneval,
    /// `None` selects the operator automatically.
    Cops(Option<&'a str>),
    CopsRead,
    Cpsms { tau: &'a str, active: &'a str },
    CrsmReadFplmn,
    CrsmEraseFplmn,
    Cscon,
    HwVersion,
    MdmEv,
    Rai,
    Rel14Feat,
    ShortSwVer,
    /// `None` removes any band lock.
    XBandLock(Option<&'a str>),
    XCband,
    XCoex0,
    XConnect { addr: &'a str, port: u16 },
    XDataPrfl,
    XGps(bool),
    Xiccid,
    XModemSleep,
    XModemTrace,
    XNetTime,
    XPofWarn,
    XSim,
    XSleep(u8),
    XSlmVer,
    XSocketOpenUdp,
    XSocketClose,
    XSocketOpt(RaiOption),
    XSocketRead,
    XSystemMode { lte_m: bool, nb_iot: bool, gnss: bool, preference: u8 },
    XTemp,
    XTempHighLvl(u8),
    XVersion,
    /// Operator-supplied line, sent verbatim.
    Raw(&'a str),
}

const FPLMN_FILE: u16 = 28539;

impl fmt::Display for AtCommand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AtCommand::*;
        let b = |v: bool| u8::from(v);
        match self {
            At => f.write_str("AT"),
            Ceppi => f.write_str("AT+CEPPI=1"),
            CeinfoRead => f.write_str("AT+CEINFO?"),
            Cereg(n) => write!(f, "AT+CEREG={n}"),
            CeregRead => f.write_str("AT+CEREG?"),
            Cfun(n) => write!(f, "AT+CFUN={n}"),
            CfunRead => f.write_str("AT+CFUN?"),
            CgactRead => f.write_str("AT+CGACT?"),
            CgattRead => f.write_str("AT+CGATT?"),
            Cgauth(None) => f.write_str("AT+CGAUTH=0,0"),
            Cgauth(Some((proto, user, pass))) => {
                write!(f, "AT+CGAUTH=0,{},\"{user}\",\"{pass}\"", *proto as u8)
            }
            Cgdcont("") => f.write_str("AT+CGDCONT=0,\"IP\""),
            Cgdcont(apn) => write!(f, "AT+CGDCONT=0,\"IP\",\"{apn}\""),
            CgdcontRead => f.write_str("AT+CGDCONT?"),
            Cgerep => f.write_str("AT+CGEREP=1"),
            Cgsn => f.write_str("AT+CGSN=1"),
            Cimi => f.write_str("AT+CIMI"),
            CclkRead => f.write_str("AT+CCLK?"),
            Cmee => f.write_str("AT+CMEE=1"),
            Cnec => f.write_str("AT+CNEC=24"),
            Coneval => f.write_str("AT%CONEVAL"),
            Cops(None) => f.write_str("AT+COPS=0"),
            Cops(Some(plmn)) => write!(f, "AT+COPS=1,2,\"{plmn}\""),
            CopsRead => f.write_str("AT+COPS?"),
            Cpsms { tau, active } => write!(f, "AT+CPSMS=1,,,\"{tau}\",\"{active}\""),
            CrsmReadFplmn => write!(f, "AT+CRSM=176,{FPLMN_FILE},0,0,12"),
            CrsmEraseFplmn => write!(
                f,
                "AT+CRSM=214,{FPLMN_FILE},0,0,12,\"FFFFFFFFFFFFFFFFFFFFFFFF\""
            ),
            Cscon => f.write_str("AT+CSCON=1"),
            HwVersion => f.write_str("AT%HWVERSION"),
            MdmEv => f.write_str("AT%MDMEV=1"),
            Rai => f.write_str("AT%RAI=1"),
            Rel14Feat => f.write_str("AT%REL14FEAT=1,1,1,1,0"),
            ShortSwVer => f.write_str("AT%SHORTSWVER"),
            XBandLock(None) => f.write_str("AT%XBANDLOCK=0"),
            XBandLock(Some(bitmap)) => write!(f, "AT%XBANDLOCK=1,\"{bitmap}\""),
            XCband => f.write_str("AT%XCBAND"),
            XCoex0 => f.write_str("AT%XCOEX0=1,1,1565,1586"),
            XConnect { addr, port } => write!(f, "AT#XCONNECT=\"{addr}\",{port}"),
            XDataPrfl => f.write_str("AT%XDATAPRFL=0"),
            XGps(true) => f.write_str("AT#XGPS=1,0,1"),
            XGps(false) => f.write_str("AT#XGPS=0"),
            Xiccid => f.write_str("AT%XICCID"),
            XModemSleep => f.write_str("AT%XMODEMSLEEP=1,500,10240"),
            XModemTrace => f.write_str("AT%XMODEMTRACE=1,2"),
            XNetTime => f.write_str("AT%XNETTIME=1"),
            XPofWarn => f.write_str("AT%XPOFWARN=1,30"),
            XSim => f.write_str("AT%XSIM=1"),
            XSleep(mode) => write!(f, "AT#XSLEEP={mode}"),
            XSlmVer => f.write_str("AT#XSLMVER"),
            XSocketOpenUdp => f.write_str("AT#XSOCKET=1,2,0"),
            XSocketClose => f.write_str("AT#XSOCKET=0"),
            XSocketOpt(opt) => write!(f, "AT#XSOCKETOPT=1,{}", *opt as u8),
            XSocketRead => f.write_str("AT#XSOCKET?"),
            XSystemMode {
                lte_m,
                nb_iot,
                gnss,
                preference,
            } => write!(
                f,
                "AT%XSYSTEMMODE={},{},{},{preference}",
                b(*lte_m),
                b(*nb_iot),
                b(*gnss)
            ),
            XTemp => f.write_str("AT%XTEMP=1"),
            XTempHighLvl(level) => write!(f, "AT%XTEMPHIGHLVL={level}"),
            XVersion => f.write_str("AT#XVERSION"),
            Raw(line) => f.write_str(line),
        }
    }
}

impl AtCommand<'_> {
    pub fn reply(&self) -> Reply {
        use AtCommand::*;
        match self {
            CeinfoRead => Reply::Prefixed("+CEINFO: "),
            CeregRead => Reply::Prefixed("+CEREG: "),
            CfunRead => Reply::Prefixed("+CFUN: "),
            CgactRead => Reply::Prefixed("+CGACT: "),
            CgattRead => Reply::Prefixed("+CGATT: "),
            CgdcontRead => Reply::Prefixed("+CGDCONT: "),
            Cgsn => Reply::Prefixed("+CGSN: "),
            Cimi => Reply::Plain,
            CclkRead => Reply::Prefixed("+CCLK: "),
            Coneval => Reply::Prefixed("%CONEVAL: "),
            CopsRead => Reply::Prefixed("+COPS: "),
            CrsmReadFplmn | CrsmEraseFplmn => Reply::Prefixed("+CRSM: "),
            HwVersion => Reply::Prefixed("%HWVERSION: "),
            ShortSwVer => Reply::Prefixed("%SHORTSWVER: "),
            XCband => Reply::Prefixed("%XCBAND: "),
            XConnect { .. } => Reply::Prefixed("#XCONNECT: "),
            Xiccid => Reply::Prefixed("%XICCID: "),
            XSlmVer => Reply::Prefixed("#XSLMVER: "),
            XSocketOpenUdp | XSocketClose | XSocketRead => Reply::Prefixed("#XSOCKET: "),
            XVersion => Reply::Prefixed("#XVERSION: "),
            _ => Reply::Ok,
        }
    }

    pub fn timeout(&self, t: &TalkTimeouts) -> Duration {
        use AtCommand::*;
        match self {
            Coneval => t.coneval,
            Cfun(_) | Cops(_) | XConnect { .. } | XSocketOpenUdp | XSocketClose
            | CrsmEraseFplmn | XGps(_) | Raw(_) => t.response_long,
            _ => t.response_short,
        }
    }
}

// ─── Dialog ─────────────────────────────────────────────────────────────────

/// What to do with a line offered to a [`Dialog::run_loop`] matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Line belongs to this reply; keep reading.
    Consumed,
    /// Line is not ours; forward to the URC sink and keep reading.
    Pass,
    /// Reply complete.
    Break,
}

fn is_error_token(line: &str) -> bool {
    line.starts_with("ERROR") || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR")
}

fn is_notification(line: &str) -> bool {
    line.starts_with('+') || line.starts_with('%') || line.starts_with('#')
}

fn bounded(line: &str, capacity: usize) -> Result<String, TalkError> {
    if line.len() >= capacity {
        return Err(TalkError::NoSpace { capacity });
    }
    Ok(line.to_string())
}

/// Byte count reported by the modem; digits only.
fn byte_count(text: &str) -> Result<usize, TalkError> {
    let text = text.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TalkError::ByteCountUnreadable(text.to_string()));
    }
    text.parse()
        .map_err(|_| TalkError::ByteCountUnreadable(text.to_string()))
}

/// Scope guard holding the link in dialog mode.
pub struct Dialog<'t> {
    talk: &'t Talk,
}

impl<'t> Dialog<'t> {
    fn open(talk: &'t Talk) -> Result<Self, TalkError> {
        talk.link.enter_dialog()?;
        Ok(Dialog { talk })
    }

    pub fn send_line(&self, line: &str) -> Result<(), TalkError> {
        trace!(line, "tx");
        self.talk.link.send_line(self.talk.timeouts.send, line)?;
        Ok(())
    }

    /// Reads lines until `matcher` returns [`Step::Break`]. `timeout`
    /// bounds the wait for each individual line.
    pub fn run_loop<F>(&self, timeout: Duration, mut matcher: F) -> Result<(), TalkError>
    where
        F: FnMut(&str) -> Result<Step, TalkError>,
    {
        loop {
            let line = self
                .talk
                .link
                .recv_line(timeout)?
                .ok_or(TalkError::Timeout)?;
            trace!(line = %line, "rx");
            if is_error_token(&line) {
                return Err(TalkError::Rejected(line));
            }
            match matcher(&line)? {
                Step::Break => return Ok(()),
                Step::Consumed => {}
                Step::Pass => self.talk.forward_urc(&line),
            }
        }
    }

    pub fn expect_ok(&self, timeout: Duration) -> Result<(), TalkError> {
        self.expect_line(timeout, "OK")
    }

    pub fn expect_line(&self, timeout: Duration, expected: &str) -> Result<(), TalkError> {
        self.run_loop(timeout, |line| {
            Ok(if line == expected {
                Step::Break
            } else {
                Step::Pass
            })
        })
    }

    /// Waits for a line starting with `prefix` and returns the remainder.
    pub fn expect_prefix(&self, timeout: Duration, prefix: &str) -> Result<String, TalkError> {
        let mut found = None;
        self.run_loop(timeout, |line| match line.strip_prefix(prefix) {
            Some(rest) => {
                found = Some(bounded(rest, MAX_RESPONSE_LEN)?);
                Ok(Step::Break)
            }
            None => Ok(Step::Pass),
        })?;
        found.ok_or(TalkError::Timeout)
    }

    /// Collects the reply line selected by `reply`, then waits for `OK`.
    pub fn gather(&self, timeout: Duration, reply: Reply) -> Result<String, TalkError> {
        let mut found: Option<String> = None;
        self.run_loop(timeout, |line| {
            if found.is_none() {
                let body = match reply {
                    Reply::Ok => None,
                    Reply::Prefixed(prefix) => line.strip_prefix(prefix),
                    Reply::Plain if !line.is_empty() && line != "OK" && !is_notification(line) => {
                        Some(line)
                    }
                    Reply::Plain => None,
                };
                if let Some(body) = body {
                    found = Some(bounded(body, MAX_RESPONSE_LEN)?);
                    return Ok(Step::Consumed);
                }
            }
            if line == "OK" {
                return match (&found, reply) {
                    (None, Reply::Prefixed(_) | Reply::Plain) => {
                        Err(TalkError::Malformed("OK without response".into()))
                    }
                    _ => Ok(Step::Break),
                };
            }
            Ok(Step::Pass)
        })?;
        Ok(found.unwrap_or_default())
    }

    pub fn data_mode(&self) -> Result<DataMode<'_>, TalkError> {
        self.talk.link.enter_data_mode()?;
        Ok(DataMode { talk: self.talk })
    }
}

impl Drop for Dialog<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.talk.link.exit_dialog() {
            warn!(error = %e, "failed to exit dialog");
        }
    }
}

/// Scope guard holding the link in raw data mode.
pub struct DataMode<'t> {
    talk: &'t Talk,
}

impl DataMode<'_> {
    pub fn send(&self, data: &[u8]) -> Result<(), TalkError> {
        self.talk
            .link
            .send_data(self.talk.timeouts.response_short, data)?;
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes.
    pub fn recv_exact(&self, timeout: Duration, buf: &mut [u8]) -> Result<(), TalkError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.talk.link.recv_data(timeout, &mut buf[filled..])?;
            if n == 0 {
                return Err(TalkError::ByteCount {
                    expected: buf.len(),
                    reported: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }
}

impl Drop for DataMode<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.talk.link.exit_data_mode() {
            warn!(error = %e, "failed to exit data mode");
        }
    }
}

// ─── Talk ───────────────────────────────────────────────────────────────────

pub struct Talk {
    link: Arc<dyn Link>,
    urc: Option<UrcSink>,
    timeouts: TalkTimeouts,
}

impl Talk {
    pub fn new(link: Arc<dyn Link>, timeouts: TalkTimeouts) -> Self {
        Talk {
            link,
            urc: None,
            timeouts,
        }
    }

    pub fn with_urc_sink(mut self, sink: UrcSink) -> Self {
        self.urc = Some(sink);
        self
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    pub fn timeouts(&self) -> &TalkTimeouts {
        &self.timeouts
    }

    pub fn set_timeouts(&mut self, timeouts: TalkTimeouts) {
        self.timeouts = timeouts;
    }

    fn forward_urc(&self, line: &str) {
        match &self.urc {
            Some(sink) => sink(line),
            None => debug!(line, "unhandled line during dialog"),
        }
    }

    pub fn dialog(&self) -> Result<Dialog<'_>, TalkError> {
        Dialog::open(self)
    }

    /// Sends `cmd` and collects its reply. Commands answered with a bare
    /// `OK` return an empty string.
    pub fn execute(&self, cmd: &AtCommand<'_>) -> Result<String, TalkError> {
        let line = cmd.to_string();
        let dialog = self.dialog()?;
        dialog.send_line(&line)?;
        let response = dialog.gather(cmd.timeout(&self.timeouts), cmd.reply())?;
        debug!(cmd = %line, response = %response, "command complete");
        Ok(response)
    }

    /// Binary payload transfer through data mode.
    ///
    /// `AT#XSEND=` → `OK`, payload, `#XDATAMODE: <n>`, escape,
    /// `#XDATAMODE: 0`.
    pub fn xsend(&self, data: &[u8]) -> Result<(), TalkError> {
        if data.is_empty() {
            return Err(TalkError::InvalidArgument);
        }
        let t = self.timeouts;
        let dialog = self.dialog()?;
        dialog.send_line("AT#XSEND=")?;
        dialog.expect_ok(t.response_short)?;

        dialog.data_mode()?.send(data)?;
        let reported = dialog.expect_prefix(t.response_long, "#XDATAMODE: ")?;
        dialog.data_mode()?.send(DATA_MODE_ESCAPE)?;

        let reported = byte_count(&reported)?;
        if reported != data.len() {
            return Err(TalkError::ByteCount {
                expected: data.len(),
                reported,
            });
        }
        dialog.expect_line(t.response_short, "#XDATAMODE: 0")
    }

    /// Text payload transfer embedded in the command line.
    pub fn xsend_text(&self, text: &str) -> Result<(), TalkError> {
        if text.is_empty() || text.contains('"') || text.contains(['\r', '\n']) {
            return Err(TalkError::InvalidArgument);
        }
        let dialog = self.dialog()?;
        dialog.send_line(&format!("AT#XSEND=\"{text}\""))?;
        let reported = dialog.gather(self.timeouts.response_long, Reply::Prefixed("#XSEND: "))?;
        let reported = byte_count(&reported)?;
        if reported != text.len() {
            return Err(TalkError::ByteCount {
                expected: text.len(),
                reported,
            });
        }
        Ok(())
    }

    /// Waits up to `window` for an inbound datagram of at most `capacity`
    /// bytes.
    ///
    /// `AT#XRECV=<s>` → `#XRECV: <n>`, `n` bytes in data mode, `OK`.
    pub fn xrecv(&self, window: Duration, capacity: usize) -> Result<Vec<u8>, TalkError> {
        let t = self.timeouts;
        let secs = window.as_secs().max(1);
        let dialog = self.dialog()?;
        dialog.send_line(&format!("AT#XRECV={secs}"))?;
        let count = dialog.expect_prefix(window + t.response_long, "#XRECV: ")?;
        let len = byte_count(&count)?;
        if len > capacity {
            return Err(TalkError::NoSpace { capacity });
        }

        let mut buf = vec![0u8; len];
        dialog.data_mode()?.recv_exact(t.response_short, &mut buf)?;
        dialog.expect_ok(t.response_short)?;
        Ok(buf)
    }
}
