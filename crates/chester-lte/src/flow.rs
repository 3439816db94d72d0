//! # Flow Sequencer
//!
//! Multi-step AT sequences the state machine runs in its state handlers:
//! modem bring-up, SIM checks, socket lifecycle, health probing and payload
//! transfer. The [`Sequencer`] trait is the seam between the state machine
//! and the modem; [`Flow`] is the implementation backed by a [`Talk`].
//!
//! Nothing here retries on its own except forbidden-network recovery,
//! which is capped per bring-up.
//!
//! [`UrcRouter`] turns unsolicited lines into state-machine events. The same
//! router serves the link handler (lines outside dialogs) and the dialog
//! URC sink (lines interleaved with a reply).

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::LteConfig;
use crate::error::{Check, FlowError, ParseError, TalkError};
use crate::fsm::{Event, EventSender};
use crate::link::{Link, LinkEvent, LinkHandler, RfInterface, RfMux};
use crate::parse::{
    parse_cclk, parse_cereg, parse_cereg_query, parse_cgdcont, parse_coneval, parse_xgps,
    parse_xmodemsleep, parse_xsocket_get, parse_xsocket_set, ConnEvalParams, NetworkTime,
    XgpsLine, SOCKET_PROTOCOL_UDP, SOCKET_ROLE_CLIENT, SOCKET_TYPE_DGRAM,
};
use crate::state::StateStore;
use crate::talk::{AtCommand, RaiOption, Step, Talk, UrcSink};
use crate::tok::unquote;

/// Expected `+CRSM` reply for an empty forbidden-network list.
const FPLMN_EMPTY: &str = "144,0,\"FFFFFFFFFFFFFFFFFFFFFFFF\"";

/// Forbidden-network erasures allowed per bring-up.
const MAX_FPLMN_ERASURES: u8 = 2;

/// Consecutive identical IMSI reads required before trusting the SIM.
const MAX_IMSI_READS: usize = 10;

/// Settle time after `#XSLEEP` and between the CFUN toggles.
const SETTLE: Duration = Duration::from_millis(100);

/// One outbound payload.
#[derive(Debug, Clone, Copy)]
pub struct Uplink<'a> {
    pub data: &'a [u8],
    /// Send through `#XSEND="..."` instead of data mode.
    pub as_string: bool,
    /// Apply release assistance around the transfer.
    pub rai: bool,
    /// A downlink is expected after this uplink.
    pub expect_response: bool,
}

/// Manual link operations available in test mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOp {
    UartEnable,
    UartDisable,
    Reset,
    Wakeup,
    Cmd(String),
}

/// Modem operations driven by the state machine.
pub trait Sequencer: Send {
    fn rfmux_acquire(&mut self) -> Result<(), FlowError>;
    fn rfmux_release(&mut self) -> Result<(), FlowError>;
    /// Pulses the reset line. Starts a fresh bring-up.
    fn reset(&mut self) -> Result<(), FlowError>;
    /// Enables the transport and wakes the modem. Idempotent.
    fn start(&mut self) -> Result<(), FlowError>;
    /// Puts the modem to sleep and disables the transport. Idempotent.
    fn stop(&mut self) -> Result<(), FlowError>;
    fn prepare(&mut self) -> Result<(), FlowError>;
    fn cfun(&mut self, mode: u8) -> Result<(), FlowError>;
    fn sim_info(&mut self) -> Result<(), FlowError>;
    fn sim_fplmn(&mut self) -> Result<(), FlowError>;
    fn open_socket(&mut self) -> Result<(), FlowError>;
    fn close_socket(&mut self) -> Result<(), FlowError>;
    fn check_health(&mut self) -> Result<(), FlowError>;
    fn send(&mut self, uplink: &Uplink<'_>) -> Result<(), FlowError>;
    fn recv(&mut self, capacity: usize, rai: bool) -> Result<Vec<u8>, FlowError>;
    fn coneval(&mut self) -> Result<ConnEvalParams, FlowError>;
    fn gnss(&mut self, enable: bool) -> Result<(), FlowError>;
    fn network_time(&mut self) -> Result<NetworkTime, FlowError>;
    fn test(&mut self, op: &TestOp) -> Result<String, FlowError>;
}

// ─── Flow ───────────────────────────────────────────────────────────────────

pub struct Flow {
    talk: Talk,
    rfmux: Box<dyn RfMux>,
    config: Arc<ArcSwap<LteConfig>>,
    store: Arc<StateStore>,
    ready: Receiver<()>,
    started: bool,
    fplmn_erasures: u8,
}

impl Flow {
    /// Builds the sequencer and wires the link handler and the dialog URC
    /// sink to a shared [`UrcRouter`].
    pub fn new(
        link: Arc<dyn Link>,
        rfmux: Box<dyn RfMux>,
        config: Arc<ArcSwap<LteConfig>>,
        store: Arc<StateStore>,
        events: EventSender,
    ) -> Self {
        let (ready_tx, ready) = bounded(1);
        let router = UrcRouter::new(store.clone(), events, config.clone(), ready_tx);
        link.set_handler(Some(router.clone().into_link_handler()));
        let timeouts = config.load().timing.talk;
        let talk = Talk::new(link, timeouts).with_urc_sink(router.into_sink());
        Flow {
            talk,
            rfmux,
            config,
            store,
            ready,
            started: false,
            fplmn_erasures: 0,
        }
    }

    fn exec(&self, cmd: AtCommand<'_>) -> Result<String, FlowError> {
        Ok(self.talk.execute(&cmd)?)
    }

    fn link(&self) -> &Arc<dyn Link> {
        self.talk.link()
    }

    /// Sends `line` and returns every line up to the final `OK`.
    fn raw(&self, line: &str) -> Result<String, FlowError> {
        let mut lines = Vec::new();
        let dialog = self.talk.dialog()?;
        dialog.send_line(line)?;
        dialog.run_loop(self.talk.timeouts().response_long, |l| {
            if l == "OK" {
                return Ok(Step::Break);
            }
            lines.push(l.to_string());
            Ok(Step::Consumed)
        })?;
        Ok(lines.join("\n"))
    }

    fn reset_rai(&self) {
        if let Err(e) = self.exec(AtCommand::XSocketOpt(RaiOption::NoData)) {
            warn!(error = %e, "failed to reset release assistance");
        }
    }
}

fn link_err(e: crate::error::LinkError) -> FlowError {
    FlowError::Talk(TalkError::Link(e))
}

fn rfmux_err(e: anyhow::Error) -> FlowError {
    FlowError::RfMux(format!("{e:#}"))
}

impl Sequencer for Flow {
    fn rfmux_acquire(&mut self) -> Result<(), FlowError> {
        let antenna = self.config.load().antenna;
        self.rfmux.acquire().map_err(rfmux_err)?;
        self.rfmux.set_antenna(antenna).map_err(rfmux_err)?;
        self.rfmux.set_interface(RfInterface::Lte).map_err(rfmux_err)?;
        debug!(%antenna, "rf mux acquired");
        Ok(())
    }

    fn rfmux_release(&mut self) -> Result<(), FlowError> {
        self.rfmux.set_interface(RfInterface::None).map_err(rfmux_err)?;
        self.rfmux.release().map_err(rfmux_err)
    }

    fn reset(&mut self) -> Result<(), FlowError> {
        if self.started {
            self.link().disable().map_err(link_err)?;
            self.started = false;
        }
        self.fplmn_erasures = 0;
        self.link().reset().map_err(link_err)
    }

    fn start(&mut self) -> Result<(), FlowError> {
        if self.started {
            return Ok(());
        }
        self.link().enable().map_err(link_err)?;
        self.started = true;
        self.link().wake_up().map_err(link_err)
    }

    fn stop(&mut self) -> Result<(), FlowError> {
        if !self.started {
            return Ok(());
        }
        if let Err(e) = self.exec(AtCommand::XSleep(2)) {
            warn!(error = %e, "modem did not acknowledge sleep");
        }
        thread::sleep(SETTLE);
        self.started = false;
        self.link().disable().map_err(link_err)
    }

    fn prepare(&mut self) -> Result<(), FlowError> {
        use AtCommand::*;

        let cfg = self.config.load_full();
        self.talk.set_timeouts(cfg.timing.talk);

        self.exec(At)?;
        if cfg.modemtrace {
            self.exec(XModemTrace)?;
        }

        let imei = self.exec(Cgsn)?;
        let imei = unquote(imei.trim())
            .parse()
            .map_err(|_| ParseError::Malformed("imei"))?;
        self.store.set_imei(imei);
        let hw = self.exec(HwVersion)?;
        let sw = self.exec(ShortSwVer)?;
        let slm = self.exec(XSlmVer)?;
        let fw = self.exec(XVersion)?;
        let fw = unquote(fw.trim());
        self.store.set_fw_version(fw);
        info!(imei, hw = %hw, sw = %sw, slm = %slm, fw, "modem identified");

        self.exec(Cfun(0))?;
        self.exec(XPofWarn)?;
        self.exec(XTempHighLvl(70))?;
        self.exec(XTemp)?;

        self.exec(XSystemMode {
            lte_m: cfg.lte_m_mode,
            nb_iot: cfg.nb_iot_mode,
            gnss: cfg.gnss,
            preference: cfg.system_mode_preference(),
        })?;
        self.exec(XDataPrfl)?;
        let bitmap = cfg.band_lock_bitmap();
        self.exec(XBandLock(bitmap.as_deref()))?;

        for cmd in [XSim, XNetTime, MdmEv, Rel14Feat, Rai] {
            self.exec(cmd)?;
        }
        self.exec(Cpsms {
            tau: &cfg.psm_tau,
            active: &cfg.psm_active,
        })?;
        for cmd in [Ceppi, Cereg(5), Cgerep, Cmee, Cnec] {
            self.exec(cmd)?;
        }
        if cfg.gnss {
            self.exec(XCoex0)?;
        }
        self.exec(Cscon)?;

        let plmn = (!cfg.autoconn).then_some(cfg.plmnid.as_str());
        self.exec(Cops(plmn))?;
        self.exec(Cgdcont(&cfg.apn))?;
        let auth = cfg
            .auth
            .protocol()
            .map(|p| (p, cfg.username.as_str(), cfg.password.as_str()));
        self.exec(Cgauth(auth))?;
        self.exec(XModemSleep)?;
        Ok(())
    }

    fn cfun(&mut self, mode: u8) -> Result<(), FlowError> {
        self.exec(AtCommand::Cfun(mode)).map(|_| ())
    }

    fn sim_info(&mut self) -> Result<(), FlowError> {
        let mut last = 0u64;
        let mut imsi = None;
        for _ in 0..MAX_IMSI_READS {
            let read: u64 = self
                .exec(AtCommand::Cimi)?
                .trim()
                .parse()
                .map_err(|_| ParseError::Malformed("imsi"))?;
            if read != 0 && read == last {
                imsi = Some(read);
                break;
            }
            last = read;
        }
        let imsi = imsi.ok_or_else(|| FlowError::Sim("IMSI did not settle".into()))?;
        self.store.set_imsi(imsi);

        let iccid = self.exec(AtCommand::Xiccid)?;
        let iccid = unquote(iccid.trim());
        if !(18..=22).contains(&iccid.len()) {
            return Err(FlowError::Sim(format!("unexpected ICCID length {}", iccid.len())));
        }
        self.store.set_iccid(iccid);
        info!(imsi, iccid, "SIM identified");
        Ok(())
    }

    fn sim_fplmn(&mut self) -> Result<(), FlowError> {
        let fplmn = self.exec(AtCommand::CrsmReadFplmn)?;
        if fplmn == FPLMN_EMPTY {
            return Ok(());
        }
        if self.fplmn_erasures >= MAX_FPLMN_ERASURES {
            return Err(FlowError::Sim("forbidden network list keeps coming back".into()));
        }
        self.fplmn_erasures += 1;
        warn!(fplmn = %fplmn, erasure = self.fplmn_erasures, "clearing forbidden network list");
        self.exec(AtCommand::CrsmEraseFplmn)?;
        self.cfun(4)?;
        thread::sleep(SETTLE);
        self.cfun(1)?;
        Err(FlowError::RetryNeeded)
    }

    fn open_socket(&mut self) -> Result<(), FlowError> {
        let operator = self.exec(AtCommand::CopsRead)?;
        let band = self.exec(AtCommand::XCband)?;
        let ceinfo = self.exec(AtCommand::CeinfoRead)?;
        info!(operator = %operator, band = %band, ceinfo = %ceinfo, "network diagnostics");

        let pdn = parse_cgdcont(&self.exec(AtCommand::CgdcontRead)?)?;
        info!(cid = pdn.cid, apn = %pdn.apn, address = %pdn.address, "PDN context");

        let socket = parse_xsocket_set(&self.exec(AtCommand::XSocketOpenUdp)?)?;
        if socket.kind != SOCKET_TYPE_DGRAM || socket.protocol != SOCKET_PROTOCOL_UDP {
            warn!(?socket, "unexpected socket type");
            return Err(FlowError::Connectivity(Check::Socket));
        }

        let cfg = self.config.load_full();
        let addr = cfg.addr.to_string();
        let connected = self.exec(AtCommand::XConnect {
            addr: &addr,
            port: cfg.port,
        })?;
        if connected.trim() != "1" {
            return Err(FlowError::Connectivity(Check::Socket));
        }
        info!(handle = socket.handle, %addr, port = cfg.port, "socket connected");
        Ok(())
    }

    fn close_socket(&mut self) -> Result<(), FlowError> {
        let reply = self.exec(AtCommand::XSocketClose)?;
        debug!(reply = %reply, "socket closed");
        Ok(())
    }

    fn check_health(&mut self) -> Result<(), FlowError> {
        use AtCommand::*;

        if self.exec(CfunRead)?.trim() != "1" {
            return Err(FlowError::Connectivity(Check::FunctionalMode));
        }
        let (n, registration) = parse_cereg_query(&self.exec(CeregRead)?)?;
        let registered = registration.status.is_registered();
        self.store.set_registration(registration);
        if n == 0 || !registered {
            return Err(FlowError::Connectivity(Check::Registration));
        }
        if self.exec(CgattRead)?.trim() != "1" {
            return Err(FlowError::Connectivity(Check::Attach));
        }
        if self.exec(CgactRead)?.trim() != "0,1" {
            return Err(FlowError::Connectivity(Check::PdnContext));
        }
        let socket = parse_xsocket_get(&self.exec(XSocketRead)?)?;
        if socket.kind != SOCKET_TYPE_DGRAM || socket.role != SOCKET_ROLE_CLIENT {
            return Err(FlowError::Connectivity(Check::Socket));
        }
        Ok(())
    }

    fn send(&mut self, uplink: &Uplink<'_>) -> Result<(), FlowError> {
        if uplink.rai {
            let opt = if uplink.expect_response {
                RaiOption::OneResponse
            } else {
                RaiOption::Last
            };
            self.exec(AtCommand::XSocketOpt(opt))?;
        }

        if uplink.as_string {
            let text = std::str::from_utf8(uplink.data).map_err(|_| TalkError::InvalidArgument)?;
            self.talk.xsend_text(text)?;
        } else {
            self.talk.xsend(uplink.data)?;
        }
        debug!(len = uplink.data.len(), "payload sent");

        if uplink.rai && !uplink.expect_response {
            self.reset_rai();
        }
        Ok(())
    }

    fn recv(&mut self, capacity: usize, rai: bool) -> Result<Vec<u8>, FlowError> {
        let window = self.config.load().timing.recv_window;
        let data = self.talk.xrecv(window, capacity)?;
        debug!(len = data.len(), "payload received");
        if rai {
            self.reset_rai();
        }
        Ok(data)
    }

    fn coneval(&mut self) -> Result<ConnEvalParams, FlowError> {
        Ok(parse_coneval(&self.exec(AtCommand::Coneval)?)?)
    }

    fn gnss(&mut self, enable: bool) -> Result<(), FlowError> {
        self.exec(AtCommand::XGps(enable)).map(|_| ())
    }

    fn network_time(&mut self) -> Result<NetworkTime, FlowError> {
        let time = parse_cclk(&self.exec(AtCommand::CclkRead)?)?;
        self.store.set_network_time(time);
        Ok(time)
    }

    fn test(&mut self, op: &TestOp) -> Result<String, FlowError> {
        match op {
            TestOp::UartEnable => {
                self.link().enable().map_err(link_err)?;
                self.started = true;
                Ok("OK".into())
            }
            TestOp::UartDisable => {
                self.link().disable().map_err(link_err)?;
                self.started = false;
                Ok("OK".into())
            }
            TestOp::Reset => {
                self.link().reset().map_err(link_err)?;
                Ok("OK".into())
            }
            TestOp::Wakeup => {
                while self.ready.try_recv().is_ok() {}
                self.link().wake_up().map_err(link_err)?;
                let wait = self.config.load().timing.wakeup;
                self.ready
                    .recv_timeout(wait)
                    .map(|()| "Ready".to_string())
                    .map_err(|_| FlowError::Talk(TalkError::Timeout))
            }
            TestOp::Cmd(line) => self.raw(line),
        }
    }
}

// ─── URC routing ────────────────────────────────────────────────────────────

/// Maps unsolicited modem lines to state-machine events.
#[derive(Clone)]
pub struct UrcRouter {
    store: Arc<StateStore>,
    events: EventSender,
    config: Arc<ArcSwap<LteConfig>>,
    ready: Sender<()>,
}

impl UrcRouter {
    pub fn new(
        store: Arc<StateStore>,
        events: EventSender,
        config: Arc<ArcSwap<LteConfig>>,
        ready: Sender<()>,
    ) -> Self {
        UrcRouter {
            store,
            events,
            config,
            ready,
        }
    }

    pub fn into_link_handler(self) -> LinkHandler {
        Arc::new(move |event| match event {
            LinkEvent::RxLine(line) => self.route(&line),
            LinkEvent::RxData => debug!("data pending outside data mode"),
            LinkEvent::Overrun => warn!("link receive overrun"),
        })
    }

    pub fn into_sink(self) -> UrcSink {
        Arc::new(move |line: &str| self.route(line))
    }

    pub fn route(&self, line: &str) {
        if self.config.load().test {
            // Manual mode: only readiness is reported, to the waiting test op.
            if line == "Ready" {
                let _ = self.ready.try_send(());
            }
            return;
        }

        if line == "Ready" {
            self.events.post(Event::Ready);
        } else if line == "%XSIM: 1" {
            self.events.post(Event::SimDetected);
        } else if line.starts_with("%XTIME:") {
            self.events.post(Event::NetworkTime);
        } else if let Some(body) = line.strip_prefix("+CEREG: ") {
            match parse_cereg(body) {
                Ok(params) => {
                    let registered = params.status.is_registered();
                    info!(status = %params.status, tac = %params.tac, cell_id = params.cell_id, "registration update");
                    self.store.set_registration(params);
                    self.events.post(if registered {
                        Event::Registered
                    } else {
                        Event::Deregistered
                    });
                }
                Err(e) => warn!(error = %e, line, "undecodable registration update"),
            }
        } else if line == "%MDMEV: RESET LOOP" {
            warn!("modem reports reset loop");
            self.events.post(Event::ResetLoop);
        } else if line == "+CSCON: 0" {
            self.events.post(Event::RadioIdle);
        } else if line == "+CSCON: 1" {
            self.events.post(Event::RadioConnected);
        } else if let Some(body) = line.strip_prefix("%XMODEMSLEEP: ") {
            match parse_xmodemsleep(body) {
                Ok(sleep) if sleep.duration_ms > 0 => self.events.post(Event::ModemSleep),
                Ok(_) => {}
                Err(e) => warn!(error = %e, line, "undecodable modem sleep notification"),
            }
        } else if let Some(body) = line.strip_prefix("#XGPS: ") {
            match parse_xgps(body) {
                Ok(XgpsLine::Fix(fix)) => {
                    self.store.set_gnss_fix(fix);
                    self.events.post(Event::GnssFix);
                }
                Ok(XgpsLine::Status { service, status }) => {
                    debug!(service, status, "GNSS status")
                }
                Err(e) => warn!(error = %e, line, "undecodable GNSS notification"),
            }
        } else {
            debug!(line, "ignored notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::link::Antenna;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // ─── Mock Infrastructure ───

    /// Answers each sent line from a table of canned replies.
    #[derive(Default)]
    struct ReplyLink {
        replies: Mutex<Vec<(String, Vec<String>)>>,
        rx: Mutex<VecDeque<String>>,
        tx: Mutex<Vec<String>>,
        tx_data: Mutex<Vec<Vec<u8>>>,
        handler: Mutex<Option<LinkHandler>>,
    }

    impl ReplyLink {
        fn new(table: &[(&str, &[&str])]) -> Arc<Self> {
            let link = ReplyLink::default();
            *link.replies.lock().unwrap() = table
                .iter()
                .map(|(cmd, rx)| (cmd.to_string(), rx.iter().map(|s| s.to_string()).collect()))
                .collect();
            Arc::new(link)
        }

        fn sent(&self) -> Vec<String> {
            self.tx.lock().unwrap().clone()
        }
    }

    impl Link for ReplyLink {
        fn set_handler(&self, handler: Option<LinkHandler>) {
            *self.handler.lock().unwrap() = handler;
        }
        fn reset(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn wake_up(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn enable(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn disable(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn enter_dialog(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn exit_dialog(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn enter_data_mode(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn exit_data_mode(&self) -> Result<(), LinkError> {
            Ok(())
        }
        fn send_line(&self, _: Duration, line: &str) -> Result<(), LinkError> {
            self.tx.lock().unwrap().push(line.to_string());
            let replies = self.replies.lock().unwrap();
            let rx = replies
                .iter()
                .find(|(cmd, _)| cmd == line)
                .map(|(_, rx)| rx.clone())
                .unwrap_or_else(|| vec!["OK".to_string()]);
            self.rx.lock().unwrap().extend(rx);
            Ok(())
        }
        fn recv_line(&self, _: Duration) -> Result<Option<String>, LinkError> {
            Ok(self.rx.lock().unwrap().pop_front())
        }
        fn send_data(&self, _: Duration, data: &[u8]) -> Result<(), LinkError> {
            self.tx_data.lock().unwrap().push(data.to_vec());
            Ok(())
        }
        fn recv_data(&self, _: Duration, _: &mut [u8]) -> Result<usize, LinkError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct RecordingMux {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RfMux for RecordingMux {
        fn acquire(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("acquire".into());
            Ok(())
        }
        fn release(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("release".into());
            Ok(())
        }
        fn set_antenna(&mut self, antenna: Antenna) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("antenna {antenna}"));
            Ok(())
        }
        fn set_interface(&mut self, interface: RfInterface) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("interface {interface:?}"));
            Ok(())
        }
    }

    struct Rig {
        flow: Flow,
        link: Arc<ReplyLink>,
        store: Arc<StateStore>,
        events: Receiver<Event>,
    }

    fn rig(table: &[(&str, &[&str])], config: LteConfig) -> Rig {
        let link = ReplyLink::new(table);
        let store = Arc::new(StateStore::new());
        let (tx, events) = bounded(16);
        let config = Arc::new(ArcSwap::from_pointee(config));
        let flow = Flow::new(
            link.clone(),
            Box::new(RecordingMux::default()),
            config,
            store.clone(),
            EventSender::new(tx),
        );
        Rig {
            flow,
            link,
            store,
            events,
        }
    }

    fn drain(rx: &Receiver<Event>) -> Vec<Event> {
        rx.try_iter().collect()
    }

    const HEALTHY: &[(&str, &[&str])] = &[
        ("AT+CFUN?", &["+CFUN: 1", "OK"]),
        ("AT+CEREG?", &["+CEREG: 5,1,\"B4DC\",\"000AE520\",9", "OK"]),
        ("AT+CGATT?", &["+CGATT: 1", "OK"]),
        ("AT+CGACT?", &["+CGACT: 0,1", "OK"]),
        ("AT#XSOCKET?", &["#XSOCKET: 0,1,0,2,0", "OK"]),
    ];

    #[test]
    fn prepare_sends_configured_sequence() {
        let config = LteConfig {
            lte_m_mode: true,
            gnss: true,
            autoconn: false,
            apn: "iot".into(),
            ..Default::default()
        };
        let mut r = rig(
            &[
                ("AT+CGSN=1", &["+CGSN: \"351358815178345\"", "OK"]),
                ("AT%HWVERSION", &["%HWVERSION: nRF9160 SICA B1A", "OK"]),
                ("AT%SHORTSWVER", &["%SHORTSWVER: nrf9160_1.3.4", "OK"]),
                ("AT#XSLMVER", &["#XSLMVER: \"2.5.0\"", "OK"]),
                ("AT#XVERSION", &["#XVERSION: \"v1.4.0\"", "OK"]),
            ],
            config,
        );
        r.flow.prepare().unwrap();
        let sent = r.link.sent();
        assert_eq!(sent.first().map(String::as_str), Some("AT"));
        assert!(sent.contains(&"AT%XSYSTEMMODE=1,1,1,2".to_string()));
        assert!(sent.contains(&"AT%XBANDLOCK=0".to_string()));
        assert!(sent.contains(&"AT%XCOEX0=1,1,1565,1586".to_string()));
        assert!(sent.contains(&"AT+COPS=1,2,\"23003\"".to_string()));
        assert!(sent.contains(&"AT+CGDCONT=0,\"IP\",\"iot\"".to_string()));
        assert!(sent.contains(&"AT+CGAUTH=0,0".to_string()));
        assert_eq!(sent.last().map(String::as_str), Some("AT%XMODEMSLEEP=1,500,10240"));
        assert!(!sent.contains(&"AT%XMODEMTRACE=1,2".to_string()));

        let id = r.store.identity();
        assert_eq!(id.imei, 351358815178345);
        assert_eq!(id.fw_version, "v1.4.0");
    }

    #[test]
    fn sim_info_waits_for_stable_imsi() {
        let mut r = rig(
            &[
                ("AT+CIMI", &["901288003457376", "OK"]),
                ("AT%XICCID", &["%XICCID: 89882390000262826558", "OK"]),
            ],
            LteConfig::default(),
        );
        r.flow.sim_info().unwrap();
        assert_eq!(r.store.imsi(), Ok(901288003457376));
        assert_eq!(
            r.link.sent().iter().filter(|l| *l == "AT+CIMI").count(),
            2
        );
    }

    #[test]
    fn short_iccid_is_a_sim_error() {
        let mut r = rig(
            &[
                ("AT+CIMI", &["901288003457376", "OK"]),
                ("AT%XICCID", &["%XICCID: 8988239", "OK"]),
            ],
            LteConfig::default(),
        );
        assert!(matches!(r.flow.sim_info(), Err(FlowError::Sim(_))));
    }

    #[test]
    fn forbidden_networks_are_erased_at_most_twice() {
        let mut r = rig(
            &[(
                "AT+CRSM=176,28539,0,0,12",
                &["+CRSM: 144,0,\"32F40132F801FFFFFFFFFFFF\"", "OK"],
            )],
            LteConfig::default(),
        );
        assert_eq!(r.flow.sim_fplmn(), Err(FlowError::RetryNeeded));
        assert_eq!(r.flow.sim_fplmn(), Err(FlowError::RetryNeeded));
        assert!(matches!(r.flow.sim_fplmn(), Err(FlowError::Sim(_))));
        let sent = r.link.sent();
        assert_eq!(sent.iter().filter(|l| l.starts_with("AT+CRSM=214")).count(), 2);
        assert!(sent.contains(&"AT+CFUN=4".to_string()));

        // A reset starts a new bring-up with a fresh budget.
        r.flow.reset().unwrap();
        assert_eq!(r.flow.sim_fplmn(), Err(FlowError::RetryNeeded));
    }

    #[test]
    fn empty_forbidden_list_passes() {
        let mut r = rig(
            &[("AT+CRSM=176,28539,0,0,12", &["+CRSM: 144,0,\"FFFFFFFFFFFFFFFFFFFFFFFF\"", "OK"])],
            LteConfig::default(),
        );
        r.flow.sim_fplmn().unwrap();
    }

    #[test]
    fn healthy_modem_passes_all_probes() {
        let mut r = rig(HEALTHY, LteConfig::default());
        r.flow.check_health().unwrap();
        assert!(r.store.is_registered());
    }

    #[test]
    fn health_probe_names_the_failing_check() {
        let mut table = HEALTHY.to_vec();
        table[2] = ("AT+CGATT?", &["+CGATT: 0", "OK"]);
        let mut r = rig(&table, LteConfig::default());
        assert_eq!(r.flow.check_health(), Err(FlowError::Connectivity(Check::Attach)));

        let mut table = HEALTHY.to_vec();
        table[4] = ("AT#XSOCKET?", &["#XSOCKET: 0,1,0,1,0", "OK"]);
        let mut r = rig(&table, LteConfig::default());
        let err = r.flow.check_health().unwrap_err();
        assert!(err.is_socket_error(), "{err}");

        let mut table = HEALTHY.to_vec();
        table[1] = ("AT+CEREG?", &["+CEREG: 0,1", "OK"]);
        let mut r = rig(&table, LteConfig::default());
        assert_eq!(
            r.flow.check_health(),
            Err(FlowError::Connectivity(Check::Registration))
        );
    }

    const DIAGNOSTICS: &[(&str, &[&str])] = &[
        ("AT+COPS?", &["+COPS: 0,2,\"23003\",9", "OK"]),
        ("AT%XCBAND", &["%XCBAND: 20", "OK"]),
        ("AT+CEINFO?", &["+CEINFO: 0,1,C,8,1,-114,9", "OK"]),
    ];

    #[test]
    fn open_socket_requires_udp_and_connect() {
        let mut table = DIAGNOSTICS.to_vec();
        table.extend_from_slice(&[
            ("AT+CGDCONT?", &["+CGDCONT: 0,\"IP\",\"iot\",\"10.0.0.2\",0,0", "OK"]),
            ("AT#XSOCKET=1,2,0", &["#XSOCKET: 0,2,17", "OK"]),
            ("AT#XCONNECT=\"192.168.192.4\",5003", &["#XCONNECT: 1", "OK"]),
        ]);
        let mut r = rig(&table, LteConfig::default());
        r.flow.open_socket().unwrap();

        let mut table = DIAGNOSTICS.to_vec();
        table.extend_from_slice(&[
            ("AT+CGDCONT?", &["+CGDCONT: 0,\"IP\",\"iot\",\"10.0.0.2\",0,0", "OK"]),
            ("AT#XSOCKET=1,2,0", &["#XSOCKET: 0,1,6", "OK"]),
        ]);
        let mut r = rig(&table, LteConfig::default());
        assert_eq!(r.flow.open_socket(), Err(FlowError::Connectivity(Check::Socket)));
    }

    #[test]
    fn send_with_rai_wraps_the_payload() {
        let mut r = rig(
            &[("AT#XSEND=", &["OK", "#XDATAMODE: 3", "#XDATAMODE: 0"])],
            LteConfig::default(),
        );
        r.flow
            .send(&Uplink {
                data: b"abc",
                as_string: false,
                rai: true,
                expect_response: false,
            })
            .unwrap();
        assert_eq!(
            r.link.sent(),
            vec!["AT#XSOCKETOPT=1,51", "AT#XSEND=", "AT#XSOCKETOPT=1,50"]
        );

        let mut r = rig(&[("AT#XSEND=\"hi\"", &["#XSEND: 2", "OK"])], LteConfig::default());
        r.flow
            .send(&Uplink {
                data: b"hi",
                as_string: true,
                rai: true,
                expect_response: true,
            })
            .unwrap();
        assert_eq!(r.link.sent(), vec!["AT#XSOCKETOPT=1,52", "AT#XSEND=\"hi\""]);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut r = rig(&[], LteConfig::default());
        r.flow.stop().unwrap();
        assert!(r.link.sent().is_empty());
        r.flow.start().unwrap();
        r.flow.stop().unwrap();
        r.flow.stop().unwrap();
        assert_eq!(r.link.sent(), vec!["AT#XSLEEP=2"]);
    }

    #[test]
    fn router_translates_notifications() {
        let r = rig(&[], LteConfig::default());
        let handler = r.link.handler.lock().unwrap().clone().unwrap();
        for line in [
            "Ready",
            "%XSIM: 1",
            "+CEREG: 5,\"B4DC\",\"000AE520\",9,,,\"00000110\",\"00111000\"",
            "+CSCON: 1",
            "%XMODEMSLEEP: 1,0",
            "%XMODEMSLEEP: 1,86390000",
            "#XGPS: 1,1",
            "#XGPS: 49.2,16.6,300.5,12.1,0.1,0.0,\"2024-01-01 10:00:00\"",
            "%MDMEV: RESET LOOP",
            "+CEREG: 2",
        ] {
            handler(LinkEvent::RxLine(line.to_string()));
        }
        assert_eq!(
            drain(&r.events),
            vec![
                Event::Ready,
                Event::SimDetected,
                Event::Registered,
                Event::RadioConnected,
                Event::ModemSleep,
                Event::GnssFix,
                Event::ResetLoop,
                Event::Deregistered,
            ]
        );
        assert!(r.store.gnss_fix().is_ok());
        assert!(!r.store.is_registered());
    }

    #[test]
    fn test_mode_routes_only_readiness() {
        let config = LteConfig {
            test: true,
            ..Default::default()
        };
        let mut r = rig(&[], config);
        let handler = r.link.handler.lock().unwrap().clone().unwrap();
        handler(LinkEvent::RxLine("%XSIM: 1".into()));
        assert!(drain(&r.events).is_empty());

        let h = handler.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            h(LinkEvent::RxLine("Ready".into()));
        });
        assert_eq!(r.flow.test(&TestOp::Wakeup).unwrap(), "Ready");
        waker.join().unwrap();

        let out = r.flow.test(&TestOp::Cmd("AT+CFUN?".into())).unwrap();
        assert_eq!(out, "");
    }
}
