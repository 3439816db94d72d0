//! Scripted modem conversations.
//!
//! Each builder returns the [`Step`]s a healthy nRF91 modem running the
//! serial-LTE firmware would play for one phase of the connection. Command
//! lines are rendered with [`AtCommand`] from the same [`LteConfig`] the
//! stack runs with, so a script follows configuration changes.

use std::time::Duration;

use chester_lte::talk::{AtCommand, RaiOption};
use chester_lte::LteConfig;

use crate::link::Step;

pub const IMEI: u64 = 351358815178345;
pub const IMSI: u64 = 901288003457376;
pub const ICCID: &str = "89882390000262826558";
pub const FW_VERSION: &str = "v1.4.0";
pub const PDN_ADDRESS: &str = "10.0.0.2";

/// Registration notification, with PSM timers when the network grants them.
pub fn registration_urc(psm: bool) -> String {
    if psm {
        "+CEREG: 1,\"B4DC\",\"000AE520\",9,,,\"00000110\",\"00111000\"".into()
    } else {
        "+CEREG: 1,\"B4DC\",\"000AE520\",9".into()
    }
}

fn ok(cmd: AtCommand<'_>) -> Step {
    Step::ok(cmd.to_string())
}

fn reply(cmd: AtCommand<'_>, line: &str) -> Step {
    Step::exchange(cmd.to_string(), &[line, "OK"])
}

/// Identification and configuration after `Ready`, then `+CFUN=1` and SIM
/// detection.
pub fn prepare(cfg: &LteConfig) -> Vec<Step> {
    use AtCommand::*;

    let mut steps = vec![ok(At)];
    if cfg.modemtrace {
        steps.push(ok(XModemTrace));
    }
    steps.extend([
        reply(Cgsn, &format!("+CGSN: \"{IMEI}\"")),
        reply(HwVersion, "%HWVERSION: nRF9160 SICA B1A"),
        reply(ShortSwVer, "%SHORTSWVER: nrf9160_1.3.4"),
        reply(XSlmVer, "#XSLMVER: \"2.5.0\""),
        reply(XVersion, &format!("#XVERSION: \"{FW_VERSION}\"")),
        ok(Cfun(0)),
        ok(XPofWarn),
        ok(XTempHighLvl(70)),
        ok(XTemp),
        ok(XSystemMode {
            lte_m: cfg.lte_m_mode,
            nb_iot: cfg.nb_iot_mode,
            gnss: cfg.gnss,
            preference: cfg.system_mode_preference(),
        }),
        ok(XDataPrfl),
    ]);
    let bitmap = cfg.band_lock_bitmap();
    steps.push(ok(XBandLock(bitmap.as_deref())));
    steps.extend([XSim, XNetTime, MdmEv, Rel14Feat, Rai].map(ok));
    steps.push(ok(Cpsms {
        tau: &cfg.psm_tau,
        active: &cfg.psm_active,
    }));
    steps.extend([Ceppi, Cereg(5), Cgerep, Cmee, Cnec].map(ok));
    if cfg.gnss {
        steps.push(ok(XCoex0));
    }
    steps.push(ok(Cscon));
    steps.push(ok(Cops((!cfg.autoconn).then_some(cfg.plmnid.as_str()))));
    steps.push(ok(Cgdcont(&cfg.apn)));
    let auth = cfg
        .auth
        .protocol()
        .map(|p| (p, cfg.username.as_str(), cfg.password.as_str()));
    steps.push(ok(Cgauth(auth)));
    steps.push(ok(XModemSleep));

    steps.push(ok(Cfun(1)));
    steps.push(Step::urc("%XSIM: 1"));
    steps
}

/// SIM identity and an empty forbidden-network list, followed by the
/// registration notification.
pub fn sim(psm: bool) -> Vec<Step> {
    vec![
        Step::exchange(AtCommand::Cimi.to_string(), &[&IMSI.to_string(), "OK"]),
        Step::exchange(AtCommand::Cimi.to_string(), &[&IMSI.to_string(), "OK"]),
        reply(AtCommand::Xiccid, &format!("%XICCID: {ICCID}")),
        reply(
            AtCommand::CrsmReadFplmn,
            "+CRSM: 144,0,\"FFFFFFFFFFFFFFFFFFFFFFFF\"",
        ),
        Step::urc(registration_urc(psm)),
    ]
}

/// Network diagnostics, PDN readout and the UDP socket to the server.
pub fn open_socket(cfg: &LteConfig) -> Vec<Step> {
    use AtCommand::*;

    let addr = cfg.addr.to_string();
    vec![
        reply(CopsRead, &format!("+COPS: 0,2,\"{}\",9", cfg.plmnid)),
        reply(XCband, "%XCBAND: 20"),
        reply(CeinfoRead, "+CEINFO: 0,1,C,8,1,-114,9"),
        reply(
            CgdcontRead,
            &format!("+CGDCONT: 0,\"IP\",\"{}\",\"{PDN_ADDRESS}\",0,0", cfg.apn),
        ),
        reply(XSocketOpenUdp, "#XSOCKET: 0,2,17"),
        reply(
            XConnect {
                addr: &addr,
                port: cfg.port,
            },
            "#XCONNECT: 1",
        ),
    ]
}

pub fn coneval() -> Vec<Step> {
    vec![reply(
        AtCommand::Coneval,
        "%CONEVAL: 0,1,7,68,29,47,\"000AE520\",\"23003\",135,6447,20,0,0,14,2,1,99",
    )]
}

/// Full bring-up from reset to an open socket with fresh signal readings.
pub fn attach(cfg: &LteConfig, psm: bool) -> Vec<Step> {
    let mut steps = prepare(cfg);
    steps.extend(sim(psm));
    steps.extend(open_socket(cfg));
    steps.extend(coneval());
    steps
}

/// Answers to the pre-transfer health probe.
pub fn health(psm: bool) -> Vec<Step> {
    use AtCommand::*;

    let cereg = if psm {
        "+CEREG: 5,1,\"B4DC\",\"000AE520\",9,,,\"00000110\",\"00111000\""
    } else {
        "+CEREG: 5,1,\"B4DC\",\"000AE520\",9"
    };
    vec![
        reply(CfunRead, "+CFUN: 1"),
        reply(CeregRead, cereg),
        reply(CgattRead, "+CGATT: 1"),
        reply(CgactRead, "+CGACT: 0,1"),
        reply(XSocketRead, "#XSOCKET: 0,1,0,2,0"),
    ]
}

/// Binary uplink in data mode, bracketed by release assistance hints when
/// `rai` is set.
pub fn send(payload: &[u8], rai: bool, expect_response: bool) -> Vec<Step> {
    let mut steps = Vec::new();
    if rai {
        let opt = if expect_response {
            RaiOption::OneResponse
        } else {
            RaiOption::Last
        };
        steps.push(ok(AtCommand::XSocketOpt(opt)));
    }
    steps.push(Step::ok("AT#XSEND="));
    steps.push(Step::data(
        payload,
        &[&format!("#XDATAMODE: {}", payload.len())],
    ));
    steps.push(Step::data(b"+++", &["#XDATAMODE: 0"]));
    if rai && !expect_response {
        steps.push(ok(AtCommand::XSocketOpt(RaiOption::NoData)));
    }
    steps
}

/// Text uplink carried in the command line.
pub fn send_text(text: &str) -> Vec<Step> {
    vec![Step::exchange(
        format!("AT#XSEND=\"{text}\""),
        &[&format!("#XSEND: {}", text.len()), "OK"],
    )]
}

/// Downlink of `data` within `window`.
pub fn recv(window: Duration, data: &[u8], rai: bool) -> Vec<Step> {
    let secs = window.as_secs().max(1);
    let mut steps = vec![
        Step::exchange(
            format!("AT#XRECV={secs}"),
            &[&format!("#XRECV: {}", data.len()), "OK"],
        ),
        Step::RxData(data.to_vec()),
    ];
    if rai {
        steps.push(ok(AtCommand::XSocketOpt(RaiOption::NoData)));
    }
    steps
}

/// A receive the modem never answers.
pub fn silent_recv(window: Duration) -> Vec<Step> {
    vec![Step::exchange(
        format!("AT#XRECV={}", window.as_secs().max(1)),
        &[],
    )]
}

/// Modem sleep acknowledged before the transport is disabled.
pub fn sleep() -> Vec<Step> {
    vec![ok(AtCommand::XSleep(2))]
}

/// The modem announces it is entering PSM; the stack puts it to sleep.
pub fn psm_sleep() -> Vec<Step> {
    let mut steps = vec![
        Step::urc("+CSCON: 0"),
        Step::urc("%XMODEMSLEEP: 1,3600000"),
    ];
    steps.extend(sleep());
    steps
}

/// Socket teardown and radio off after inactivity without PSM.
pub fn flight_mode() -> Vec<Step> {
    let mut steps = vec![
        reply(AtCommand::XSocketClose, "#XSOCKET: 0,\"closed\""),
        ok(AtCommand::Cfun(4)),
    ];
    steps.extend(sleep());
    steps
}

/// Radio back on after flight mode, then re-registration and a new socket.
pub fn leave_flight_mode(cfg: &LteConfig, psm: bool) -> Vec<Step> {
    let mut steps = vec![ok(AtCommand::Cfun(1)), Step::urc(registration_urc(psm))];
    steps.extend(open_socket(cfg));
    steps.extend(coneval());
    steps
}
