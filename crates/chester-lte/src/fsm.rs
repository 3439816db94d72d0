//! # Connectivity State Machine
//!
//! Owned by the worker thread; nothing else touches it. Events come from
//! three places: the bounded event queue (URCs, enable), commands from the
//! public API, and the single state timer. Events a handler raises while
//! processing are posted to a local FIFO that drains before the next queue
//! item is looked at.
//!
//! ```text
//!   Disabled ─enable─► Boot ─ready─► Prepare ─sim─► Attach ─registered─► OpenSocket
//!                       ▲                             │ ▲                    │
//!                       │                       timeout │ │ timeout          ▼
//!                       │                             ▼ │               Coneval
//!                       └──────────timeout──────── RetryDelay                 │
//!                                                                            ▼
//!      Sleep ◄─modem sleep / idle─ Ready ◄────────────────────────────────────┘
//!        │                          │ ▲
//!   send-recv                 send-recv └── Coneval ◄─ Receive ◄─ Send
//!        ▼                          ▼
//!      Wakeup ─ready─► Ready       Send
//! ```
//!
//! Any unhandled failure posts `error`, which always lands in `Error`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use quanta::Instant;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LteConfig;
use crate::error::{FlowError, SendRecvError, StackError};
use crate::flow::{Sequencer, TestOp, Uplink};
use crate::metrics::MetricsRecorder;
use crate::parse::GnssFix;
use crate::state::StateStore;

/// Ceiling for the restart backoff after repeated failures.
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Socket-class probe failures tolerated before a full restart.
pub const MAX_PROBE_FAILURES: u32 = 3;

pub const EVENT_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FsmState {
    #[default]
    Disabled,
    Error,
    Boot,
    Prepare,
    Attach,
    RetryDelay,
    ResetLoop,
    OpenSocket,
    Ready,
    Sleep,
    Wakeup,
    Send,
    Receive,
    Coneval,
    Gnss,
}

impl FsmState {
    pub fn as_str(self) -> &'static str {
        match self {
            FsmState::Disabled => "disabled",
            FsmState::Error => "error",
            FsmState::Boot => "boot",
            FsmState::Prepare => "prepare",
            FsmState::Attach => "attach",
            FsmState::RetryDelay => "retry-delay",
            FsmState::ResetLoop => "reset-loop",
            FsmState::OpenSocket => "open-socket",
            FsmState::Ready => "ready",
            FsmState::Sleep => "sleep",
            FsmState::Wakeup => "wakeup",
            FsmState::Send => "send",
            FsmState::Receive => "receive",
            FsmState::Coneval => "coneval",
            FsmState::Gnss => "gnss",
        }
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Error,
    Timeout,
    Enable,
    Ready,
    SimDetected,
    Registered,
    Deregistered,
    ResetLoop,
    SocketOpened,
    ModemSleep,
    /// `+CSCON: 1`
    RadioConnected,
    /// `+CSCON: 0`
    RadioIdle,
    NetworkTime,
    SendRecv,
    SendDone,
    RecvDone,
    GnssEnable,
    GnssDisable,
    GnssFix,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Error => "error",
            Event::Timeout => "timeout",
            Event::Enable => "enable",
            Event::Ready => "ready",
            Event::SimDetected => "sim-detected",
            Event::Registered => "registered",
            Event::Deregistered => "deregistered",
            Event::ResetLoop => "reset-loop",
            Event::SocketOpened => "socket-opened",
            Event::ModemSleep => "modem-sleep",
            Event::RadioConnected => "radio-connected",
            Event::RadioIdle => "radio-idle",
            Event::NetworkTime => "network-time",
            Event::SendRecv => "send-recv",
            Event::SendDone => "send-done",
            Event::RecvDone => "recv-done",
            Event::GnssEnable => "gnss-enable",
            Event::GnssDisable => "gnss-disable",
            Event::GnssFix => "gnss-fix",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer side of the event queue. Never blocks: when the queue is full
/// the new event is dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    pub fn new(tx: Sender<Event>) -> Self {
        EventSender { tx }
    }

    pub fn post(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(%event, "event queue full, dropping event");
            }
            Err(TrySendError::Disconnected(event)) => {
                debug!(%event, "event queue closed");
            }
        }
    }
}

pub fn event_queue() -> (EventSender, Receiver<Event>) {
    let (tx, rx) = bounded(EVENT_QUEUE_DEPTH);
    (EventSender::new(tx), rx)
}

// ─── Transactions ───────────────────────────────────────────────────────────

pub type Completion = Result<Option<Vec<u8>>, SendRecvError>;

/// A send/receive request handed to the worker.
#[derive(Debug)]
pub struct Transaction {
    pub payload: Bytes,
    /// `Some(capacity)` when a downlink is expected.
    pub recv_capacity: Option<usize>,
    pub send_as_string: bool,
    pub rai: bool,
    /// Past this point the caller has given up. A request still waiting
    /// here is failed with `TimedOut` and never executed.
    pub deadline: Instant,
    pub reply: Sender<Completion>,
}

impl Transaction {
    fn abandoned(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn complete(self, result: Completion) {
        let _ = self.reply.try_send(result);
    }
}

pub type GnssHandler = Box<dyn Fn(&GnssFix) + Send + Sync>;

// ─── Shared status ──────────────────────────────────────────────────────────

/// State the worker publishes for API callers.
#[derive(Debug, Default)]
pub struct Status {
    connected: Mutex<bool>,
    changed: Condvar,
    state: Mutex<FsmState>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_connected(&self, connected: bool) {
        *self.connected.lock().unwrap_or_else(|e| e.into_inner()) = connected;
        self.changed.notify_all();
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until connected or `timeout` elapses. Returns the flag.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let guard = self.connected.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |connected| !*connected)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    pub fn state(&self) -> FsmState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: FsmState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// Next restart backoff: doubles, never below `floor`, never above
/// [`MAX_BACKOFF`].
pub fn next_backoff(prev: Option<Duration>, floor: Duration) -> Duration {
    match prev {
        None => floor.min(MAX_BACKOFF),
        Some(prev) => prev.saturating_mul(2).max(floor).min(MAX_BACKOFF),
    }
}

// ─── State machine ──────────────────────────────────────────────────────────

pub struct Fsm<S: Sequencer> {
    seq: S,
    config: Arc<ArcSwap<LteConfig>>,
    store: Arc<StateStore>,
    metrics: MetricsRecorder,
    status: Arc<Status>,

    state: FsmState,
    timer: Option<Instant>,
    posted: VecDeque<Event>,
    pending: Option<Transaction>,

    attempt: u32,
    probe_failures: u32,
    backoff: Option<Duration>,
    rfmux_held: bool,
    flight_mode: bool,
    gnss_requested: bool,
    gnss_handler: Option<GnssHandler>,
}

impl<S: Sequencer> Fsm<S> {
    pub fn new(
        seq: S,
        config: Arc<ArcSwap<LteConfig>>,
        store: Arc<StateStore>,
        metrics: MetricsRecorder,
        status: Arc<Status>,
    ) -> Self {
        Fsm {
            seq,
            config,
            store,
            metrics,
            status,
            state: FsmState::Disabled,
            timer: None,
            posted: VecDeque::new(),
            pending: None,
            attempt: 0,
            probe_failures: 0,
            backoff: None,
            rfmux_held: false,
            flight_mode: false,
            gnss_requested: false,
            gnss_handler: None,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn sequencer(&self) -> &S {
        &self.seq
    }

    pub fn sequencer_mut(&mut self) -> &mut S {
        &mut self.seq
    }

    /// Earliest of the state timer and the deadline of a request still
    /// waiting to be executed.
    pub fn deadline(&self) -> Option<Instant> {
        let waiting = self.pending.as_ref().map(|tx| tx.deadline);
        match (self.timer, waiting) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Dispatches `event` and then everything handlers post in response.
    pub fn process(&mut self, event: Event) {
        self.dispatch(event);
        while let Some(next) = self.posted.pop_front() {
            self.dispatch(next);
        }
    }

    /// Expires a waiting request past its deadline, then raises `timeout`
    /// if the state timer has expired.
    pub fn fire_timer(&mut self) {
        let now = Instant::now();
        if self.pending.as_ref().is_some_and(|tx| tx.abandoned(now)) {
            debug!(state = %self.state, "request expired before it could run");
            self.fail_pending(SendRecvError::TimedOut);
        }
        if self.timer.is_some_and(|deadline| deadline <= now) {
            self.timer = None;
            self.process(Event::Timeout);
        }
    }

    pub fn submit(&mut self, tx: Transaction) {
        if self.state == FsmState::Disabled {
            tx.complete(Err(SendRecvError::Disabled));
            return;
        }
        if let Some(stale) = self.pending.replace(tx) {
            debug!("replacing abandoned transaction");
            stale.complete(Err(SendRecvError::TimedOut));
        }
        self.process(Event::SendRecv);
    }

    /// Forces a full restart from `Disabled`.
    pub fn reconnect(&mut self) -> Result<(), StackError> {
        if self.state == FsmState::Disabled {
            return Err(StackError::AlreadyDisabled);
        }
        self.posted.clear();
        self.transition(FsmState::Disabled);
        self.process(Event::Enable);
        Ok(())
    }

    pub fn set_gnss(&mut self, enable: bool) {
        self.gnss_requested = enable;
        self.process(if enable {
            Event::GnssEnable
        } else {
            Event::GnssDisable
        });
    }

    pub fn set_gnss_handler(&mut self, handler: Option<GnssHandler>) {
        self.gnss_handler = handler;
    }

    pub fn test(&mut self, op: &TestOp) -> Result<String, StackError> {
        if !self.config.load().test {
            return Err(StackError::TestModeRequired);
        }
        Ok(self.seq.test(op)?)
    }

    pub fn shutdown(&mut self) {
        self.posted.clear();
        self.transition(FsmState::Disabled);
    }

    // ── Plumbing ────────────────────────────────────────────────────

    fn post(&mut self, event: Event) {
        self.posted.push_back(event);
    }

    fn arm(&mut self, after: Duration) {
        self.timer = Some(Instant::now() + after);
    }

    fn fail(&mut self, step: &'static str, error: &FlowError) {
        warn!(state = %self.state, step, error = %error, "step failed");
        self.post(Event::Error);
    }

    fn fail_pending(&mut self, error: SendRecvError) {
        if let Some(tx) = self.pending.take() {
            tx.complete(Err(error));
        }
    }

    fn complete_pending(&mut self, data: Option<Vec<u8>>) {
        if let Some(tx) = self.pending.take() {
            tx.complete(Ok(data));
        }
    }

    fn set_connected(&self, connected: bool) {
        self.status.set_connected(connected);
    }

    fn timing(&self) -> crate::config::Timing {
        self.config.load().timing
    }

    fn ignore(&self, event: Event) {
        debug!(state = %self.state, %event, "event ignored");
    }

    fn transition(&mut self, to: FsmState) {
        if to == self.state {
            return;
        }
        info!(from = %self.state, to = %to, "state transition");
        self.timer = None;
        self.state = to;
        self.status.set_state(to);
        self.enter();
    }

    fn enter(&mut self) {
        match self.state {
            FsmState::Disabled => self.enter_disabled(),
            FsmState::Error => self.enter_error(),
            FsmState::Boot => self.enter_boot(),
            FsmState::Prepare => self.enter_prepare(),
            FsmState::Attach => self.enter_attach(),
            FsmState::RetryDelay => self.enter_retry_delay(),
            FsmState::ResetLoop => self.enter_reset_loop(),
            FsmState::OpenSocket => self.enter_open_socket(),
            FsmState::Ready => self.enter_ready(),
            FsmState::Sleep => self.enter_sleep(),
            FsmState::Wakeup => self.enter_wakeup(),
            FsmState::Send => self.enter_send(),
            FsmState::Receive => self.enter_receive(),
            FsmState::Coneval => self.enter_coneval(),
            FsmState::Gnss => self.enter_gnss(),
        }
    }

    fn dispatch(&mut self, event: Event) {
        debug!(state = %self.state, %event, "event");
        match event {
            Event::RadioConnected => self.metrics.radio_connected(),
            Event::RadioIdle => self.metrics.radio_idle(),
            _ => {}
        }
        if event == Event::Error && !matches!(self.state, FsmState::Disabled | FsmState::Error) {
            self.transition(FsmState::Error);
            return;
        }
        if event == Event::GnssFix {
            self.on_gnss_fix();
            return;
        }
        match self.state {
            FsmState::Disabled => self.on_disabled(event),
            FsmState::Error => self.on_error(event),
            FsmState::Boot => self.on_boot(event),
            FsmState::Prepare => self.on_prepare(event),
            FsmState::Attach => self.on_attach(event),
            FsmState::RetryDelay => self.on_retry_delay(event),
            FsmState::ResetLoop => self.on_reset_loop(event),
            FsmState::OpenSocket => self.on_open_socket(event),
            FsmState::Ready => self.on_ready(event),
            FsmState::Sleep => self.on_sleep(event),
            FsmState::Wakeup => self.on_wakeup(event),
            FsmState::Send => self.on_send(event),
            FsmState::Receive => self.on_receive(event),
            FsmState::Coneval => self.ignore(event),
            FsmState::Gnss => self.on_gnss(event),
        }
    }

    // ── Disabled ────────────────────────────────────────────────────

    fn enter_disabled(&mut self) {
        self.fail_pending(SendRecvError::Disabled);
        self.set_connected(false);
        self.flight_mode = false;
        if let Err(e) = self.seq.stop() {
            warn!(error = %e, "failed to stop modem");
        }
        if self.rfmux_held {
            if let Err(e) = self.seq.rfmux_release() {
                warn!(error = %e, "failed to release rf mux");
            }
            self.rfmux_held = false;
        }
    }

    fn on_disabled(&mut self, event: Event) {
        if event != Event::Enable {
            return self.ignore(event);
        }
        if self.config.load().test {
            warn!("enable ignored in test mode");
            return;
        }
        if let Err(e) = self.seq.rfmux_acquire() {
            warn!(error = %e, "cannot acquire rf mux");
            return;
        }
        self.rfmux_held = true;
        self.attempt = 0;
        self.probe_failures = 0;
        self.backoff = None;
        self.flight_mode = false;
        self.transition(FsmState::Boot);
    }

    // ── Error ───────────────────────────────────────────────────────

    fn enter_error(&mut self) {
        self.set_connected(false);
        self.fail_pending(SendRecvError::ConnectionDropped);

        if self.probe_failures < MAX_PROBE_FAILURES {
            match self.seq.check_health() {
                Ok(()) => {
                    info!("modem healthy, resuming");
                    self.set_connected(true);
                    self.transition(FsmState::Ready);
                    return;
                }
                Err(e) if e.is_socket_error() => {
                    self.probe_failures += 1;
                    warn!(error = %e, failures = self.probe_failures, "socket probe failed, reopening");
                    self.transition(FsmState::OpenSocket);
                    return;
                }
                Err(e) => warn!(error = %e, "health probe failed"),
            }
        }

        self.probe_failures = 0;
        if let Err(e) = self.seq.stop() {
            warn!(error = %e, "failed to stop modem");
        }
        let backoff = next_backoff(self.backoff, self.timing().error_backoff);
        self.backoff = Some(backoff);
        warn!(backoff_ms = backoff.as_millis() as u64, "restarting modem after backoff");
        self.arm(backoff);
    }

    fn on_error(&mut self, event: Event) {
        match event {
            Event::Timeout => self.transition(FsmState::Boot),
            e => self.ignore(e),
        }
    }

    // ── Bring-up ────────────────────────────────────────────────────

    fn enter_boot(&mut self) {
        self.store.invalidate_registration();
        match self.seq.reset().and_then(|()| self.seq.start()) {
            Ok(()) => self.arm(self.timing().boot),
            Err(e) => self.fail("boot", &e),
        }
    }

    fn on_boot(&mut self, event: Event) {
        match event {
            Event::Ready => self.transition(FsmState::Prepare),
            Event::Timeout => self.transition(FsmState::Error),
            e => self.ignore(e),
        }
    }

    fn enter_prepare(&mut self) {
        match self.seq.prepare().and_then(|()| self.seq.cfun(1)) {
            Ok(()) => self.arm(self.timing().simdetect),
            Err(e) => self.fail("prepare", &e),
        }
    }

    fn on_prepare(&mut self, event: Event) {
        match event {
            Event::SimDetected => {
                match self.seq.sim_info().and_then(|()| self.seq.sim_fplmn()) {
                    Ok(()) => self.transition(FsmState::Attach),
                    Err(FlowError::RetryNeeded) => self.arm(self.timing().simdetect),
                    Err(e) => self.fail("sim", &e),
                }
            }
            Event::ResetLoop => self.transition(FsmState::ResetLoop),
            Event::Timeout => self.transition(FsmState::Error),
            e => self.ignore(e),
        }
    }

    fn enter_reset_loop(&mut self) {
        match self.seq.cfun(4) {
            Ok(()) => self.arm(self.timing().reset_loop),
            Err(e) => self.fail("reset loop cooldown", &e),
        }
    }

    fn on_reset_loop(&mut self, event: Event) {
        match event {
            Event::Timeout => match self.seq.cfun(1) {
                Ok(()) => {
                    self.attempt = 0;
                    self.transition(FsmState::Attach);
                }
                Err(e) => self.fail("reset loop recovery", &e),
            },
            e => self.ignore(e),
        }
    }

    fn enter_attach(&mut self) {
        let policy = self.config.load().attach_policy;
        let timeout = policy.timeout(self.attempt);
        self.metrics.attach_started();
        info!(attempt = self.attempt, %policy, timeout_s = timeout.attach.as_secs(), "attaching");
        self.arm(timeout.attach);
        if self.store.is_registered() {
            self.post(Event::Registered);
        }
    }

    fn on_attach(&mut self, event: Event) {
        match event {
            Event::Registered => {
                self.metrics.attach_succeeded();
                self.attempt = 0;
                self.transition(FsmState::OpenSocket);
            }
            Event::Timeout => {
                self.metrics.attach_failed();
                self.transition(FsmState::RetryDelay);
            }
            Event::ResetLoop => self.transition(FsmState::ResetLoop),
            e => self.ignore(e),
        }
    }

    fn enter_retry_delay(&mut self) {
        let delay = self.config.load().attach_policy.timeout(self.attempt).retry_delay;
        match self.seq.cfun(0) {
            Ok(()) => {
                info!(attempt = self.attempt, delay_s = delay.as_secs(), "attach failed, waiting");
                self.arm(delay);
                self.attempt = self.attempt.saturating_add(1);
            }
            Err(e) => self.fail("retry delay", &e),
        }
    }

    fn on_retry_delay(&mut self, event: Event) {
        match event {
            Event::Timeout => self.transition(FsmState::Boot),
            e => self.ignore(e),
        }
    }

    fn enter_open_socket(&mut self) {
        match self.seq.open_socket() {
            Ok(()) => self.post(Event::SocketOpened),
            Err(e) => self.fail("open socket", &e),
        }
    }

    fn on_open_socket(&mut self, event: Event) {
        match event {
            Event::SocketOpened => {
                self.set_connected(true);
                self.backoff = None;
                self.probe_failures = 0;
                self.transition(FsmState::Coneval);
            }
            e => self.ignore(e),
        }
    }

    // ── Connected ───────────────────────────────────────────────────

    fn enter_ready(&mut self) {
        if self.pending.is_some() {
            self.post(Event::SendRecv);
        } else if self.gnss_requested {
            self.post(Event::GnssEnable);
        }
        if !self.store.psm_supported() {
            self.arm(self.timing().inactivity);
        }
    }

    fn enter_flight_mode(&mut self) {
        info!("PSM unavailable, entering flight mode");
        if let Err(e) = self.seq.close_socket() {
            warn!(error = %e, "failed to close socket");
        }
        if let Err(e) = self.seq.cfun(4) {
            warn!(error = %e, "failed to enter flight mode");
        }
        self.store.invalidate_registration();
        self.set_connected(false);
        self.flight_mode = true;
    }

    fn on_ready(&mut self, event: Event) {
        match event {
            Event::SendRecv if self.pending.is_some() => match self.seq.check_health() {
                Ok(()) => self.transition(FsmState::Send),
                Err(e) => {
                    warn!(error = %e, "health check failed before transfer");
                    self.fail_pending(SendRecvError::ConnectionDropped);
                    self.transition(FsmState::Error);
                }
            },
            Event::Deregistered => {
                self.set_connected(false);
                self.fail_pending(SendRecvError::Deregistered);
                self.transition(FsmState::Attach);
            }
            Event::RadioIdle if !self.store.psm_supported() => {
                self.enter_flight_mode();
                self.transition(FsmState::Sleep);
            }
            Event::Timeout => {
                self.enter_flight_mode();
                self.transition(FsmState::Sleep);
            }
            Event::ModemSleep => self.transition(FsmState::Sleep),
            Event::GnssEnable if self.gnss_requested => self.transition(FsmState::Gnss),
            Event::NetworkTime if self.config.load().clksync => match self.seq.network_time() {
                Ok(time) => debug!(?time, "network time updated"),
                Err(e) => warn!(error = %e, "failed to read network time"),
            },
            e => self.ignore(e),
        }
    }

    fn enter_sleep(&mut self) {
        if let Err(e) = self.seq.stop() {
            self.fail("sleep", &e);
        }
    }

    fn on_sleep(&mut self, event: Event) {
        match event {
            Event::SendRecv => self.transition(FsmState::Wakeup),
            Event::GnssEnable if self.gnss_requested => self.transition(FsmState::Wakeup),
            e => self.ignore(e),
        }
    }

    fn enter_wakeup(&mut self) {
        match self.seq.start() {
            Ok(()) => self.arm(self.timing().wakeup),
            Err(e) => self.fail("wakeup", &e),
        }
    }

    fn on_wakeup(&mut self, event: Event) {
        match event {
            Event::Ready if self.flight_mode => match self.seq.cfun(1) {
                Ok(()) => {
                    self.flight_mode = false;
                    self.transition(FsmState::Attach);
                }
                Err(e) => self.fail("leave flight mode", &e),
            },
            Event::Ready => self.transition(FsmState::Ready),
            Event::Timeout => self.transition(FsmState::Error),
            e => self.ignore(e),
        }
    }

    // ── Transfer ────────────────────────────────────────────────────

    fn enter_send(&mut self) {
        let now = Instant::now();
        if !self.pending.as_ref().is_some_and(|tx| !tx.abandoned(now)) {
            if let Some(tx) = self.pending.take() {
                debug!("discarding abandoned transaction");
                tx.complete(Err(SendRecvError::TimedOut));
            }
            self.transition(FsmState::Ready);
            return;
        }
        let Some(tx) = self.pending.as_ref() else {
            return;
        };
        let len = tx.payload.len();
        let uplink = Uplink {
            data: &tx.payload,
            as_string: tx.send_as_string,
            rai: tx.rai,
            expect_response: tx.recv_capacity.is_some(),
        };
        match self.seq.send(&uplink) {
            Ok(()) => {
                self.metrics.uplink_sent(len);
                self.post(Event::SendDone);
            }
            Err(e) => {
                self.metrics.uplink_failed();
                self.fail_pending(SendRecvError::from(e.clone()));
                self.fail("send", &e);
            }
        }
    }

    fn on_send(&mut self, event: Event) {
        match event {
            Event::SendDone => {
                let expects_reply = self
                    .pending
                    .as_ref()
                    .is_some_and(|tx| tx.recv_capacity.is_some());
                if expects_reply {
                    self.transition(FsmState::Receive);
                } else {
                    self.complete_pending(None);
                    self.transition(FsmState::Coneval);
                }
            }
            e => self.ignore(e),
        }
    }

    fn enter_receive(&mut self) {
        let Some((capacity, rai)) = self
            .pending
            .as_ref()
            .and_then(|tx| tx.recv_capacity.map(|c| (c, tx.rai)))
        else {
            self.transition(FsmState::Ready);
            return;
        };
        match self.seq.recv(capacity, rai) {
            Ok(data) => {
                self.metrics.downlink_received(data.len());
                self.complete_pending(Some(data));
                self.post(Event::RecvDone);
            }
            Err(e) => {
                self.metrics.downlink_failed();
                self.fail_pending(SendRecvError::from(e.clone()));
                self.fail("receive", &e);
            }
        }
    }

    fn on_receive(&mut self, event: Event) {
        match event {
            Event::RecvDone => self.transition(FsmState::Coneval),
            e => self.ignore(e),
        }
    }

    fn enter_coneval(&mut self) {
        match self.seq.coneval() {
            Ok(params) => {
                debug!(
                    rsrp = params.rsrp,
                    rsrq = params.rsrq,
                    snr = params.snr,
                    band = params.band,
                    "connection evaluated"
                );
                self.store.set_conn_params(params);
                self.transition(FsmState::Ready);
            }
            Err(e) => self.fail("coneval", &e),
        }
    }

    // ── Positioning ─────────────────────────────────────────────────

    fn enter_gnss(&mut self) {
        if let Err(e) = self.seq.gnss(true) {
            self.fail("gnss start", &e);
        }
    }

    fn stop_gnss(&mut self) {
        if let Err(e) = self.seq.gnss(false) {
            warn!(error = %e, "failed to stop GNSS");
        }
    }

    fn on_gnss_fix(&mut self) {
        match (&self.gnss_handler, self.store.gnss_fix()) {
            (Some(handler), Ok(fix)) => handler(&fix),
            (None, _) => debug!("GNSS fix without handler"),
            (_, Err(e)) => warn!(error = %e, "GNSS fix missing from store"),
        }
    }

    fn on_gnss(&mut self, event: Event) {
        match event {
            Event::GnssDisable => {
                self.stop_gnss();
                self.transition(FsmState::Ready);
            }
            Event::SendRecv => {
                self.stop_gnss();
                self.transition(FsmState::Ready);
            }
            Event::Deregistered => {
                self.stop_gnss();
                self.set_connected(false);
                self.transition(FsmState::Attach);
            }
            e => self.ignore(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Check, TalkError};
    use crate::parse::{parse_cereg, ConnEvalParams, NetworkTime};
    use proptest::prelude::*;

    // ─── Mock Infrastructure ───

    #[derive(Default)]
    struct MockSeq {
        calls: Vec<String>,
        health: VecDeque<Result<(), FlowError>>,
        open_socket_error: Option<FlowError>,
        recv_error: Option<FlowError>,
        downlink: Vec<u8>,
    }

    impl MockSeq {
        fn count(&self, name: &str) -> usize {
            self.calls.iter().filter(|c| *c == name).count()
        }

        fn ok(&mut self, name: &str) -> Result<(), FlowError> {
            self.calls.push(name.to_string());
            Ok(())
        }
    }

    impl Sequencer for MockSeq {
        fn rfmux_acquire(&mut self) -> Result<(), FlowError> {
            self.ok("rfmux_acquire")
        }
        fn rfmux_release(&mut self) -> Result<(), FlowError> {
            self.ok("rfmux_release")
        }
        fn reset(&mut self) -> Result<(), FlowError> {
            self.ok("reset")
        }
        fn start(&mut self) -> Result<(), FlowError> {
            self.ok("start")
        }
        fn stop(&mut self) -> Result<(), FlowError> {
            self.ok("stop")
        }
        fn prepare(&mut self) -> Result<(), FlowError> {
            self.ok("prepare")
        }
        fn cfun(&mut self, mode: u8) -> Result<(), FlowError> {
            self.ok(&format!("cfun {mode}"))
        }
        fn sim_info(&mut self) -> Result<(), FlowError> {
            self.ok("sim_info")
        }
        fn sim_fplmn(&mut self) -> Result<(), FlowError> {
            self.ok("sim_fplmn")
        }
        fn open_socket(&mut self) -> Result<(), FlowError> {
            self.calls.push("open_socket".into());
            self.open_socket_error.clone().map_or(Ok(()), Err)
        }
        fn close_socket(&mut self) -> Result<(), FlowError> {
            self.ok("close_socket")
        }
        fn check_health(&mut self) -> Result<(), FlowError> {
            self.calls.push("check_health".into());
            self.health.pop_front().unwrap_or(Ok(()))
        }
        fn send(&mut self, uplink: &Uplink<'_>) -> Result<(), FlowError> {
            self.ok(&format!("send {}", uplink.data.len()))
        }
        fn recv(&mut self, _capacity: usize, _rai: bool) -> Result<Vec<u8>, FlowError> {
            self.calls.push("recv".into());
            match self.recv_error.clone() {
                Some(e) => Err(e),
                None => Ok(self.downlink.clone()),
            }
        }
        fn coneval(&mut self) -> Result<ConnEvalParams, FlowError> {
            self.calls.push("coneval".into());
            Ok(ConnEvalParams::default())
        }
        fn gnss(&mut self, enable: bool) -> Result<(), FlowError> {
            self.ok(&format!("gnss {enable}"))
        }
        fn network_time(&mut self) -> Result<NetworkTime, FlowError> {
            Err(FlowError::Talk(TalkError::Timeout))
        }
        fn test(&mut self, _op: &TestOp) -> Result<String, FlowError> {
            Ok("OK".into())
        }
    }

    struct Rig {
        fsm: Fsm<MockSeq>,
        store: Arc<StateStore>,
        metrics: MetricsRecorder,
        status: Arc<Status>,
    }

    fn rig(config: LteConfig) -> Rig {
        let store = Arc::new(StateStore::new());
        let metrics = MetricsRecorder::new();
        let status = Arc::new(Status::new());
        let fsm = Fsm::new(
            MockSeq::default(),
            Arc::new(ArcSwap::from_pointee(config)),
            store.clone(),
            metrics.clone(),
            status.clone(),
        );
        Rig {
            fsm,
            store,
            metrics,
            status,
        }
    }

    fn psm_registration() -> crate::parse::RegistrationParams {
        parse_cereg("1,\"B4DC\",\"000AE520\",9,,,\"00000110\",\"00111000\"").unwrap()
    }

    /// Drives a fresh machine through bring-up into `Ready`.
    fn ready_rig(psm: bool) -> Rig {
        let mut r = rig(LteConfig::default());
        r.fsm.process(Event::Enable);
        assert_eq!(r.fsm.state(), FsmState::Boot);
        r.fsm.process(Event::Ready);
        assert_eq!(r.fsm.state(), FsmState::Prepare);
        r.fsm.process(Event::SimDetected);
        assert_eq!(r.fsm.state(), FsmState::Attach);
        if psm {
            r.store.set_registration(psm_registration());
        } else {
            r.store
                .set_registration(parse_cereg("1,\"B4DC\",\"000AE520\",9").unwrap());
        }
        r.fsm.process(Event::Registered);
        assert_eq!(r.fsm.state(), FsmState::Ready);
        r
    }

    fn transaction(recv: Option<usize>, deadline: Instant) -> (Transaction, Receiver<Completion>) {
        let (reply, rx) = bounded(1);
        let tx = Transaction {
            payload: Bytes::from_static(b"ping"),
            recv_capacity: recv,
            send_as_string: false,
            rai: true,
            deadline,
            reply,
        };
        (tx, rx)
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn bring_up_reaches_ready_and_connects() {
        let r = ready_rig(true);
        assert!(r.status.is_connected());
        assert_eq!(r.status.state(), FsmState::Ready);
        let seq = r.fsm.sequencer();
        assert_eq!(
            seq.calls[..4],
            ["rfmux_acquire", "reset", "start", "prepare"].map(String::from)
        );
        assert_eq!(seq.count("open_socket"), 1);
        assert_eq!(seq.count("coneval"), 1);
        assert_eq!(r.metrics.snapshot().attach_count, 1);
        // PSM granted: no inactivity timer.
        assert!(r.fsm.deadline().is_none());
    }

    #[test]
    fn self_transition_does_not_rerun_enter() {
        let mut r = rig(LteConfig::default());
        r.fsm.transition(FsmState::Boot);
        let deadline = r.fsm.deadline();
        let calls = r.fsm.sequencer().calls.len();
        r.fsm.transition(FsmState::Boot);
        assert_eq!(r.fsm.sequencer().calls.len(), calls);
        assert_eq!(r.fsm.deadline(), deadline);
    }

    #[test]
    fn send_without_receive_skips_receive_state() {
        let mut r = ready_rig(true);
        let (tx, done) = transaction(None, later());
        r.fsm.submit(tx);
        assert_eq!(done.try_recv().unwrap(), Ok(None));
        assert_eq!(r.fsm.state(), FsmState::Ready);
        let seq = r.fsm.sequencer();
        assert_eq!(seq.count("send 4"), 1);
        assert_eq!(seq.count("recv"), 0);
        assert_eq!(r.metrics.snapshot().uplink_bytes, 4);
    }

    #[test]
    fn send_with_receive_returns_downlink() {
        let mut r = ready_rig(true);
        r.fsm.sequencer_mut().downlink = b"pong".to_vec();
        let (tx, done) = transaction(Some(16), later());
        r.fsm.submit(tx);
        assert_eq!(done.try_recv().unwrap(), Ok(Some(b"pong".to_vec())));
        assert_eq!(r.fsm.state(), FsmState::Ready);
        assert_eq!(r.metrics.snapshot().downlink_count, 1);
    }

    #[test]
    fn abandoned_transaction_is_never_sent() {
        let mut r = ready_rig(true);
        let (tx, done) = transaction(None, Instant::now());
        r.fsm.submit(tx);
        assert_eq!(done.try_recv().unwrap(), Err(SendRecvError::TimedOut));
        assert_eq!(r.fsm.sequencer().count("send 4"), 0);
        assert_eq!(r.fsm.state(), FsmState::Ready);
    }

    #[test]
    fn waiting_request_expires_without_disturbing_bring_up() {
        let mut r = rig(LteConfig::default());
        r.fsm.process(Event::Enable);
        let boot_timer = r.fsm.deadline().unwrap();

        let expiry = Instant::now() + Duration::from_millis(5);
        let (tx, done) = transaction(None, expiry);
        r.fsm.submit(tx);
        assert_eq!(r.fsm.state(), FsmState::Boot);
        assert_eq!(r.fsm.deadline(), Some(expiry));
        assert!(done.try_recv().is_err());

        std::thread::sleep(Duration::from_millis(10));
        r.fsm.fire_timer();
        assert_eq!(done.try_recv().unwrap(), Err(SendRecvError::TimedOut));
        assert_eq!(r.fsm.state(), FsmState::Boot);
        assert_eq!(r.fsm.deadline(), Some(boot_timer));
        assert_eq!(r.fsm.sequencer().count("send 4"), 0);
    }

    #[test]
    fn failed_receive_reports_and_recovers() {
        let mut r = ready_rig(true);
        r.fsm.sequencer_mut().recv_error = Some(FlowError::Talk(TalkError::Timeout));
        let (tx, done) = transaction(Some(16), later());
        r.fsm.submit(tx);
        assert_eq!(done.try_recv().unwrap(), Err(SendRecvError::TimedOut));
        // Error probes health, which passes, and resumes.
        assert_eq!(r.fsm.state(), FsmState::Ready);
        assert!(r.status.is_connected());
        assert_eq!(r.metrics.snapshot().downlink_errors, 1);
    }

    #[test]
    fn unhealthy_modem_drops_the_request() {
        let mut r = ready_rig(true);
        r.fsm
            .sequencer_mut()
            .health
            .push_back(Err(FlowError::Connectivity(Check::Registration)));
        let (tx, done) = transaction(None, later());
        r.fsm.submit(tx);
        assert_eq!(done.try_recv().unwrap(), Err(SendRecvError::ConnectionDropped));
        assert_eq!(r.fsm.state(), FsmState::Ready);
    }

    #[test]
    fn three_socket_probe_failures_force_full_restart() {
        let mut r = ready_rig(true);
        {
            let seq = r.fsm.sequencer_mut();
            seq.open_socket_error = Some(FlowError::Connectivity(Check::Socket));
            for _ in 0..MAX_PROBE_FAILURES {
                seq.health.push_back(Err(FlowError::Connectivity(Check::Socket)));
            }
            seq.calls.clear();
        }
        r.fsm.process(Event::Error);

        assert_eq!(r.fsm.state(), FsmState::Error);
        let seq = r.fsm.sequencer();
        assert_eq!(seq.count("open_socket"), 3);
        assert_eq!(seq.count("check_health"), 3);
        assert_eq!(seq.count("stop"), 1);
        assert!(r.fsm.deadline().is_some());
        assert!(!r.status.is_connected());

        r.fsm.process(Event::Timeout);
        assert_eq!(r.fsm.state(), FsmState::Boot);
    }

    #[test]
    fn backoff_doubles_from_floor_and_caps() {
        let floor = Duration::from_secs(60);
        let mut prev = None;
        let mut seen = Vec::new();
        for _ in 0..6 {
            let next = next_backoff(prev, floor);
            seen.push(next.as_secs());
            prev = Some(next);
        }
        assert_eq!(seen, [60, 120, 240, 480, 600, 600]);
    }

    proptest! {
        #[test]
        fn backoff_is_non_decreasing_and_bounded(prev_s in 0u64..10_000, floor_s in 1u64..1_000) {
            let prev = Duration::from_secs(prev_s).min(MAX_BACKOFF);
            let next = next_backoff(Some(prev), Duration::from_secs(floor_s));
            prop_assert!(next >= prev);
            prop_assert!(next <= MAX_BACKOFF);
        }
    }

    #[test]
    fn inactivity_without_psm_enters_flight_mode_and_reattaches() {
        let mut r = ready_rig(false);
        assert!(r.fsm.deadline().is_some(), "inactivity timer armed");
        r.fsm.process(Event::Timeout);
        assert_eq!(r.fsm.state(), FsmState::Sleep);
        assert!(!r.status.is_connected());
        {
            let seq = r.fsm.sequencer();
            assert_eq!(seq.count("close_socket"), 1);
            assert_eq!(seq.count("cfun 4"), 1);
        }

        let (tx, _done) = transaction(None, later());
        r.fsm.submit(tx);
        assert_eq!(r.fsm.state(), FsmState::Wakeup);
        r.fsm.process(Event::Ready);
        assert_eq!(r.fsm.state(), FsmState::Attach);
        assert_eq!(r.fsm.sequencer().count("cfun 1"), 2);
    }

    #[test]
    fn psm_sleep_wakes_straight_to_ready() {
        let mut r = ready_rig(true);
        r.fsm.process(Event::ModemSleep);
        assert_eq!(r.fsm.state(), FsmState::Sleep);
        let (tx, done) = transaction(None, later());
        r.fsm.submit(tx);
        r.fsm.process(Event::Ready);
        assert_eq!(done.try_recv().unwrap(), Ok(None));
        assert_eq!(r.fsm.state(), FsmState::Ready);
    }

    #[test]
    fn deregistration_fails_pending_and_reattaches() {
        let mut r = ready_rig(true);
        let (tx, done) = transaction(None, later());
        r.fsm.pending = Some(tx);
        r.store.invalidate_registration();
        r.fsm.process(Event::Deregistered);
        assert_eq!(done.try_recv().unwrap(), Err(SendRecvError::Deregistered));
        assert_eq!(r.fsm.state(), FsmState::Attach);
    }

    #[test]
    fn disabled_rejects_requests_and_reconnect() {
        let mut r = rig(LteConfig::default());
        let (tx, done) = transaction(None, later());
        r.fsm.submit(tx);
        assert_eq!(done.try_recv().unwrap(), Err(SendRecvError::Disabled));
        assert_eq!(r.fsm.reconnect(), Err(StackError::AlreadyDisabled));
    }

    #[test]
    fn reconnect_releases_and_reacquires_rf_mux() {
        let mut r = ready_rig(true);
        r.fsm.reconnect().unwrap();
        assert_eq!(r.fsm.state(), FsmState::Boot);
        let seq = r.fsm.sequencer();
        assert_eq!(seq.count("rfmux_release"), 1);
        assert_eq!(seq.count("rfmux_acquire"), 2);
    }

    #[test]
    fn test_mode_blocks_enable_and_allows_test_ops() {
        let mut r = rig(LteConfig {
            test: true,
            ..Default::default()
        });
        r.fsm.process(Event::Enable);
        assert_eq!(r.fsm.state(), FsmState::Disabled);
        assert_eq!(r.fsm.test(&TestOp::Reset).unwrap(), "OK");

        let mut r = rig(LteConfig::default());
        assert_eq!(r.fsm.test(&TestOp::Reset), Err(StackError::TestModeRequired));
    }

    #[test]
    fn gnss_session_yields_to_transfers() {
        let mut r = ready_rig(true);
        let fixes = Arc::new(Mutex::new(0));
        let counter = fixes.clone();
        r.fsm
            .set_gnss_handler(Some(Box::new(move |_fix: &GnssFix| *counter.lock().unwrap() += 1)));
        r.fsm.set_gnss(true);
        assert_eq!(r.fsm.state(), FsmState::Gnss);

        r.store.set_gnss_fix(GnssFix::default());
        r.fsm.process(Event::GnssFix);
        assert_eq!(*fixes.lock().unwrap(), 1);

        let (tx, done) = transaction(None, later());
        r.fsm.submit(tx);
        assert_eq!(done.try_recv().unwrap(), Ok(None));
        // Positioning is still requested, so the session resumes.
        assert_eq!(r.fsm.state(), FsmState::Gnss);
        assert_eq!(r.fsm.sequencer().count("gnss true"), 2);

        r.fsm.set_gnss(false);
        assert_eq!(r.fsm.state(), FsmState::Ready);
    }

    #[test]
    fn radio_connection_time_is_metered() {
        let mut r = ready_rig(true);
        r.fsm.process(Event::RadioConnected);
        std::thread::sleep(Duration::from_millis(2));
        r.fsm.process(Event::RadioIdle);
        assert!(r.metrics.snapshot().cscon_1_duration_ms >= 2);
        // PSM granted: radio idle does not trigger flight mode.
        assert_eq!(r.fsm.state(), FsmState::Ready);
    }

    // ─── Event queue ───

    #[test]
    fn full_event_queue_drops_the_newest_event() {
        let (events, rx) = event_queue();
        let burst = [
            Event::Enable,
            Event::Ready,
            Event::SimDetected,
            Event::Registered,
            Event::SocketOpened,
            Event::RadioConnected,
            Event::RadioIdle,
            Event::NetworkTime,
        ];
        assert_eq!(burst.len(), EVENT_QUEUE_DEPTH);
        for event in burst {
            events.post(event);
        }
        events.post(Event::ModemSleep);

        let queued: Vec<Event> = rx.try_iter().collect();
        assert_eq!(queued, burst);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn posting_to_a_full_queue_does_not_block() {
        let (events, rx) = event_queue();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            for _ in 0..EVENT_QUEUE_DEPTH * 4 {
                events.post(Event::Timeout);
            }
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).is_ok());
        assert_eq!(rx.len(), EVENT_QUEUE_DEPTH);
    }
}
