use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam_channel::{after, bounded, never, select, Receiver, RecvTimeoutError, Sender};
use quanta::Instant;
use tracing::{debug, info, warn};

use crate::config::LteConfig;
use crate::error::{SendRecvError, StackError};
use crate::flow::{Flow, Sequencer, TestOp};
use crate::fsm::{event_queue, Event, Fsm, FsmState, GnssHandler, Status, Transaction};
use crate::link::{Link, RfMux};
use crate::metrics::{Metrics, MetricsRecorder};
use crate::parse::{ConnEvalParams, GnssFix, NetworkTime, RegistrationParams};
use crate::state::{Identity, StateStore};

const COMMAND_QUEUE_DEPTH: usize = 16;

/// One uplink, optionally followed by a downlink into `recv`.
#[derive(Debug)]
pub struct SendRecvRequest<'a> {
    pub send: &'a [u8],
    /// Receive buffer. Its length is the downlink capacity.
    pub recv: Option<&'a mut [u8]>,
    pub timeout: Duration,
    pub send_as_string: bool,
    pub rai: bool,
}

impl<'a> SendRecvRequest<'a> {
    pub fn send(data: &'a [u8], timeout: Duration) -> Self {
        SendRecvRequest {
            send: data,
            recv: None,
            timeout,
            send_as_string: false,
            rai: true,
        }
    }

    pub fn with_recv(mut self, buf: &'a mut [u8]) -> Self {
        self.recv = Some(buf);
        self
    }
}

/// Requests handled on the worker thread.
enum Command {
    Enable,
    SendRecv(Transaction),
    Reconnect(Sender<Result<(), StackError>>),
    ForceError,
    SetGnss(bool),
    SetGnssHandler(Option<GnssHandler>),
    Test(TestOp, Sender<Result<String, StackError>>),
    Shutdown,
}

/// Returns the transaction slot token when dropped.
struct SlotGuard<'a> {
    tokens: &'a Sender<()>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let _ = self.tokens.try_send(());
    }
}

/// Thread-safe handle to the LTE connectivity worker.
///
/// Owns a background thread (`lte-worker`) that runs the state machine.
/// Requests travel over a bounded command channel; snapshot reads go
/// straight to the shared state store and metrics.
///
/// At most one send/receive transaction is in flight at a time. Dropping
/// the stack shuts the worker down, which disables the modem.
pub struct LteStack {
    commands: Sender<Command>,
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    config: Arc<ArcSwap<LteConfig>>,
    store: Arc<StateStore>,
    metrics: MetricsRecorder,
    status: Arc<Status>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LteStack {
    /// Builds the stack on top of a link driver and RF mux and starts the
    /// worker. The stack begins disabled.
    pub fn new(link: Arc<dyn Link>, rfmux: Box<dyn RfMux>, config: LteConfig) -> anyhow::Result<Self> {
        let config = Arc::new(ArcSwap::from_pointee(config));
        let store = Arc::new(StateStore::new());
        let (events, event_rx) = event_queue();
        let flow = Flow::new(link, rfmux, config.clone(), store.clone(), events);
        Self::start(flow, event_rx, config, store)
    }

    pub(crate) fn start<S: Sequencer + 'static>(
        seq: S,
        event_rx: Receiver<Event>,
        config: Arc<ArcSwap<LteConfig>>,
        store: Arc<StateStore>,
    ) -> anyhow::Result<Self> {
        let metrics = MetricsRecorder::new();
        let status = Arc::new(Status::new());
        let fsm = Fsm::new(seq, config.clone(), store.clone(), metrics.clone(), status.clone());

        let (commands, command_rx) = bounded(COMMAND_QUEUE_DEPTH);
        let (slot_tx, slot_rx) = bounded(1);
        let _ = slot_tx.try_send(());

        let handle = thread::Builder::new()
            .name("lte-worker".into())
            .spawn(move || worker(fsm, command_rx, event_rx))
            .context("failed to spawn lte worker")?;

        Ok(LteStack {
            commands,
            slot_tx,
            slot_rx,
            config,
            store,
            metrics,
            status,
            handle: Some(handle),
        })
    }

    fn command(&self, cmd: Command) -> Result<(), StackError> {
        self.commands.send(cmd).map_err(|_| StackError::WorkerGone)
    }

    fn request<T>(
        &self,
        build: impl FnOnce(Sender<Result<T, StackError>>) -> Command,
    ) -> Result<T, StackError> {
        let (tx, rx) = bounded(1);
        self.command(build(tx))?;
        rx.recv().map_err(|_| StackError::WorkerGone)?
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Starts bring-up from `Disabled`.
    pub fn enable(&self) -> Result<(), StackError> {
        if self.config.load().test {
            return Err(StackError::NotSupported);
        }
        self.command(Command::Enable)
    }

    /// Drops queued events and restarts bring-up from scratch.
    pub fn reconnect(&self) -> Result<(), StackError> {
        self.request(Command::Reconnect)
    }

    pub fn is_attached(&self) -> bool {
        self.status.is_connected()
    }

    pub fn wait_for_connected(&self, timeout: Duration) -> Result<(), StackError> {
        if self.status.wait_connected(timeout) {
            Ok(())
        } else {
            Err(StackError::Timeout)
        }
    }

    pub fn state(&self) -> FsmState {
        self.status.state()
    }

    // ── Transfer ────────────────────────────────────────────────────

    /// Sends one payload and, when a receive buffer is given, waits for the
    /// reply. Returns the number of bytes written into the buffer.
    ///
    /// A request that has not started within `timeout`, for example while
    /// the modem is still attaching, fails with [`SendRecvError::TimedOut`].
    /// One that started blocks for at most `timeout` plus the configured
    /// stop timeout; if the worker has not finished by then the call fails
    /// with [`SendRecvError::WorkerStuck`] and the state machine is forced
    /// into its error state.
    pub fn send_recv(&self, req: SendRecvRequest<'_>) -> Result<usize, SendRecvError> {
        if req.send.is_empty() || req.recv.as_ref().is_some_and(|buf| buf.is_empty()) {
            return Err(SendRecvError::InvalidArgument);
        }
        let (test_mode, stop_timeout) = {
            let config = self.config.load();
            (config.test, config.timing.stop_timeout)
        };
        if test_mode {
            return Err(SendRecvError::NotSupported);
        }

        let _slot = self.acquire_slot(req.timeout)?;

        let (reply, done) = bounded(1);
        let tx = Transaction {
            payload: Bytes::copy_from_slice(req.send),
            recv_capacity: req.recv.as_ref().map(|buf| buf.len()),
            send_as_string: req.send_as_string,
            rai: req.rai,
            deadline: Instant::now() + req.timeout,
            reply,
        };
        self.commands
            .send(Command::SendRecv(tx))
            .map_err(|_| SendRecvError::Disabled)?;

        let data = match done.recv_timeout(req.timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Disconnected) => return Err(SendRecvError::Disabled),
            Err(RecvTimeoutError::Timeout) => match done.recv_timeout(stop_timeout) {
                Ok(_) => {
                    debug!("transaction finished after caller timeout");
                    return Err(SendRecvError::TimedOut);
                }
                Err(_) => {
                    warn!(
                        timeout_ms = req.timeout.as_millis() as u64,
                        "worker did not finish transaction, forcing error"
                    );
                    let _ = self.commands.try_send(Command::ForceError);
                    return Err(SendRecvError::WorkerStuck);
                }
            },
        };

        Ok(match (data, req.recv) {
            (Some(data), Some(buf)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                n
            }
            _ => 0,
        })
    }

    fn acquire_slot(&self, timeout: Duration) -> Result<SlotGuard<'_>, SendRecvError> {
        self.slot_rx
            .recv_timeout(timeout)
            .map_err(|_| SendRecvError::TimedOut)?;
        Ok(SlotGuard {
            tokens: &self.slot_tx,
        })
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn identity(&self) -> Identity {
        self.store.identity()
    }

    pub fn imei(&self) -> Result<u64, StackError> {
        self.store.imei()
    }

    pub fn imsi(&self) -> Result<u64, StackError> {
        self.store.imsi()
    }

    pub fn conn_params(&self) -> Result<ConnEvalParams, StackError> {
        let params = self.store.conn_params();
        if params.valid {
            Ok(params)
        } else {
            Err(StackError::NoData)
        }
    }

    pub fn registration_params(&self) -> Result<RegistrationParams, StackError> {
        let params = self.store.registration();
        if params.valid {
            Ok(params)
        } else {
            Err(StackError::NoData)
        }
    }

    pub fn network_time(&self) -> Result<NetworkTime, StackError> {
        self.store.network_time()
    }

    pub fn gnss_fix(&self) -> Result<GnssFix, StackError> {
        self.store.gnss_fix()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot()
    }

    // ── Configuration ───────────────────────────────────────────────

    pub fn config(&self) -> Arc<LteConfig> {
        self.config.load_full()
    }

    /// Replaces the configuration. Running steps keep the values they
    /// started with; the next bring-up uses the new ones.
    pub fn set_config(&self, config: LteConfig) {
        self.config.store(Arc::new(config));
    }

    // ── Positioning ─────────────────────────────────────────────────

    pub fn set_gnss_enabled(&self, enable: bool) -> Result<(), StackError> {
        if enable && !self.config.load().gnss {
            return Err(StackError::GnssUnavailable);
        }
        self.command(Command::SetGnss(enable))
    }

    pub fn set_gnss_handler(&self, handler: Option<GnssHandler>) -> Result<(), StackError> {
        self.command(Command::SetGnssHandler(handler))
    }

    // ── Test mode ───────────────────────────────────────────────────

    /// Runs a manual link operation on the worker. Requires test mode.
    pub fn test(&self, op: TestOp) -> Result<String, StackError> {
        if !self.config.load().test {
            return Err(StackError::TestModeRequired);
        }
        self.request(|reply| Command::Test(op, reply))
    }

    /// Stops the worker and waits for it to exit. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("lte worker panicked");
            }
        }
    }
}

impl Drop for LteStack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

fn worker<S: Sequencer>(mut fsm: Fsm<S>, commands: Receiver<Command>, events: Receiver<Event>) {
    info!("lte worker started");
    loop {
        let timer = match fsm.deadline() {
            Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
            None => never(),
        };
        select! {
            recv(commands) -> msg => match msg {
                Ok(Command::Shutdown) | Err(_) => break,
                Ok(cmd) => handle_command(&mut fsm, &events, cmd),
            },
            recv(events) -> event => match event {
                Ok(event) => fsm.process(event),
                Err(_) => break,
            },
            recv(timer) -> _ => fsm.fire_timer(),
        }
    }
    fsm.shutdown();
    info!("lte worker stopped");
}

fn handle_command<S: Sequencer>(fsm: &mut Fsm<S>, events: &Receiver<Event>, cmd: Command) {
    match cmd {
        Command::Enable => fsm.process(Event::Enable),
        Command::SendRecv(tx) => fsm.submit(tx),
        Command::Reconnect(reply) => {
            let dropped = events.try_iter().count();
            if dropped > 0 {
                debug!(dropped, "dropped queued events for reconnect");
            }
            let _ = reply.send(fsm.reconnect());
        }
        Command::ForceError => fsm.process(Event::Error),
        Command::SetGnss(enable) => fsm.set_gnss(enable),
        Command::SetGnssHandler(handler) => fsm.set_gnss_handler(handler),
        Command::Test(op, reply) => {
            let _ = reply.send(fsm.test(&op));
        }
        Command::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::EventSender;
    use crate::parse::parse_cereg;
    use crate::testing::idle_stack as stack;

    fn wait_state(stack: &LteStack, state: FsmState) {
        let start = std::time::Instant::now();
        while stack.state() != state {
            assert!(
                start.elapsed() < Duration::from_secs(2),
                "stuck in {} waiting for {state}",
                stack.state()
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn connected(config: LteConfig, recv_delay: Duration) -> (LteStack, EventSender) {
        let (stack, events) = stack(config, recv_delay);
        stack.enable().unwrap();
        wait_state(&stack, FsmState::Boot);
        events.post(Event::Ready);
        wait_state(&stack, FsmState::Prepare);
        events.post(Event::SimDetected);
        wait_state(&stack, FsmState::Attach);
        stack.store.set_registration(
            parse_cereg("1,\"B4DC\",\"000AE520\",9,,,\"00000110\",\"00111000\"").unwrap(),
        );
        events.post(Event::Registered);
        stack.wait_for_connected(Duration::from_secs(2)).unwrap();
        wait_state(&stack, FsmState::Ready);
        (stack, events)
    }

    fn stack_default() -> (LteStack, EventSender) {
        stack(LteConfig::default(), Duration::ZERO)
    }

    fn short_stop() -> LteConfig {
        let mut config = LteConfig::default();
        config.timing.stop_timeout = Duration::from_millis(50);
        config
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (mut stack, _events) = stack(LteConfig::default(), Duration::ZERO);
        stack.shutdown();
        stack.shutdown();
        assert_eq!(stack.enable(), Err(StackError::WorkerGone));
    }

    #[test]
    fn requests_fail_while_disabled() {
        let (stack, _events) = stack(LteConfig::default(), Duration::ZERO);
        let req = SendRecvRequest::send(b"x", Duration::from_secs(1));
        assert_eq!(stack.send_recv(req), Err(SendRecvError::Disabled));
        assert_eq!(stack.reconnect(), Err(StackError::AlreadyDisabled));
        assert!(!stack.is_attached());
        assert_eq!(
            stack.wait_for_connected(Duration::from_millis(10)),
            Err(StackError::Timeout)
        );
        assert_eq!(stack.conn_params(), Err(StackError::NoData));
    }

    #[test]
    fn empty_payload_is_rejected() {
        let (stack, _events) = stack(LteConfig::default(), Duration::ZERO);
        let req = SendRecvRequest::send(b"", Duration::from_secs(1));
        assert_eq!(stack.send_recv(req), Err(SendRecvError::InvalidArgument));
        let mut buf = [0u8; 0];
        let req = SendRecvRequest::send(b"x", Duration::from_secs(1)).with_recv(&mut buf);
        assert_eq!(stack.send_recv(req), Err(SendRecvError::InvalidArgument));
    }

    #[test]
    fn send_recv_copies_downlink() {
        let (stack, _events) = connected(LteConfig::default(), Duration::ZERO);
        let mut buf = [0u8; 16];
        let req = SendRecvRequest::send(b"ping", Duration::from_secs(2)).with_recv(&mut buf);
        assert_eq!(stack.send_recv(req), Ok(4));
        assert_eq!(&buf[..4], b"pong");
        let m = stack.metrics();
        assert_eq!(m.uplink_count, 1);
        assert_eq!(m.downlink_bytes, 4);
        assert!(stack.conn_params().is_ok());
    }

    #[test]
    fn stuck_worker_is_reported_and_forced_to_error() {
        let (stack, _events) = connected(short_stop(), Duration::from_millis(500));
        let mut buf = [0u8; 16];
        let req = SendRecvRequest::send(b"ping", Duration::from_millis(50)).with_recv(&mut buf);
        assert_eq!(stack.send_recv(req), Err(SendRecvError::WorkerStuck));
        // Once the receive returns, the forced error probes health and resumes.
        wait_state(&stack, FsmState::Ready);
    }

    #[test]
    fn request_waiting_for_attach_times_out_without_forcing_error() {
        let (stack, _events) = stack(short_stop(), Duration::ZERO);
        stack.enable().unwrap();
        wait_state(&stack, FsmState::Boot);
        let req = SendRecvRequest::send(b"ping", Duration::from_millis(50));
        assert_eq!(stack.send_recv(req), Err(SendRecvError::TimedOut));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(stack.state(), FsmState::Boot);
        assert_eq!(stack.metrics().uplink_count, 0);
    }

    #[test]
    fn late_completion_counts_as_timeout() {
        let mut config = LteConfig::default();
        config.timing.stop_timeout = Duration::from_millis(500);
        let (stack, _events) = connected(config, Duration::from_millis(150));
        let mut buf = [0u8; 16];
        let req = SendRecvRequest::send(b"ping", Duration::from_millis(50)).with_recv(&mut buf);
        assert_eq!(stack.send_recv(req), Err(SendRecvError::TimedOut));
    }

    #[test]
    fn reconnect_restarts_bring_up() {
        let (stack, _events) = connected(LteConfig::default(), Duration::ZERO);
        stack.reconnect().unwrap();
        assert!(!stack.is_attached());
        wait_state(&stack, FsmState::Boot);
    }

    #[test]
    fn test_mode_gates_operations() {
        let config = LteConfig {
            test: true,
            ..Default::default()
        };
        let (stack, _events) = stack(config, Duration::ZERO);
        assert_eq!(stack.enable(), Err(StackError::NotSupported));
        assert_eq!(stack.test(TestOp::Reset).unwrap(), "Reset");
        let req = SendRecvRequest::send(b"x", Duration::from_secs(1));
        assert_eq!(stack.send_recv(req), Err(SendRecvError::NotSupported));

        let (stack, _events) = stack_default();
        assert_eq!(stack.test(TestOp::Reset), Err(StackError::TestModeRequired));
    }

    #[test]
    fn gnss_requires_configuration() {
        let (stack, _events) = stack_default();
        assert_eq!(stack.set_gnss_enabled(true), Err(StackError::GnssUnavailable));
        assert_eq!(stack.set_gnss_enabled(false), Ok(()));
    }

    #[test]
    fn config_updates_are_visible() {
        let (stack, _events) = stack_default();
        let mut config = (*stack.config()).clone();
        config.apn = "iot".into();
        stack.set_config(config);
        assert_eq!(stack.config().apn, "iot");
    }
}
