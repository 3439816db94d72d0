//! Scripted AT link.
//!
//! [`ScriptedLink`] plays the modem side of a conversation from a queue of
//! [`Step`]s. Every command line or data write the stack sends is matched
//! against the head of the queue; a match releases the scripted reply lines,
//! then any notifications and inbound payloads queued behind it. A mismatch
//! is recorded and answered with `ERROR`, leaving the script where it was.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use chester_lte::{Link, LinkError, LinkEvent, LinkHandler};
use tracing::{debug, warn};

/// One scripted exchange or spontaneous modem output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Expect the command line `tx`, answer with `rx`.
    Exchange { tx: String, rx: Vec<String> },
    /// Expect the data-mode write `tx`, answer with `rx`.
    Data { tx: Vec<u8>, rx: Vec<String> },
    /// Emit a notification line, `delay` after the preceding step.
    Urc { delay: Duration, line: String },
    /// Make bytes available to data-mode reads.
    RxData(Vec<u8>),
}

impl Step {
    pub fn exchange(tx: impl Into<String>, rx: &[&str]) -> Self {
        Step::Exchange {
            tx: tx.into(),
            rx: rx.iter().map(|l| l.to_string()).collect(),
        }
    }

    /// A command answered with a bare `OK`.
    pub fn ok(tx: impl Into<String>) -> Self {
        Step::exchange(tx, &["OK"])
    }

    pub fn data(tx: &[u8], rx: &[&str]) -> Self {
        Step::Data {
            tx: tx.to_vec(),
            rx: rx.iter().map(|l| l.to_string()).collect(),
        }
    }

    pub fn urc(line: impl Into<String>) -> Self {
        Step::urc_after(Duration::ZERO, line)
    }

    pub fn urc_after(delay: Duration, line: impl Into<String>) -> Self {
        Step::Urc {
            delay,
            line: line.into(),
        }
    }

    fn is_expectation(&self) -> bool {
        matches!(self, Step::Exchange { .. } | Step::Data { .. })
    }
}

#[derive(Default)]
struct State {
    script: VecDeque<Step>,
    enabled: bool,
    in_dialog: bool,
    data_mode: bool,
    rx: VecDeque<String>,
    rx_data: VecDeque<u8>,
    sent: Vec<String>,
    sent_data: Vec<Vec<u8>>,
    mismatches: Vec<String>,
    resets: u32,
    wakeups: u32,
}

/// In-memory [`Link`] driven by a [`Step`] script.
pub struct ScriptedLink {
    me: Weak<ScriptedLink>,
    state: Mutex<State>,
    arrived: Condvar,
    handler: Mutex<Option<LinkHandler>>,
}

impl ScriptedLink {
    pub fn new(script: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new_cyclic(|me| ScriptedLink {
            me: me.clone(),
            state: Mutex::new(State {
                script: script.into_iter().collect(),
                ..Default::default()
            }),
            arrived: Condvar::new(),
            handler: Mutex::new(None),
        })
    }

    /// Appends steps to the end of the script.
    pub fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.lock().script.extend(steps);
    }

    /// Command lines sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Data-mode writes so far, in order.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.lock().sent_data.clone()
    }

    /// Every line or write that did not match the script.
    pub fn mismatches(&self) -> Vec<String> {
        self.lock().mismatches.clone()
    }

    /// Number of steps not yet played.
    pub fn remaining(&self) -> usize {
        self.lock().script.len()
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    pub fn resets(&self) -> u32 {
        self.lock().resets
    }

    pub fn wakeups(&self) -> u32 {
        self.lock().wakeups
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(handler) = handler else {
            debug!(count = lines.len(), "no handler, lines dropped");
            return;
        };
        for line in lines {
            handler(LinkEvent::RxLine(line));
        }
    }

    /// Hands a line to the active dialog, or to the handler outside one.
    fn deliver(&self, line: String) {
        let mut st = self.lock();
        if st.in_dialog {
            st.rx.push_back(line);
            self.arrived.notify_all();
            return;
        }
        drop(st);
        self.dispatch(vec![line]);
    }

    /// Plays the spontaneous steps up to the next expectation. Returns the
    /// lines that must be dispatched once the state lock is released.
    fn advance(&self, st: &mut State) -> Vec<String> {
        let mut outside = Vec::new();
        while st.script.front().is_some_and(|s| !s.is_expectation()) {
            match st.script.pop_front() {
                Some(Step::RxData(bytes)) => st.rx_data.extend(bytes),
                Some(Step::Urc { delay, line }) if delay.is_zero() => {
                    if st.in_dialog {
                        st.rx.push_back(line);
                    } else {
                        outside.push(line);
                    }
                }
                Some(Step::Urc { delay, line }) => self.schedule(delay, line),
                _ => {}
            }
        }
        self.arrived.notify_all();
        outside
    }

    fn schedule(&self, delay: Duration, line: String) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name("sim-urc".into())
            .spawn(move || {
                thread::sleep(delay);
                me.deliver(line);
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to schedule notification");
        }
    }
}

impl Link for ScriptedLink {
    fn set_handler(&self, handler: Option<LinkHandler>) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    fn reset(&self) -> Result<(), LinkError> {
        let mut st = self.lock();
        st.resets += 1;
        st.rx.clear();
        st.rx_data.clear();
        st.in_dialog = false;
        st.data_mode = false;
        Ok(())
    }

    fn wake_up(&self) -> Result<(), LinkError> {
        let mut st = self.lock();
        st.wakeups += 1;
        if !st.enabled {
            return Ok(());
        }
        let mut lines = vec!["Ready".to_string()];
        lines.extend(self.advance(&mut st));
        drop(st);
        self.dispatch(lines);
        Ok(())
    }

    fn enable(&self) -> Result<(), LinkError> {
        self.lock().enabled = true;
        Ok(())
    }

    fn disable(&self) -> Result<(), LinkError> {
        let mut st = self.lock();
        st.enabled = false;
        st.data_mode = false;
        Ok(())
    }

    fn enter_dialog(&self) -> Result<(), LinkError> {
        let mut st = self.lock();
        if !st.enabled {
            return Err(LinkError::NotEnabled);
        }
        if st.in_dialog {
            return Err(LinkError::Busy);
        }
        st.in_dialog = true;
        Ok(())
    }

    fn exit_dialog(&self) -> Result<(), LinkError> {
        let mut st = self.lock();
        st.in_dialog = false;
        st.data_mode = false;
        let leftover: Vec<String> = st.rx.drain(..).collect();
        drop(st);
        self.dispatch(leftover);
        Ok(())
    }

    fn enter_data_mode(&self) -> Result<(), LinkError> {
        let mut st = self.lock();
        if !st.in_dialog {
            return Err(LinkError::ModeMismatch);
        }
        st.data_mode = true;
        Ok(())
    }

    fn exit_data_mode(&self) -> Result<(), LinkError> {
        self.lock().data_mode = false;
        Ok(())
    }

    fn send_line(&self, _timeout: Duration, line: &str) -> Result<(), LinkError> {
        let mut st = self.lock();
        if !st.enabled {
            return Err(LinkError::NotEnabled);
        }
        if !st.in_dialog || st.data_mode {
            return Err(LinkError::ModeMismatch);
        }
        st.sent.push(line.to_string());

        let matched = matches!(st.script.front(), Some(Step::Exchange { tx, .. }) if tx == line);
        if matched {
            if let Some(Step::Exchange { rx, .. }) = st.script.pop_front() {
                st.rx.extend(rx);
            }
            self.advance(&mut st);
        } else {
            let expected = st.script.front().cloned();
            warn!(line, ?expected, "unscripted command");
            st.mismatches
                .push(format!("sent {line:?}, expected {expected:?}"));
            st.rx.push_back("ERROR".into());
            self.arrived.notify_all();
        }
        Ok(())
    }

    fn recv_line(&self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let st = self.lock();
        if !st.in_dialog {
            return Err(LinkError::ModeMismatch);
        }
        let (mut st, _) = self
            .arrived
            .wait_timeout_while(st, timeout, |st| st.rx.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        Ok(st.rx.pop_front())
    }

    fn send_data(&self, _timeout: Duration, data: &[u8]) -> Result<(), LinkError> {
        let mut st = self.lock();
        if !st.data_mode {
            return Err(LinkError::ModeMismatch);
        }
        st.sent_data.push(data.to_vec());

        let matched = matches!(st.script.front(), Some(Step::Data { tx, .. }) if tx == data);
        if matched {
            if let Some(Step::Data { rx, .. }) = st.script.pop_front() {
                st.rx.extend(rx);
            }
            self.advance(&mut st);
        } else {
            let expected = st.script.front().cloned();
            warn!(len = data.len(), ?expected, "unscripted data write");
            st.mismatches.push(format!(
                "wrote {:?}, expected {expected:?}",
                String::from_utf8_lossy(data)
            ));
            st.rx.push_back("ERROR".into());
            self.arrived.notify_all();
        }
        Ok(())
    }

    fn recv_data(&self, timeout: Duration, buf: &mut [u8]) -> Result<usize, LinkError> {
        let st = self.lock();
        if !st.data_mode {
            return Err(LinkError::ModeMismatch);
        }
        let (mut st, _) = self
            .arrived
            .wait_timeout_while(st, timeout, |st| st.rx_data.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        let n = buf.len().min(st.rx_data.len());
        for (slot, byte) in buf.iter_mut().zip(st.rx_data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
