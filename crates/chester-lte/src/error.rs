//! Error taxonomy for the LTE stack.
//!
//! Lower layers carry precise causes (`LinkError`, `TalkError`, `ParseError`)
//! which the flow sequencer folds into [`FlowError`]. Everything the worker
//! cannot handle locally becomes the generic error event; callers of
//! `send_recv` receive a [`SendRecvError`] instead.

use thiserror::Error;

// ── Link ────────────────────────────────────────────────────────────

/// Failures reported by the line/data link driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link is not enabled")]
    NotEnabled,
    #[error("link is busy")]
    Busy,
    #[error("link is in the wrong mode for this operation")]
    ModeMismatch,
    #[error("link operation timed out")]
    Timeout,
    #[error("link I/O failure: {0}")]
    Io(String),
}

// ── Dialog transport ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TalkError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("timed out waiting for modem response")]
    Timeout,
    #[error("modem rejected command: {0}")]
    Rejected(String),
    #[error("response does not fit in {capacity} bytes")]
    NoSpace { capacity: usize },
    #[error("byte count mismatch: expected {expected}, modem reported {reported}")]
    ByteCount { expected: usize, reported: usize },
    /// The count in `#XDATAMODE:`, `#XSEND:` or `#XRECV:` is not a number.
    #[error("byte count mismatch: modem reported `{0}`")]
    ByteCountUnreadable(String),
    #[error("malformed response line: {0}")]
    Malformed(String),
    #[error("invalid argument")]
    InvalidArgument,
}

// ── Parser ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("malformed field `{0}`")]
    Malformed(&'static str),
    #[error("field `{0}` exceeds its bounds")]
    Overflow(&'static str),
    #[error("unexpected trailing input")]
    TrailingInput,
    #[error("socket is closed")]
    Closed,
}

// ── Flow sequencer ──────────────────────────────────────────────────

/// Which health-probe step disagreed with the expected "ready" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    FunctionalMode,
    Registration,
    Attach,
    PdnContext,
    Socket,
}

impl std::fmt::Display for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Check::FunctionalMode => "functional mode",
            Check::Registration => "registration",
            Check::Attach => "packet domain attach",
            Check::PdnContext => "PDN context",
            Check::Socket => "socket",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error(transparent)]
    Talk(#[from] TalkError),
    #[error("parse: {0}")]
    Parse(#[from] ParseError),
    #[error("connectivity check failed: {0}")]
    Connectivity(Check),
    #[error("SIM recovery performed, retry needed")]
    RetryNeeded,
    #[error("SIM failure: {0}")]
    Sim(String),
    #[error("RF multiplexer: {0}")]
    RfMux(String),
    #[error("no transaction pending")]
    NoTransaction,
}

impl FlowError {
    /// True for failures that point at the data socket rather than the
    /// modem or network. The error state retries these by reopening the
    /// socket before resorting to a full restart.
    pub fn is_socket_error(&self) -> bool {
        matches!(
            self,
            FlowError::Connectivity(Check::Socket) | FlowError::Parse(ParseError::Closed)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FlowError::Talk(TalkError::Timeout)
                | FlowError::Talk(TalkError::Link(LinkError::Timeout))
        )
    }
}

// ── Public API ──────────────────────────────────────────────────────

/// Outcome codes surfaced to callers of `send_recv`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendRecvError {
    #[error("connection dropped")]
    ConnectionDropped,
    #[error("timed out")]
    TimedOut,
    #[error("network deregistered during transaction")]
    Deregistered,
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("worker did not finish within the stop timeout")]
    WorkerStuck,
    #[error("stack is disabled")]
    Disabled,
    #[error("not supported in test mode")]
    NotSupported,
    #[error("invalid argument")]
    InvalidArgument,
}

impl From<FlowError> for SendRecvError {
    fn from(e: FlowError) -> Self {
        match e {
            FlowError::Connectivity(_) | FlowError::Parse(ParseError::Closed) => {
                SendRecvError::ConnectionDropped
            }
            FlowError::Talk(TalkError::InvalidArgument) => SendRecvError::InvalidArgument,
            e if e.is_timeout() => SendRecvError::TimedOut,
            e => SendRecvError::Io(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("not supported in test mode")]
    NotSupported,
    #[error("stack is already disabled")]
    AlreadyDisabled,
    #[error("timed out")]
    Timeout,
    #[error("no data available")]
    NoData,
    #[error("worker thread is gone")]
    WorkerGone,
    #[error("GNSS is not enabled in the configuration")]
    GnssUnavailable,
    #[error("operation requires test mode")]
    TestModeRequired,
    #[error(transparent)]
    Flow(#[from] FlowError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown config item `{0}`")]
    UnknownItem(String),
    #[error("invalid value for `{item}`: {reason}")]
    InvalidValue { item: &'static str, reason: String },
    #[error("invalid config TOML: {0}")]
    Toml(String),
    #[error("unsupported config version {0}")]
    Version(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_errors_are_classified() {
        assert!(FlowError::Connectivity(Check::Socket).is_socket_error());
        assert!(FlowError::Parse(ParseError::Closed).is_socket_error());
        assert!(!FlowError::Connectivity(Check::Attach).is_socket_error());
        assert!(!FlowError::Talk(TalkError::Timeout).is_socket_error());
    }

    #[test]
    fn flow_errors_map_to_caller_codes() {
        assert_eq!(
            SendRecvError::from(FlowError::Connectivity(Check::Registration)),
            SendRecvError::ConnectionDropped
        );
        assert_eq!(
            SendRecvError::from(FlowError::Talk(TalkError::Timeout)),
            SendRecvError::TimedOut
        );
        assert!(matches!(
            SendRecvError::from(FlowError::Talk(TalkError::Rejected("ERROR".into()))),
            SendRecvError::Io(_)
        ));
    }
}
