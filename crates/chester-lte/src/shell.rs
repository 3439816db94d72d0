//! # `lte` shell commands
//!
//! Operator commands parsed with clap from a single input line. Every
//! command renders to text; failures render as `command failed: <cause>`.
//! Test operations are forwarded to the worker and need test mode.

use std::fmt::Write;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use crate::config::find_item;
use crate::flow::TestOp;
use crate::metrics::render_prometheus;
use crate::parse::coneval_result_str;
use crate::stack::LteStack;

#[derive(Parser, Debug, PartialEq, Eq)]
#[command(name = "lte", about = "LTE modem control")]
pub struct Shell {
    #[command(subcommand)]
    pub command: ShellCommand,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    /// Show all items (`config show`), read one item, or set it.
    Config {
        item: String,
        value: Option<String>,
    },
    /// Modem and SIM identity.
    Info,
    /// Connection state, registration and signal quality.
    State,
    /// Traffic and attach counters.
    Metrics {
        /// Prometheus text format instead of JSON.
        #[arg(long)]
        prometheus: bool,
    },
    /// Restart the connection from scratch.
    Reconnect,
    /// Manual link operations (test mode only).
    Test {
        #[command(subcommand)]
        op: TestCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum TestCommand {
    /// Enable or disable the modem UART.
    Uart { state: UartState },
    /// Pulse the reset line.
    Reset,
    /// Pulse the wake-up line and wait for `Ready`.
    Wakeup,
    /// Send a raw AT command and print every line until `OK`.
    Cmd {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        line: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum UartState {
    Enable,
    Disable,
}

impl TestCommand {
    fn op(self) -> TestOp {
        match self {
            TestCommand::Uart {
                state: UartState::Enable,
            } => TestOp::UartEnable,
            TestCommand::Uart {
                state: UartState::Disable,
            } => TestOp::UartDisable,
            TestCommand::Reset => TestOp::Reset,
            TestCommand::Wakeup => TestOp::Wakeup,
            TestCommand::Cmd { line } => TestOp::Cmd(line.join(" ")),
        }
    }
}

/// Parses and runs one shell line, returning the text to print.
pub fn execute(stack: &LteStack, line: &str) -> String {
    let args = std::iter::once("lte").chain(line.split_whitespace());
    match Shell::try_parse_from(args) {
        Ok(shell) => match run(stack, shell.command) {
            Ok(out) => out,
            Err(e) => format!("command failed: {e:#}"),
        },
        Err(e) => e.to_string(),
    }
}

pub fn run(stack: &LteStack, command: ShellCommand) -> anyhow::Result<String> {
    match command {
        ShellCommand::Config { item, value } => config(stack, &item, value.as_deref()),
        ShellCommand::Info => Ok(info(stack)),
        ShellCommand::State => Ok(state(stack)),
        ShellCommand::Metrics { prometheus } => {
            let m = stack.metrics();
            if prometheus {
                Ok(render_prometheus(&m))
            } else {
                serde_json::to_string_pretty(&m).context("serializing metrics")
            }
        }
        ShellCommand::Reconnect => {
            stack.reconnect()?;
            Ok("reconnecting".into())
        }
        ShellCommand::Test { op } => Ok(stack.test(op.op())?),
    }
}

fn config(stack: &LteStack, item: &str, value: Option<&str>) -> anyhow::Result<String> {
    let current = stack.config();
    if item == "show" && value.is_none() {
        let mut out = String::new();
        for (name, shown) in current.show() {
            let _ = writeln!(out, "{name}: {shown}");
        }
        return Ok(out);
    }
    let Some(value) = value else {
        let descriptor = find_item(item);
        let hint = descriptor.map(|d| d.kind.hint()).unwrap_or_default();
        return Ok(format!("{item}: {} ({hint})", current.get_item(item)?));
    };
    let mut next = (*current).clone();
    next.set_item(item, value)?;
    stack.set_config(next);
    Ok(format!("{item}: {}", stack.config().get_item(item)?))
}

fn info(stack: &LteStack) -> String {
    let id = stack.identity();
    let mut out = String::new();
    let _ = writeln!(out, "imei: {}", id.imei);
    let _ = writeln!(out, "imsi: {}", id.imsi);
    let _ = writeln!(out, "iccid: {}", id.iccid);
    let _ = writeln!(out, "firmware: {}", id.fw_version);
    out
}

fn state(stack: &LteStack) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "state: {}", stack.state());
    let _ = writeln!(out, "attached: {}", if stack.is_attached() { "yes" } else { "no" });

    match stack.registration_params() {
        Ok(reg) => {
            let _ = writeln!(out, "registration: {} ({})", reg.status, reg.status.describe());
            let _ = writeln!(out, "tac: {} cell: {:08X} act: {}", reg.tac, reg.cell_id, reg.act);
            if let (Some(active), Some(tau)) = (reg.active_time, reg.periodic_tau_ext) {
                let _ = writeln!(out, "psm active: {active} tau: {tau}");
            }
        }
        Err(_) => out.push_str("registration: n/a\n"),
    }

    match stack.conn_params() {
        Ok(p) => {
            let _ = writeln!(out, "coneval: {}", coneval_result_str(p.result));
            let _ = writeln!(
                out,
                "rsrp: {} dBm rsrq: {} dB snr: {} dB band: {} earfcn: {}",
                p.rsrp, p.rsrq, p.snr, p.band, p.earfcn
            );
            let _ = writeln!(out, "plmn: {} ce level: {} energy: {}", p.plmn, p.ce_level, p.energy_estimate);
        }
        Err(_) => out.push_str("coneval: n/a\n"),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LteConfig;
    use crate::testing::idle_stack;
    use std::time::Duration;

    fn parse(line: &str) -> ShellCommand {
        let args = std::iter::once("lte").chain(line.split_whitespace());
        Shell::try_parse_from(args).unwrap().command
    }

    #[test]
    fn parses_command_tree() {
        assert_eq!(
            parse("config apn iot.example"),
            ShellCommand::Config {
                item: "apn".into(),
                value: Some("iot.example".into())
            }
        );
        assert_eq!(
            parse("metrics --prometheus"),
            ShellCommand::Metrics { prometheus: true }
        );
        assert_eq!(
            parse("test uart disable"),
            ShellCommand::Test {
                op: TestCommand::Uart {
                    state: UartState::Disable
                }
            }
        );
        let ShellCommand::Test { op } = parse("test cmd AT+CFUN? extra") else {
            panic!("expected test command");
        };
        assert_eq!(op.op(), TestOp::Cmd("AT+CFUN? extra".into()));
    }

    #[test]
    fn unknown_commands_report_usage() {
        let (stack, _events) = idle_stack(LteConfig::default(), Duration::ZERO);
        let out = execute(&stack, "frobnicate");
        assert!(out.contains("Usage"), "{out}");
    }

    #[test]
    fn config_show_get_and_set() {
        let (stack, _events) = idle_stack(LteConfig::default(), Duration::ZERO);
        let all = execute(&stack, "config show");
        assert!(all.contains("plmnid: 23003"), "{all}");
        assert!(all.contains("attach-policy: progressive"), "{all}");

        assert!(execute(&stack, "config port").starts_with("port: 5003"));
        assert_eq!(execute(&stack, "config apn iot"), "apn: iot");
        assert_eq!(stack.config().apn, "iot");

        let out = execute(&stack, "config port 0");
        assert!(out.starts_with("command failed:"), "{out}");
        assert_eq!(stack.config().port, 5003);

        let out = execute(&stack, "config colour blue");
        assert!(out.starts_with("command failed:"), "{out}");
    }

    #[test]
    fn failures_carry_the_cause() {
        let (stack, _events) = idle_stack(LteConfig::default(), Duration::ZERO);
        let out = execute(&stack, "reconnect");
        assert!(out.starts_with("command failed: "), "{out}");
        let out = execute(&stack, "test reset");
        assert!(out.contains("test mode"), "{out}");
    }

    #[test]
    fn test_ops_run_on_the_worker() {
        let config = LteConfig {
            test: true,
            ..Default::default()
        };
        let (stack, _events) = idle_stack(config, Duration::ZERO);
        assert_eq!(execute(&stack, "test wakeup"), "Wakeup");
        assert_eq!(execute(&stack, "test cmd AT%XICCID"), "Cmd(\"AT%XICCID\")");
    }

    #[test]
    fn reports_render_without_data() {
        let (stack, _events) = idle_stack(LteConfig::default(), Duration::ZERO);
        let state = execute(&stack, "state");
        assert!(state.contains("state: disabled"), "{state}");
        assert!(state.contains("attached: no"), "{state}");
        assert!(state.contains("registration: n/a"), "{state}");

        let metrics = execute(&stack, "metrics");
        assert!(metrics.contains("\"uplink_count\": 0"), "{metrics}");
        assert!(execute(&stack, "metrics --prometheus").contains("lte_uplink_bytes_total 0"));
        assert!(execute(&stack, "info").contains("imei: 0"));
    }
}
