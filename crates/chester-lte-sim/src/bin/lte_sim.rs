use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chester_lte::{FsmState, LteConfig, LteStack, SendRecvRequest};
use chester_lte_sim::{scenario, ScriptedLink, ScriptedRfMux, Step};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);
const UPLINK: &[u8] = b"hello";
const DOWNLINK: &[u8] = b"pong";

#[derive(Parser, Debug)]
#[command(name = "lte-sim", about = "Run the LTE stack against a scripted modem")]
struct Cli {
    /// TOML configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play one scenario and print the resulting metrics as JSON.
    Run {
        #[arg(value_enum)]
        scenario: Scenario,
    },
    /// Attach, then run one `lte` shell command and print its output.
    Shell {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        line: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    /// Bring-up to an open socket.
    Attach,
    /// One uplink without a response, then PSM sleep.
    Send,
    /// Uplink, downlink, then PSM sleep.
    SendRecv,
    /// Network without PSM: flight mode on inactivity, re-attach on demand.
    NoPsm,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            LteConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => LteConfig::default(),
    };
    if config.test {
        bail!("the simulator drives the state machine; disable test mode");
    }

    match cli.command {
        Command::Run { scenario } => {
            let metrics = run(&config, scenario)?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Command::Shell { line } => {
            let (link, mut stack) = start(&config, scenario::attach(&config, true))?;
            println!("{}", chester_lte::shell::execute(&stack, &line.join(" ")));
            link.push(scenario::sleep());
            stack.shutdown();
            check(&link)?;
        }
    }
    Ok(())
}

fn start(config: &LteConfig, script: Vec<Step>) -> Result<(Arc<ScriptedLink>, LteStack)> {
    let link = ScriptedLink::new(script);
    let stack = LteStack::new(link.clone(), Box::new(ScriptedRfMux::new()), config.clone())?;
    stack.enable()?;
    stack
        .wait_for_connected(CONNECT_TIMEOUT)
        .context("modem did not connect")?;
    info!(state = %stack.state(), "connected");
    Ok((link, stack))
}

fn run(config: &LteConfig, scenario: Scenario) -> Result<chester_lte::Metrics> {
    use chester_lte_sim::scenario::*;

    let window = config.timing.recv_window;
    let script = match scenario {
        Scenario::Attach => attach(config, true),
        Scenario::Send => [
            attach(config, true),
            health(true),
            send(UPLINK, true, false),
            coneval(),
            psm_sleep(),
        ]
        .concat(),
        Scenario::SendRecv => [
            attach(config, true),
            health(true),
            send(UPLINK, true, true),
            recv(window, DOWNLINK, true),
            coneval(),
            psm_sleep(),
        ]
        .concat(),
        Scenario::NoPsm => [
            attach(config, false),
            flight_mode(),
            leave_flight_mode(config, false),
            health(false),
            send(UPLINK, true, false),
            coneval(),
            flight_mode(),
        ]
        .concat(),
    };

    let (link, mut stack) = start(config, script)?;
    match scenario {
        Scenario::Attach => {}
        Scenario::Send => {
            stack.send_recv(SendRecvRequest::send(UPLINK, TRANSFER_TIMEOUT))?;
        }
        Scenario::SendRecv => {
            let mut buf = [0u8; 64];
            let n = stack.send_recv(SendRecvRequest::send(UPLINK, TRANSFER_TIMEOUT).with_recv(&mut buf))?;
            info!(reply = %String::from_utf8_lossy(&buf[..n]), "downlink received");
        }
        Scenario::NoPsm => {
            wait_until(TRANSFER_TIMEOUT, || stack.state() == FsmState::Sleep)
                .context("modem did not enter flight mode")?;
            stack.send_recv(SendRecvRequest::send(UPLINK, TRANSFER_TIMEOUT))?;
        }
    }

    let settled = match scenario {
        Scenario::Attach => FsmState::Ready,
        Scenario::Send | Scenario::SendRecv | Scenario::NoPsm => FsmState::Sleep,
    };
    wait_until(TRANSFER_TIMEOUT, || {
        link.is_finished()
            && stack.state() == settled
            && (settled != FsmState::Sleep || !link.is_enabled())
    })
        .with_context(|| format!("{} scripted steps left", link.remaining()))?;
    let metrics = stack.metrics();
    // Shutdown from Ready puts the modem to sleep first.
    if settled == FsmState::Ready {
        link.push(sleep());
    }
    stack.shutdown();
    check(&link)?;
    Ok(metrics)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            bail!("timed out after {timeout:?}");
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn check(link: &ScriptedLink) -> Result<()> {
    let mismatches = link.mismatches();
    if !mismatches.is_empty() {
        bail!("conversation left the script:\n{}", mismatches.join("\n"));
    }
    Ok(())
}
