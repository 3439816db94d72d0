//! # Metrics
//!
//! Counters accumulated by the worker and a Prometheus text renderer for
//! exporting them. All mutation goes through [`MetricsRecorder`], which
//! keeps the whole struct behind one lock so readers only ever see a
//! consistent snapshot.

use std::fmt::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Metrics {
    pub attach_count: u32,
    pub attach_fail_count: u32,
    pub attach_duration_ms: u64,
    /// Uptime in milliseconds at the end of the last successful attach.
    pub attach_last_ts: u64,
    pub attach_last_duration_ms: u64,

    pub uplink_count: u32,
    pub uplink_bytes: u64,
    pub uplink_errors: u32,
    pub uplink_last_ts: u64,

    pub downlink_count: u32,
    pub downlink_bytes: u64,
    pub downlink_errors: u32,
    pub downlink_last_ts: u64,

    /// Total time spent RRC-connected.
    pub cscon_1_duration_ms: u64,
    pub cscon_1_last_duration_ms: u64,
}

/// Shared metrics handle. Cloning shares the same counters.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    inner: Arc<Mutex<Inner>>,
    epoch: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    metrics: Metrics,
    attach_started: Option<Instant>,
    connected_since: Option<Instant>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        MetricsRecorder {
            inner: Arc::new(Mutex::new(Inner::default())),
            epoch: Instant::now(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn uptime_ms(&self, now: Instant) -> u64 {
        millis(now.saturating_duration_since(self.epoch))
    }

    pub fn snapshot(&self) -> Metrics {
        self.with(|i| i.metrics)
    }

    pub fn attach_started(&self) {
        self.with(|i| i.attach_started = Some(Instant::now()));
    }

    pub fn attach_succeeded(&self) {
        let now = Instant::now();
        let ts = self.uptime_ms(now);
        self.with(|i| {
            let m = &mut i.metrics;
            m.attach_count += 1;
            m.attach_last_ts = ts;
            if let Some(start) = i.attach_started.take() {
                let d = millis(now.saturating_duration_since(start));
                m.attach_duration_ms += d;
                m.attach_last_duration_ms = d;
            }
        });
    }

    pub fn attach_failed(&self) {
        self.with(|i| {
            i.metrics.attach_fail_count += 1;
            i.attach_started = None;
        });
    }

    pub fn uplink_sent(&self, bytes: usize) {
        let ts = self.uptime_ms(Instant::now());
        self.with(|i| {
            i.metrics.uplink_count += 1;
            i.metrics.uplink_bytes += bytes as u64;
            i.metrics.uplink_last_ts = ts;
        });
    }

    pub fn uplink_failed(&self) {
        self.with(|i| i.metrics.uplink_errors += 1);
    }

    pub fn downlink_received(&self, bytes: usize) {
        let ts = self.uptime_ms(Instant::now());
        self.with(|i| {
            i.metrics.downlink_count += 1;
            i.metrics.downlink_bytes += bytes as u64;
            i.metrics.downlink_last_ts = ts;
        });
    }

    pub fn downlink_failed(&self) {
        self.with(|i| i.metrics.downlink_errors += 1);
    }

    /// `+CSCON: 1`.
    pub fn radio_connected(&self) {
        self.with(|i| {
            i.connected_since.get_or_insert_with(Instant::now);
        });
    }

    /// `+CSCON: 0`.
    pub fn radio_idle(&self) {
        let now = Instant::now();
        self.with(|i| {
            if let Some(since) = i.connected_since.take() {
                let d = millis(now.saturating_duration_since(since));
                i.metrics.cscon_1_duration_ms += d;
                i.metrics.cscon_1_last_duration_ms = d;
            }
        });
    }
}

/// Render metrics in Prometheus text exposition format.
pub fn render_prometheus(m: &Metrics) -> String {
    let mut out = String::with_capacity(1024);

    let counters: [(&str, &str, u64); 11] = [
        ("lte_attach_total", "Successful network attaches.", m.attach_count.into()),
        ("lte_attach_failures_total", "Attach attempts that timed out.", m.attach_fail_count.into()),
        ("lte_attach_duration_ms_total", "Cumulative attach time in milliseconds.", m.attach_duration_ms),
        ("lte_uplink_messages_total", "Payloads sent.", m.uplink_count.into()),
        ("lte_uplink_bytes_total", "Payload bytes sent.", m.uplink_bytes),
        ("lte_uplink_errors_total", "Failed sends.", m.uplink_errors.into()),
        ("lte_downlink_messages_total", "Payloads received.", m.downlink_count.into()),
        ("lte_downlink_bytes_total", "Payload bytes received.", m.downlink_bytes),
        ("lte_downlink_errors_total", "Failed receives.", m.downlink_errors.into()),
        ("lte_rrc_connected_ms_total", "Cumulative RRC connected time in milliseconds.", m.cscon_1_duration_ms),
        ("lte_attach_last_timestamp_ms", "Uptime at the last successful attach.", m.attach_last_ts),
    ];
    for (name, help, value) in counters {
        let kind = if name.ends_with("_total") { "counter" } else { "gauge" };
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
        let _ = writeln!(out, "{name} {value}");
    }

    // ── Last-event gauges ───────────────────────────────────────────

    let _ = writeln!(out, "# HELP lte_attach_last_duration_ms Duration of the last attach.");
    let _ = writeln!(out, "# TYPE lte_attach_last_duration_ms gauge");
    let _ = writeln!(out, "lte_attach_last_duration_ms {}", m.attach_last_duration_ms);
    let _ = writeln!(out, "# HELP lte_rrc_connected_last_ms Duration of the last RRC connection.");
    let _ = writeln!(out, "# TYPE lte_rrc_connected_last_ms gauge");
    let _ = writeln!(out, "lte_rrc_connected_last_ms {}", m.cscon_1_last_duration_ms);

    out
}
