//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::{
    self, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;

/// Registry shared between the session loops and the `/metrics` route.
pub type SharedRegistry = Arc<Registry>;

/// Create an empty registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every metric family in the Prometheus text format.
pub fn render(registry: &Registry) -> prometheus::Result<String> {
    TextEncoder::new().encode_to_string(&registry.gather())
}

const JITTER_WINDOW: usize = 4_096;

/// Rolling window of tick jitter samples.
#[derive(Debug)]
pub struct JitterHistogram {
    samples: Mutex<VecDeque<f64>>,
    capacity: usize,
}

impl Default for JitterHistogram {
    fn default() -> Self {
        Self::with_capacity(JITTER_WINDOW)
    }
}

impl JitterHistogram {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, jitter: Duration) {
        let micros = jitter.as_secs_f64() * 1_000_000.0;
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(micros);
    }

    pub fn summary(&self) -> Option<JitterSummary> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let count = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / count;
        let variance = if samples.len() > 1 {
            samples
                .iter()
                .map(|value| {
                    let delta = value - mean;
                    delta * delta
                })
                .sum::<f64>()
                / (count - 1.0)
        } else {
            0.0
        };
        Some(JitterSummary {
            mean_us: mean,
            std_dev_us: variance.sqrt(),
            max_us: samples.iter().copied().fold(f64::MIN, f64::max),
            min_us: samples.iter().copied().fold(f64::MAX, f64::min),
            samples: samples.len() as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JitterSummary {
    pub mean_us: f64,
    pub std_dev_us: f64,
    pub max_us: f64,
    pub min_us: f64,
    pub samples: u64,
}

/// Measures tick intervals against a target period.
#[derive(Debug)]
pub struct LoopTimingReporter {
    target_interval: Duration,
    last_tick: Mutex<Option<Instant>>,
    histogram: JitterHistogram,
}

impl LoopTimingReporter {
    pub fn new(target_interval: Duration) -> Self {
        Self {
            target_interval,
            last_tick: Mutex::new(None),
            histogram: JitterHistogram::default(),
        }
    }

    /// Record a tick now. Returns the absolute jitter once a previous tick exists.
    pub fn record_tick(&self) -> Option<Duration> {
        self.record_tick_at(Instant::now())
    }

    pub fn record_tick_at(&self, now: Instant) -> Option<Duration> {
        let mut last_tick = self.last_tick.lock();
        let jitter = last_tick.map(|previous| {
            let actual = now.saturating_duration_since(previous);
            if actual > self.target_interval {
                actual - self.target_interval
            } else {
                self.target_interval - actual
            }
        });
        if let Some(jitter) = jitter {
            self.histogram.record(jitter);
        }
        *last_tick = Some(now);
        jitter
    }

    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    pub fn histogram(&self) -> &JitterHistogram {
        &self.histogram
    }
}

/// Counters and gauges published by a teleoperation server.
#[derive(Clone)]
pub struct TeleopMetrics {
    envelopes_received: IntCounterVec,
    protocol_errors: IntCounterVec,
    admission_drops: IntCounterVec,
    safety_alerts: IntCounterVec,
    control_frames_coalesced: IntCounter,
    state_frames_sent: IntCounter,
    state_frames_dropped: IntCounter,
    heartbeats_answered: IntCounter,
    active_connections: IntGauge,
    tick_jitter: Histogram,
    last_tick_jitter_us: IntGauge,
}

impl TeleopMetrics {
    /// Register all teleoperation metrics with `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let envelopes_received = IntCounterVec::new(
            Opts::new(
                "teleop_envelopes_received_total",
                "Envelopes decoded from the operator, by message type",
            ),
            &["msg_type"],
        )?;
        registry.register(Box::new(envelopes_received.clone()))?;

        let protocol_errors = IntCounterVec::new(
            Opts::new(
                "teleop_protocol_errors_total",
                "Inbound messages dropped because they failed to decode",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(protocol_errors.clone()))?;

        let admission_drops = IntCounterVec::new(
            Opts::new(
                "teleop_control_frames_dropped_total",
                "Control frames refused at admission, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(admission_drops.clone()))?;

        let safety_alerts = IntCounterVec::new(
            Opts::new(
                "teleop_safety_alerts_total",
                "Safety alerts raised by the target filter",
            ),
            &["alert"],
        )?;
        registry.register(Box::new(safety_alerts.clone()))?;

        let control_frames_coalesced = IntCounter::new(
            "teleop_control_frames_coalesced_total",
            "Control frames replaced in the mailbox before the tick read them",
        )?;
        registry.register(Box::new(control_frames_coalesced.clone()))?;

        let state_frames_sent = IntCounter::new(
            "teleop_state_frames_sent_total",
            "State frames queued for the operator",
        )?;
        registry.register(Box::new(state_frames_sent.clone()))?;

        let state_frames_dropped = IntCounter::new(
            "teleop_state_frames_dropped_total",
            "State frames skipped because the outbound queue was full",
        )?;
        registry.register(Box::new(state_frames_dropped.clone()))?;

        let heartbeats_answered = IntCounter::new(
            "teleop_heartbeats_answered_total",
            "Heartbeat acknowledgements sent",
        )?;
        registry.register(Box::new(heartbeats_answered.clone()))?;

        let active_connections = IntGauge::new(
            "teleop_active_connections",
            "Operator connections currently attached to the engine",
        )?;
        registry.register(Box::new(active_connections.clone()))?;

        let tick_jitter = Histogram::with_opts(
            HistogramOpts::new(
                "teleop_control_tick_jitter_seconds",
                "Absolute deviation of control tick intervals from the target period",
            )
            .buckets(prometheus::exponential_buckets(0.000_05, 2.0, 14)?),
        )?;
        registry.register(Box::new(tick_jitter.clone()))?;

        let last_tick_jitter_us = IntGauge::new(
            "teleop_control_tick_jitter_last_us",
            "Jitter of the most recent control tick in microseconds",
        )?;
        registry.register(Box::new(last_tick_jitter_us.clone()))?;

        Ok(Self {
            envelopes_received,
            protocol_errors,
            admission_drops,
            safety_alerts,
            control_frames_coalesced,
            state_frames_sent,
            state_frames_dropped,
            heartbeats_answered,
            active_connections,
            tick_jitter,
            last_tick_jitter_us,
        })
    }

    pub fn record_envelope(&self, msg_type: &str) {
        self.envelopes_received.with_label_values(&[msg_type]).inc();
    }

    pub fn record_protocol_error(&self, kind: &str) {
        self.protocol_errors.with_label_values(&[kind]).inc();
    }

    pub fn record_admission_drop(&self, reason: &str) {
        self.admission_drops.with_label_values(&[reason]).inc();
    }

    pub fn record_safety_alert(&self, alert: &str) {
        self.safety_alerts.with_label_values(&[alert]).inc();
    }

    pub fn record_coalesced(&self) {
        self.control_frames_coalesced.inc();
    }

    pub fn record_state_frame(&self, delivered: bool) {
        if delivered {
            self.state_frames_sent.inc();
        } else {
            self.state_frames_dropped.inc();
        }
    }

    pub fn record_heartbeat_ack(&self) {
        self.heartbeats_answered.inc();
    }

    pub fn connection_opened(&self) {
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    pub fn observe_tick_jitter(&self, jitter: Duration) {
        self.tick_jitter.observe(jitter.as_secs_f64());
        self.last_tick_jitter_us
            .set(i64::try_from(jitter.as_micros()).unwrap_or(i64::MAX));
    }
}

impl std::fmt::Debug for TeleopMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeleopMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_measures_deviation_from_target() {
        let reporter = LoopTimingReporter::new(Duration::from_millis(10));
        let start = Instant::now();
        assert_eq!(reporter.record_tick_at(start), None);
        let jitter = reporter.record_tick_at(start + Duration::from_millis(12));
        assert_eq!(jitter, Some(Duration::from_millis(2)));
        let jitter = reporter.record_tick_at(start + Duration::from_millis(19));
        assert_eq!(jitter, Some(Duration::from_millis(3)));
        let summary = reporter.histogram().summary().unwrap();
        assert_eq!(summary.samples, 2);
        assert!((summary.mean_us - 2_500.0).abs() < 1e-6);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let histogram = JitterHistogram::with_capacity(3);
        for micros in [1, 2, 3, 4, 5] {
            histogram.record(Duration::from_micros(micros));
        }
        let summary = histogram.summary().unwrap();
        assert_eq!(summary.samples, 3);
        assert!((summary.min_us - 3.0).abs() < 1e-6);
    }

    #[test]
    fn metrics_render_in_text_format() {
        let registry = new_registry();
        let metrics = TeleopMetrics::new(&registry).unwrap();
        metrics.record_envelope("heartbeat");
        metrics.record_admission_drop("clutch_released");
        metrics.record_state_frame(true);
        let text = render(&registry).unwrap();
        assert!(text.contains("teleop_envelopes_received_total{msg_type=\"heartbeat\"} 1"));
        assert!(text.contains("teleop_control_frames_dropped_total{reason=\"clutch_released\"} 1"));
        assert!(text.contains("teleop_state_frames_sent_total 1"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = new_registry();
        TeleopMetrics::new(&registry).unwrap();
        assert!(TeleopMetrics::new(&registry).is_err());
    }
}
