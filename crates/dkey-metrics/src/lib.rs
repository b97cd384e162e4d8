//! Metrics declarations for the digital key BLE engine.
//!
//! Every metric the engine records is declared here as a [`Metric`] constant
//! so names and label keys live in one place. The `metrics` crate is
//! re-exported; install any recorder and call [`describe_metrics`] once.
//!
//! # Example
//!
//! ```rust,ignore
//! use dkey_metrics::{metric_defs, describe_metrics, SessionLabels};
//!
//! describe_metrics();
//!
//! let labels = SessionLabels::new("LSVAU2180N2183294");
//! metrics::counter!(
//!     metric_defs::FRAMES_TX.name,
//!     &labels.with(&[("command_type", "control".to_string())])
//! )
//! .increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// How a metric is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Only ever incremented.
    Counter,
    /// Set to the latest value.
    Gauge,
    /// Sampled into a distribution.
    Histogram,
}

impl MetricKind {
    /// Lowercase name, as printed by `dkey-sim metrics`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name, kind and metadata of one engine metric.
///
/// ```rust
/// use dkey_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const WRITES: Metric = Metric::counter("dkey.test.writes")
///     .with_description("Transport writes")
///     .with_unit(Unit::Count)
///     .with_labels(&["vehicle"]);
///
/// assert_eq!(WRITES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "dkey.ble.frames_tx").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn with_kind(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declare a counter.
    pub const fn counter(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Counter)
    }

    /// Declare a gauge.
    pub const fn gauge(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Gauge)
    }

    /// Declare a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Histogram)
    }

    /// Attach a description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Attach a unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Attach the label keys recorded with this metric.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(self.name, unit, self.description),
            (MetricKind::Counter, None) => describe_counter!(self.name, self.description),
            (MetricKind::Gauge, Some(unit)) => describe_gauge!(self.name, unit, self.description),
            (MetricKind::Gauge, None) => describe_gauge!(self.name, self.description),
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description)
            }
            (MetricKind::Histogram, None) => describe_histogram!(self.name, self.description),
        }
    }
}

/// All metric definitions for the engine.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Externally visible status transitions.
    ///
    /// Labels: vehicle, status
    pub const STATUS_TRANSITIONS: Metric = Metric::counter("dkey.ble.status_transitions")
        .with_description("BLE status transitions reported to the application")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle", "status"]);

    /// Connection attempts that failed at the radio layer.
    pub const CONNECT_FAILURES: Metric = Metric::counter("dkey.ble.connect_failures")
        .with_description("Connection attempts refused or failed by the transport")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle"]);

    // ========================================================================
    // Handshake
    // ========================================================================

    /// Handshakes started.
    pub const HANDSHAKE_STARTED: Metric = Metric::counter("dkey.ble.handshake_started")
        .with_description("Authentication handshakes started")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle"]);

    /// Handshakes finished, by outcome.
    ///
    /// Labels: vehicle, outcome (success|rejected|timeout|cancelled)
    pub const HANDSHAKE_COMPLETED: Metric = Metric::counter("dkey.ble.handshake_completed")
        .with_description("Authentication handshakes finished, by outcome")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle", "outcome"]);

    /// Time from auth-start to a definitive outcome.
    pub const HANDSHAKE_DURATION: Metric = Metric::histogram("dkey.ble.handshake_duration_ms")
        .with_description("Time from auth-start to a definitive handshake outcome")
        .with_unit(Unit::Milliseconds)
        .with_labels(&["vehicle"]);

    // ========================================================================
    // Dispatcher
    // ========================================================================

    /// Frames written to the transport.
    ///
    /// Labels: vehicle, command_type
    pub const FRAMES_TX: Metric = Metric::counter("dkey.ble.frames_tx")
        .with_description("Frames written to the transport")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle", "command_type"]);

    /// Frames received and decoded.
    ///
    /// Labels: vehicle, command_type
    pub const FRAMES_RX: Metric = Metric::counter("dkey.ble.frames_rx")
        .with_description("Frames received and decoded")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle", "command_type"]);

    /// Inbound frames that failed to decode.
    ///
    /// Labels: vehicle, kind
    pub const DECODE_ERRORS: Metric = Metric::counter("dkey.ble.decode_errors")
        .with_description("Inbound frames dropped because they failed to decode")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle", "kind"]);

    /// Outbound commands refused before reaching the transport.
    ///
    /// Labels: vehicle, reason
    pub const SEND_REJECTED: Metric = Metric::counter("dkey.ble.send_rejected")
        .with_description("Outbound commands refused before reaching the transport")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle", "reason"]);

    /// Frames waiting behind the in-flight write.
    pub const TX_QUEUE_DEPTH: Metric = Metric::gauge("dkey.ble.tx_queue_depth")
        .with_description("Encoded frames waiting behind the in-flight write")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle"]);

    /// Encoded outbound frame size.
    pub const TX_FRAME_SIZE: Metric = Metric::histogram("dkey.ble.tx_frame_size_bytes")
        .with_description("Encoded outbound frame size in bytes")
        .with_unit(Unit::Bytes)
        .with_labels(&["vehicle", "command_type"]);

    // ========================================================================
    // Calibration & Region
    // ========================================================================

    /// Calibration values submitted.
    ///
    /// Labels: vehicle, kind (pe|ps)
    pub const CALIBRATION_SUBMITTED: Metric = Metric::counter("dkey.ble.calibration_submitted")
        .with_description("Calibration values submitted to the vehicle")
        .with_unit(Unit::Count)
        .with_labels(&["vehicle", "kind"]);

    /// Region transitions observed.
    ///
    /// Labels: region
    pub const REGION_TRANSITIONS: Metric = Metric::counter("dkey.region.transitions")
        .with_description("Geofence region transitions")
        .with_unit(Unit::Count)
        .with_labels(&["region"]);

    /// Wake-up attempts started.
    pub const WAKE_REQUESTS: Metric = Metric::counter("dkey.region.wake_requests")
        .with_description("Proactive wake-up connection attempts")
        .with_unit(Unit::Count);

    /// Every metric above.
    pub const ALL: &[&Metric] = &[
        // Session Lifecycle
        &STATUS_TRANSITIONS,
        &CONNECT_FAILURES,
        // Handshake
        &HANDSHAKE_STARTED,
        &HANDSHAKE_COMPLETED,
        &HANDSHAKE_DURATION,
        // Dispatcher
        &FRAMES_TX,
        &FRAMES_RX,
        &DECODE_ERRORS,
        &SEND_REJECTED,
        &TX_QUEUE_DEPTH,
        &TX_FRAME_SIZE,
        // Calibration & Region
        &CALIBRATION_SUBMITTED,
        &REGION_TRANSITIONS,
        &WAKE_REQUESTS,
    ];
}

/// Labels identifying the vehicle a session talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLabels {
    /// Vehicle identifier (VIN or peripheral name).
    pub vehicle: String,
}

impl SessionLabels {
    /// Create labels for a vehicle.
    pub fn new(vehicle: impl Into<String>) -> Self {
        Self {
            vehicle: vehicle.into(),
        }
    }

    /// Labels as `(key, value)` pairs.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("vehicle", self.vehicle.clone())]
    }

    /// Session labels followed by `extra`.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        self.to_labels().into_iter().chain(extra.iter().cloned()).collect()
    }
}

/// Register every description in [`metric_defs::ALL`] with the current recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_labels() {
        let labels = SessionLabels::new("VIN123");
        assert_eq!(labels.to_labels(), vec![("vehicle", "VIN123".to_string())]);

        let extended = labels.with(&[("command_type", "control".to_string())]);
        assert_eq!(extended.len(), 2);
        assert!(extended.contains(&("command_type", "control".to_string())));
    }

    #[test]
    fn test_metric_definitions() {
        assert_eq!(metric_defs::FRAMES_TX.name, "dkey.ble.frames_tx");
        assert_eq!(metric_defs::FRAMES_TX.kind, MetricKind::Counter);
        assert_eq!(metric_defs::TX_QUEUE_DEPTH.kind, MetricKind::Gauge);
        assert_eq!(metric_defs::HANDSHAKE_DURATION.kind, MetricKind::Histogram);
        assert_eq!(metric_defs::HANDSHAKE_DURATION.unit, Some(Unit::Milliseconds));
    }

    #[test]
    fn test_all_metrics_unique() {
        let mut names: Vec<_> = metric_defs::ALL.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), metric_defs::ALL.len());
    }

    #[test]
    fn test_metric_minimal() {
        const MINIMAL: Metric = Metric::counter("minimal");

        assert_eq!(MINIMAL.description, "");
        assert_eq!(MINIMAL.unit, None);
        assert_eq!(MINIMAL.labels, &[] as &[&str]);
    }

    #[test]
    fn test_describe_without_recorder() {
        // No recorder installed: describing is a no-op and must not panic.
        describe_metrics();
    }
}
