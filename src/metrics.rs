//! Metrics for APIService availability
//!
//! Provides OpenTelemetry metrics for:
//! - Per-APIService unavailability (0/1 gauge)
//! - Persisted transitions to unavailable (counter)
//! - Reconcile pass duration (histogram)

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, ObservableGauge};
use opentelemetry::KeyValue;

/// Global meter for availability metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("apiservice-availability"));

/// Counter of transitions to unavailable that were written to the API server
///
/// Labels:
/// - `name`: APIService name
/// - `reason`: condition reason
pub static UNAVAILABLE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("aggregator_unavailable_apiservice_total")
        .with_description("Total number of APIServices which are marked as unavailable")
        .with_unit("{transitions}")
        .build()
});

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("aggregator_availability_reconcile_duration_seconds")
        .with_description("Duration of APIService availability reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Process-wide gauge: 1 for each APIService last computed as unavailable
pub static UNAVAILABLE_APISERVICES: Lazy<Arc<UnavailabilityGauge>> =
    Lazy::new(|| Arc::new(UnavailabilityGauge::new()));

/// Per-APIService unavailability gauge
///
/// Values live in a map that an observable gauge reads at collection time,
/// so a deleted APIService's series disappears instead of freezing at its
/// last value.
pub struct UnavailabilityGauge {
    values: Arc<DashMap<String, i64>>,
    _instrument: ObservableGauge<i64>,
}

impl std::fmt::Debug for UnavailabilityGauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnavailabilityGauge")
            .field("series", &self.values.len())
            .finish()
    }
}

impl Default for UnavailabilityGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl UnavailabilityGauge {
    /// Create a gauge and register it with the global meter
    pub fn new() -> Self {
        let values: Arc<DashMap<String, i64>> = Arc::new(DashMap::new());
        let observed = Arc::clone(&values);
        let instrument = METER
            .i64_observable_gauge("aggregator_unavailable_apiservice")
            .with_description("Gauge of APIServices which are marked as unavailable")
            .with_unit("{apiservices}")
            .with_callback(move |observer| {
                for entry in observed.iter() {
                    observer.observe(*entry.value(), &[KeyValue::new("name", entry.key().clone())]);
                }
            })
            .build();

        Self {
            values,
            _instrument: instrument,
        }
    }

    /// Record the outcome of a pass
    pub fn set_unavailable(&self, name: &str, unavailable: bool) {
        self.values
            .insert(name.to_string(), if unavailable { 1 } else { 0 });
    }

    /// Current value for an APIService, if it has been observed
    pub fn value(&self, name: &str) -> Option<i64> {
        self.values.get(name).map(|v| *v)
    }

    /// Drop the series of a deleted APIService
    pub fn forget(&self, name: &str) {
        self.values.remove(name);
    }

    /// Keep only the series whose name matches `keep`
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.values.retain(|name, _| keep(name));
    }

    /// Number of tracked APIServices
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no APIService is tracked
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Record a persisted transition to unavailable
pub fn record_unavailable_transition(name: &str, reason: &str) {
    UNAVAILABLE_TRANSITIONS.add(
        1,
        &[
            KeyValue::new("name", name.to_string()),
            KeyValue::new("reason", reason.to_string()),
        ],
    );
}

/// Times a reconcile pass
pub struct ReconcileTimer {
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a pass
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        self.record("success");
    }

    /// Record error completion
    pub fn error(self) {
        self.record("error");
    }

    fn record(self, result: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", result)],
        );
    }
}
