//! Minimal run-time metrics sink.
//!
//! No exporter is bundled; the host process may register a raw callback
//! that receives name/value pairs as they are recorded.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::Arc;

pub const INSERTS: &str = "kmerdht_inserts_total";
pub const INSERT_COLLISIONS: &str = "kmerdht_insert_collisions_total";
pub const TABLE_FULL: &str = "kmerdht_table_full_total";
pub const LOOKUPS: &str = "kmerdht_lookups_total";
pub const LOOKUP_MISSES: &str = "kmerdht_lookup_misses_total";
pub const LOCAL_OCCUPIED: &str = "kmerdht_local_occupied_slots";
pub const PROBE_LENGTH: &str = "kmerdht_probe_length";

/// Signature for external collectors.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register a callback from C/other languages. Only the first registration
/// takes effect.
#[no_mangle]
pub unsafe extern "C" fn kmerdht_register_stats_callback(cb: StatsCallback) {
    let _ = CALLBACK.set(cb);
}

/// Forwarding recorder. Uses the callback **if** it was registered.
struct FfiRecorder;

/// Metric name kept NUL-terminated for the callback.
#[derive(Clone)]
struct FfiMetric {
    name: Arc<CString>,
}

impl FfiMetric {
    fn new(key: &Key) -> Self {
        // metric names are crate constants; an interior NUL would be a bug
        let name = CString::new(key.name()).unwrap_or_default();
        Self {
            name: Arc::new(name),
        }
    }

    fn emit(&self, value: u64) {
        if let Some(cb) = CALLBACK.get() {
            unsafe { cb(self.name.as_ptr(), value as c_ulonglong) };
        }
    }
}

impl Recorder for FfiRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(FfiMetric::new(key)))
    }
    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(FfiMetric::new(key)))
    }
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(FfiMetric::new(key)))
    }
}

impl metrics::CounterFn for FfiMetric {
    fn increment(&self, value: u64) {
        self.emit(value);
    }
    fn absolute(&self, value: u64) {
        self.emit(value);
    }
}

impl metrics::GaugeFn for FfiMetric {
    fn set(&self, value: f64) {
        self.emit(value as u64);
    }
    fn increment(&self, value: f64) {
        self.emit(value as u64);
    }
    fn decrement(&self, value: f64) {
        self.emit(value as u64);
    }
}

impl metrics::HistogramFn for FfiMetric {
    fn record(&self, value: f64) {
        self.emit(value as u64);
    }
}

/// Install exactly **once** – called from crate root. Leaves any recorder
/// the host installed first in place.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if metrics::set_global_recorder(FfiRecorder).is_ok() {
            metrics::describe_counter!(INSERTS, "records written");
            metrics::describe_counter!(INSERT_COLLISIONS, "claims lost to an occupied slot");
            metrics::describe_counter!(TABLE_FULL, "inserts rejected by a full table");
            metrics::describe_counter!(LOOKUPS, "find calls");
            metrics::describe_counter!(LOOKUP_MISSES, "find calls that returned nothing");
            metrics::describe_gauge!(LOCAL_OCCUPIED, "claimed slots in this rank's partition");
            metrics::describe_histogram!(PROBE_LENGTH, "slots visited per insert");
        }
    });
}
