use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static RECONCILE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static POD_OPERATION_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static POD_OPERATION_MAX: OnceLock<GaugeVec> = OnceLock::new();
static POD_OPERATION_MIN: OnceLock<GaugeVec> = OnceLock::new();

const POD_LABELS: &[&str] = &["operation", "namespace", "name", "status"];

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("gamedeployment".to_string()), None)
            .expect("failed to initialise gamedeployment metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register gamedeployment metric collector");
    collector
}

fn reconcile_total() -> &'static IntCounterVec {
    RECONCILE_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "reconcile_total",
            "Reconcile passes grouped by workload and result",
        );
        let counter = IntCounterVec::new(opts, &["namespace", "name", "status"])
            .expect("failed to build reconcile counter");
        register_collector(counter)
    })
}

fn reconcile_duration() -> &'static HistogramVec {
    RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "reconcile_duration_seconds",
            "Duration of reconcile passes grouped by workload and result",
        );
        let histogram = HistogramVec::new(opts, &["namespace", "name", "status"])
            .expect("failed to build reconcile histogram");
        register_collector(histogram)
    })
}

fn pod_operation_duration() -> &'static HistogramVec {
    POD_OPERATION_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "pod_operation_duration_seconds",
            "Duration of pod create, update and delete calls",
        );
        let histogram =
            HistogramVec::new(opts, POD_LABELS).expect("failed to build pod operation histogram");
        register_collector(histogram)
    })
}

fn pod_operation_max() -> &'static GaugeVec {
    POD_OPERATION_MAX.get_or_init(|| {
        let opts = Opts::new(
            "pod_operation_duration_seconds_max",
            "Longest pod operation seen",
        );
        let gauge = GaugeVec::new(opts, POD_LABELS).expect("failed to build pod operation gauge");
        register_collector(gauge)
    })
}

fn pod_operation_min() -> &'static GaugeVec {
    POD_OPERATION_MIN.get_or_init(|| {
        let opts = Opts::new(
            "pod_operation_duration_seconds_min",
            "Shortest pod operation seen",
        );
        let gauge = GaugeVec::new(opts, POD_LABELS).expect("failed to build pod operation gauge");
        register_collector(gauge)
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodOperation {
    Create,
    Update,
    Delete,
}

impl PodOperation {
    fn as_str(&self) -> &'static str {
        match self {
            PodOperation::Create => "create",
            PodOperation::Update => "update",
            PodOperation::Delete => "delete",
        }
    }
}

fn status_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

pub fn record_reconcile(namespace: &str, name: &str, success: bool, duration: Duration) {
    let labels = [namespace, name, status_label(success)];
    reconcile_total().with_label_values(&labels).inc();
    reconcile_duration()
        .with_label_values(&labels)
        .observe(duration.as_secs_f64());
}

pub fn record_pod_operation(
    operation: PodOperation,
    namespace: &str,
    name: &str,
    success: bool,
    duration: Duration,
) {
    let labels = [operation.as_str(), namespace, name, status_label(success)];
    let seconds = duration.as_secs_f64();
    pod_operation_duration()
        .with_label_values(&labels)
        .observe(seconds);

    let max = pod_operation_max().with_label_values(&labels);
    if seconds > max.get() {
        max.set(seconds);
    }
    // a fresh gauge reads zero
    let min = pod_operation_min().with_label_values(&labels);
    if min.get() == 0.0 || seconds < min.get() {
        min.set(seconds);
    }
}

/// Encode every registered metric in the prometheus text format.
pub fn gather() -> Result<Vec<u8>, prometheus::Error> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}
