// Prometheus exporter setup and process-wide gauges.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use sysinfo::System;
use tokio::time::Duration;

use crate::metrics_consts::*;

/// Latency buckets, in seconds, shared by the ingest and worker
/// histograms. Part of the scrape ABI.
const LATENCY_SECONDS: &[f64] = &[0.25, 0.5, 0.75, 1.0, 1.25, 1.5, 2.0, 3.0, 5.0, 8.0, 11.0];

pub fn report_event_error(kind: &'static str) {
    counter!(EVENT_ERRORS, "kind" => kind).increment(1);
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(INGEST_LATENCY.to_string()), LATENCY_SECONDS)
        .expect("latency buckets must not be empty")
        .set_buckets_for_metric(Matcher::Full(WORKER_LATENCY.to_string()), LATENCY_SECONDS)
        .expect("latency buckets must not be empty")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

/// Publishes the static gauges and zeroes every error-counter label so
/// the series exist before the first increment.
pub fn init_metrics(queue_size: usize) {
    gauge!(QUEUE_SIZE).set(queue_size as f64);
    gauge!(
        BUILD_INFO,
        "version" => env!("CARGO_PKG_VERSION"),
        "os" => std::env::consts::OS,
        "arch" => std::env::consts::ARCH,
        "commit" => option_env!("GIT_COMMIT").unwrap_or("unknown"),
        "branch" => option_env!("GIT_BRANCH").unwrap_or("unknown"),
    )
    .set(1.0);
    for kind in EVENT_ERROR_KINDS {
        counter!(EVENT_ERRORS, "kind" => kind).increment(0);
    }
}

/// Samples host load, memory, and CPU gauges every 5 seconds. Spawned as
/// its own task; never exits.
pub async fn run_host_metrics() {
    let mut sys = System::new();
    loop {
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let load = System::load_average();
        gauge!(HOST_LOAD_ONE).set(load.one);
        gauge!(HOST_LOAD_FIVE).set(load.five);
        gauge!(HOST_LOAD_FIFTEEN).set(load.fifteen);

        gauge!(HOST_MEM_TOTAL).set(sys.total_memory() as f64);
        gauge!(HOST_MEM_AVAILABLE).set(sys.available_memory() as f64);
        gauge!(HOST_MEM_USED).set(sys.used_memory() as f64);
        gauge!(HOST_CPU_USED_PCT).set(f64::from(sys.global_cpu_info().cpu_usage()));

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
