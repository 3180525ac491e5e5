//! Metric names exposed to the Prometheus scrape. These are part of the
//! external ABI; dashboards and alerts depend on them verbatim.

pub const INGESTED_EVENTS: &str = "ingested_events";
pub const EVENT_ERRORS: &str = "event_errors";
pub const RATE_LIMITER_DROPS: &str = "rate_limiter_drops";

pub const QUEUE_SIZE: &str = "queue_size";
pub const QUEUE_UTILIZATION: &str = "queue_utilization";
pub const BUILD_INFO: &str = "build_info";

pub const INGEST_LATENCY: &str = "ingest_latency";
pub const WORKER_LATENCY: &str = "worker_latency";

pub const HOST_LOAD_ONE: &str = "host_load_one";
pub const HOST_LOAD_FIVE: &str = "host_load_five";
pub const HOST_LOAD_FIFTEEN: &str = "host_load_fifteen";
pub const HOST_MEM_TOTAL: &str = "host_mem_total";
pub const HOST_MEM_AVAILABLE: &str = "host_mem_available";
pub const HOST_MEM_USED: &str = "host_mem_used";
pub const HOST_CPU_USED_PCT: &str = "host_cpu_used_pct";

/// Every `kind` label the `event_errors` counter is reported with.
pub const EVENT_ERROR_KINDS: [&str; 6] = [
    "parse",
    "enrich",
    "enqueue",
    "salt",
    "save",
    "queue_full",
];
