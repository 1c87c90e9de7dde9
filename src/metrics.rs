//! Process-wide self metrics, exposed at `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        registry.register(Box::new(CONFIG_RELOAD_SUCCESS.clone())).unwrap();
        registry.register(Box::new(SCRAPE_DURATION.clone())).unwrap();
        registry.register(Box::new(SCRAPES.clone())).unwrap();
        registry.register(Box::new(SNAPSHOTS_APPENDED.clone())).unwrap();
        registry.register(Box::new(SNAPSHOTS_DISCARDED.clone())).unwrap();
        registry.register(Box::new(RETENTION_DURATION.clone())).unwrap();
        registry.register(Box::new(RETENTION_RUNS.clone())).unwrap();
        registry.register(Box::new(CACHE_HITS.clone())).unwrap();
        registry.register(Box::new(CACHE_MISSES.clone())).unwrap();
        registry.register(Box::new(HTTP_REQUESTS.clone())).unwrap();
        registry
    };
    pub static ref CONFIG_RELOAD_SUCCESS: IntGauge = IntGauge::new(
        "topoviz_config_last_reload_successful",
        "Whether the last configuration reload attempt was successful."
    )
    .unwrap();
    pub static ref SCRAPE_DURATION: Histogram = Histogram::with_opts(HistogramOpts::new(
        "topoviz_scrape_duration_seconds",
        "Time spent generating one graph snapshot."
    ))
    .unwrap();
    pub static ref SCRAPES: IntCounterVec = IntCounterVec::new(
        Opts::new("topoviz_scrapes_total", "Number of scrape rounds by result."),
        &["result"]
    )
    .unwrap();
    pub static ref SNAPSHOTS_APPENDED: IntCounter = IntCounter::new(
        "topoviz_storage_snapshots_appended_total",
        "Number of snapshots appended to storage."
    )
    .unwrap();
    pub static ref SNAPSHOTS_DISCARDED: IntCounter = IntCounter::new(
        "topoviz_storage_snapshots_discarded_total",
        "Number of snapshots dropped for arriving behind the current chunk."
    )
    .unwrap();
    pub static ref RETENTION_DURATION: Histogram = Histogram::with_opts(HistogramOpts::new(
        "topoviz_retention_sweep_duration_seconds",
        "Time spent sweeping expired blocks from storage."
    ))
    .unwrap();
    pub static ref RETENTION_RUNS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "topoviz_retention_sweeps_total",
            "Number of retention sweeps by result."
        ),
        &["result"]
    )
    .unwrap();
    pub static ref CACHE_HITS: IntCounter = IntCounter::new(
        "topoviz_cache_hits_total",
        "Number of chunk cache hits."
    )
    .unwrap();
    pub static ref CACHE_MISSES: IntCounter = IntCounter::new(
        "topoviz_cache_misses_total",
        "Number of chunk cache misses."
    )
    .unwrap();
    pub static ref HTTP_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "topoviz_http_requests_total",
            "Number of handled HTTP requests by handler and status code."
        ),
        &["handler", "code"]
    )
    .unwrap();
}
