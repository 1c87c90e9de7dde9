//! Topoviz periodically scrapes one or more Prometheus-compatible
//! back-ends, turns the resulting time-series vectors into a Vizceral
//! service-topology graph, stores every rendering as a time-indexed
//! snapshot and serves the latest (or a past) snapshot over HTTP.
//!
//! # Data layout
//!
//! Snapshots are grouped into chunks, each covering a fixed time bucket.
//! The chunk currently being written lives in memory; on bucket rollover
//! it is flagged completed and persisted as a single JSON file below a
//! block directory (`<dbDir>/<blockTs>/<chunkID>.json`). A retention
//! worker removes expired block directories.
//!
//! # Components
//!
//! * [`model`] - the Vizceral graph shape and timestamped snapshots.
//! * [`storage`] - chunk container plus the single-writer/multi-reader
//!   disk engine.
//! * [`cache`] - a bounded LRU over completed chunks for past reads.
//! * [`retrieval`] - the scrape loop, query fan-out and graph assembly.
//! * [`api`] - the HTTP surface (`/graph`, `/reload`, `/metrics`).

pub mod api;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod model;
pub mod retrieval;
pub mod storage;
pub mod tools;
