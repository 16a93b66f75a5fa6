//! HTTP endpoints for probes and metrics
//!
//! Serves `/healthz`, `/readyz` and the Prometheus `/metrics` scrape target.

mod server;

pub use server::{router, run_server};
