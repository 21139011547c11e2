//! Prometheus metrics for the CSI driver
//!
//! Covers CSI operation outcomes and latency, data-path mount attempts and
//! lock contention. Backend request counters are emitted by `storage_api`
//! under the names re-exported here.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::error::DriverError;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: NFS mount attempts by candidate kind, NFS version and result
    pub const CSI_MOUNT_ATTEMPTS_TOTAL: &str = "csi_mount_attempts_total";
    /// Counter: Lock acquisitions that gave up waiting
    pub const CSI_LOCK_WAIT_TIMEOUTS_TOTAL: &str = "csi_lock_wait_timeouts_total";

    pub use storage_api::client::{BACKEND_REAUTH_TOTAL, BACKEND_REQUESTS_TOTAL};
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record one NFS mount attempt
pub fn record_mount_attempt(kind: &'static str, nfs_version: &'static str, success: bool) {
    counter!(
        names::CSI_MOUNT_ATTEMPTS_TOTAL,
        "kind" => kind,
        "nfs_version" => nfs_version,
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }

    /// Record the outcome of a driver result and pass it through.
    pub fn finish<T>(self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        match &result {
            Ok(_) => self.success(),
            Err(e) => self.failure(e.code_name()),
        }
        result
    }
}
