//! Shared metrics recording for `SQLite` backends.

use crate::Result;
use std::time::Instant;

/// Records operation metrics for a storage call.
///
/// Emits `storage_operations_total` and `storage_operation_duration_ms`,
/// labelled by table and operation.
pub fn record_operation_metrics(
    table: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "table" => table,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "table" => table,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Runs `call` and records its outcome with [`record_operation_metrics`].
pub fn timed<T>(
    table: &'static str,
    operation: &'static str,
    call: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let start = Instant::now();
    let result = call();
    let status = if result.is_ok() { "success" } else { "error" };
    record_operation_metrics(table, operation, start, status);
    result
}
