//! Single-flight gate for restore entry points

use std::future::Future;

use tokio::sync::Mutex;
use tracing::warn;

/// Lets at most one restore run at a time
///
/// A second caller is turned away immediately instead of queueing behind
/// the running restore, since both would race for the same target file.
#[derive(Debug, Default)]
pub struct RestoreGate {
    inner: Mutex<()>,
}

impl RestoreGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` unless another one holds the gate
    pub async fn try_run<F, T>(&self, operation: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let Ok(_guard) = self.inner.try_lock() else {
            warn!("restore rejected, another restore is in progress");
            return None;
        };
        Some(operation.await)
    }

    /// Whether an operation currently holds the gate
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
