//! Cancellation of in-flight fabric calls.

use fabric_api::{FabricError, FabricResult};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Runs one fabric call, abandoning it if `cancel` fires first.
///
/// A call that is abandoned may still have been applied by the fabric.
pub(crate) async fn guarded<T, F>(cancel: &CancellationToken, call: F) -> FabricResult<T>
where
    F: Future<Output = FabricResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(FabricError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FabricError::Cancelled),
        result = call => result,
    }
}
