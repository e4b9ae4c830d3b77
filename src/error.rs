use crate::dataplane::DataplaneError;
use thiserror::Error;

/// Error type for reconciler operations.
///
/// Every variant is retriable: the store and pending deltas survive a failed
/// apply, and the next apply rebuilds whatever client failed and retries the
/// same desired state.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Dataplane(#[from] DataplaneError),

    #[error("status callback failed: {0}")]
    StatusCallback(String),
}
