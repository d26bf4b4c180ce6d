//! Cache errors.

use thiserror::Error;

/// Failure modes for [`super::ResponseCache`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// `invalidate_by_prefix` was called with a prefix that does not start
    /// with `"<service>|"`. Rejected to prevent cross-service invalidation.
    #[error("prefix '{prefix}' is not scoped to service '{service}' (expected it to start with '{service}|')")]
    UnscopedPrefix {
        /// The offending prefix.
        prefix: String,
        /// The cache's own service name, for the error message.
        service: String,
    },
}
