use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PlanCacheError>;

/// Errors surfaced by the plan cache.
#[derive(Debug, Error)]
pub enum PlanCacheError {
    /// Caller broke an API contract (e.g. saving or copying a one-shot
    /// source). Never retried.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// A fixed-result source produced a different result row shape after
    /// reanalysis. The source stays invalid; nothing is partially adopted.
    #[error("cached plan must not change result type")]
    ResultShapeChanged,
    /// Analysis or planning failed inside the external compiler.
    #[error("compiler error: {0}")]
    Compiler(String),
}
