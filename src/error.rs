//! Unified error handling for primforge
//!
//! This module provides a centralized error type for every stage of the
//! dispatch pipeline (validator, descriptor builder, fusion policy, primitive
//! cache, executor). Errors are categorized for handling decisions:
//! - Configuration errors (bad static attributes, reported at construction)
//! - Call errors (runtime shape/bounds problems, fatal for one call)
//! - Backend errors (the compute backend refused or failed)
//! - Internal errors (bugs, poisoned locks)

use std::fmt;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for primforge
///
/// Every stage returns `ForgeResult<T>`; kernels collapse the error into a
/// single failure report at their `compute` boundary.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Construction-time errors ==========
    /// Static attributes are malformed or contradictory
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Requested fused-op list is not one of the legal combinations
    #[error("Unsupported fusion: {0}")]
    UnsupportedFusion(String),

    // ========== Per-call errors ==========
    /// Runtime tensor shapes are inconsistent
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A buffer is too small for the index range derived from another tensor
    #[error("Out of bounds: {what} needs {required} elements but holds {available}")]
    OutOfBounds {
        what: String,
        required: usize,
        available: usize,
    },

    /// The framework collaborator was used incorrectly (missing input, bad dtype)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A host buffer of the requested size could not be allocated
    #[error("Allocation failed: {what} needs {elements} elements")]
    AllocationFailed { what: String, elements: usize },

    // ========== Backend errors ==========
    /// The compute backend cannot honor the descriptor
    #[error("Backend rejected descriptor: {0}")]
    BackendRejected(String),

    /// The backend failed while executing a primitive
    #[error("Operation received an exception: {0}")]
    ExecutionAborted(String),

    // ========== Internal errors ==========
    /// Lock poisoned (a thread panicked while holding it)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::InvalidConfiguration(_) | ForgeError::UnsupportedFusion(_) => {
                ErrorCategory::Configuration
            }

            ForgeError::ShapeMismatch(_)
            | ForgeError::OutOfBounds { .. }
            | ForgeError::InvalidArgument(_)
            | ForgeError::AllocationFailed { .. } => ErrorCategory::Call,

            ForgeError::BackendRejected(_) | ForgeError::ExecutionAborted(_) => {
                ErrorCategory::Backend
            }

            ForgeError::LockPoisoned(_) | ForgeError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Errors raised while configuring a kernel instance
    pub fn is_configuration_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Configuration)
    }

    /// Errors that abort a single call; the kernel instance stays usable
    pub fn is_call_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Call | ErrorCategory::Backend)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad static attributes, fatal at construction
    Configuration,
    /// Bad runtime inputs, fatal for one call
    Call,
    /// Compute backend refusal or failure
    Backend,
    /// Bug or poisoned lock
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Call => write!(f, "Call"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

// Helper type alias for Results using ForgeError
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Create an `InvalidConfiguration` error with a formatted message
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::ForgeError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}

/// Create a `ShapeMismatch` error with a formatted message
#[macro_export]
macro_rules! shape_error {
    ($msg:expr) => {
        $crate::error::ForgeError::ShapeMismatch($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::ShapeMismatch(format!($fmt, $($arg)*))
    };
}

/// Create a `BackendRejected` error with a formatted message
#[macro_export]
macro_rules! backend_error {
    ($msg:expr) => {
        $crate::error::ForgeError::BackendRejected($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::BackendRejected(format!($fmt, $($arg)*))
    };
}

/// Fail with `OutOfBounds` unless `available >= required`.
///
/// Every index range derived from one tensor's shape is checked against the
/// element count of the buffer it will address, independent of that buffer's
/// declared shape.
pub fn ensure_addressable(what: &str, required: usize, available: usize) -> ForgeResult<()> {
    if available < required {
        return Err(ForgeError::OutOfBounds {
            what: what.to_string(),
            required,
            available,
        });
    }
    Ok(())
}

/// Largest element count any f32 buffer may hold
pub const MAX_ELEMENTS: usize = isize::MAX as usize / std::mem::size_of::<f32>();

/// Element count of `dims`, failing with `ShapeMismatch` on overflow.
///
/// A zero dimension makes the count zero regardless of the others.
pub fn checked_element_count(what: &str, dims: &[usize]) -> ForgeResult<usize> {
    if dims.contains(&0) {
        return Ok(0);
    }
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .filter(|&count| count <= MAX_ELEMENTS)
        .ok_or_else(|| {
            ForgeError::ShapeMismatch(format!(
                "{} dims {:?} hold more than {} elements",
                what, dims, MAX_ELEMENTS
            ))
        })
}
