//! # Error Types
//!
//! Domain-specific error types for caseline-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  caseline-core errors (this file)                                      │
//! │  ├── CoreError        - Data model errors                              │
//! │  └── ValidationError  - Identifier / input validation failures         │
//! │                                                                         │
//! │  caseline-store errors (separate crate)                                │
//! │  └── StoreError       - Key/value storage failures                     │
//! │                                                                         │
//! │  caseline-sync errors (separate crate)                                 │
//! │  └── SyncError        - What the embedding application sees            │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError / SyncError → Caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (field, value)
//! 3. Errors are enum variants, never String

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Data model errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An event type string is not one of the closed set.
    ///
    /// ## When This Occurs
    /// - A peer running a newer build sends an event kind this build lacks
    /// - A hand-edited persisted queue contains a typo
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised synchronously before any state is mutated, so a failed call never
/// leaves a half-registered session or a half-queued operation behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., control characters in an identifier).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "session_id".to_string(),
        };
        assert_eq!(err.to_string(), "session_id is required");

        let err = ValidationError::TooLong {
            field: "user_id".to_string(),
            max: 128,
        };
        assert_eq!(err.to_string(), "user_id must be at most 128 characters");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "session_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }

    #[test]
    fn test_unknown_event_type_message() {
        let err = CoreError::UnknownEventType("evidence-exploded".to_string());
        assert_eq!(err.to_string(), "Unknown event type: evidence-exploded");
    }
}
