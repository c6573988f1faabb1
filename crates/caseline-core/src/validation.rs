//! # Validation Module
//!
//! Identifier validation for sessions and users.
//!
//! ## Where Validation Happens
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Configuration load                                           │
//! │  └── user_id checked once when the config is validated                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: SyncClient calls                                             │
//! │  ├── subscribe_to_session(session_id, user_id)                         │
//! │  └── queue_operation(session_id, ..)  ◄── THIS MODULE                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Coordination service                                         │
//! │  └── Authorization, membership (outside this engine)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use caseline_core::validation::{validate_session_id, validate_user_id};
//!
//! assert!(validate_session_id("case-42").is_ok());
//! assert!(validate_user_id("   ").is_err());
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum length of a session or user identifier.
pub const MAX_IDENTIFIER_LEN: usize = 128;

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates a session identifier.
///
/// ## Rules
/// - Must not be empty (after trimming)
/// - At most 128 characters
/// - No control characters
pub fn validate_session_id(session_id: &str) -> ValidationResult<()> {
    validate_identifier("session_id", session_id)
}

/// Validates a user identifier.
///
/// Same rules as [`validate_session_id`].
pub fn validate_user_id(user_id: &str) -> ValidationResult<()> {
    validate_identifier("user_id", user_id)
}

fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_IDENTIFIER_LEN,
        });
    }

    if value.chars().any(char::is_control) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not contain control characters".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("S").is_ok());
        assert!(validate_session_id("case-2024-0117").is_ok());

        assert!(matches!(
            validate_session_id(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            validate_session_id("  \t "),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_identifier_length_limit() {
        let ok = "a".repeat(MAX_IDENTIFIER_LEN);
        assert!(validate_user_id(&ok).is_ok());

        let too_long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert_eq!(
            validate_user_id(&too_long),
            Err(ValidationError::TooLong {
                field: "user_id".to_string(),
                max: MAX_IDENTIFIER_LEN,
            })
        );
    }

    #[test]
    fn test_control_characters_rejected() {
        assert!(matches!(
            validate_user_id("analyst\u{0007}7"),
            Err(ValidationError::InvalidFormat { .. })
        ));
    }
}
