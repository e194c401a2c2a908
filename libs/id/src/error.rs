//! Error types for identity parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The input exceeds the maximum length for its kind.
    #[error("{kind} '{value}' exceeds {max} characters")]
    TooLong {
        kind: &'static str,
        value: String,
        max: usize,
    },

    /// The input contains a character outside the allowed set.
    #[error("{kind} '{value}' contains invalid character '{ch}'")]
    InvalidCharacter {
        kind: &'static str,
        value: String,
        ch: char,
    },

    /// The input must start and end with an alphanumeric character.
    #[error("{kind} '{value}' must start and end with an alphanumeric character")]
    InvalidBoundary { kind: &'static str, value: String },

    /// The separator between namespace and name is missing.
    #[error("identity '{0}' is missing the '{1}' separator")]
    MissingSeparator(String, char),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
