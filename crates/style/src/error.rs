//! The lookup-error taxonomy of the style cache.
//!
//! Everything that goes wrong inside resolution is normalized at the
//! `get` boundary into a single key error carrying the chain of underlying
//! messages; type precision is deliberately lost, callers only need "did it
//! fail". Recursion is the one distinguished subtype: it is an artifact of
//! the current call stack, so it is re-surfaced as-is and never cached.
//! Invariant violations are panics, not errors.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum StyleError {
    /// A key failed to resolve. `chain` holds the underlying messages,
    /// outermost first.
    Key { key: String, chain: Vec<String> },
    /// A property formula read its own key, directly or transitively.
    Recursion { key: String },
}

impl StyleError {
    pub fn key(key: impl Into<String>, chain: Vec<String>) -> Self {
        StyleError::Key {
            key: key.into(),
            chain,
        }
    }

    pub fn is_recursion(&self) -> bool {
        matches!(self, StyleError::Recursion { .. })
    }

    /// The key this error is about.
    pub fn key_name(&self) -> &str {
        match self {
            StyleError::Key { key, .. } | StyleError::Recursion { key } => key,
        }
    }
}

impl fmt::Display for StyleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StyleError::Key { key, chain } => {
                write!(f, "cannot resolve key `{key}`")?;
                for message in chain {
                    write!(f, ": {message}")?;
                }
                Ok(())
            }
            StyleError::Recursion { key } => {
                write!(f, "recursive resolution of key `{key}`")
            }
        }
    }
}

impl std::error::Error for StyleError {}
