//! Shared error types for flow construction
//!
//! Only two failures are expected at a call site: cooperative cancellation
//! and incomplete code. Both mean "no flow available right now" and the
//! caller may retry later or skip the fragment. Everything reported as
//! [`FlowError::Invariant`] is a defect in the builder itself.

use thiserror::Error;

use crate::syntax::SyntaxRef;

/// Main error type for ctrlflow operations
#[derive(Debug, Error)]
pub enum FlowError {
    /// The build was canceled through its [`Cancellation`](crate::Cancellation) token
    #[error("Analysis canceled while lowering {node}")]
    Canceled { node: SyntaxRef },

    /// The fragment contains parse errors
    #[error("Incomplete code at {node}")]
    IncompleteCode { node: SyntaxRef },

    /// Internal consistency failure (unbalanced elements, dangling jumps, ...)
    #[error("Flow invariant violated: {message}")]
    Invariant { message: String },

    /// Source could not be parsed at all
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// IO errors
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FlowError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the caller can reasonably retry or skip instead of reporting a defect.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Canceled { .. } | Self::IncompleteCode { .. } | Self::Parse { .. }
        )
    }

    /// The node the failure is attached to, if any.
    pub fn node(&self) -> Option<SyntaxRef> {
        match self {
            Self::Canceled { node } | Self::IncompleteCode { node } => Some(*node),
            _ => None,
        }
    }
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, FlowError>;
