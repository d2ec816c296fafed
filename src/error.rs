use thiserror::Error;

/// Unified result type for coalescer construction.
pub type Result<T> = std::result::Result<T, CoalesceError>;

/// Errors raised while deriving a registry key from an argument list.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The argument graph nests deeper than the encoder allows.
    #[error("argument nesting exceeds the maximum key depth of {max_depth} at {path}")]
    TooDeep { max_depth: usize, path: String },

    /// A `Json` argument could not be represented as a JSON value.
    #[error("argument at {path} is not representable as json: {reason}")]
    Unrepresentable { path: String, reason: String },
}

/// Errors emitted while configuring a coalescer or serial gate.
#[derive(Debug, Error)]
pub enum CoalesceError {
    /// A builder option was rejected.
    #[error("invalid coalescer option {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },

    /// Key derivation failed outside of a wrapped call.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Catch-all for lower-level errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
