use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Backbone '{backbone}' does not support {mode}")]
    IncompatibleMode { backbone: String, mode: String },

    #[error("{what}: {numerator} is not divisible by {denominator}")]
    NonExactRatio {
        what: &'static str,
        numerator: usize,
        denominator: usize,
    },

    #[error("Unrecognized slot tag component '{0}'")]
    UnknownSlotTag(String),

    #[error("No backbone registered under '{0}'")]
    UnknownBackbone(String),

    #[error(
        "State dict mismatch: missing {missing:?}, unexpected {unexpected:?}, shape mismatches {shape_mismatches:?}"
    )]
    StateDictMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
        shape_mismatches: Vec<(String, Vec<usize>, Vec<usize>)>,
    },

    #[error("Required key '{0}' not found in state dict")]
    MissingKey(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, ClipError>;

/// Exact integer division, rejecting any remainder.
pub fn exact_div(what: &'static str, numerator: usize, denominator: usize) -> Result<usize> {
    if denominator == 0 || numerator % denominator != 0 {
        return Err(ClipError::NonExactRatio {
            what,
            numerator,
            denominator,
        });
    }
    Ok(numerator / denominator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_div() {
        assert_eq!(exact_div("heads", 768, 64).unwrap(), 12);
        assert!(matches!(
            exact_div("heads", 100, 64),
            Err(ClipError::NonExactRatio { numerator: 100, .. })
        ));
        assert!(exact_div("heads", 64, 0).is_err());
    }
}
