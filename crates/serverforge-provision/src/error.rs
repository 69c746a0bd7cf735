//! Script generation errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    /// A substituted value contains characters outside the safe set
    #[error("Unsafe value for {name}: only [A-Za-z0-9._@-] are allowed")]
    UnsafeValue { name: &'static str },

    #[error("Invalid {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("Unknown {kind}: {value}")]
    Unknown { kind: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ScriptError>;
