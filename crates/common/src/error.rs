//! Errors raised while decoding call records from their stored form.

use thiserror::Error;

/// A stored call record could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// A required field is absent from the stored record
    #[error("Missing record field: {0}")]
    MissingField(&'static str),

    /// A field is present but holds a value outside its domain
    #[error("Invalid value for {field}: {value}")]
    InvalidValue {
        /// Wire name of the offending field
        field: &'static str,
        /// The rejected value
        value: String,
    },
}
