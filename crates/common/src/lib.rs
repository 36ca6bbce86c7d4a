//! Common types shared across the call session components.

#![warn(clippy::pedantic)]

/// Module for record decoding errors
pub mod error;

/// Module for the call record data model
pub mod types;

pub use error::RecordError;
pub use types::{CallId, CallRecord, CallStatus, MediaKind, RecordField, SignalPayload, UserId};
