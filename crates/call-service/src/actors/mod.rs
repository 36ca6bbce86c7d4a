//! Actor model for call sessions.
//!
//! # Hierarchy
//!
//! ```text
//! CallController (application root, owns the root CancellationToken)
//! └── CallSessionActor (one per live call, child token)
//!     ├── PeerConnectionAdapter (owned)
//!     ├── LocalMedia (owned)
//!     └── signaling Subscriptions (owned)
//! ```
//!
//! Sessions publish what happens to them on [`CallEvents`]; the application
//! subscribes there instead of registering per-session callbacks.

pub mod controller;
pub mod messages;
pub mod session;
pub mod state;

pub use controller::{CallController, ControllerSettings};
pub use messages::{
    CallEvents, EndReason, SessionSnapshot, SessionUpdate, TrackStatus, UpdateKind,
};
pub use session::{CallSessionActor, CallSessionHandle, SessionParams};
pub use state::{CallState, CallStateMachine, Effect, SessionEvent, Transition};
