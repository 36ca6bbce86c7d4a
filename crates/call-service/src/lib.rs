//! Call Service Library
//!
//! Peer-to-peer call session management on top of a shared call registry:
//!
//! - Outgoing and incoming call setup with a ring timeout
//! - Offer/answer exchange through fields of the shared call record
//! - Local media ownership and guaranteed release on every exit path
//! - Incoming-call notification for the local user
//!
//! # Architecture
//!
//! ```text
//! CallController (one per local user)
//! ├── CallSessionActor (one per live call)
//! │   ├── PeerConnectionAdapter  -> PeerBackend (negotiation library)
//! │   ├── LocalMedia             <- MediaAcquirer (capture devices)
//! │   └── Subscriptions          -> SignalingChannel -> CallStore
//! └── IncomingCallWatcher        -> CallStore (registry scope)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Session actor, state machine and controller
//! - [`signaling`] - Field publish/subscribe over the registry
//! - [`store`] - Registry backends (in-memory, Redis)
//! - [`peer`] - Negotiation library boundary and adapter
//! - [`media`] - Local media handles
//! - [`incoming`] - Incoming call watcher
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types

pub mod actors;
pub mod config;
pub mod errors;
pub mod incoming;
pub mod media;
pub mod observability;
pub mod peer;
pub mod signaling;
pub mod store;
