//! # Call Test Utilities
//!
//! Shared test utilities for the call service.
//!
//! This crate provides mock implementations of the external capabilities
//! (capture devices, negotiation library, registry store) and fixtures for
//! isolated call flow testing without real devices or Redis.
//!
//! ## Modules
//!
//! - `mock_media` - Media acquirer that grants, denies or has no devices
//! - `mock_peer` - Negotiation library that connects on the first exchange
//! - `failing_store` - In-memory store with switchable transport failures
//! - `fixtures` - Records, parties and update helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let store = shared_store();
//!     let caller = TestParty::new(CALLER, store.clone());
//!     let callee = TestParty::new(CALLEE, store.clone());
//!
//!     let session = caller.controller.initiate(callee.user(), MediaKind::Video).await.unwrap();
//!     let answered = callee.controller.answer(session.call_id()).await.unwrap();
//!     // ...
//! }
//! ```

pub mod failing_store;
pub mod fixtures;
pub mod mock_media;
pub mod mock_peer;

// Re-export commonly used items
pub use failing_store::*;
pub use fixtures::*;
pub use mock_media::*;
pub use mock_peer::*;
