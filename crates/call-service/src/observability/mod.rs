//! Observability for the call service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit safe
//! fields. Negotiation payloads are never logged or used as labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `call_sessions_active` | Gauge | none | Live call sessions |
//! | `call_initiated_total` | Counter | `media_kind` | Outgoing calls |
//! | `call_answered_total` | Counter | none | Answered incoming calls |
//! | `call_declined_total` | Counter | none | Declined incoming calls |
//! | `call_session_ended_total` | Counter | `reason` | Sessions reaching a terminal state |
//! | `call_operation_failures_total` | Counter | `operation`, `error` | Failed call operations |
//! | `call_signaling_write_seconds` | Histogram | `field`, `status` | Signaling write latency |
//! | `call_incoming_notifications_total` | Counter | none | Incoming-call notifications |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
