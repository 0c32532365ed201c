//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor documents, inbox, outbox, collections)
//! - WebFinger
//! - Admin API
//! - Metrics (Prometheus)

mod activitypub;
mod admin;
pub mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use admin::admin_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
