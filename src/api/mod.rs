//! API layer
//!
//! HTTP handlers:
//! - ActivityPub endpoints (actor, inbox, outbox, collections)
//! - Well-known discovery endpoints
//! - Local publish API
//! - Metrics endpoint

mod activitypub;
mod metrics;
mod publish;
mod wellknown;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
pub use publish::publish_router;
pub use wellknown::wellknown_router;
