//! Service layer
//!
//! Business logic between the HTTP handlers and the data layer.

mod publisher;

pub use publisher::OutboxPublisher;
