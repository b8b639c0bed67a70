//! Observability for the Room Controller: Prometheus metrics and health probes.

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
