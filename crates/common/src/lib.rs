//! Shared building blocks for the home dashboard: domain types and the
//! backend collaborator trait, the change-feed transport, and telemetry.

pub mod domain;
pub mod realtime;
pub mod telemetry;

#[cfg(any(test, feature = "testing"))]
pub use domain::MockDashboardBackend;
