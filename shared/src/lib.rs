//! Shared data model, persistence, and collaborators for the market watch backend
//!
//! This crate contains the types and components that are used by both the
//! `scheduler` and `worker` binaries: the domain model (`MonitoringTask`,
//! `FoundItem`, `Proxy`), the relational `Store` with its per-activity
//! session discipline, the durable `Bus` queues, the `ProxyManager`, filter
//! evaluation, listing fingerprinting, and the `Fetcher`/`Notifier`
//! collaborators.

pub mod bus;
pub mod config;
pub mod fetcher;
pub mod filters;
pub mod fingerprint;
pub mod model;
pub mod notifier;
pub mod proxy_manager;
pub mod retry;
pub mod store;
pub mod time;

pub use model::{FoundItem, MonitoringTask, Proxy};

/// Result type alias used throughout this crate and its dependents.
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the monitoring system.
#[derive(Debug, thiserror::Error)]
pub enum MonitoringError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no leasable proxy available")]
    ProxyUnavailable,
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        // Smoke test to ensure the module tree compiles and links together.
    }
}
