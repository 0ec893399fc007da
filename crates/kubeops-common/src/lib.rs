//! Common types for kubeops: errors, settings, backoff, telemetry and leader election

#![deny(missing_docs)]

pub mod backoff;
pub mod error;
pub mod leader_election;
pub mod metrics;
pub mod settings;
pub mod telemetry;

pub use backoff::{BackoffConfig, BackoffPolicy, WaitOutcome};
pub use error::Error;
pub use leader_election::{LeaderElector, LeadershipState, LeaseLock};
pub use settings::OperatorSettings;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
