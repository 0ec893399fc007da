//! Operator settings
//!
//! A plain configuration struct handed to every runtime component. The
//! `kubeops` binary fills it from CLI flags and environment variables;
//! library users can build it directly.

use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::Error;

/// Default operator name, used as field manager and lease prefix
pub const DEFAULT_OPERATOR_NAME: &str = "kubeops-operator";

/// Default namespace holding the leader election Lease
pub const DEFAULT_LEASE_NAMESPACE: &str = "default";

/// Server-side watch timeout (seconds).
///
/// Must stay below the client read timeout so the API server closes idle
/// watches before the client gives up with "body read timed out".
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 25;

// Leader election timing
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Settings for the whole operator
#[derive(Clone, Debug)]
pub struct OperatorSettings {
    /// Operator name (field manager, lease name prefix, log context)
    pub name: String,
    /// Restrict watches to one namespace; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Only the lease holder runs watchers when enabled
    pub leader_election: bool,
    /// Lease object name
    pub lease_name: String,
    /// Namespace of the lease object
    pub lease_namespace: String,
    /// Identity written into the lease (usually the pod name)
    pub identity: String,
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How often the leader renews the lease
    pub renew_interval: Duration,
    /// How often a candidate retries acquisition
    pub retry_interval: Duration,
    /// Server-side watch timeout in seconds
    pub watch_timeout_secs: u32,
    /// Backoff applied when the watch transport fails
    pub watch_backoff: BackoffConfig,
    /// Backoff applied when a reconcile fails
    pub reconcile_backoff: BackoffConfig,
    /// Add registered finalizers to live entities automatically
    pub auto_attach_finalizers: bool,
    /// Remove finalizers after they ran successfully
    pub auto_detach_finalizers: bool,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_OPERATOR_NAME.to_string(),
            namespace: None,
            leader_election: false,
            lease_name: format!("{}-leader", DEFAULT_OPERATOR_NAME),
            lease_namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            identity: default_identity(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
            watch_backoff: BackoffConfig::default(),
            reconcile_backoff: BackoffConfig::default(),
            auto_attach_finalizers: true,
            auto_detach_finalizers: true,
        }
    }
}

impl OperatorSettings {
    /// Settings for an operator with the given name
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            lease_name: format!("{}-leader", name),
            name,
            ..Default::default()
        }
    }

    /// Check timing invariants
    ///
    /// The renew interval must be shorter than the lease duration, otherwise
    /// the leader's lease expires between renewals.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::configuration("operator name must not be empty"));
        }
        if self.renew_interval >= self.lease_duration {
            return Err(Error::configuration(format!(
                "renew interval ({:?}) must be shorter than lease duration ({:?})",
                self.renew_interval, self.lease_duration
            )));
        }
        // The API server rejects watch timeouts above 295s.
        if self.watch_timeout_secs == 0 || self.watch_timeout_secs >= 295 {
            return Err(Error::configuration(format!(
                "watch timeout must be between 1 and 294 seconds, got {}",
                self.watch_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Identity for leader election: `POD_NAME`, then `HOSTNAME`, then a random id
pub fn default_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("kubeops-{}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = OperatorSettings::default();
        assert!(settings.validate().is_ok());
        assert!(!settings.leader_election);
        assert!(settings.namespace.is_none());
    }

    #[test]
    fn test_named_derives_lease_name() {
        let settings = OperatorSettings::named("mirror-operator");
        assert_eq!(settings.name, "mirror-operator");
        assert_eq!(settings.lease_name, "mirror-operator-leader");
    }

    #[test]
    fn test_renew_must_be_shorter_than_lease() {
        let settings = OperatorSettings {
            renew_interval: Duration::from_secs(20),
            lease_duration: Duration::from_secs(15),
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("renew interval"));
    }

    #[test]
    fn test_watch_timeout_bounds() {
        let settings = OperatorSettings {
            watch_timeout_secs: 300,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = OperatorSettings {
            watch_timeout_secs: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
