//! Consensus configuration.

use std::time::Duration;
use tracing::warn;

/// Configuration for one consensus instance.
///
/// Injected into the constructors as an immutable value; there is no
/// process-wide configuration cache.
#[derive(Debug, Clone)]
pub struct PbftConfig {
    /// Number of replicas in the network, PBFT `N`.
    pub n: u64,

    /// Maximum number of Byzantine faults tolerated, PBFT `f`.
    pub f: u64,

    /// Checkpoint period `K`: a checkpoint is proposed every K executions.
    pub k: u64,

    /// Log size multiplier; the watermark window is `L = K * log_multiplier`.
    pub log_multiplier: u64,

    /// Execute an automatic view change every this many checkpoint periods.
    /// Zero disables automatic view changes.
    pub view_change_period: u64,

    /// Debug flag: suppress this replica's broadcasts to emulate a faulty
    /// node on a testnet.
    pub byzantine: bool,

    /// Progress timeout for outstanding request batches.
    pub request_timeout: Duration,

    /// Timeout before a pending view change is considered failed.
    pub view_change_timeout: Duration,

    /// Timeout before an unanswered view-change message is resent.
    pub view_change_resend_timeout: Duration,

    /// Timeout for primary liveness heartbeats. Zero disables null requests.
    pub null_request_timeout: Duration,

    /// How long a broadcast waits for its f-tolerant completion.
    pub broadcast_timeout: Duration,

    /// Cut a batch once this many requests accumulate.
    pub batch_size: usize,

    /// Cut a non-empty batch after this long regardless of size.
    pub batch_timeout: Duration,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            n: 4,
            f: 1,
            k: 10,
            log_multiplier: 4,
            view_change_period: 0,
            byzantine: false,
            request_timeout: Duration::from_secs(2),
            view_change_timeout: Duration::from_secs(2),
            view_change_resend_timeout: Duration::from_secs(10),
            null_request_timeout: Duration::ZERO,
            broadcast_timeout: Duration::from_secs(1),
            batch_size: 500,
            batch_timeout: Duration::from_secs(1),
        }
    }
}

impl PbftConfig {
    /// Check the construction-time invariants.
    ///
    /// Violations are fatal: a replica must not start with a configuration
    /// that cannot tolerate its declared fault count.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.f * 3 + 1 > self.n {
            return Err(ConfigError::TooFewReplicas {
                needed: self.f * 3 + 1,
                have: self.n,
                f: self.f,
            });
        }
        if self.log_multiplier < 2 {
            return Err(ConfigError::LogMultiplierTooSmall(self.log_multiplier));
        }
        Ok(())
    }

    /// Watermark window size `L`.
    pub fn log_size(&self) -> u64 {
        self.k * self.log_multiplier
    }

    /// Apply the timeout orderings the protocol requires.
    ///
    /// A request timeout at or below the batch timeout would trigger view
    /// changes on every quiet batch period, and a null-request timeout at
    /// or below the request timeout would misfire the liveness heartbeat.
    /// Both are corrected upward with a warning, never rejected.
    pub fn normalized(mut self) -> Self {
        if self.request_timeout <= self.batch_timeout {
            self.request_timeout = self.batch_timeout * 3 / 2;
            warn!(
                request_timeout = ?self.request_timeout,
                "configured request timeout must exceed batch timeout, corrected"
            );
        }
        if !self.null_request_timeout.is_zero()
            && self.null_request_timeout <= self.request_timeout
        {
            self.null_request_timeout = self.request_timeout * 3 / 2;
            warn!(
                null_request_timeout = ?self.null_request_timeout,
                "configured null request timeout must exceed request timeout, corrected"
            );
        }
        self
    }
}

/// Fatal configuration errors, detected at construction only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// N is too small for the declared fault tolerance.
    #[error("need at least {needed} replicas to tolerate {f} byzantine faults, only {have} configured")]
    TooFewReplicas {
        /// Minimum replica count, `3f + 1`.
        needed: u64,
        /// Configured replica count.
        have: u64,
        /// Configured fault tolerance.
        f: u64,
    },

    /// The watermark window would be smaller than two checkpoint periods.
    #[error("log multiplier must be at least 2, got {0}")]
    LogMultiplierTooSmall(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PbftConfig::default().validate().is_ok());
    }

    #[test]
    fn test_too_few_replicas_is_fatal() {
        let config = PbftConfig {
            n: 3,
            f: 1,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooFewReplicas {
                needed: 4,
                have: 3,
                f: 1
            })
        );
    }

    #[test]
    fn test_minimal_valid_ratios() {
        for f in 0..4u64 {
            let config = PbftConfig {
                n: 3 * f + 1,
                f,
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "n=3f+1 must validate for f={f}");
        }
    }

    #[test]
    fn test_log_multiplier_floor() {
        let config = PbftConfig {
            log_multiplier: 1,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::LogMultiplierTooSmall(1))
        );
    }

    #[test]
    #[traced_test]
    fn test_request_timeout_corrected_above_batch_timeout() {
        let config = PbftConfig {
            request_timeout: Duration::from_secs(1),
            batch_timeout: Duration::from_secs(2),
            ..Default::default()
        }
        .normalized();

        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert!(logs_contain("request timeout must exceed batch timeout"));
    }

    #[test]
    #[traced_test]
    fn test_null_request_timeout_corrected_above_request_timeout() {
        let config = PbftConfig {
            request_timeout: Duration::from_secs(4),
            null_request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
        .normalized();

        assert_eq!(config.null_request_timeout, Duration::from_secs(6));
        assert!(logs_contain("null request timeout must exceed request timeout"));
    }

    #[test]
    fn test_disabled_null_request_stays_disabled() {
        let config = PbftConfig::default().normalized();
        assert!(config.null_request_timeout.is_zero());
    }
}
