use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// How long a COMPLETED record keeps replaying before its key may be reused.
    pub record_ttl: Duration,
    /// Upper bound on waiting for another caller's in-flight execution.
    pub pending_wait_timeout: Duration,
    /// First poll delay while waiting; doubles up to `pending_max_poll_interval`.
    pub pending_poll_interval: Duration,
    pub pending_max_poll_interval: Duration,
    /// How long a claim stays owned without a renewal. The guard renews it
    /// while the handler runs; the sweeper releases claims whose lease lapsed.
    pub claim_lease: Duration,
    /// Renewal period for a running handler's lease. Must be < `claim_lease`.
    pub lease_renew_interval: Duration,
    /// Audit entries are kept at least this long. Must be >= `record_ttl`.
    pub audit_retention: Duration,
    pub sweep_interval: Duration,
    pub max_key_len: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(24 * 60 * 60),
            pending_wait_timeout: Duration::from_secs(10),
            pending_poll_interval: Duration::from_millis(25),
            pending_max_poll_interval: Duration::from_millis(500),
            claim_lease: Duration::from_secs(60),
            lease_renew_interval: Duration::from_secs(15),
            audit_retention: Duration::from_secs(30 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            max_key_len: 255,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("audit retention ({audit:?}) must not be shorter than record ttl ({ttl:?})")]
    RetentionTooShort { audit: Duration, ttl: Duration },
    #[error("lease renewal interval ({renew:?}) must be shorter than the claim lease ({lease:?})")]
    LeaseRenewTooSlow { renew: Duration, lease: Duration },
}

impl GuardConfig {
    /// Defaults overridden by `IDEM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let secs = |var| read_u64(&lookup, var).map(|v| v.map(Duration::from_secs));
        let millis = |var| read_u64(&lookup, var).map(|v| v.map(Duration::from_millis));

        if let Some(v) = secs("IDEM_RECORD_TTL_SECS")? {
            config.record_ttl = v;
        }
        if let Some(v) = millis("IDEM_PENDING_WAIT_MS")? {
            config.pending_wait_timeout = v;
        }
        if let Some(v) = millis("IDEM_PENDING_POLL_MS")? {
            config.pending_poll_interval = v;
        }
        if let Some(v) = secs("IDEM_CLAIM_LEASE_SECS")? {
            config.claim_lease = v;
        }
        if let Some(v) = millis("IDEM_LEASE_RENEW_MS")? {
            config.lease_renew_interval = v;
        }
        if let Some(v) = secs("IDEM_AUDIT_RETENTION_SECS")? {
            config.audit_retention = v;
        }
        if let Some(v) = secs("IDEM_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = v;
        }
        if let Some(v) = read_u64(&lookup, "IDEM_MAX_KEY_LEN")? {
            config.max_key_len = v as usize;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audit_retention < self.record_ttl {
            return Err(ConfigError::RetentionTooShort {
                audit: self.audit_retention,
                ttl: self.record_ttl,
            });
        }
        if self.lease_renew_interval >= self.claim_lease {
            return Err(ConfigError::LeaseRenewTooSlow {
                renew: self.lease_renew_interval,
                lease: self.claim_lease,
            });
        }
        Ok(())
    }
}

fn read_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let value = raw.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = GuardConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.record_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_key_len, 255);
    }

    #[test]
    fn env_overrides_apply() {
        let config = GuardConfig::from_lookup(lookup(&[
            ("IDEM_RECORD_TTL_SECS", "60"),
            ("IDEM_PENDING_WAIT_MS", "250"),
            ("IDEM_MAX_KEY_LEN", "64"),
        ]))
        .expect("config");
        assert_eq!(config.record_ttl, Duration::from_secs(60));
        assert_eq!(config.pending_wait_timeout, Duration::from_millis(250));
        assert_eq!(config.max_key_len, 64);
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = GuardConfig::from_lookup(lookup(&[("IDEM_PENDING_POLL_MS", "fast")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "IDEM_PENDING_POLL_MS", .. }));
        let err = GuardConfig::from_lookup(lookup(&[("IDEM_SWEEP_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn retention_must_cover_ttl() {
        let err = GuardConfig::from_lookup(lookup(&[
            ("IDEM_RECORD_TTL_SECS", "7200"),
            ("IDEM_AUDIT_RETENTION_SECS", "3600"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::RetentionTooShort { .. }));
    }

    #[test]
    fn lease_must_outlast_its_renewal() {
        let config = GuardConfig::from_lookup(lookup(&[
            ("IDEM_CLAIM_LEASE_SECS", "30"),
            ("IDEM_LEASE_RENEW_MS", "5000"),
        ]))
        .expect("config");
        assert_eq!(config.claim_lease, Duration::from_secs(30));
        assert_eq!(config.lease_renew_interval, Duration::from_millis(5_000));

        let err = GuardConfig::from_lookup(lookup(&[
            ("IDEM_CLAIM_LEASE_SECS", "10"),
            ("IDEM_LEASE_RENEW_MS", "10000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::LeaseRenewTooSlow { .. }));
    }
}
