//! The single runtime configuration object threaded through every
//! orchestration component, per spec §9.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by the Scheduler, Lock Manager, Result Handler, and
/// Auditor. Constructed once at startup by `mcs-server` and passed by
/// reference into each component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bearer token workers and API clients must present.
    pub auth_token: String,
    /// Model name passed through to the configured LLM gateway.
    pub llm_model: String,
    /// Upper bound on tokens requested per LLM completion.
    pub llm_max_tokens: u32,
    /// Retry-with-reprompt budget for a single planner/auditor call.
    pub llm_max_attempts: u32,
    /// How long a worker may hold a task claim before the Scheduler
    /// reverts it to `ready`.
    #[serde(with = "duration_secs")]
    pub claim_ttl: Duration,
    /// How many times a task may be retried after a reported failure
    /// before it is marked `failed` for good.
    pub max_retries: i32,
    /// How many audit-driven rework cycles a workflow may go through
    /// before the Auditor accepts it regardless of confidence.
    pub max_rework_cycles: i32,
    /// Minimum Auditor confidence required to accept a workflow outright.
    pub audit_confidence_threshold: f32,
    /// How long a granted file lease lives before the Lock Manager treats
    /// it as stale and sweeps it.
    #[serde(with = "duration_secs")]
    pub lock_ttl: Duration,
    /// Default value for a workflow's `fast_mode` metadata flag when a
    /// caller doesn't specify one.
    pub fast_mode_default: bool,
    /// Worker roles the Planner is allowed to assign tasks to.
    pub roles: Vec<String>,
}

impl Config {
    pub fn chrono_claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.claim_ttl).unwrap_or(chrono::Duration::minutes(10))
    }

    pub fn chrono_lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lock_ttl).unwrap_or(chrono::Duration::minutes(10))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            llm_model: "gpt-4o-mini".to_string(),
            llm_max_tokens: 4096,
            llm_max_attempts: 3,
            claim_ttl: Duration::from_secs(600),
            max_retries: 2,
            max_rework_cycles: 2,
            audit_confidence_threshold: 0.6,
            lock_ttl: Duration::from_secs(600),
            fast_mode_default: false,
            roles: vec![
                "analyst".to_string(),
                "developer".to_string(),
                "tester".to_string(),
            ],
        }
    }
}

/// Serializes a [`Duration`] as whole seconds, so `mcs-server`'s TOML
/// config reads `claim_ttl_secs = 600` instead of a nested struct.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_roles() {
        let config = Config::default();
        assert!(config.roles.contains(&"developer".to_string()));
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.llm_model, config.llm_model);
        assert_eq!(parsed.claim_ttl, config.claim_ttl);
    }
}
