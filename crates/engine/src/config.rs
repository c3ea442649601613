//! Engine configuration.
//!
//! Durations serialize as integer milliseconds (`lease_ttl_ms = 30000`), so
//! the same struct loads from TOML, environment variables and JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use spire_core::WorkerId;

use crate::error::EngineError;

/// Tuning knobs for the dispatcher, orchestrator and sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Prefix for worker ids (`{worker_name}-{n}`).
    pub worker_name: String,
    /// Number of concurrent worker tasks.
    pub workers: usize,
    /// Idle delay between empty claim attempts.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Claim lifetime; renewed before every step and every action call.
    #[serde(rename = "lease_ttl_ms", with = "duration_ms")]
    pub lease_ttl: Duration,
    /// Upper bound on one step invocation.
    #[serde(rename = "step_timeout_ms", with = "duration_ms")]
    pub step_timeout: Duration,
    /// Upper bound on one action handler call.
    #[serde(rename = "action_timeout_ms", with = "duration_ms")]
    pub action_timeout: Duration,
    /// How often overdue tickets are expired.
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Ticket deadline when the step does not set one. `None` never expires.
    #[serde(rename = "default_ticket_ttl_ms", with = "opt_duration_ms")]
    pub default_ticket_ttl: Option<Duration>,
    /// Per-subscriber notification buffer.
    pub notification_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_name: "worker".to_owned(),
            workers: 4,
            poll_interval: Duration::from_millis(200),
            lease_ttl: Duration::from_secs(30),
            step_timeout: Duration::from_secs(10),
            action_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            default_ticket_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            notification_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::InvalidConfig("workers must be at least 1".into()));
        }
        let durations = [
            ("poll_interval", self.poll_interval),
            ("lease_ttl", self.lease_ttl),
            ("step_timeout", self.step_timeout),
            ("action_timeout", self.action_timeout),
            ("sweep_interval", self.sweep_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(EngineError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.default_ticket_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(EngineError::InvalidConfig(
                "default_ticket_ttl must be non-zero when set".into(),
            ));
        }
        if self.lease_ttl <= self.step_timeout.saturating_add(self.action_timeout) {
            return Err(EngineError::InvalidConfig(format!(
                "lease_ttl ({:?}) must exceed step_timeout ({:?}) plus action_timeout ({:?})",
                self.lease_ttl, self.step_timeout, self.action_timeout
            )));
        }
        self.worker_id("0")?;
        Ok(())
    }

    /// Worker id for the given suffix.
    pub fn worker_id(&self, suffix: &str) -> Result<WorkerId, EngineError> {
        WorkerId::new(&format!("{}-{suffix}", self.worker_name))
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn durations_serialize_as_millis() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["lease_ttl_ms"], 30_000);
        assert_eq!(json["default_ticket_ttl_ms"], 86_400_000);

        let back: EngineConfig = serde_json::from_value(serde_json::json!({
            "workers": 2,
            "step_timeout_ms": 500,
            "default_ticket_ttl_ms": null
        }))
        .unwrap();
        assert_eq!(back.workers, 2);
        assert_eq!(back.step_timeout, Duration::from_millis(500));
        assert_eq!(back.default_ticket_ttl, None);
        assert_eq!(back.lease_ttl, Duration::from_secs(30));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_value::<EngineConfig>(serde_json::json!({ "wrkers": 2 }));
        assert!(err.is_err());
    }

    #[rstest]
    #[case::no_workers(EngineConfig { workers: 0, ..EngineConfig::default() }, "workers")]
    #[case::zero_poll(EngineConfig { poll_interval: Duration::ZERO, ..EngineConfig::default() }, "poll_interval")]
    #[case::lease_too_short(
        EngineConfig { lease_ttl: Duration::from_secs(5), ..EngineConfig::default() },
        "lease_ttl"
    )]
    #[case::lease_shorter_than_step_and_action(
        EngineConfig {
            lease_ttl: Duration::from_millis(200),
            step_timeout: Duration::from_millis(100),
            action_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        },
        "action_timeout"
    )]
    #[case::zero_ticket_ttl(
        EngineConfig { default_ticket_ttl: Some(Duration::ZERO), ..EngineConfig::default() },
        "default_ticket_ttl"
    )]
    #[case::bad_worker_name(
        EngineConfig { worker_name: "has space".into(), ..EngineConfig::default() },
        "worker id"
    )]
    fn invalid_configs_are_rejected(#[case] config: EngineConfig, #[case] mentions: &str) {
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains(mentions), "{err}");
    }
}
