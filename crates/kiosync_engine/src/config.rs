//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use kiosync_protocol::{EndpointId, EndpointPair};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the primary base address.
pub const ENV_PRIMARY_URL: &str = "KIOSYNC_PRIMARY_URL";
/// Environment variable holding the primary streaming address.
pub const ENV_PRIMARY_STREAM_URL: &str = "KIOSYNC_PRIMARY_STREAM_URL";
/// Environment variable holding the secondary base address.
pub const ENV_SECONDARY_URL: &str = "KIOSYNC_SECONDARY_URL";
/// Environment variable holding the secondary streaming address.
pub const ENV_SECONDARY_STREAM_URL: &str = "KIOSYNC_SECONDARY_STREAM_URL";
/// Environment variable overriding the health-check interval (milliseconds).
pub const ENV_HEALTH_INTERVAL_MS: &str = "KIOSYNC_HEALTH_INTERVAL_MS";
/// Environment variable overriding the probe timeout (milliseconds).
pub const ENV_PROBE_TIMEOUT_MS: &str = "KIOSYNC_PROBE_TIMEOUT_MS";
/// Environment variable overriding the degraded threshold.
pub const ENV_DEGRADED_AFTER: &str = "KIOSYNC_DEGRADED_AFTER";
/// Environment variable overriding the offline threshold.
pub const ENV_OFFLINE_AFTER: &str = "KIOSYNC_OFFLINE_AFTER";
/// Environment variable overriding the settle delay (milliseconds).
pub const ENV_SETTLE_DELAY_MS: &str = "KIOSYNC_SETTLE_DELAY_MS";
/// Environment variable overriding the session poll interval (milliseconds).
pub const ENV_POLL_INTERVAL_MS: &str = "KIOSYNC_POLL_INTERVAL_MS";

/// Configuration for the connection health monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Time between health-check ticks.
    pub interval: Duration,
    /// Upper bound for a single liveness probe.
    pub probe_timeout: Duration,
    /// Consecutive failures after which an endpoint is degraded.
    pub degraded_after: u32,
    /// Consecutive failures after which an endpoint is offline.
    pub offline_after: u32,
    /// Path probed on each endpoint.
    pub probe_path: String,
}

impl HealthConfig {
    /// Sets the health-check interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the degraded and offline thresholds.
    pub fn with_thresholds(mut self, degraded_after: u32, offline_after: u32) -> Self {
        self.degraded_after = degraded_after;
        self.offline_after = offline_after;
        self
    }

    /// Sets the probed path.
    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.probe_path = path.into();
        self
    }

    fn validate(&self) -> SyncResult<()> {
        if self.interval.is_zero() {
            return Err(SyncError::Config("health interval must be non-zero".into()));
        }
        if self.probe_timeout.is_zero() {
            return Err(SyncError::Config("probe timeout must be non-zero".into()));
        }
        if self.probe_timeout > self.interval {
            return Err(SyncError::Config(format!(
                "probe timeout {:?} exceeds health interval {:?}",
                self.probe_timeout, self.interval
            )));
        }
        if self.degraded_after == 0 {
            return Err(SyncError::Config("degraded threshold must be > 0".into()));
        }
        if self.offline_after <= self.degraded_after {
            return Err(SyncError::Config(format!(
                "offline threshold ({}) must exceed degraded threshold ({})",
                self.offline_after, self.degraded_after
            )));
        }
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            degraded_after: 3,
            offline_after: 5,
            probe_path: "/health".into(),
        }
    }
}

/// Configuration for the failover coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Pause between stopping the old endpoint and starting the new one.
    pub settle_delay: Duration,
    /// Capacity of the health-event channel feeding the coordinator.
    pub event_capacity: usize,
}

impl CoordinatorConfig {
    /// Sets the settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(150),
            event_capacity: 32,
        }
    }
}

/// Configuration for replication sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Time between pull/push cycles when nothing else wakes the session.
    pub poll_interval: Duration,
    /// Page size for pulls (0 uses each collection's batch size).
    pub pull_batch_size: u32,
    /// Maximum number of local changes per push.
    pub push_batch_size: u32,
}

impl SessionConfig {
    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            pull_batch_size: 0,
            push_batch_size: 100,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// The two remote endpoints.
    pub endpoints: EndpointPair,
    /// Health monitoring.
    pub health: HealthConfig,
    /// Failover coordination.
    pub coordinator: CoordinatorConfig,
    /// Replication sessions.
    pub session: SessionConfig,
}

impl SyncSettings {
    /// Creates settings with default tuning.
    pub fn new(endpoints: EndpointPair) -> Self {
        Self {
            endpoints,
            health: HealthConfig::default(),
            coordinator: CoordinatorConfig::default(),
            session: SessionConfig::default(),
        }
    }

    /// Sets the health configuration.
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Sets the coordinator configuration.
    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Sets the session configuration.
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Checks addresses and tuning values.
    pub fn validate(&self) -> SyncResult<()> {
        for endpoint in self.endpoints.iter() {
            validate_address(endpoint.id, "base", &endpoint.base_url, &["http://", "https://"])?;
            validate_address(
                endpoint.id,
                "stream",
                &endpoint.stream_url,
                &["ws://", "wss://", "http://", "https://"],
            )?;
        }
        if self.endpoints.primary.base_url == self.endpoints.secondary.base_url {
            return Err(SyncError::Config(
                "primary and secondary share the same base address".into(),
            ));
        }
        self.health.validate()?;
        if self.coordinator.event_capacity == 0 {
            return Err(SyncError::Config("event capacity must be > 0".into()));
        }
        if self.session.poll_interval.is_zero() {
            return Err(SyncError::Config("poll interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Reads settings from the process environment.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through a variable lookup function.
    ///
    /// Base addresses are required. A missing streaming address is derived
    /// from the base address by switching the scheme to `ws`/`wss`.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| SyncError::Config(format!("{key} is not set")))
        };

        let primary = required(ENV_PRIMARY_URL)?;
        let secondary = required(ENV_SECONDARY_URL)?;
        let primary_stream =
            lookup(ENV_PRIMARY_STREAM_URL).unwrap_or_else(|| derive_stream_url(&primary));
        let secondary_stream =
            lookup(ENV_SECONDARY_STREAM_URL).unwrap_or_else(|| derive_stream_url(&secondary));

        let mut settings = Self::new(EndpointPair::new(
            primary,
            primary_stream,
            secondary,
            secondary_stream,
        ));

        if let Some(ms) = parse_number(&lookup, ENV_HEALTH_INTERVAL_MS)? {
            settings.health.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(&lookup, ENV_PROBE_TIMEOUT_MS)? {
            settings.health.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_number(&lookup, ENV_DEGRADED_AFTER)? {
            settings.health.degraded_after = to_u32(ENV_DEGRADED_AFTER, n)?;
        }
        if let Some(n) = parse_number(&lookup, ENV_OFFLINE_AFTER)? {
            settings.health.offline_after = to_u32(ENV_OFFLINE_AFTER, n)?;
        }
        if let Some(ms) = parse_number(&lookup, ENV_SETTLE_DELAY_MS)? {
            settings.coordinator.settle_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(&lookup, ENV_POLL_INTERVAL_MS)? {
            settings.session.poll_interval = Duration::from_millis(ms);
        }

        settings.validate()?;
        Ok(settings)
    }
}

fn validate_address(
    endpoint: EndpointId,
    kind: &str,
    address: &str,
    schemes: &[&str],
) -> SyncResult<()> {
    if address.trim().is_empty() {
        return Err(SyncError::Config(format!("{endpoint} {kind} address is empty")));
    }
    if !schemes.iter().any(|scheme| address.starts_with(scheme)) {
        return Err(SyncError::Config(format!(
            "{endpoint} {kind} address '{address}' has an unsupported scheme"
        )));
    }
    Ok(())
}

fn derive_stream_url(base: &str) -> String {
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> SyncResult<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{key}='{raw}' is not a number"))),
    }
}

fn to_u32(key: &str, value: u64) -> SyncResult<u32> {
    u32::try_from(value).map_err(|_| SyncError::Config(format!("{key} is out of range")))
}
