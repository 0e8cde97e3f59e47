//! Component configuration.

use super::error::ComponentError;
use super::requests::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default port of the XMPP server's component listener.
pub const DEFAULT_COMPONENT_PORT: u16 = 5347;

/// Upper bound for `keep_alive_seconds`: one day.
pub const MAX_KEEP_ALIVE_SECONDS: u64 = 86_400;

/// Service discovery identity of the component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub category: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            category: "component".into(),
            kind: "generic".into(),
            name: "fluux component".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    pub host: String,
    pub port: u16,
    /// Address of the component, e.g. `pubsub.example.org`.
    pub component_sub_domain: String,
    pub shared_secret: String,
    pub identity: Identity,
    /// Keep-alive traffic is sent every half of this interval.
    pub keep_alive_seconds: u64,
    pub default_retry_timeout_ms: u64,
    pub default_nr_retries: u32,
    pub default_drop_off: bool,
    pub default_max_retry_timeout_ms: u64,
    pub max_assured_messages_pending_from_source: usize,
    pub max_assured_messages_pending_total: usize,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_COMPONENT_PORT,
            component_sub_domain: String::new(),
            shared_secret: String::new(),
            identity: Identity::default(),
            keep_alive_seconds: 30,
            default_retry_timeout_ms: 2_000,
            default_nr_retries: 5,
            default_drop_off: true,
            default_max_retry_timeout_ms: i32::MAX as u64,
            max_assured_messages_pending_from_source: 5,
            max_assured_messages_pending_total: 100,
        }
    }
}

impl ComponentConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        component_sub_domain: impl Into<String>,
        shared_secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            component_sub_domain: component_sub_domain.into(),
            shared_secret: shared_secret.into(),
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ComponentError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ComponentError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ComponentError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ComponentError> {
        let fail = |msg: &str| Err(ComponentError::Config(msg.to_string()));
        if self.host.trim().is_empty() {
            return fail("host must not be empty");
        }
        if self.port == 0 {
            return fail("port must not be zero");
        }
        if self.component_sub_domain.trim().is_empty() {
            return fail("component_sub_domain must not be empty");
        }
        if self.keep_alive_seconds == 0 {
            return fail("keep_alive_seconds must be positive");
        }
        if self.keep_alive_seconds > MAX_KEEP_ALIVE_SECONDS {
            return fail("keep_alive_seconds must not exceed one day");
        }
        if self.default_retry_timeout_ms == 0 || self.default_max_retry_timeout_ms == 0 {
            return fail("retry timeouts must be positive");
        }
        if self.max_assured_messages_pending_from_source == 0 || self.max_assured_messages_pending_total == 0 {
            return fail("assured message ceilings must be positive");
        }
        Ok(())
    }

    /// Time between keep-alives: half of `keep_alive_seconds`.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_seconds.saturating_mul(500))
    }

    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout_ms: self.default_retry_timeout_ms,
            retries: self.default_nr_retries,
            drop_off: self.default_drop_off,
            max_timeout_ms: self.default_max_retry_timeout_ms,
        }
    }
}
