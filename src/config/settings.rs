use serde::Deserialize;

use crate::utils::RelayError;

/// Top-level runtime settings for the relay.
///
/// Includes settings for the forwarding engine and for logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub relay: RelaySettings,
    pub logging: LoggingSettings,
}

/// Tunables of the forwarding engine and its two endpoints.
#[derive(Debug, Deserialize, Clone)]
pub struct RelaySettings {
    /// Registered connections allowed per endpoint.
    pub max_connections: usize,
    /// Capacity of each subscriber's outbound queue.
    pub subscriber_queue: usize,
    /// Largest WebSocket message or frame accepted, in bytes.
    pub max_message_size: usize,
    pub handshake_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub relay: Option<PartialRelaySettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRelaySettings {
    pub max_connections: Option<usize>,
    pub subscriber_queue: Option<usize>,
    pub max_message_size: Option<usize>,
    pub handshake_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay: RelaySettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            subscriber_queue: 1000,
            max_message_size: 16 * 1024 * 1024,
            handshake_timeout_secs: 5,
        }
    }
}

impl Settings {
    /// Fill every value missing from `partial` with its default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let relay = partial.relay.as_ref();

        Settings {
            relay: RelaySettings {
                max_connections: relay
                    .and_then(|r| r.max_connections)
                    .unwrap_or(default.relay.max_connections),
                subscriber_queue: relay
                    .and_then(|r| r.subscriber_queue)
                    .unwrap_or(default.relay.subscriber_queue),
                max_message_size: relay
                    .and_then(|r| r.max_message_size)
                    .unwrap_or(default.relay.max_message_size),
                handshake_timeout_secs: relay
                    .and_then(|r| r.handshake_timeout_secs)
                    .unwrap_or(default.relay.handshake_timeout_secs),
            },
            logging: LoggingSettings {
                level: partial
                    .logging
                    .and_then(|l| l.level)
                    .unwrap_or(default.logging.level),
            },
        }
    }

    /// Rejects values the relay cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        let relay = &self.relay;
        if relay.max_connections == 0 {
            return Err(RelayError::InvalidSettings(
                "relay.max_connections must be greater than 0".to_string(),
            ));
        }
        // tokio's bounded channel panics on a zero capacity
        if relay.subscriber_queue == 0 {
            return Err(RelayError::InvalidSettings(
                "relay.subscriber_queue must be greater than 0".to_string(),
            ));
        }
        if relay.max_message_size == 0 {
            return Err(RelayError::InvalidSettings(
                "relay.max_message_size must be greater than 0".to_string(),
            ));
        }
        if relay.handshake_timeout_secs == 0 {
            return Err(RelayError::InvalidSettings(
                "relay.handshake_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
