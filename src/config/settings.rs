use serde::Deserialize;

/// Top-level configuration: how the demo session connects and recovers, and
/// where the bundled loopback broker listens.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub session: SessionSettings,
    pub reconnect: ReconnectSettings,
    pub broker: BrokerSettings,
}

/// Endpoint and credentials of the session.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SessionSettings {
    pub url: String,
    pub principal: String,
    pub password: String,
    pub secure: bool,
}

/// Reconnection policy parameters.
///
/// The backoff is `min(2^attempt * base_interval_ms, max_interval_ms)` and the
/// session gives up once `timeout_secs` have passed since the connection was
/// lost. A zero timeout disables reconnection.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub timeout_secs: u64,
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub queue_while_recovering: bool,
}

/// Loopback broker listener.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    /// How long a disconnected session can still be resumed.
    pub session_retention_secs: u64,
}

/// Partial configuration loaded from files or environment. Missing values are
/// filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub session: Option<PartialSessionSettings>,
    pub reconnect: Option<PartialReconnectSettings>,
    pub broker: Option<PartialBrokerSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSessionSettings {
    pub url: Option<String>,
    pub principal: Option<String>,
    pub password: Option<String>,
    pub secure: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialReconnectSettings {
    pub timeout_secs: Option<u64>,
    pub base_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub queue_while_recovering: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub session_retention_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session: SessionSettings {
                url: "ws://127.0.0.1:8080".to_string(),
                principal: "control".to_string(),
                password: "password".to_string(),
                secure: false,
            },
            reconnect: ReconnectSettings {
                timeout_secs: 600,
                base_interval_ms: 100,
                max_interval_ms: 60_000,
                queue_while_recovering: true,
            },
            broker: BrokerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                session_retention_secs: 60,
            },
        }
    }
}

impl PartialSettings {
    /// Overlay the values present in `self` on `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let session = self.session.unwrap_or_default();
        let reconnect = self.reconnect.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();

        Settings {
            session: SessionSettings {
                url: session.url.unwrap_or(defaults.session.url),
                principal: session.principal.unwrap_or(defaults.session.principal),
                password: session.password.unwrap_or(defaults.session.password),
                secure: session.secure.unwrap_or(defaults.session.secure),
            },
            reconnect: ReconnectSettings {
                timeout_secs: reconnect
                    .timeout_secs
                    .unwrap_or(defaults.reconnect.timeout_secs),
                base_interval_ms: reconnect
                    .base_interval_ms
                    .unwrap_or(defaults.reconnect.base_interval_ms),
                max_interval_ms: reconnect
                    .max_interval_ms
                    .unwrap_or(defaults.reconnect.max_interval_ms),
                queue_while_recovering: reconnect
                    .queue_while_recovering
                    .unwrap_or(defaults.reconnect.queue_while_recovering),
            },
            broker: BrokerSettings {
                host: broker.host.unwrap_or(defaults.broker.host),
                port: broker.port.unwrap_or(defaults.broker.port),
                session_retention_secs: broker
                    .session_retention_secs
                    .unwrap_or(defaults.broker.session_retention_secs),
            },
        }
    }
}
