//! Connection options.

use core::fmt::Write;

use embassy_time::Duration;
use heapless::{String, Vec};

use crate::QoS;
use crate::error::OptionsError;
use crate::message::{Topic, copy_str};
use crate::topic::is_valid_topic_name;

/// Maximum length of the client identifier.
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Maximum length of the username and of the password.
pub const MAX_CREDENTIAL_LEN: usize = 64;

/// Maximum size of the last-will message.
pub const MAX_WILL_LEN: usize = 128;

/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 60;

/// Default topic used by the `*_default` convenience methods.
pub const DEFAULT_TOPIC: &str = "test/topic";

/// Default prefix used by [`MqttOptions::generate_client_id`].
pub const DEFAULT_CLIENT_ID_PREFIX: &str = "mqtt_client";

pub type ClientId = String<MAX_CLIENT_ID_LEN>;

/// Last-will message the broker publishes if the client vanishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWillOptions {
    pub topic: Topic,
    pub message: Vec<u8, MAX_WILL_LEN>,
    pub qos: QoS,
    pub retain: bool,
}

/// Reconnection policy applied after the connection is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOptions {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

/// Everything the client needs to open and maintain an MQTT session.
///
/// Built with `with_*` methods:
///
/// ```ignore
/// let options = MqttOptions::new("sensor-01")?
///     .with_keep_alive(30)
///     .with_clean_session(false)
///     .with_credentials("user", b"secret")?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOptions {
    pub client_id: ClientId,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub username: Option<String<MAX_CREDENTIAL_LEN>>,
    pub password: Option<Vec<u8, MAX_CREDENTIAL_LEN>>,
    pub last_will: Option<LastWillOptions>,
    /// Topic used by `publish_default`/`subscribe_default`.
    pub default_topic: Topic,
    /// QoS used by `publish_default`/`subscribe_default`.
    pub default_qos: QoS,
    /// Bound on the wait for CONNACK (and for the transport connect).
    pub connect_timeout: Duration,
    /// Time without acknowledgment before a QoS 1/2 packet is retransmitted.
    pub retry_interval: Duration,
    /// Retransmissions before a QoS 1/2 publish fails.
    pub max_retries: u8,
    /// Bound on the wait for SUBACK/UNSUBACK.
    pub ack_timeout: Duration,
    pub reconnect: ReconnectOptions,
}

impl Default for MqttOptions {
    /// An empty client id (broker-assigned) with a clean session.
    fn default() -> Self {
        let mut default_topic = Topic::new();
        let _ = default_topic.push_str(DEFAULT_TOPIC);
        Self {
            client_id: ClientId::new(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            clean_session: true,
            username: None,
            password: None,
            last_will: None,
            default_topic,
            default_qos: QoS::AtLeastOnce,
            connect_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            max_retries: 3,
            ack_timeout: Duration::from_secs(10),
            reconnect: ReconnectOptions::default(),
        }
    }
}

impl MqttOptions {
    pub fn new(client_id: &str) -> Result<Self, OptionsError> {
        let client_id = copy_str(client_id).ok_or(OptionsError::ClientIdTooLong)?;
        Ok(Self {
            client_id,
            ..Self::default()
        })
    }

    /// Builds a unique identifier of the form `<prefix>_<kind>_<millis>`.
    pub fn generate_client_id(
        prefix: &str,
        kind: &str,
        millis: u64,
    ) -> Result<ClientId, OptionsError> {
        let mut id = ClientId::new();
        write!(id, "{}_{}_{}", prefix, kind, millis).map_err(|_| OptionsError::ClientIdTooLong)?;
        Ok(id)
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Sets username and password. An empty password is sent as username only.
    pub fn with_credentials(mut self, username: &str, password: &[u8]) -> Result<Self, OptionsError> {
        self.username = Some(copy_str(username).ok_or(OptionsError::CredentialsTooLong)?);
        self.password = if password.is_empty() {
            None
        } else {
            Some(Vec::from_slice(password).map_err(|_| OptionsError::CredentialsTooLong)?)
        };
        Ok(self)
    }

    pub fn with_last_will(
        mut self,
        topic: &str,
        message: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Self, OptionsError> {
        if !is_valid_topic_name(topic) {
            return Err(OptionsError::InvalidTopic);
        }
        self.last_will = Some(LastWillOptions {
            topic: copy_str(topic).ok_or(OptionsError::InvalidTopic)?,
            message: Vec::from_slice(message).map_err(|_| OptionsError::WillTooLarge)?,
            qos,
            retain,
        });
        Ok(self)
    }

    /// Topic and QoS used by [`MqttClient::publish_default`](crate::MqttClient::publish_default)
    /// and [`MqttClient::subscribe_default`](crate::MqttClient::subscribe_default).
    /// Wildcards are refused, because the topic is also published to.
    pub fn with_default_topic(mut self, topic: &str, qos: QoS) -> Result<Self, OptionsError> {
        if !is_valid_topic_name(topic) {
            return Err(OptionsError::InvalidTopic);
        }
        self.default_topic = copy_str(topic).ok_or(OptionsError::InvalidTopic)?;
        self.default_qos = qos;
        Ok(self)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, interval: Duration, max_retries: u8) -> Self {
        self.retry_interval = interval;
        self.max_retries = max_retries;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Keep-alive as a duration; zero disables pings.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_configuration() {
        let options = MqttOptions::default();
        assert_eq!(options.keep_alive_secs, 60);
        assert!(options.clean_session);
        assert_eq!(options.default_qos, QoS::AtLeastOnce);
        assert_eq!(options.default_topic.as_str(), "test/topic");
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.reconnect.max_attempts, None);
    }

    #[test]
    fn generated_client_id_has_prefix_kind_and_time() {
        let id = MqttOptions::generate_client_id(DEFAULT_CLIENT_ID_PREFIX, "demo", 1_700_000_000_000)
            .unwrap();
        assert_eq!(id.as_str(), "mqtt_client_demo_1700000000000");
    }

    #[test]
    fn overlong_values_are_refused() {
        let long = "x".repeat(MAX_CLIENT_ID_LEN + 1);
        assert_eq!(MqttOptions::new(&long), Err(OptionsError::ClientIdTooLong));
        assert_eq!(
            MqttOptions::default().with_credentials(&long, b"pw").err(),
            Some(OptionsError::CredentialsTooLong)
        );
    }

    #[test]
    fn will_topic_must_not_contain_wildcards() {
        assert_eq!(
            MqttOptions::default()
                .with_last_will("devices/+/status", b"offline", QoS::AtLeastOnce, true)
                .err(),
            Some(OptionsError::InvalidTopic)
        );
    }

    #[test]
    fn default_topic_must_be_publishable() {
        for topic in ["", "home/#", "home/+/temp"] {
            assert_eq!(
                MqttOptions::default()
                    .with_default_topic(topic, QoS::AtMostOnce)
                    .err(),
                Some(OptionsError::InvalidTopic),
                "{topic:?}"
            );
        }
        let options = MqttOptions::default()
            .with_default_topic("home/status", QoS::ExactlyOnce)
            .unwrap();
        assert_eq!(options.default_topic.as_str(), "home/status");
        assert_eq!(options.default_qos, QoS::ExactlyOnce);
    }

    #[test]
    fn empty_password_is_omitted() {
        let options = MqttOptions::default().with_credentials("user", b"").unwrap();
        assert_eq!(options.username.as_deref(), Some("user"));
        assert!(options.password.is_none());
    }
}
