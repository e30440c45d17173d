//! Client options: parsing defaults and validation.

use crate::error::{MqttError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_keep_alive_period() -> Duration {
    Duration::from_secs(15)
}

fn default_communication_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_clean_session() -> bool {
    true
}

/// Connection options for [`MqttClient`](crate::session::MqttClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttClientOptions {
    /// MQTT client identifier sent in CONNECT.
    pub client_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Interval between PINGREQ probes; zero disables the keep-alive loop.
    #[serde(default = "default_keep_alive_period")]
    pub keep_alive_period: Duration,
    /// Deadline applied to every transport send and every awaited response.
    #[serde(default = "default_communication_timeout")]
    pub default_communication_timeout: Duration,
}

impl MqttClientOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            user_name: None,
            password: None,
            clean_session: default_clean_session(),
            keep_alive_period: default_keep_alive_period(),
            default_communication_timeout: default_communication_timeout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(MqttError::ProtocolViolation(
                "client_id must not be empty".to_string(),
            ));
        }
        if self.default_communication_timeout.is_zero() {
            return Err(MqttError::ProtocolViolation(
                "default_communication_timeout must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Keep-alive value carried in CONNECT, rounded to whole seconds.
    pub(crate) fn keep_alive_seconds(&self) -> u16 {
        let seconds = self.keep_alive_period.as_secs_f64().round();
        if seconds >= f64::from(u16::MAX) {
            u16::MAX
        } else {
            seconds as u16
        }
    }
}
