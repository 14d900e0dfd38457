use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::LightClientError;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 19333;
pub const DEFAULT_PRIORITY: u16 = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    #[serde(with = "millis_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "millis_serde")]
    pub request_timeout: Duration,
    /// Close the connection when the server stays silent for this long.
    #[serde(with = "millis_serde::option")]
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            priority: DEFAULT_PRIORITY,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            idle_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Reads the server address from a `tcp://` or `boblight://` URL. The
    /// priority can be given as a `priority` query parameter.
    pub fn from_url(url: &Url) -> Result<Self, LightClientError> {
        match url.scheme() {
            "tcp" | "boblight" => (),
            scheme => {
                return Err(LightClientError::InvalidConfig {
                    reason: format!("unsupported scheme: {scheme}"),
                })
            }
        }
        let host = url.host_str().ok_or_else(|| LightClientError::InvalidConfig {
            reason: format!("missing host in {url}"),
        })?;

        let mut config = Self::default()
            .with_host(host)
            .with_port(url.port().unwrap_or(DEFAULT_PORT));
        for (key, value) in url.query_pairs() {
            if key == "priority" {
                config.priority = value.parse().map_err(|e| LightClientError::InvalidConfig {
                    reason: format!("invalid priority {value:?}: {e}"),
                })?;
            }
        }
        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: u64 = Deserialize::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    pub(super) mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub(in crate::config) fn serialize<S>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub(in crate::config) fn deserialize<'de, D>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis: Option<u64> = Deserialize::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}
