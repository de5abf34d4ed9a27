//! Configuration for the MQTT transport.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rumqttc::TlsConfiguration;

use crate::backoff::Backoff;
use crate::error::{Result, TransportError};

/// Connection settings for [`crate::MqttTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Broker hostname or IP
    /// Default: "localhost"
    pub host: String,

    /// Broker port
    /// Default: 1883
    pub port: u16,

    /// MQTT client identifier; a random one is generated when empty
    pub client_id: String,

    /// Optional username/password pair
    pub credentials: Option<(String, String)>,

    /// TLS settings; `None` connects over plain TCP
    /// Default: None
    pub tls: Option<TlsConfig>,

    /// Keep-alive interval
    /// Default: 60 seconds
    pub keep_alive: Duration,

    /// Start with a clean session on every connect
    /// Default: true
    pub clean_session: bool,

    /// Capacity of the client's outgoing request queue
    /// Default: 100
    pub request_channel_capacity: usize,

    /// How long `connect` waits for the first CONNACK
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// First reconnect delay
    /// Default: 1 second
    pub reconnect_initial_delay: Duration,

    /// Reconnect delay cap
    /// Default: 30 seconds
    pub reconnect_max_delay: Duration,

    /// Give up reconnecting after this many consecutive failures
    /// Default: None (retry forever)
    pub reconnect_max_attempts: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: String::new(),
            credentials: None,
            tls: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            request_channel_capacity: 100,
            connect_timeout: Duration::from_secs(10),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: None,
        }
    }
}

impl TransportConfig {
    /// Create a config pointing at `host:port` with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Build a config from the environment.
    ///
    /// - `MQTT_BROKER`: `host`, `host:port`, `mqtt://host:port` or
    ///   `mqtts://host:port` (also `ssl://`), the latter enabling TLS
    /// - `MQTT_PORT`: overrides the port
    /// - `MQTT_USERNAME` / `MQTT_PASSWORD`: credentials, used when the username is non-empty
    /// - `MQTT_CLIENT_ID`: client identifier
    /// - `MQTT_CA_CERT`, `MQTT_CLIENT_CERT`, `MQTT_CLIENT_KEY`: PEM files, any of
    ///   which enables TLS
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(broker) = std::env::var("MQTT_BROKER") {
            config = config.with_broker_address(&broker)?;
        }

        if let Ok(port) = std::env::var("MQTT_PORT") {
            config.port = port
                .parse()
                .map_err(|_| TransportError::Configuration(format!("Invalid MQTT_PORT: {port}")))?;
        }

        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            if !username.is_empty() {
                let password = std::env::var("MQTT_PASSWORD").unwrap_or_default();
                config.credentials = Some((username, password));
            }
        }

        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            config.client_id = client_id;
        }

        let env_path = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        };
        let ca_cert_path = env_path("MQTT_CA_CERT");
        let client_cert_path = env_path("MQTT_CLIENT_CERT");
        let client_key_path = env_path("MQTT_CLIENT_KEY");
        if ca_cert_path.is_some() || client_cert_path.is_some() || client_key_path.is_some() {
            config.tls = Some(TlsConfig {
                ca_cert_path,
                client_cert_path,
                client_key_path,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(TransportError::Configuration(
                "Broker host must not be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(TransportError::Configuration(
                "Broker port must be greater than 0".to_string(),
            ));
        }

        if self.client_id.len() > 36 {
            return Err(TransportError::Configuration(
                "Client id must be at most 36 characters".to_string(),
            ));
        }

        if self.request_channel_capacity == 0 {
            return Err(TransportError::Configuration(
                "Request channel capacity must be greater than 0".to_string(),
            ));
        }

        if self.keep_alive < Duration::from_secs(5) {
            return Err(TransportError::Configuration(
                "Keep-alive must be at least 5 seconds".to_string(),
            ));
        }

        if self.reconnect_initial_delay.is_zero()
            || self.reconnect_initial_delay > self.reconnect_max_delay
        {
            return Err(TransportError::Configuration(
                "Reconnect delays must satisfy 0 < initial <= max".to_string(),
            ));
        }

        if let Some(tls) = &self.tls {
            tls.validate()?;
        }

        Ok(())
    }

    /// The client id to present, generating one if none was configured.
    pub fn effective_client_id(&self) -> String {
        if self.client_id.is_empty() {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("locker-{}", &id[..12])
        } else {
            self.client_id.clone()
        }
    }

    /// Backoff schedule described by this config.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_initial_delay, self.reconnect_max_delay, 2.0)
            .with_max_attempts(self.reconnect_max_attempts)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Point the config at a broker address such as `mqtts://host:8883`.
    ///
    /// TLS schemes enable TLS with the platform roots unless TLS is already
    /// configured, and default the port to 8883. Schemes other than `mqtt`,
    /// `tcp`, `mqtts`, `ssl` and `tls` are rejected.
    pub fn with_broker_address(mut self, address: &str) -> Result<Self> {
        let parsed = parse_broker_address(address)?;
        self.host = parsed.host;
        if parsed.tls && self.tls.is_none() {
            self.tls = Some(TlsConfig::default());
        }
        match parsed.port {
            Some(port) => self.port = port,
            None if parsed.tls => self.port = DEFAULT_TLS_PORT,
            None => {}
        }
        Ok(self)
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_max_delay = max;
        self.reconnect_max_attempts = max_attempts;
        self
    }
}

/// Conventional port for MQTT over TLS.
const DEFAULT_TLS_PORT: u16 = 8883;

/// TLS settings for an encrypted broker connection.
///
/// Without a CA certificate the platform root store is used, which is what
/// hosted brokers with public certificates need. Files are read when the
/// transport connects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsConfig {
    /// PEM CA certificate used to verify the broker
    pub ca_cert_path: Option<PathBuf>,

    /// PEM client certificate for mutual TLS; requires `client_key_path`
    pub client_cert_path: Option<PathBuf>,

    /// Unencrypted PEM private key for mutual TLS; requires `client_cert_path`
    pub client_key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Mutual TLS with a private CA.
    pub fn new(
        ca_cert_path: impl Into<PathBuf>,
        client_cert_path: impl Into<PathBuf>,
        client_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    /// Server verification against a private CA, no client certificate.
    pub fn with_ca_only(ca_cert_path: impl Into<PathBuf>) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.into()),
            ..Default::default()
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(TransportError::Configuration(
                "Client certificate and key must be provided together".to_string(),
            ));
        }

        if self.has_client_auth() && self.ca_cert_path.is_none() {
            return Err(TransportError::Configuration(
                "Client certificates require a CA certificate".to_string(),
            ));
        }

        let paths = [&self.ca_cert_path, &self.client_cert_path, &self.client_key_path];
        if paths.into_iter().flatten().any(|path| path.as_os_str().is_empty()) {
            return Err(TransportError::Configuration(
                "TLS file paths must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Load the certificates and build the rumqttc transport.
    pub(crate) fn transport(&self) -> Result<rumqttc::Transport> {
        self.validate()?;

        let Some(ca_cert_path) = &self.ca_cert_path else {
            return Ok(rumqttc::Transport::tls_with_default_config());
        };

        let ca = read_pem(ca_cert_path)?;
        let client_auth = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
            _ => None,
        };

        Ok(rumqttc::Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        TransportError::Configuration(format!("Cannot read {}: {e}", path.display()))
    })
}

#[derive(Debug, PartialEq)]
struct BrokerAddress {
    host: String,
    port: Option<u16>,
    tls: bool,
}

/// Split a broker address into host, optional port and whether it asks for TLS.
fn parse_broker_address(address: &str) -> Result<BrokerAddress> {
    if address.contains("://") {
        let url = url::Url::parse(address)
            .map_err(|e| TransportError::Configuration(format!("Invalid MQTT_BROKER {address}: {e}")))?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" | "tls" => true,
            other => {
                return Err(TransportError::Configuration(format!(
                    "Unsupported MQTT_BROKER scheme {other}: {address}"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::Configuration(format!("MQTT_BROKER has no host: {address}")))?;
        return Ok(BrokerAddress {
            host: host.to_string(),
            port: url.port(),
            tls,
        });
    }

    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| TransportError::Configuration(format!("Invalid port in MQTT_BROKER: {address}")))?;
            Ok(BrokerAddress {
                host: host.to_string(),
                port: Some(port),
                tls: false,
            })
        }
        None => Ok(BrokerAddress {
            host: address.to_string(),
            port: None,
            tls: false,
        }),
    }
}
