//! Configuration for the SMTP relay.
//!
//! Provides configuration with builder pattern for:
//! - Relay endpoint and EHLO identity
//! - TLS mode and trust roots
//! - Sender credentials and preferred AUTH mechanism
//! - Session and per-command timeouts
//! - Loading from the process environment or a `.env` file

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{AuthMethod, Credentials};
use crate::errors::{MailerError, MailerResult};

/// Default relay host.
pub const DEFAULT_HOST: &str = "smtp.gmail.com";

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Default bound on one whole send (connect through QUIT).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval at which consumers poll the event stream.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Environment variable names read by [`SmtpConfig::from_env`].
pub mod env {
    /// Relay host.
    pub const HOST: &str = "SMTP_HOST";
    /// Relay port.
    pub const PORT: &str = "SMTP_PORT";
    /// Sender account.
    pub const USER: &str = "EMAIL_USER";
    /// Sender passphrase.
    pub const PASS: &str = "EMAIL_PASS";
}

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS. Only for local test relays.
    None,
    /// Opportunistic STARTTLS.
    StartTls,
    /// STARTTLS, failing if the server does not offer it (default).
    #[default]
    StartTlsRequired,
    /// Implicit TLS (port 465).
    Implicit,
}

impl TlsMode {
    /// Returns true if the session must end up encrypted.
    pub fn is_required(&self) -> bool {
        matches!(self, TlsMode::StartTlsRequired | TlsMode::Implicit)
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// PEM bundle of extra trust roots, added to the built-in roots.
    pub ca_cert_path: Option<PathBuf>,
    /// Server name to verify instead of the host.
    pub sni_override: Option<String>,
}

impl TlsConfig {
    /// Validates the TLS configuration.
    pub fn validate(&self) -> MailerResult<()> {
        if let Some(path) = &self.ca_cert_path {
            if !path.exists() {
                return Err(MailerError::configuration(format!(
                    "CA certificate file not found: {}",
                    path.display()
                )));
            }
        }

        if self.mode == TlsMode::None {
            #[cfg(feature = "tracing")]
            tracing::warn!("TLS is disabled; credentials will be sent in the clear");
        }

        Ok(())
    }
}

/// SMTP relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Relay hostname.
    pub host: String,
    /// Relay port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Sender account.
    pub username: Option<String>,
    /// Sender passphrase (never serialized).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Preferred authentication method.
    pub auth_method: Option<AuthMethod>,
    /// Envelope and header sender; defaults to the username.
    pub from: Option<String>,
    /// Bound on one whole send.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Bound on a single command.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_timeout() -> Duration { DEFAULT_TIMEOUT }
fn default_command_timeout() -> Duration { DEFAULT_COMMAND_TIMEOUT }

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Loads configuration from the environment.
    ///
    /// A `.env` file in the working directory (or a parent) is loaded first
    /// if present. Missing credentials are allowed here and rejected by
    /// [`SmtpConfig::require_credentials`].
    pub fn from_env() -> MailerResult<Self> {
        match dotenvy::dotenv() {
            Ok(_path) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(path = %_path.display(), "Loaded .env file");
            }
            Err(e) if e.not_found() => {}
            Err(e) => {
                return Err(MailerError::configuration(format!("Invalid .env file: {}", e))
                    .with_cause(e))
            }
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from a specific env file, without touching the
    /// process environment.
    pub fn from_env_file(path: impl AsRef<Path>) -> MailerResult<Self> {
        let path = path.as_ref();
        let iter = dotenvy::from_path_iter(path).map_err(|e| {
            MailerError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let mut vars = std::collections::HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                MailerError::configuration(format!("Invalid line in {}: {}", path.display(), e))
            })?;
            vars.insert(key, value);
        }

        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Builds configuration from a variable lookup.
    pub fn from_lookup<F>(lookup: F) -> MailerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut builder = Self::builder().host(read(env::HOST).unwrap_or_else(|| DEFAULT_HOST.to_string()));

        if let Some(port) = read(env::PORT) {
            let port = port.trim().parse::<u16>().map_err(|e| {
                MailerError::configuration(format!("{} must be a port number, got '{}'", env::PORT, port))
                    .with_cause(e)
            })?;
            builder = builder.port(port);
        }

        if let Some(user) = read(env::USER) {
            builder = builder.username(user);
        }
        if let Some(pass) = read(env::PASS) {
            builder = builder.password(pass);
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> MailerResult<()> {
        if self.host.is_empty() {
            return Err(MailerError::configuration("Host is required"));
        }

        if self.port == 0 {
            return Err(MailerError::configuration("Port must be non-zero"));
        }

        if self.timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(MailerError::configuration("Timeouts must be positive"));
        }

        self.tls.validate()
    }

    /// Returns the sender credentials, or a configuration error if either
    /// part is missing.
    pub fn require_credentials(&self) -> MailerResult<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() => Ok(Credentials::new(user, pass.clone())),
            _ => Err(MailerError::configuration(format!(
                "Sender credentials are missing; set {} and {}",
                env::USER,
                env::PASS
            ))),
        }
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the sender address used in MAIL FROM and the From header.
    pub fn sender(&self) -> &str {
        self.from
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or_default()
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }

    /// Returns the server name used for certificate verification.
    pub fn tls_server_name(&self) -> &str {
        self.tls.sni_override.as_deref().unwrap_or(&self.host)
    }
}

/// Builder for SMTP configuration.
#[derive(Debug, Default)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: u16,
    tls: TlsConfig,
    username: Option<String>,
    password: Option<SecretString>,
    auth_method: Option<AuthMethod>,
    from: Option<String>,
    timeout: Duration,
    command_timeout: Duration,
    client_id: Option<String>,
}

impl SmtpConfigBuilder {
    /// Sets the relay host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the relay port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets both credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the preferred authentication method.
    pub fn auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = Some(method);
        self
    }

    /// Sets the sender address.
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Adds a PEM bundle of trust roots.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.ca_cert_path = Some(path.into());
        self
    }

    /// Disables TLS (test relays only).
    pub fn no_tls(mut self) -> Self {
        self.tls.mode = TlsMode::None;
        self
    }

    /// Sets the whole-send timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the per-command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> MailerResult<SmtpConfig> {
        let config = SmtpConfig {
            host: self.host.ok_or_else(|| MailerError::configuration("Host is required"))?,
            port: if self.port == 0 { DEFAULT_PORT } else { self.port },
            tls: self.tls,
            username: self.username,
            password: self.password,
            auth_method: self.auth_method,
            from: self.from,
            timeout: if self.timeout.is_zero() { DEFAULT_TIMEOUT } else { self.timeout },
            command_timeout: if self.command_timeout.is_zero() {
                DEFAULT_COMMAND_TIMEOUT
            } else {
                self.command_timeout
            },
            client_id: self.client_id,
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
