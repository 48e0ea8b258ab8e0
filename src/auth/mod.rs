//! SMTP AUTH for the sender account.
//!
//! Supported mechanisms:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but still what most relays offer)
//! - CRAM-MD5 (RFC 2195)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{MailerError, MailerResult};

/// Authentication mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication.
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses a mechanism name from the EHLO AUTH line.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }

    /// Returns true if the mechanism sends the password in the clear.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Sender account credentials.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Creates credentials from a plain password string.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(username, SecretString::new(password.into()))
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the protected password.
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Builds AUTH exchange payloads.
pub struct Authenticator;

impl Authenticator {
    /// PLAIN initial response: base64 of `\0username\0password`.
    pub fn plain_initial_response(credentials: &Credentials) -> String {
        let response = format!(
            "\0{}\0{}",
            credentials.username(),
            credentials.password().expose_secret()
        );
        BASE64.encode(response)
    }

    /// LOGIN username step.
    pub fn login_username(credentials: &Credentials) -> String {
        BASE64.encode(credentials.username())
    }

    /// LOGIN password step.
    pub fn login_password(credentials: &Credentials) -> String {
        BASE64.encode(credentials.password().expose_secret())
    }

    /// CRAM-MD5 response to a base64 challenge.
    pub fn cram_md5_response(challenge: &str, credentials: &Credentials) -> MailerResult<String> {
        let challenge_bytes = BASE64
            .decode(challenge.trim())
            .map_err(|e| MailerError::authentication(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(credentials.password().expose_secret().as_bytes())
            .map_err(|e| MailerError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(BASE64.encode(format!("{} {}", credentials.username(), hex_digest)))
    }

    /// Picks the mechanism to use.
    ///
    /// A preferred method wins if the server offers it; otherwise the
    /// highest-priority offered method is chosen. Cleartext mechanisms are
    /// only considered on an encrypted connection.
    pub fn select_method(
        available: &[AuthMethod],
        preferred: Option<AuthMethod>,
        tls_enabled: bool,
    ) -> MailerResult<AuthMethod> {
        let usable = |m: &AuthMethod| !m.requires_tls() || tls_enabled;

        if let Some(method) = preferred {
            if available.contains(&method) && usable(&method) {
                return Ok(method);
            }
        }

        available
            .iter()
            .copied()
            .filter(usable)
            .max_by_key(AuthMethod::priority)
            .ok_or_else(|| {
                MailerError::authentication("No compatible authentication method offered by server")
            })
    }
}
