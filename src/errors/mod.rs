//! Error types for the schedule mailer.
//!
//! A single error struct covers configuration, address validation and every
//! failure a send attempt can hit. Per-batch failures are turned into
//! [`FailureReason`] values carried by dispatch events.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for mailer operations.
pub type MailerResult<T> = Result<T, MailerError>;

/// Error kinds categorizing failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailerErrorKind {
    /// Missing credentials or invalid settings. Fatal before a run starts.
    Configuration,
    /// Recipient address failed the format check.
    InvalidAddress,
    /// The send attempt exceeded its time budget.
    Timeout,
    /// DNS, TCP connect, greeting or TLS negotiation failed.
    ConnectFailure,
    /// The relay rejected the credentials or no usable mechanism exists.
    AuthFailure,
    /// The relay refused the envelope or the message data.
    TransmitFailure,
    /// Malformed or unexpected server reply, before phase classification.
    Protocol,
    /// Template or table construction failed.
    Render,
    /// The run was cancelled before this batch was attempted.
    Cancelled,
}

impl MailerErrorKind {
    /// Returns the severity level of this error kind.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            MailerErrorKind::Configuration | MailerErrorKind::AuthFailure => {
                ErrorSeverity::Critical
            }
            MailerErrorKind::ConnectFailure
            | MailerErrorKind::TransmitFailure
            | MailerErrorKind::Protocol
            | MailerErrorKind::Render => ErrorSeverity::Error,
            MailerErrorKind::Timeout | MailerErrorKind::InvalidAddress => ErrorSeverity::Warning,
            MailerErrorKind::Cancelled => ErrorSeverity::Info,
        }
    }
}

impl fmt::Display for MailerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailerErrorKind::Configuration => write!(f, "Configuration error"),
            MailerErrorKind::InvalidAddress => write!(f, "Invalid address"),
            MailerErrorKind::Timeout => write!(f, "Timed out"),
            MailerErrorKind::ConnectFailure => write!(f, "Connection failed"),
            MailerErrorKind::AuthFailure => write!(f, "Authentication failed"),
            MailerErrorKind::TransmitFailure => write!(f, "Transmission failed"),
            MailerErrorKind::Protocol => write!(f, "Protocol error"),
            MailerErrorKind::Render => write!(f, "Render error"),
            MailerErrorKind::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational - expected scenario.
    Info,
    /// Warning - the batch failed but nothing is misconfigured.
    Warning,
    /// Error - operation failed.
    Error,
    /// Critical - every further send will fail the same way.
    Critical,
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 7=security).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Creates a new enhanced status code.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self { class, subject, detail }
    }

    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let code = Self {
            class: parts.next()?.parse().ok()?,
            subject: parts.next()?.parse().ok()?,
            detail: parts.next()?.parse().ok()?,
        };
        if parts.next().is_some() || !(2..=5).contains(&code.class) {
            return None;
        }
        Some(code)
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Mailer error with detailed information.
#[derive(Error, Debug)]
pub struct MailerError {
    kind: MailerErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MailerError {
    /// Creates a new error.
    pub fn new(kind: MailerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> MailerErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        self.kind.severity()
    }

    /// Re-labels a failure with the session phase it happened in.
    ///
    /// Timeouts keep their kind; everything else takes `phase`.
    pub fn in_phase(mut self, phase: MailerErrorKind) -> Self {
        if self.kind != MailerErrorKind::Timeout {
            self.kind = phase;
        }
        self
    }

    /// Converts into the cloneable form carried by events.
    pub fn to_reason(&self) -> FailureReason {
        let message = match self.smtp_code {
            Some(code) => format!("{} (SMTP {})", self.message, code),
            None => self.message.clone(),
        };
        FailureReason::new(self.kind, message)
    }

    // Convenience constructors

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::Configuration, message)
    }

    /// Creates an invalid address error.
    pub fn invalid_address(address: &str) -> Self {
        Self::new(
            MailerErrorKind::InvalidAddress,
            format!("'{}' is not a valid email address", address),
        )
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::Timeout, message)
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::ConnectFailure, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::AuthFailure, message)
    }

    /// Creates a transmission error.
    pub fn transmit(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::TransmitFailure, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(MailerErrorKind::Protocol, message)
    }

    /// Creates a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(MailerErrorKind::Cancelled, "Run cancelled before this batch was sent")
    }

    /// Creates an error from a negative SMTP reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => MailerErrorKind::ConnectFailure,
            454 | 530 | 534 | 535 | 538 => MailerErrorKind::AuthFailure,
            500..=504 => MailerErrorKind::Protocol,
            _ => MailerErrorKind::TransmitFailure,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for MailerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

/// Why a batch failed, as reported to event consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Failure category.
    pub kind: MailerErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl FailureReason {
    /// Creates a new failure reason.
    pub fn new(kind: MailerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&MailerError> for FailureReason {
    fn from(error: &MailerError) -> Self {
        error.to_reason()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code.class, 5);
        assert_eq!(code.subject, 1);
        assert_eq!(code.detail, 1);
        assert!(code.is_permanent());

        assert!(EnhancedStatusCode::parse("5.1").is_none());
        assert!(EnhancedStatusCode::parse("5.1.1.1").is_none());
        assert!(EnhancedStatusCode::parse("smtp.example.com").is_none());
        assert!(EnhancedStatusCode::parse("9.0.0").is_none());
    }

    #[test]
    fn test_error_from_response() {
        let err = MailerError::from_smtp_response(535, "Authentication failed");
        assert_eq!(err.kind(), MailerErrorKind::AuthFailure);
        assert_eq!(err.smtp_code(), Some(535));

        let err = MailerError::from_smtp_response(550, "Mailbox unavailable");
        assert_eq!(err.kind(), MailerErrorKind::TransmitFailure);

        let err = MailerError::from_smtp_response(421, "Service not available");
        assert_eq!(err.kind(), MailerErrorKind::ConnectFailure);
    }

    #[test]
    fn test_in_phase_keeps_timeouts() {
        let err = MailerError::protocol("bad reply").in_phase(MailerErrorKind::AuthFailure);
        assert_eq!(err.kind(), MailerErrorKind::AuthFailure);

        let err = MailerError::timeout("read timed out").in_phase(MailerErrorKind::TransmitFailure);
        assert_eq!(err.kind(), MailerErrorKind::Timeout);
    }

    #[test]
    fn test_reason_includes_smtp_code() {
        let err = MailerError::from_smtp_response(550, "No such user");
        let reason = err.to_reason();
        assert_eq!(reason.kind, MailerErrorKind::TransmitFailure);
        assert_eq!(reason.to_string(), "Transmission failed: No such user (SMTP 550)");
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            MailerErrorKind::Configuration.severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(MailerErrorKind::Timeout.severity(), ErrorSeverity::Warning);
        assert_eq!(MailerErrorKind::Cancelled.severity(), ErrorSeverity::Info);
        assert!(MailerError::authentication("denied").severity() > ErrorSeverity::Error);
    }
}
