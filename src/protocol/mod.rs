//! SMTP protocol implementation.
//!
//! Implements the subset of RFC 5321 a submission client needs,
//! plus the ESMTP extensions it inspects.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, MailerError, MailerResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: AuthMethod,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address, without angle brackets.
        address: String,
        /// SIZE parameter (optional).
        size: Option<usize>,
        /// 8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address, without angle brackets.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::MailFrom {
                address,
                size,
                body_8bit,
            } => {
                let mut cmd = format!("MAIL FROM:<{}>", address);
                if let Some(s) = size {
                    cmd.push_str(&format!(" SIZE={}", s));
                }
                if *body_8bit {
                    cmd.push_str(" BODY=8BITMIME");
                }
                cmd
            }
            SmtpCommand::RcptTo { address } => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }
}

/// Log-safe rendering: AUTH payloads are redacted.
impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => write!(f, "AUTH {} [REDACTED]", mechanism),
            other => write!(f, "{}", other.to_smtp_string()),
        }
    }
}

/// SMTP response from server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Response message lines.
    pub message: Vec<String>,
    /// Whether this is a multiline response.
    pub is_multiline: bool,
}

impl SmtpResponse {
    /// Creates a single-line response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
            is_multiline: false,
        }
    }

    /// Parses a response from raw lines.
    pub fn parse(lines: &[String]) -> MailerResult<Self> {
        if lines.is_empty() {
            return Err(MailerError::protocol("Empty response"));
        }

        let mut messages = Vec::with_capacity(lines.len());
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code: u16 = line
                .get(..3)
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| MailerError::protocol(format!("Invalid status line: {}", line)))?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(MailerError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let text = line.get(4..).unwrap_or("");
            let text = if i == 0 {
                match Self::parse_enhanced_code(text) {
                    Some((esc, rest)) => {
                        enhanced_code = Some(esc);
                        rest.trim()
                    }
                    None => text,
                }
            } else {
                text
            };

            messages.push(text.to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
            is_multiline: lines.len() > 1,
        })
    }

    /// Splits a leading `X.Y.Z` enhanced code off the text.
    fn parse_enhanced_code(text: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (head, rest) = text.split_once(' ').unwrap_or((text, ""));
        EnhancedStatusCode::parse(head).map(|code| (code, rest))
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this is a positive intermediate response (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(String::as_str).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts to an error.
    pub fn to_error(&self) -> MailerError {
        let mut err = MailerError::from_smtp_response(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }

    /// Returns `Ok(self)` if the code matches, otherwise the reply as an error.
    pub fn expect_code(self, expected: u16) -> MailerResult<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }

    /// Returns `Ok(self)` for any 2xx reply, otherwise the reply as an error.
    pub fn expect_success(self) -> MailerResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
    /// Enhanced status codes supported.
    pub enhanced_status_codes: bool,
    /// Raw capability strings.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO response.
    ///
    /// The first line is the server greeting and is skipped.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (capability, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match capability {
                "SIZE" => caps.size = params.parse().ok(),
                // some servers still advertise the pre-standard "AUTH=" form
                _ if capability == "AUTH" || capability.starts_with("AUTH=") => {
                    let first = capability.strip_prefix("AUTH=").unwrap_or("");
                    caps.auth_mechanisms.extend(
                        std::iter::once(first)
                            .chain(params.split_whitespace())
                            .filter_map(AuthMethod::from_capability),
                    );
                }
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "ENHANCEDSTATUSCODES" => caps.enhanced_status_codes = true,
                _ => {}
            }

            caps.raw.push(line);
        }

        caps
    }

    /// Returns the advertised AUTH mechanisms.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        self.auth_mechanisms.iter().copied().collect()
    }

    /// Returns true if authentication is available.
    pub fn has_auth(&self) -> bool {
        !self.auth_mechanisms.is_empty()
    }
}

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Connected, greeting received.
    Connected,
    /// EHLO/HELO accepted.
    Greeted,
    /// TLS established.
    TlsEstablished,
    /// Authenticated.
    Authenticated,
    /// After MAIL FROM.
    InTransaction,
    /// After RCPT TO.
    RecipientsAdded,
    /// After DATA.
    SendingData,
    /// Message accepted.
    Complete,
    /// Connection closed.
    Closed,
}

impl TransactionState {
    /// Returns true if authentication is allowed in this state.
    pub fn can_authenticate(&self) -> bool {
        matches!(self, TransactionState::Greeted | TransactionState::TlsEstablished)
    }

    /// Returns true if MAIL FROM is allowed in this state.
    pub fn can_start_mail(&self) -> bool {
        matches!(
            self,
            TransactionState::Greeted
                | TransactionState::TlsEstablished
                | TransactionState::Authenticated
                | TransactionState::Complete
        )
    }
}

/// Response codes used by the session.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u16 = 502;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 535;
    /// Mailbox unavailable (permanent).
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MailerErrorKind;

    #[test]
    fn test_command_formatting() {
        assert_eq!(
            SmtpCommand::Ehlo("localhost".to_string()).to_smtp_string(),
            "EHLO localhost"
        );
        assert_eq!(SmtpCommand::StartTls.to_smtp_string(), "STARTTLS");
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "office@example.com".to_string(),
                size: Some(1024),
                body_8bit: true,
            }
            .to_smtp_string(),
            "MAIL FROM:<office@example.com> SIZE=1024 BODY=8BITMIME"
        );
        assert_eq!(
            SmtpCommand::RcptTo {
                address: "a@x.com".to_string()
            }
            .to_smtp_string(),
            "RCPT TO:<a@x.com>"
        );
    }

    #[test]
    fn test_auth_display_is_redacted() {
        let command = SmtpCommand::Auth {
            mechanism: AuthMethod::Plain,
            initial_response: Some("AHVzZXIAcGFzcw==".to_string()),
        };
        assert_eq!(command.to_smtp_string(), "AUTH PLAIN AHVzZXIAcGFzcw==");
        assert_eq!(command.to_string(), "AUTH PLAIN [REDACTED]");
    }

    #[test]
    fn test_response_parse() {
        let response = SmtpResponse::parse(&["250 OK".to_string()]).unwrap();
        assert_eq!(response.code, 250);
        assert!(response.is_success());
        assert_eq!(response.first_message(), "OK");

        let lines = vec![
            "250-smtp.example.com Hello".to_string(),
            "250-SIZE 10485760".to_string(),
            "250 STARTTLS".to_string(),
        ];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert!(response.is_multiline);
        assert_eq!(response.message.len(), 3);

        let response = SmtpResponse::parse(&["354".to_string()]).unwrap();
        assert!(response.is_intermediate());
        assert_eq!(response.first_message(), "");
    }

    #[test]
    fn test_response_parse_rejects_garbage() {
        assert!(SmtpResponse::parse(&[]).is_err());
        assert!(SmtpResponse::parse(&["OK".to_string()]).is_err());
        assert!(SmtpResponse::parse(&["250-a".to_string(), "251 b".to_string()]).is_err());
    }

    #[test]
    fn test_response_with_enhanced_code() {
        let response = SmtpResponse::parse(&["550 5.1.1 User unknown".to_string()]).unwrap();
        let esc = response.enhanced_code.clone().unwrap();
        assert_eq!((esc.class, esc.subject, esc.detail), (5, 1, 1));
        assert_eq!(response.first_message(), "User unknown");

        let err = response.expect_success().unwrap_err();
        assert_eq!(err.kind(), MailerErrorKind::TransmitFailure);
        assert_eq!(err.smtp_code(), Some(550));
    }

    #[test]
    fn test_capabilities_parse() {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: vec![
                "smtp.example.com".to_string(),
                "SIZE 10485760".to_string(),
                "AUTH PLAIN LOGIN CRAM-MD5 XOAUTH2".to_string(),
                "STARTTLS".to_string(),
                "8BITMIME".to_string(),
                "ENHANCEDSTATUSCODES".to_string(),
            ],
            is_multiline: true,
        };

        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert_eq!(caps.size, Some(10485760));
        assert_eq!(caps.auth_mechanisms.len(), 3);
        assert!(caps.auth_mechanisms.contains(&AuthMethod::CramMd5));
        assert!(caps.starttls);
        assert!(caps.eight_bit_mime);
        assert!(caps.enhanced_status_codes);
        assert_eq!(caps.raw.len(), 5);
    }

    #[test]
    fn test_greeting_line_is_not_a_capability() {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: vec!["STARTTLS.example.com greets you".to_string()],
            is_multiline: false,
        };
        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert!(!caps.starttls);
        assert!(!caps.has_auth());
    }

    #[test]
    fn test_legacy_auth_capability() {
        let response = SmtpResponse {
            code: 250,
            enhanced_code: None,
            message: vec!["relay".to_string(), "AUTH=LOGIN PLAIN".to_string()],
            is_multiline: true,
        };
        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Plain));
    }

    #[test]
    fn test_transaction_state() {
        assert!(TransactionState::Greeted.can_authenticate());
        assert!(!TransactionState::InTransaction.can_authenticate());
        assert!(TransactionState::Authenticated.can_start_mail());
        assert!(!TransactionState::Closed.can_start_mail());
    }
}
