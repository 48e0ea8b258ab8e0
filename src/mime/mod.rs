//! MIME encoding for outgoing schedule messages.
//!
//! Produces a single-part RFC 5322 message:
//! - Header encoding (RFC 2047) for non-ASCII subjects
//! - Quoted-printable `text/html; charset=utf-8` body
//! - DATA preparation with dot-stuffing

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{MailerError, MailerResult};
use crate::types::RenderedMessage;

/// Largest chunk of UTF-8 put into one encoded word; keeps each word under
/// the 75 character limit.
const ENCODED_WORD_BYTES: usize = 45;

/// Content-Transfer-Encoding of the body.
const BODY_TRANSFER_ENCODING: &str = "quoted-printable";

/// MIME encoder for one message.
pub struct MimeEncoder {
    date: DateTime<Utc>,
    domain: String,
}

impl MimeEncoder {
    /// Creates a new encoder; `domain` is used in the Message-ID.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            date: Utc::now(),
            domain: domain.into(),
        }
    }

    /// Creates an encoder using the domain part of the sender address.
    pub fn for_sender(sender: &str) -> Self {
        let domain = sender
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .unwrap_or("localhost");
        Self::new(domain)
    }

    /// Encodes a rendered message addressed from `from` to `to`.
    pub fn encode(&self, from: &str, to: &str, message: &RenderedMessage) -> MailerResult<Vec<u8>> {
        let mut output = Vec::with_capacity(message.body_html.len() + 512);

        self.write_header(&mut output, "Date", &self.format_date())?;
        self.write_header(&mut output, "From", &Self::address_header(from)?)?;
        self.write_header(&mut output, "To", &Self::address_header(to)?)?;
        self.write_header(&mut output, "Subject", &self.encode_header(&message.subject))?;
        self.write_header(&mut output, "Message-ID", &format!("<{}>", self.generate_message_id()))?;
        self.write_header(&mut output, "MIME-Version", "1.0")?;
        self.write_header(&mut output, "Content-Type", mime::TEXT_HTML_UTF_8.as_ref())?;
        self.write_header(&mut output, "Content-Transfer-Encoding", BODY_TRANSFER_ENCODING)?;
        output.extend_from_slice(b"\r\n");
        output.extend_from_slice(&self.encode_quoted_printable(&message.body_html));

        Ok(output)
    }

    fn address_header(address: &str) -> MailerResult<String> {
        if address.chars().any(|c| c.is_control() || c == '<' || c == '>') {
            return Err(MailerError::transmit(format!(
                "Address cannot be used in a header: {:?}",
                address
            )));
        }
        Ok(address.to_string())
    }

    /// Writes a header line.
    fn write_header(&self, output: &mut Vec<u8>, name: &str, value: &str) -> MailerResult<()> {
        if name.chars().any(|c| c.is_control() || c == ':') {
            return Err(MailerError::transmit(format!("Invalid header name: {}", name)));
        }

        let header = format!("{}: {}", name, value);
        output.extend_from_slice(self.fold_header(&header).as_bytes());
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Folds a header line at 78 characters.
    fn fold_header(&self, header: &str) -> String {
        if header.len() <= 78 {
            return header.to_string();
        }

        let mut result = String::new();
        let mut current_line = String::new();

        for word in header.split(' ') {
            if current_line.is_empty() {
                current_line = word.to_string();
            } else if current_line.len() + 1 + word.len() <= 76 {
                current_line.push(' ');
                current_line.push_str(word);
            } else {
                result.push_str(&current_line);
                result.push_str("\r\n ");
                current_line = word.to_string();
            }
        }

        result.push_str(&current_line);
        result
    }

    /// Encodes a header value using RFC 2047 when it is not plain ASCII.
    ///
    /// Control characters force encoding too, so CR/LF in a subject can
    /// never start a new header.
    fn encode_header(&self, value: &str) -> String {
        if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
            return value.to_string();
        }

        let mut words = Vec::new();
        let mut chunk = String::new();
        for c in value.chars() {
            if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
                words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
                chunk.clear();
            }
            chunk.push(c);
        }
        if !chunk.is_empty() {
            words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
        }

        words.join(" ")
    }

    fn encode_quoted_printable(&self, text: &str) -> Vec<u8> {
        quoted_printable::encode(text.as_bytes())
    }

    fn generate_message_id(&self) -> String {
        format!("{}.{}@{}", Uuid::new_v4(), self.date.timestamp(), self.domain)
    }

    fn format_date(&self) -> String {
        self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
    }

    /// Prepares the DATA content with dot-stuffing and the final `.` line.
    pub fn prepare_data_content(encoded_email: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(encoded_email.len() + 100);
        let mut at_line_start = true;

        for &byte in encoded_email {
            if at_line_start && byte == b'.' {
                output.push(b'.');
            }

            output.push(byte);
            at_line_start = byte == b'\n';
        }

        if !output.ends_with(b"\r\n") {
            if output.ends_with(b"\n") {
                output.pop();
            }
            output.extend_from_slice(b"\r\n");
        }

        output.extend_from_slice(b".\r\n");
        output
    }
}

impl Default for MimeEncoder {
    fn default() -> Self {
        Self::new("localhost")
    }
}
