//! Core types for the schedule mailer.
//!
//! This module provides:
//! - Input records and their well-known field names
//! - Recipient batches and their keys
//! - Rendered messages
//! - Dispatch events and per-batch send status

use std::collections::HashMap;
use std::fmt;
use serde::{Deserialize, Serialize};

use crate::errors::{FailureReason, MailerError, MailerResult};

/// Normalized column names produced by the data loader.
pub mod fields {
    /// Recipient email address.
    pub const EMAIL: &str = "Email";
    /// Recipient display name (the lecturer in charge).
    pub const RECIPIENT_NAME: &str = "Giang_vien";
    /// Program or track.
    pub const TRACK: &str = "Nganh";
    /// Exam subject.
    pub const SUBJECT: &str = "Hoc_phan";
    /// Class section.
    pub const CLASS_SECTION: &str = "Lop";
    /// Exam date.
    pub const EXAM_DATE: &str = "Ngay_thi";
    /// Exam time.
    pub const EXAM_TIME: &str = "Gio_thi";

    /// Columns of the schedule table, in display order.
    pub const TABLE_COLUMNS: [&str; 5] = [TRACK, SUBJECT, CLASS_SECTION, EXAM_DATE, EXAM_TIME];
}

/// One normalized input row.
///
/// Fields are plain strings; reading a field that is absent yields `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this record with `name` set to `value`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns the field value, or `""` if the field is absent.
    pub fn get(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    /// Returns true if the field is present (even if empty).
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Recipient address, raw.
    pub fn address(&self) -> &str {
        self.get(fields::EMAIL)
    }

    /// Recipient display name, raw.
    pub fn recipient_name(&self) -> &str {
        self.get(fields::RECIPIENT_NAME)
    }

    /// Batch key this record belongs to.
    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.address(), self.recipient_name())
    }
}

impl<K, V> FromIterator<(K, V)> for Record
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Identity of a batch: the raw (address, name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    /// Recipient address as it appears in the input.
    pub address: String,
    /// Recipient display name as it appears in the input.
    pub name: String,
}

impl BatchKey {
    /// Creates a new key.
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.address)
    }
}

/// Records sharing one recipient, sent as a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    key: BatchKey,
    records: Vec<Record>,
}

impl Batch {
    /// Creates an empty batch for `key`.
    pub fn new(key: BatchKey) -> Self {
        Self {
            key,
            records: Vec::new(),
        }
    }

    /// Appends a record. The record must carry this batch's key.
    pub(crate) fn push(&mut self, record: Record) {
        debug_assert_eq!(record.key(), self.key);
        self.records.push(record);
    }

    /// Returns the batch key.
    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    /// Returns the recipient address.
    pub fn address(&self) -> &str {
        &self.key.address
    }

    /// Returns the recipient display name.
    pub fn recipient_name(&self) -> &str {
        &self.key.name
    }

    /// Returns the records in first-seen order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records in this batch.
    pub fn size(&self) -> usize {
        self.records.len()
    }
}

/// Subject and HTML body produced for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub body_html: String,
}

/// Send status of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SendStatus {
    /// Queued for this run.
    Pending,
    /// Being rendered and sent.
    Sending,
    /// Accepted by the relay.
    Success,
    /// Failed; the run continues with the next batch.
    Failed(FailureReason),
}

impl SendStatus {
    /// Returns true for `Success` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendStatus::Success | SendStatus::Failed(_))
    }

    /// Returns the label shown in a status table.
    pub fn label(&self) -> String {
        match self {
            SendStatus::Pending => "Pending".to_string(),
            SendStatus::Sending => "Sending...".to_string(),
            SendStatus::Success => "Sent".to_string(),
            SendStatus::Failed(reason) => format!("Error: {}", reason),
        }
    }
}

impl From<MailerResult<()>> for SendStatus {
    fn from(result: MailerResult<()>) -> Self {
        match result {
            Ok(()) => SendStatus::Success,
            Err(e) => SendStatus::Failed(e.to_reason()),
        }
    }
}

impl From<MailerError> for SendStatus {
    fn from(error: MailerError) -> Self {
        SendStatus::Failed(error.to_reason())
    }
}

/// Progress information produced by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A batch moved to a new status.
    StatusChanged {
        /// Batch identity.
        key: BatchKey,
        /// New status.
        status: SendStatus,
    },
    /// A batch reached a terminal status; `completed` is its 1-based ordinal.
    ProgressTick {
        /// Number of batches finished so far.
        completed: usize,
    },
    /// The run is over. Always the last event.
    Completed,
}

impl Event {
    /// Shorthand for a status change.
    pub fn status(key: &BatchKey, status: SendStatus) -> Self {
        Event::StatusChanged {
            key: key.clone(),
            status,
        }
    }
}

/// Checks that an address looks like `local@domain.tld`.
///
/// The address is trimmed first. This is a shape check only; the relay has
/// the final word.
pub fn is_valid_address(address: &str) -> bool {
    let address = address.trim();
    if address.chars().any(char::is_control) {
        return false;
    }

    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };

    if local.is_empty() || domain.contains('@') {
        return false;
    }

    // some dot with at least one character on each side
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}
