//! Message rendering for recipient batches.
//!
//! Provides:
//! - Two-token placeholder substitution (`{GV}`, `{TABLE}`)
//! - Fixed-column HTML schedule tables
//! - Exam date normalization to `dd/mm/yyyy`
//! - Live template sources read at send time

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tokio::sync::watch;

use crate::types::{fields, Batch, Record, RenderedMessage};

/// Placeholder replaced by the recipient display name.
pub const NAME_TOKEN: &str = "{GV}";

/// Placeholder replaced by the schedule table (body only).
pub const TABLE_TOKEN: &str = "{TABLE}";

/// Output format for exam dates.
pub const DATE_FORMAT: &str = "%d/%m/%Y";

const DATETIME_INPUTS: &[&str] = &[
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_INPUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"];

/// chrono's `%Y` accepts short years; anything below this is a misread.
const MIN_YEAR: i32 = 1000;

/// Two-digit years are taken as 20xx.
const SHORT_YEAR_BASE: i32 = 2000;

/// Subject and body templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Templates {
    /// Subject template; `{GV}` is substituted.
    pub subject: String,
    /// HTML body template; `{GV}` and `{TABLE}` are substituted.
    pub body: String,
}

impl Templates {
    /// Creates templates from strings.
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Returns a copy with surrounding whitespace removed from both templates.
    pub fn trimmed(&self) -> Self {
        Self::new(self.subject.trim(), self.body.trim())
    }
}

impl Default for Templates {
    fn default() -> Self {
        Self::new(
            "Exam schedule - {GV}",
            "<p>Dear <b>{GV}</b>,</p>\
             <p>Below is the exam schedule for the courses you are in charge of:</p>\
             {TABLE}\
             <p>Best regards,<br>Examinations Office</p>",
        )
    }
}

/// Supplies the templates in effect right now.
///
/// Read once per batch, immediately before rendering, so edits made while a
/// run is in progress apply to batches that have not been sent yet.
pub trait TemplateSource: Send + Sync {
    /// Returns the current templates.
    fn current(&self) -> Templates;
}

impl TemplateSource for Templates {
    fn current(&self) -> Templates {
        self.clone()
    }
}

impl TemplateSource for watch::Receiver<Templates> {
    fn current(&self) -> Templates {
        self.borrow().clone()
    }
}

/// Creates an editable template channel.
///
/// The sender stays with the editor (usually the UI); the receiver is handed
/// to the dispatcher as its [`TemplateSource`].
pub fn live_templates(
    initial: Templates,
) -> (watch::Sender<Templates>, watch::Receiver<Templates>) {
    watch::channel(initial)
}

/// Rendering options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    /// HTML-escape the recipient name before substituting it.
    ///
    /// Off by default: names are inserted verbatim.
    #[serde(default)]
    pub escape_recipient_name: bool,
}

/// Turns batches into messages. Pure; safe to share across tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Renderer {
    options: RenderOptions,
}

impl Renderer {
    /// Creates a renderer.
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    /// Returns the rendering options.
    pub fn options(&self) -> RenderOptions {
        self.options
    }

    /// Renders a batch with the given templates.
    ///
    /// Unknown tokens are left as they are. If the body has no `{TABLE}` the
    /// table is omitted.
    pub fn render(&self, batch: &Batch, subject_template: &str, body_template: &str) -> RenderedMessage {
        let name = if self.options.escape_recipient_name {
            escape_html(batch.recipient_name())
        } else {
            batch.recipient_name().to_string()
        };

        let table = render_table(batch.records());

        RenderedMessage {
            subject: substitute(subject_template, &name, None),
            body_html: substitute(body_template, &name, Some(&table)),
        }
    }

    /// Renders a batch with a template snapshot, trimming both templates first.
    pub fn render_templates(&self, batch: &Batch, templates: &Templates) -> RenderedMessage {
        let templates = templates.trimmed();
        self.render(batch, &templates.subject, &templates.body)
    }
}

/// Replaces placeholders in one left-to-right pass.
///
/// Substituted text is never scanned again, so a name containing `{TABLE}`
/// stays literal.
fn substitute(template: &str, name: &str, table: Option<&str>) -> String {
    let mut out = String::with_capacity(template.len() + name.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];

        if let Some(after) = tail.strip_prefix(NAME_TOKEN) {
            out.push_str(name);
            rest = after;
        } else if let (Some(table), Some(after)) = (table, tail.strip_prefix(TABLE_TOKEN)) {
            out.push_str(table);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    out
}

/// Serializes records into the fixed-column schedule table.
pub fn render_table(records: &[Record]) -> String {
    let mut html = String::from("<table border=\"1\" class=\"schedule\">\n  <thead>\n    <tr style=\"text-align: center;\">\n");
    for column in fields::TABLE_COLUMNS {
        let _ = writeln!(html, "      <th>{}</th>", escape_html(column));
    }
    html.push_str("    </tr>\n  </thead>\n  <tbody>\n");

    for record in records {
        html.push_str("    <tr>\n");
        for column in fields::TABLE_COLUMNS {
            let value = if column == fields::EXAM_DATE {
                format_exam_date(record.get(column))
            } else {
                record.get(column).to_string()
            };
            let _ = writeln!(html, "      <td>{}</td>", escape_html(&value));
        }
        html.push_str("    </tr>\n");
    }

    html.push_str("  </tbody>\n</table>");
    html
}

/// Reformats an exam date as `dd/mm/yyyy`.
///
/// Values that do not parse as a date are returned unchanged. Slash and dash
/// forms with the year last are read day-first, unlike the month-first
/// default of pandas' `to_datetime`. Two-digit years
/// (`12/05/24`) are read as 20xx.
pub fn format_exam_date(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }

    parse_exam_date(value)
        .map(|date| date.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| raw.to_string())
}

fn parse_exam_date(value: &str) -> Option<NaiveDate> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.date_naive());
    }

    DATETIME_INPUTS
        .iter()
        .filter_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|timestamp| timestamp.date())
        .find(|date| date.year() >= MIN_YEAR)
        .or_else(|| {
            DATE_INPUTS
                .iter()
                .filter_map(|format| NaiveDate::parse_from_str(value, format).ok())
                .find(|date| date.year() >= MIN_YEAR)
        })
        .or_else(|| parse_short_year(value))
}

/// Parses `dd/mm/yy` and `dd-mm-yy`.
fn parse_short_year(value: &str) -> Option<NaiveDate> {
    let separator = ['/', '-'].into_iter().find(|&s| value.contains(s))?;
    let mut parts = value.split(separator);
    let (day, month, year) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || year.len() != 2 {
        return None;
    }

    let number = |part: &str| -> Option<u32> {
        if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    };

    let year = SHORT_YEAR_BASE + i32::try_from(number(year)?).ok()?;
    NaiveDate::from_ymd_opt(year, number(month)?, number(day)?)
}

/// Escapes text for use inside HTML element content.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
