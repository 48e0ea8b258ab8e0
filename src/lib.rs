//! # Schedule Mailer
//!
//! Sends each lecturer one email listing the exams they are in charge of:
//! - Groups schedule rows into per-recipient batches, in first-seen order
//! - Renders subject and HTML body from live templates with a schedule table
//! - Delivers over authenticated SMTP (STARTTLS, PLAIN, LOGIN, CRAM-MD5)
//! - Reports per-batch status and progress on an event stream
//! - Folds the stream into a status table for display
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use integrations_schedule_mailer::{
//!     group, live_templates, Dispatcher, SmtpConfig, SmtpMailer, StatusRegistry, Templates,
//!     DEFAULT_POLL_INTERVAL,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SmtpConfig::from_env()?;
//!     let mailer = SmtpMailer::new(config)?;
//!
//!     let batches = group(Vec::new());
//!     let mut registry = StatusRegistry::seed(&batches);
//!
//!     let (_editor, templates) = live_templates(Templates::default());
//!     let dispatcher = Dispatcher::new(Arc::new(mailer), Arc::new(templates));
//!
//!     let mut handle = dispatcher.spawn(batches);
//!     registry
//!         .follow(handle.events(), DEFAULT_POLL_INTERVAL, |r| {
//!             println!("{:?}", r.progress());
//!         })
//!         .await;
//!
//!     let report = handle.join().await?;
//!     println!("sent {} of {}", report.succeeded, report.total);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Batching and rendering
pub mod grouper;
pub mod render;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// MIME encoding
pub mod mime;

// Delivery
pub mod mailer;

// Run orchestration
pub mod dispatch;
pub mod status;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, Credentials};
pub use config::{SmtpConfig, SmtpConfigBuilder, TlsConfig, TlsMode, DEFAULT_POLL_INTERVAL};
pub use dispatch::{DispatchHandle, DispatchReport, Dispatcher};
pub use errors::{FailureReason, MailerError, MailerErrorKind, MailerResult};
pub use grouper::group;
pub use mailer::{MailTransport, SmtpMailer};
pub use observability::{DispatchMetrics, MetricsSnapshot};
pub use render::{live_templates, RenderOptions, Renderer, TemplateSource, Templates};
pub use status::{StatusRegistry, StatusRow};
pub use types::{Batch, BatchKey, Event, Record, RenderedMessage, SendStatus};
