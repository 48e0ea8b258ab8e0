//! One-shot message delivery over an authenticated SMTP session.
//!
//! Every call to [`MailTransport::send`] opens its own connection, upgrades
//! it to TLS, authenticates, transmits one message and quits. The whole
//! exchange is bounded by [`SmtpConfig::timeout`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::time::timeout;

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::{SmtpConfig, TlsMode};
use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::mime::MimeEncoder;
use crate::observability::DispatchMetrics;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, TransactionState};
use crate::transport::{SmtpTransport, TcpTransport};
use crate::types::{is_valid_address, RenderedMessage};

/// Sends one rendered message to one recipient.
///
/// Implementations return every failure as a [`MailerError`] whose kind is
/// one of `InvalidAddress`, `Timeout`, `ConnectFailure`, `AuthFailure` or
/// `TransmitFailure`. They make exactly one attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync + fmt::Debug {
    /// Sends `message` to `to`.
    async fn send(&self, to: &str, message: &RenderedMessage) -> MailerResult<()>;
}

/// SMTP-backed [`MailTransport`].
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    config: Arc<SmtpConfig>,
    credentials: Credentials,
    metrics: Arc<DispatchMetrics>,
}

impl SmtpMailer {
    /// Creates a mailer. Fails with a configuration error if the sender
    /// credentials are incomplete.
    pub fn new(config: SmtpConfig) -> MailerResult<Self> {
        config.validate()?;
        let credentials = config.require_credentials()?;

        Ok(Self {
            config: Arc::new(config),
            credentials,
            metrics: Arc::new(DispatchMetrics::new()),
        })
    }

    /// Shares a metrics registry with this mailer.
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    async fn session(&self, to: &str, message: &RenderedMessage) -> MailerResult<()> {
        let mut transport = TcpTransport::connect(&self.config)
            .await
            .map_err(|e| e.in_phase(MailerErrorKind::ConnectFailure))?;

        let result = deliver(&mut transport, &self.config, &self.credentials, to, message).await;

        if transport.is_tls() {
            self.metrics.record_tls_upgrade();
        }

        // QUIT failures do not change the outcome
        let _ = transport.close().await;
        result
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, to: &str, message: &RenderedMessage) -> MailerResult<()> {
        let to = to.trim();
        if !is_valid_address(to) {
            return Err(MailerError::invalid_address(to));
        }

        let limit = self.config.timeout;
        match timeout(limit, self.session(to, message)).await {
            Ok(result) => result,
            Err(_) => Err(MailerError::timeout(format!(
                "Sending to {} did not finish within {}",
                to,
                humantime::format_duration(limit)
            ))),
        }
    }
}

/// Runs one mail transaction on an already connected transport.
///
/// Greets the server, upgrades to TLS as configured, authenticates and sends
/// `message` to `to`. Errors are labelled with the phase they occurred in;
/// timeouts keep their own kind. QUIT is left to the caller.
pub async fn deliver<T>(
    transport: &mut T,
    config: &SmtpConfig,
    credentials: &Credentials,
    to: &str,
    message: &RenderedMessage,
) -> MailerResult<()>
where
    T: SmtpTransport + ?Sized,
{
    negotiate(transport, config)
        .await
        .map_err(|e| e.in_phase(MailerErrorKind::ConnectFailure))?;

    authenticate(transport, config, credentials)
        .await
        .map_err(|e| e.in_phase(MailerErrorKind::AuthFailure))?;

    transmit(transport, config, to, message)
        .await
        .map_err(|e| e.in_phase(MailerErrorKind::TransmitFailure))
}

/// EHLO (HELO fallback), then STARTTLS and a second EHLO when configured.
async fn negotiate<T>(transport: &mut T, config: &SmtpConfig) -> MailerResult<()>
where
    T: SmtpTransport + ?Sized,
{
    greet(transport, config).await?;

    let wants_starttls = matches!(config.tls.mode, TlsMode::StartTls | TlsMode::StartTlsRequired);
    if !wants_starttls || transport.is_tls() {
        return Ok(());
    }

    let offered = transport.capabilities().map_or(false, |c| c.starttls);
    if !offered {
        if config.tls.mode.is_required() {
            return Err(MailerError::connection("Server does not offer STARTTLS"));
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(host = %config.host, "STARTTLS not offered; continuing without encryption");
        return Ok(());
    }

    transport
        .send_command(&SmtpCommand::StartTls)
        .await?
        .expect_code(codes::SERVICE_READY)?;
    transport
        .upgrade_tls(&config.tls, config.tls_server_name())
        .await?;

    greet(transport, config).await
}

async fn greet<T>(transport: &mut T, config: &SmtpConfig) -> MailerResult<()>
where
    T: SmtpTransport + ?Sized,
{
    let client_id = config.client_id().to_string();
    let response = transport.send_command(&SmtpCommand::Ehlo(client_id.clone())).await?;

    let capabilities = if response.is_success() {
        EsmtpCapabilities::from_ehlo_response(&response)
    } else if (500..=504).contains(&response.code) {
        transport
            .send_command(&SmtpCommand::Helo(client_id))
            .await?
            .expect_success()?;
        EsmtpCapabilities::default()
    } else {
        return Err(response.to_error());
    };

    transport.set_capabilities(capabilities);
    if !transport.is_tls() {
        transport.set_state(TransactionState::Greeted);
    }
    Ok(())
}

async fn authenticate<T>(
    transport: &mut T,
    config: &SmtpConfig,
    credentials: &Credentials,
) -> MailerResult<()>
where
    T: SmtpTransport + ?Sized,
{
    let available = match transport.capabilities() {
        Some(caps) if caps.has_auth() => caps.auth_methods(),
        _ => return Err(MailerError::authentication("Server does not offer AUTH")),
    };

    let method = Authenticator::select_method(&available, config.auth_method, transport.is_tls())?;

    #[cfg(feature = "tracing")]
    tracing::debug!(method = %method, user = %credentials.username(), "Authenticating");

    match method {
        AuthMethod::Plain => {
            let command = SmtpCommand::Auth {
                mechanism: method,
                initial_response: Some(Authenticator::plain_initial_response(credentials)),
            };
            transport
                .send_command(&command)
                .await?
                .expect_code(codes::AUTH_SUCCESS)?;
        }
        AuthMethod::Login => {
            let command = SmtpCommand::Auth {
                mechanism: method,
                initial_response: None,
            };
            transport
                .send_command(&command)
                .await?
                .expect_code(codes::AUTH_CONTINUE)?;

            let username = format!("{}\r\n", Authenticator::login_username(credentials));
            transport.send_data(username.as_bytes()).await?;
            transport
                .read_response()
                .await?
                .expect_code(codes::AUTH_CONTINUE)?;

            let password = format!("{}\r\n", Authenticator::login_password(credentials));
            transport.send_data(password.as_bytes()).await?;
            transport
                .read_response()
                .await?
                .expect_code(codes::AUTH_SUCCESS)?;
        }
        AuthMethod::CramMd5 => {
            let command = SmtpCommand::Auth {
                mechanism: method,
                initial_response: None,
            };
            let challenge = transport
                .send_command(&command)
                .await?
                .expect_code(codes::AUTH_CONTINUE)?;

            let response = Authenticator::cram_md5_response(challenge.first_message(), credentials)?;
            transport.send_data(format!("{}\r\n", response).as_bytes()).await?;
            transport
                .read_response()
                .await?
                .expect_code(codes::AUTH_SUCCESS)?;
        }
    }

    transport.set_state(TransactionState::Authenticated);
    Ok(())
}

async fn transmit<T>(
    transport: &mut T,
    config: &SmtpConfig,
    to: &str,
    message: &RenderedMessage,
) -> MailerResult<()>
where
    T: SmtpTransport + ?Sized,
{
    let sender = config.sender();
    let encoded = MimeEncoder::for_sender(sender).encode(sender, to, message)?;
    let data = MimeEncoder::prepare_data_content(&encoded);

    let max_size = transport.capabilities().and_then(|c| c.size).filter(|&max| max > 0);
    if let Some(max) = max_size {
        if data.len() > max {
            return Err(MailerError::transmit(format!(
                "Message is {} bytes; server accepts at most {}",
                data.len(),
                max
            )));
        }
    }

    transport
        .send_command(&SmtpCommand::MailFrom {
            address: sender.to_string(),
            size: max_size.map(|_| data.len()),
            body_8bit: false,
        })
        .await?
        .expect_success()?;
    transport.set_state(TransactionState::InTransaction);

    transport
        .send_command(&SmtpCommand::RcptTo {
            address: to.to_string(),
        })
        .await?
        .expect_success()?;
    transport.set_state(TransactionState::RecipientsAdded);

    transport
        .send_command(&SmtpCommand::Data)
        .await?
        .expect_code(codes::START_MAIL_INPUT)?;
    transport.set_state(TransactionState::SendingData);

    transport.send_data(&data).await?;
    transport.read_response().await?.expect_success()?;
    transport.set_state(TransactionState::Complete);

    #[cfg(feature = "tracing")]
    tracing::debug!(to = %to, bytes = data.len(), "Message accepted");

    Ok(())
}
