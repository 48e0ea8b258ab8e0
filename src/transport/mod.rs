//! Transport layer for SMTP connections.
//!
//! A plain TCP connection that can be upgraded to TLS in place, behind the
//! [`SmtpTransport`] trait so sessions can be driven against a scripted mock.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{SmtpConfig, TlsConfig, TlsMode};
use crate::errors::{MailerError, MailerResult};
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};

/// Trait for SMTP transport abstraction.
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and receives a response.
    async fn send_command(&mut self, command: &SmtpCommand) -> MailerResult<SmtpResponse>;

    /// Sends raw bytes (AUTH continuation lines, DATA payload).
    async fn send_data(&mut self, data: &[u8]) -> MailerResult<()>;

    /// Reads a response from the server.
    async fn read_response(&mut self) -> MailerResult<SmtpResponse>;

    /// Upgrades the connection to TLS, verifying `server_name`.
    async fn upgrade_tls(&mut self, config: &TlsConfig, server_name: &str) -> MailerResult<()>;

    /// Returns true if TLS is enabled.
    fn is_tls(&self) -> bool;

    /// Sends QUIT and marks the connection closed. Errors are ignored.
    async fn close(&mut self) -> MailerResult<()>;

    /// Returns the current transaction state.
    fn state(&self) -> TransactionState;

    /// Sets the transaction state.
    fn set_state(&mut self, state: TransactionState);

    /// Returns the server capabilities.
    fn capabilities(&self) -> Option<&EsmtpCapabilities>;

    /// Sets the server capabilities.
    fn set_capabilities(&mut self, caps: EsmtpCapabilities);
}

trait SmtpStream: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> SmtpStream for T {}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(BufReader<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(feature = "native-tls")]
    NativeTls(BufReader<tokio_native_tls::TlsStream<TcpStream>>),
    /// Left in place while the TCP stream is inside a TLS handshake; stays
    /// if the handshake fails.
    Detached,
}

impl TransportStream {
    fn io(&mut self) -> MailerResult<&mut dyn SmtpStream> {
        match self {
            TransportStream::Plain(stream) => Ok(stream),
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => Ok(stream),
            #[cfg(feature = "native-tls")]
            TransportStream::NativeTls(stream) => Ok(stream),
            TransportStream::Detached => Err(MailerError::connection(
                "Connection is unusable after a failed TLS handshake",
            )),
        }
    }
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    stream: TransportStream,
    command_timeout: Duration,
    state: TransactionState,
    capabilities: Option<EsmtpCapabilities>,
    tls_enabled: bool,
    host: String,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("tls_enabled", &self.tls_enabled)
            .field("state", &self.state)
            .finish()
    }
}

impl TcpTransport {
    /// Connects to the relay and reads its greeting.
    ///
    /// With [`TlsMode::Implicit`] the TLS handshake happens before the
    /// greeting is read.
    pub async fn connect(config: &SmtpConfig) -> MailerResult<Self> {
        let address = config.address();

        #[cfg(feature = "tracing")]
        tracing::debug!(address = %address, tls_mode = ?config.tls.mode, "Connecting to SMTP relay");

        let stream = timeout(config.command_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| MailerError::timeout(format!("Connecting to {} timed out", address)))?
            .map_err(|e| Self::map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            command_timeout: config.command_timeout,
            state: TransactionState::Connected,
            capabilities: None,
            tls_enabled: false,
            host: config.host.clone(),
        };

        if config.tls.mode == TlsMode::Implicit {
            transport
                .upgrade_tls(&config.tls, config.tls_server_name())
                .await?;
        }

        transport
            .read_response()
            .await?
            .expect_code(codes::SERVICE_READY)?;

        Ok(transport)
    }

    /// Maps IO errors to mailer errors.
    fn map_io_error(error: io::Error, address: &str) -> MailerError {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => {
                MailerError::connection(format!("Connection refused by {}", address))
            }
            io::ErrorKind::TimedOut => {
                MailerError::timeout(format!("Connecting to {} timed out", address))
            }
            io::ErrorKind::ConnectionReset => {
                MailerError::connection("Connection reset by server")
            }
            _ => MailerError::connection(format!("Cannot connect to {}: {}", address, error)),
        }
        .with_cause(error)
    }

    /// Reads lines until a complete (possibly multiline) reply arrives.
    async fn read_response_inner<R: AsyncBufRead + Unpin + ?Sized>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> MailerResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(timeout_duration, reader.read_line(&mut line))
                .await
                .map_err(|_| MailerError::timeout("Timed out waiting for server reply"))?
                .map_err(|e| MailerError::connection(format!("Read error: {}", e)).with_cause(e))?;

            if read == 0 {
                return Err(MailerError::connection("Server closed connection"));
            }

            let line = line.trim_end().to_string();

            // "250-" continues, "250 " ends
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    /// Writes and flushes.
    async fn write_all<W: AsyncWrite + Unpin + ?Sized>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> MailerResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| MailerError::timeout("Write timed out"))?
            .map_err(|e| MailerError::connection(format!("Write error: {}", e)).with_cause(e))?;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| MailerError::timeout("Flush timed out"))?
            .map_err(|e| MailerError::connection(format!("Flush error: {}", e)).with_cause(e))?;

        Ok(())
    }

    /// Removes the plain TCP stream so it can be wrapped in TLS.
    fn detach_plain(&mut self) -> MailerResult<TcpStream> {
        match std::mem::replace(&mut self.stream, TransportStream::Detached) {
            TransportStream::Plain(reader) => Ok(reader.into_inner()),
            other => {
                self.stream = other;
                Err(MailerError::connection("Connection is not a plain TCP stream"))
            }
        }
    }
}

impl TcpTransport {
    #[cfg(feature = "rustls-tls")]
    async fn handshake(&mut self, config: &TlsConfig, server_name: &str) -> MailerResult<TransportStream> {
        use rustls::pki_types::ServerName;
        use std::sync::Arc;

        let connector = tokio_rustls::TlsConnector::from(Arc::new(rustls_client_config(config)?));
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| MailerError::configuration(format!("Invalid server name: {}", server_name)))?;

        let tcp_stream = self.detach_plain()?;
        let tls_stream = timeout(self.command_timeout, connector.connect(name, tcp_stream))
            .await
            .map_err(|_| MailerError::timeout("TLS handshake timed out"))?
            .map_err(|e| MailerError::connection(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        Ok(TransportStream::Tls(BufReader::new(tls_stream)))
    }

    #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
    async fn handshake(&mut self, config: &TlsConfig, server_name: &str) -> MailerResult<TransportStream> {
        let mut builder = native_tls::TlsConnector::builder();
        if let Some(path) = &config.ca_cert_path {
            for der in load_ca_certs(path)? {
                let cert = native_tls::Certificate::from_der(&der).map_err(|e| {
                    MailerError::configuration(format!("Unusable CA certificate: {}", e))
                })?;
                builder.add_root_certificate(cert);
            }
        }

        let connector = builder.build().map_err(|e| {
            MailerError::configuration(format!("Failed to build TLS connector: {}", e))
        })?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tcp_stream = self.detach_plain()?;
        let tls_stream = timeout(self.command_timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| MailerError::timeout("TLS handshake timed out"))?
            .map_err(|e| MailerError::connection(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        Ok(TransportStream::NativeTls(BufReader::new(tls_stream)))
    }

    #[cfg(not(any(feature = "rustls-tls", feature = "native-tls")))]
    async fn handshake(&mut self, _config: &TlsConfig, _server_name: &str) -> MailerResult<TransportStream> {
        Err(MailerError::configuration("No TLS implementation available"))
    }
}

/// Reads every certificate from a PEM bundle, as DER bytes.
pub fn load_ca_certs(path: &Path) -> MailerResult<Vec<Vec<u8>>> {
    let file = std::fs::File::open(path).map_err(|e| {
        MailerError::configuration(format!("Cannot open {}: {}", path.display(), e))
    })?;
    let mut reader = io::BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            MailerError::configuration(format!("Invalid PEM in {}: {}", path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(MailerError::configuration(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

#[cfg(feature = "rustls-tls")]
fn rustls_client_config(config: &TlsConfig) -> MailerResult<rustls::ClientConfig> {
    use rustls::pki_types::CertificateDer;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.ca_cert_path {
        for der in load_ca_certs(path)? {
            roots.add(CertificateDer::from(der)).map_err(|e| {
                MailerError::configuration(format!(
                    "Unusable CA certificate in {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> MailerResult<SmtpResponse> {
        let line = format!("{}\r\n", command.to_smtp_string());

        #[cfg(feature = "tracing")]
        tracing::debug!(command = %command, "Sending SMTP command");

        let command_timeout = self.command_timeout;
        Self::write_all(self.stream.io()?, line.as_bytes(), command_timeout).await?;

        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> MailerResult<()> {
        let command_timeout = self.command_timeout;
        Self::write_all(self.stream.io()?, data, command_timeout).await
    }

    async fn read_response(&mut self) -> MailerResult<SmtpResponse> {
        let command_timeout = self.command_timeout;
        let response = Self::read_response_inner(self.stream.io()?, command_timeout).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(code = response.code, message = %response.first_message(), "Received SMTP response");

        Ok(response)
    }

    async fn upgrade_tls(&mut self, config: &TlsConfig, server_name: &str) -> MailerResult<()> {
        if self.tls_enabled {
            return Ok(());
        }

        let stream = self.handshake(config, server_name).await?;
        self.stream = stream;
        self.tls_enabled = true;
        self.state = TransactionState::TlsEstablished;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> MailerResult<()> {
        if self.state != TransactionState::Closed {
            let _ = self.send_command(&SmtpCommand::Quit).await;
            self.state = TransactionState::Closed;
        }
        Ok(())
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    fn capabilities(&self) -> Option<&EsmtpCapabilities> {
        self.capabilities.as_ref()
    }

    fn set_capabilities(&mut self, caps: EsmtpCapabilities) {
        self.capabilities = Some(caps);
    }
}
