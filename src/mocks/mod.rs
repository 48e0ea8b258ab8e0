//! Mock implementations for testing.
//!
//! Provides a scripted SMTP connection, a recording mailer, sample input
//! rows and a loopback SMTP server for end-to-end tests.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::auth::AuthMethod;
use crate::config::{SmtpConfig, SmtpConfigBuilder, TlsConfig};
use crate::errors::{MailerError, MailerErrorKind, MailerResult};
use crate::mailer::MailTransport;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::transport::SmtpTransport;
use crate::types::{fields, is_valid_address, Record, RenderedMessage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock SMTP transport for testing.
///
/// Replies are popped from a queue; an empty queue answers `250 OK`.
#[derive(Debug)]
pub struct MockTransport {
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
    responses: Arc<Mutex<VecDeque<SmtpResponse>>>,
    default_response: SmtpResponse,
    state: TransactionState,
    capabilities: Option<EsmtpCapabilities>,
    tls_enabled: bool,
    data_received: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_next: Arc<Mutex<Option<MailerError>>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            default_response: SmtpResponse::new(codes::OK, "OK"),
            state: TransactionState::Connected,
            capabilities: None,
            tls_enabled: false,
            data_received: Arc::new(Mutex::new(Vec::new())),
            fail_next: Arc::new(Mutex::new(None)),
        }
    }

    /// Queues a response.
    pub fn queue_response(&self, response: SmtpResponse) -> &Self {
        lock(&self.responses).push_back(response);
        self
    }

    /// Queues an OK response.
    pub fn queue_ok(&self) -> &Self {
        self.queue_response(SmtpResponse::new(codes::OK, "OK"))
    }

    /// Queues an error response.
    pub fn queue_error(&self, code: u16, message: &str) -> &Self {
        self.queue_response(SmtpResponse::new(code, message))
    }

    /// Makes the next call fail with `error`.
    pub fn fail_next_with(&self, error: MailerError) -> &Self {
        *lock(&self.fail_next) = Some(error);
        self
    }

    /// Sets TLS enabled.
    pub fn set_tls_enabled(&mut self, enabled: bool) {
        self.tls_enabled = enabled;
    }

    /// Returns recorded commands.
    pub fn recorded_commands(&self) -> Vec<SmtpCommand> {
        lock(&self.commands).clone()
    }

    /// Returns raw data written with `send_data`.
    pub fn received_data(&self) -> Vec<Vec<u8>> {
        lock(&self.data_received).clone()
    }

    fn take_failure(&self) -> MailerResult<()> {
        match lock(&self.fail_next).take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn next_response(&self) -> SmtpResponse {
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> MailerResult<SmtpResponse> {
        self.take_failure()?;
        lock(&self.commands).push(command.clone());
        Ok(self.next_response())
    }

    async fn send_data(&mut self, data: &[u8]) -> MailerResult<()> {
        self.take_failure()?;
        lock(&self.data_received).push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> MailerResult<SmtpResponse> {
        self.take_failure()?;
        Ok(self.next_response())
    }

    async fn upgrade_tls(&mut self, _config: &TlsConfig, _server_name: &str) -> MailerResult<()> {
        self.take_failure()?;
        self.tls_enabled = true;
        self.state = TransactionState::TlsEstablished;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> MailerResult<()> {
        self.state = TransactionState::Closed;
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

/// Mailer-level fake: records deliveries and fails chosen recipients.
///
/// Addresses are trimmed and shape-checked like the real mailer, so an
/// invalid address fails with `InvalidAddress` and is never recorded.
#[derive(Debug, Clone, Default)]
pub struct MockMailTransport {
    deliveries: Arc<Mutex<Vec<(String, RenderedMessage)>>>,
    attempts: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<HashMap<String, MailerErrorKind>>>,
    delay: Option<Duration>,
}

impl MockMailTransport {
    /// Creates a fake that accepts every valid address.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits `delay` inside every send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes sends to `address` fail with `kind`.
    pub fn fail_recipient(&self, address: &str, kind: MailerErrorKind) -> &Self {
        lock(&self.failures).insert(address.to_string(), kind);
        self
    }

    /// Returns accepted deliveries in order.
    pub fn deliveries(&self) -> Vec<(String, RenderedMessage)> {
        lock(&self.deliveries).clone()
    }

    /// Returns every address that reached `send`, valid or not.
    pub fn attempts(&self) -> Vec<String> {
        lock(&self.attempts).clone()
    }
}

#[async_trait]
impl MailTransport for MockMailTransport {
    async fn send(&self, to: &str, message: &RenderedMessage) -> MailerResult<()> {
        lock(&self.attempts).push(to.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let to = to.trim();
        if !is_valid_address(to) {
            return Err(MailerError::invalid_address(to));
        }

        let failure = lock(&self.failures).get(to).copied();
        if let Some(kind) = failure {
            return Err(MailerError::new(kind, format!("Simulated failure for {}", to)));
        }

        lock(&self.deliveries).push((to.to_string(), message.clone()));
        Ok(())
    }
}

/// Creates a schedule row.
pub fn schedule_record(
    email: &str,
    name: &str,
    subject: &str,
    class_section: &str,
    exam_date: &str,
) -> Record {
    Record::new()
        .with(fields::EMAIL, email)
        .with(fields::RECIPIENT_NAME, name)
        .with(fields::TRACK, "Computer Science")
        .with(fields::SUBJECT, subject)
        .with(fields::CLASS_SECTION, class_section)
        .with(fields::EXAM_DATE, exam_date)
        .with(fields::EXAM_TIME, "08:00")
}

/// Three rows: two for `a@x.com`/Alice, one for `bad-address`/Bob.
pub fn sample_records() -> Vec<Record> {
    vec![
        schedule_record("a@x.com", "Alice", "Databases", "CS101", "2024-06-15"),
        schedule_record("bad-address", "Bob", "Networks", "CS201", "2024-06-16"),
        schedule_record("a@x.com", "Alice", "Databases", "CS102", "2024-06-17"),
    ]
}

/// Creates an EHLO response with standard capabilities.
pub fn ehlo_response() -> SmtpResponse {
    SmtpResponse {
        code: codes::OK,
        enhanced_code: None,
        message: vec![
            "smtp.example.com Hello".to_string(),
            "SIZE 10485760".to_string(),
            "AUTH PLAIN LOGIN CRAM-MD5".to_string(),
            "STARTTLS".to_string(),
            "8BITMIME".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ],
        is_multiline: true,
    }
}

/// Creates a greeting response.
pub fn greeting_response() -> SmtpResponse {
    SmtpResponse::new(codes::SERVICE_READY, "smtp.example.com ESMTP ready")
}

/// Behaviour knobs for [`FakeSmtpServer`].
#[derive(Debug, Clone, Default)]
pub struct FakeServerBehavior {
    /// Recipients answered with `550` at RCPT.
    pub reject_recipients: Vec<String>,
    /// Answer AUTH with `535`.
    pub reject_auth: bool,
    /// Send the greeting, then never answer again.
    pub stall: bool,
}

/// A message accepted by [`FakeSmtpServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeDelivery {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipient.
    pub to: String,
    /// DATA payload without the terminating `.` line.
    pub data: String,
}

/// Plain-text SMTP server on loopback.
///
/// Offers only `AUTH CRAM-MD5` so it works without TLS. The listener is
/// stopped on drop.
#[derive(Debug)]
pub struct FakeSmtpServer {
    addr: SocketAddr,
    deliveries: Arc<Mutex<Vec<FakeDelivery>>>,
    task: JoinHandle<()>,
}

const FAKE_SIZE_LIMIT: usize = 1_000_000;
const FAKE_CHALLENGE: &str = "<1896.697170952@fake.test>";

impl FakeSmtpServer {
    /// Binds to an ephemeral port and starts serving.
    pub async fn start(behavior: FakeServerBehavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let deliveries = Arc::new(Mutex::new(Vec::new()));
        let behavior = Arc::new(behavior);

        let sink = deliveries.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let behavior = behavior.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, &behavior, &sink).await;
                });
            }
        });

        Ok(Self {
            addr,
            deliveries,
            task,
        })
    }

    /// Returns the bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Returns accepted messages in order.
    pub fn deliveries(&self) -> Vec<FakeDelivery> {
        lock(&self.deliveries).clone()
    }

    /// Returns a config builder pointed at this server, without TLS.
    pub fn config_builder(&self) -> SmtpConfigBuilder {
        SmtpConfig::builder()
            .host("127.0.0.1")
            .port(self.port())
            .no_tls()
            .credentials("office@example.com", "app-password")
            .auth_method(AuthMethod::CramMd5)
    }
}

impl Drop for FakeSmtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    behavior: &FakeServerBehavior,
    sink: &Mutex<Vec<FakeDelivery>>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    write.write_all(b"220 fake.test ESMTP ready\r\n").await?;
    if behavior.stall {
        reader.read_line(&mut line).await?;
        std::future::pending::<()>().await;
    }

    let mut from = String::new();
    let mut to = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_ascii_uppercase();

        let reply = if command.starts_with("EHLO") {
            format!(
                "250-fake.test\r\n250-AUTH CRAM-MD5\r\n250 SIZE {}\r\n",
                FAKE_SIZE_LIMIT
            )
        } else if command.starts_with("AUTH") {
            let challenge = format!("334 {}\r\n", BASE64.encode(FAKE_CHALLENGE));
            write.write_all(challenge.as_bytes()).await?;
            line.clear();
            reader.read_line(&mut line).await?;
            if behavior.reject_auth {
                "535 5.7.8 Authentication credentials invalid\r\n".to_string()
            } else {
                "235 2.7.0 Accepted\r\n".to_string()
            }
        } else if command.starts_with("MAIL FROM") {
            from = angle_bracketed(&line);
            "250 2.1.0 OK\r\n".to_string()
        } else if command.starts_with("RCPT TO") {
            to = angle_bracketed(&line);
            if behavior.reject_recipients.contains(&to) {
                "550 5.1.1 No such user\r\n".to_string()
            } else {
                "250 2.1.5 OK\r\n".to_string()
            }
        } else if command == "DATA" {
            write.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await?;
            let mut data = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" {
                    break;
                }
                data.push_str(&line);
            }
            lock(sink).push(FakeDelivery {
                from: from.clone(),
                to: to.clone(),
                data,
            });
            "250 2.0.0 Queued\r\n".to_string()
        } else if command == "QUIT" {
            write.write_all(b"221 2.0.0 Bye\r\n").await?;
            return Ok(());
        } else {
            "502 5.5.1 Command not implemented\r\n".to_string()
        };

        write.write_all(reply.as_bytes()).await?;
    }
}

fn angle_bracketed(line: &str) -> String {
    line.split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(inner, _)| inner.to_string())
        .unwrap_or_default()
}
