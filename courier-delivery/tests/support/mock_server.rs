//! Mock SMTP server for exercising the SMTP carrier
//!
//! Speaks just enough SMTP for lettre's client: EHLO, AUTH, MAIL, RCPT,
//! DATA, NOOP, RSET and QUIT. Responses to MAIL, RCPT, AUTH and the end of
//! DATA are configurable, and every command and message body is recorded.
#![allow(dead_code)]

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content (after DATA)
    MessageContent(Vec<u8>),
    Noop,
    Rset,
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    capabilities: Vec<String>,
    auth_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    data_end_response: SmtpResponse,
    response_delay: Option<Duration>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            capabilities: vec![
                "localhost".to_string(),
                "SIZE 10000000".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
            ],
            auth_response: SmtpResponse::new(235, "Authentication successful"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            response_delay: None,
        }
    }
}

fn ehlo_bytes(capabilities: &[String]) -> Vec<u8> {
    let mut response = String::new();
    for (i, cap) in capabilities.iter().enumerate() {
        let separator = if i + 1 < capabilities.len() { '-' } else { ' ' };
        let _ = write!(&mut response, "250{separator}{cap}\r\n");
    }
    response.into_bytes()
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// Bodies of every message received, in order
    pub async fn messages(&self) -> Vec<String> {
        self.commands_received
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => {
                    Some(String::from_utf8_lossy(content).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    /// Connections accepted so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn respond(
        writer: &mut (impl AsyncWriteExt + Unpin),
        config: &MockServerConfig,
        response: &[u8],
    ) -> std::io::Result<()> {
        if let Some(delay) = config.response_delay {
            tokio::time::sleep(delay).await;
        }
        writer.write_all(response).await?;
        writer.flush().await
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer
            .write_all(&SmtpResponse::new(220, "Mock SMTP Server").to_bytes())
            .await?;
        writer.flush().await?;

        loop {
            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            let cmd_line = line.trim();
            tracing::debug!("Mock server received: {}", cmd_line);

            let (verb, argument) = cmd_line.split_once(' ').unwrap_or((cmd_line, ""));
            let argument = argument.to_string();

            let (response, command) = match verb.to_uppercase().as_str() {
                "EHLO" => (ehlo_bytes(&config.capabilities), SmtpCommand::Ehlo(argument)),
                "AUTH" => (config.auth_response.to_bytes(), SmtpCommand::Auth(argument)),
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(argument),
                ),
                "RCPT" => (
                    config.rcpt_to_response.to_bytes(),
                    SmtpCommand::RcptTo(argument),
                ),
                "DATA" => (
                    SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>").to_bytes(),
                    SmtpCommand::Data,
                ),
                "NOOP" => (SmtpResponse::new(250, "OK").to_bytes(), SmtpCommand::Noop),
                "RSET" => (SmtpResponse::new(250, "OK").to_bytes(), SmtpCommand::Rset),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    Self::respond(&mut writer, &config, &SmtpResponse::new(221, "Bye").to_bytes())
                        .await?;
                    return Ok(());
                }
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            let is_data = command == SmtpCommand::Data;
            commands.write().await.push(command);
            Self::respond(&mut writer, &config, &response).await?;

            if is_data {
                let mut content = Vec::new();
                let mut data_line = String::new();
                loop {
                    data_line.clear();
                    if reader.read_line(&mut data_line).await? == 0 {
                        return Ok(());
                    }
                    if data_line.trim_end_matches(['\r', '\n']) == "." {
                        break;
                    }
                    content.extend_from_slice(data_line.as_bytes());
                }

                commands
                    .write()
                    .await
                    .push(SmtpCommand::MessageContent(content));
                Self::respond(&mut writer, &config, &config.data_end_response.to_bytes()).await?;
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.auth_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    /// Bind to a random local port and start serving
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        tokio::spawn({
            let commands = Arc::clone(&commands);
            let shutdown = Arc::clone(&shutdown);
            let connections = Arc::clone(&connections);
            async move {
                while !shutdown.load(Ordering::Relaxed) {
                    // Accept with a timeout so the shutdown flag is rechecked
                    let Ok(Ok((stream, _peer))) =
                        timeout(Duration::from_millis(100), listener.accept()).await
                    else {
                        continue;
                    };

                    connections.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands);
                    tokio::spawn(async move {
                        if let Err(e) = MockSmtpServer::handle_client(stream, config, commands).await
                        {
                            tracing::debug!("Mock server client error: {}", e);
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            shutdown,
            connections,
        })
    }
}
