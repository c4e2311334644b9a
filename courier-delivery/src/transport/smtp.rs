//! SMTP carrier built on lettre's async connection.

use std::time::Duration;

use async_trait::async_trait;
use courier_common::outgoing;
use lettre::{
    address::Envelope,
    message::{
        Mailbox, MultiPart,
        header::{ContentType, HeaderName, HeaderValue},
    },
    transport::smtp::{
        self,
        authentication::{Credentials, Mechanism},
        client::{AsyncSmtpConnection, TlsParameters},
        extension::ClientId,
    },
};
use serde::Deserialize;

use super::{Carrier, CarrierConnection, PoolConfig, PreparedMessage};
use crate::TransportError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TlsMode {
    /// Plaintext session, for local relays
    None,
    /// Upgrade with STARTTLS, failing if the server does not offer it
    #[default]
    StartTls,
    /// TLS from the first byte (usually port 465)
    Wrapper,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: TlsMode,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Name announced in EHLO
    #[serde(default = "default_hello_name")]
    pub hello_name: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub pool: PoolConfig,
}

const fn default_port() -> u16 {
    587
}

fn default_hello_name() -> String {
    "localhost".to_string()
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: TlsMode::default(),
            username: None,
            password: None,
            hello_name: default_hello_name(),
            connect_timeout_secs: default_connect_timeout_secs(),
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpCarrier {
    config: SmtpConfig,
}

impl SmtpCarrier {
    pub const fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn tls_parameters(&self) -> Result<TlsParameters, TransportError> {
        TlsParameters::new(self.config.host.clone()).map_err(|e| classify(&e))
    }
}

#[async_trait]
impl Carrier for SmtpCarrier {
    type Connection = SmtpConnection;

    #[tracing::instrument(level = "debug", skip(self), fields(host = %self.config.host, port = self.config.port))]
    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        let hello = ClientId::Domain(self.config.hello_name.clone());
        let timeout = Some(Duration::from_secs(self.config.connect_timeout_secs));

        let wrapper = match self.config.tls {
            TlsMode::Wrapper => Some(self.tls_parameters()?),
            TlsMode::None | TlsMode::StartTls => None,
        };

        let mut connection = AsyncSmtpConnection::connect_tokio1(
            (self.config.host.as_str(), self.config.port),
            timeout,
            &hello,
            wrapper,
            None,
        )
        .await
        .map_err(|e| classify(&e))?;

        if self.config.tls == TlsMode::StartTls {
            if !connection.can_starttls() {
                connection.abort().await;
                return Err(TransportError::Connectivity(format!(
                    "{} does not offer STARTTLS",
                    self.config.host
                )));
            }

            connection
                .starttls(self.tls_parameters()?, &hello)
                .await
                .map_err(|e| classify(&e))?;
        }

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            let credentials = Credentials::new(username.clone(), password.clone());
            if let Err(e) = connection
                .auth(&[Mechanism::Plain, Mechanism::Login], &credentials)
                .await
            {
                connection.abort().await;
                return Err(classify(&e));
            }
        }

        outgoing!(
            level = DEBUG,
            "Connected to {}:{}",
            self.config.host,
            self.config.port
        );

        Ok(SmtpConnection { inner: connection })
    }
}

pub struct SmtpConnection {
    inner: AsyncSmtpConnection,
}

impl std::fmt::Debug for SmtpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConnection")
            .field("broken", &self.inner.has_broken())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CarrierConnection for SmtpConnection {
    async fn send(&mut self, message: &PreparedMessage) -> Result<String, TransportError> {
        let (envelope, bytes) = build_message(message)?;
        let response = self
            .inner
            .send(&envelope, &bytes)
            .await
            .map_err(|e| classify(&e))?;

        Ok(format!(
            "{} {}",
            response.code(),
            response.first_line().unwrap_or_default()
        ))
    }

    async fn is_alive(&mut self) -> bool {
        !self.inner.has_broken() && self.inner.test_connected().await
    }

    async fn close(&mut self) {
        if self.inner.quit().await.is_err() {
            self.inner.abort().await;
        }
    }
}

fn mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address
        .parse::<Mailbox>()
        .map_err(|e| TransportError::Envelope(format!("invalid address {address}: {e}")))
}

/// Build the wire message and its SMTP envelope
///
/// # Errors
/// Returns [`TransportError::Envelope`] for addresses or headers lettre rejects
pub fn build_message(prepared: &PreparedMessage) -> Result<(Envelope, Vec<u8>), TransportError> {
    let message = &prepared.message;

    let mut builder = lettre::Message::builder()
        .from(mailbox(&prepared.from)?)
        .subject(message.subject.clone())
        .message_id(Some(prepared.message_id.clone()));

    for address in &message.to {
        builder = builder.to(mailbox(address)?);
    }
    for address in &message.cc {
        builder = builder.cc(mailbox(address)?);
    }
    for address in &message.bcc {
        builder = builder.bcc(mailbox(address)?);
    }
    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(mailbox(reply_to)?);
    }

    for (name, value) in &message.headers {
        let header = HeaderName::new_from_ascii(name.clone())
            .map_err(|_| TransportError::Envelope(format!("invalid header name {name}")))?;
        builder = builder.raw_header(HeaderValue::new(header, value.clone()));
    }

    let email = match (&message.html, &message.text) {
        (Some(html), Some(text)) => {
            builder.multipart(MultiPart::alternative_plain_html(text.clone(), html.clone()))?
        }
        (Some(html), None) => builder.header(ContentType::TEXT_HTML).body(html.clone())?,
        (None, Some(text)) => builder.header(ContentType::TEXT_PLAIN).body(text.clone())?,
        (None, None) => {
            return Err(TransportError::Envelope("message has no body".to_string()));
        }
    };

    Ok((email.envelope().clone(), email.formatted()))
}

/// Map a lettre error onto the transport taxonomy
///
/// Reply codes decide first: 530/534/535/538 and 454 are credential
/// problems, 421 means the server is going away, and mailbox or syntax
/// rejections are envelope problems. Anything without a reply code that is
/// not a lettre client error happened on the wire.
pub fn classify(error: &smtp::Error) -> TransportError {
    let detail = error.to_string();
    let code = error
        .status()
        .and_then(|code| code.to_string().parse::<u16>().ok());

    match code {
        Some(454 | 530 | 534 | 535 | 538) => TransportError::Auth(detail),
        Some(421) => TransportError::Connectivity(detail),
        Some(450..=452 | 501 | 503 | 550..=554) => TransportError::Envelope(detail),
        Some(_) => TransportError::Unknown(detail),
        None if error.is_timeout() || !(error.is_client() || error.is_response()) => {
            TransportError::Connectivity(detail)
        }
        None => TransportError::Unknown(detail),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use courier_common::Message;

    use super::*;
    use crate::transport::{MessageDefaults, TRACE_HEADER};

    #[test]
    fn test_build_message_headers_and_envelope() {
        let message = Message::new()
            .to("a@x.com")
            .cc("b@x.com")
            .bcc("hidden@x.com")
            .subject("Hi")
            .html("<p>hi</p>")
            .header("X-Campaign", "spring");
        let prepared = MessageDefaults::default().prepare(&message);

        let (envelope, bytes) = build_message(&prepared).unwrap();
        let wire = String::from_utf8(bytes).unwrap();

        assert_eq!(envelope.to().len(), 3);
        assert!(wire.contains("X-Campaign: spring"));
        assert!(wire.contains(&format!("{TRACE_HEADER}: {}", prepared.trace_id)));
        assert!(wire.contains(&prepared.message_id));
        assert!(wire.contains("multipart/alternative"));
        assert!(!wire.contains("hidden@x.com"));
    }

    #[test]
    fn test_build_message_rejects_bad_address() {
        let message = Message::new().to("not an address").subject("Hi").text("hi");
        let prepared = MessageDefaults::default().prepare(&message);

        assert!(matches!(
            build_message(&prepared),
            Err(TransportError::Envelope(_))
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config: SmtpConfig = ron::from_str(r#"(host: "smtp.example.com")"#).unwrap();
        assert_eq!(config.port, 587);
        assert_eq!(config.tls, TlsMode::StartTls);
        assert_eq!(config.pool.max_connections, 5);
        assert_eq!(config.pool.max_messages_per_connection, 100);
    }
}
