//! Transport adapter: turns a [`Message`] into a delivered mail.
//!
//! Every implementation runs messages through [`MessageDefaults::prepare`]
//! first, so callers can rely on a sender being present, a plain-text
//! alternative existing whenever HTML does, and a trace id header being set.
//!
//! - [`PooledTransport`] drives a [`Carrier`] through a bounded
//!   [`ConnectionPool`]; [`SmtpCarrier`] is the production carrier
//! - [`LogTransport`] logs the prepared message and reports success

pub mod log;
pub mod pool;
pub mod prepare;
pub mod smtp;

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{Message, outgoing};
use serde::{Deserialize, Serialize};

pub use self::{
    log::{LogConfig, LogTransport},
    pool::{Carrier, CarrierConnection, ConnectionPool, PoolConfig, PoolStats},
    prepare::{MessageDefaults, PreparedMessage, TRACE_HEADER, html_to_text},
    smtp::{SmtpCarrier, SmtpConfig, TlsMode},
};
use crate::TransportError;

/// Proof that a carrier accepted a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub trace_id: String,
    pub accepted: Vec<String>,
    /// Carrier response, e.g. the SMTP reply line
    pub response: String,
}

impl DeliveryReceipt {
    pub(crate) fn new(prepared: &PreparedMessage, response: String) -> Self {
        Self {
            message_id: prepared.message_id.clone(),
            trace_id: prepared.trace_id.clone(),
            accepted: prepared.message.recipients().map(str::to_string).collect(),
            response,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns a classified [`TransportError`] when the carrier fails
    async fn deliver(&self, message: &Message) -> Result<DeliveryReceipt, TransportError>;

    /// Whether the carrier can currently be reached
    async fn verify(&self) -> bool;
}

/// Transport adapter over a pooled [`Carrier`]
#[derive(Debug)]
pub struct PooledTransport<C: Carrier> {
    defaults: MessageDefaults,
    pool: ConnectionPool<C>,
}

impl<C: Carrier> PooledTransport<C> {
    pub fn new(carrier: C, defaults: MessageDefaults, pool: PoolConfig) -> Self {
        Self {
            defaults,
            pool: ConnectionPool::new(carrier, pool),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn close(&self) {
        self.pool.close_idle().await;
    }
}

#[async_trait]
impl<C: Carrier> Transport for PooledTransport<C> {
    fn name(&self) -> &'static str {
        "pooled"
    }

    async fn deliver(&self, message: &Message) -> Result<DeliveryReceipt, TransportError> {
        let prepared = self.defaults.prepare(message);
        let mut lease = self.pool.checkout().await?;

        match lease.connection().send(&prepared).await {
            Ok(response) => {
                lease.finish().await;
                outgoing!(
                    level = DEBUG,
                    trace_id = %prepared.trace_id,
                    "Carrier accepted message: {response}"
                );
                Ok(DeliveryReceipt::new(&prepared, response))
            }
            Err(e) => {
                lease.discard().await;
                Err(e)
            }
        }
    }

    async fn verify(&self) -> bool {
        // Idle connections are probed during checkout and new ones have just
        // completed a handshake
        match self.pool.checkout().await {
            Ok(lease) => {
                lease.release();
                true
            }
            Err(e) => {
                outgoing!(level = DEBUG, error = %e, "Carrier verification failed");
                false
            }
        }
    }
}

/// Which transport the service uses
///
/// ```ron
/// transport: Smtp(
///     host: "smtp.example.com",
///     port: 587,
///     tls: StartTls,
///     username: Some("courier"),
///     password: Some("secret"),
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum TransportConfig {
    Smtp(SmtpConfig),
    Log(LogConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Log(LogConfig::default())
    }
}

impl TransportConfig {
    pub fn build(self, defaults: MessageDefaults) -> Arc<dyn Transport> {
        match self {
            Self::Smtp(config) => {
                let pool = config.pool;
                Arc::new(PooledTransport::new(
                    SmtpCarrier::new(config),
                    defaults,
                    pool,
                ))
            }
            Self::Log(config) => Arc::new(LogTransport::new(config, defaults)),
        }
    }
}
