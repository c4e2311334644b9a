//! Transport that writes messages to the log instead of a carrier.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use courier_common::{Message, outgoing};
use serde::Deserialize;

use super::{DeliveryReceipt, MessageDefaults, Transport};
use crate::TransportError;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LogConfig {
    /// Also log headers and bodies
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Default)]
pub struct LogTransport {
    config: LogConfig,
    defaults: MessageDefaults,
    delivered: AtomicU64,
}

impl LogTransport {
    pub const fn new(config: LogConfig, defaults: MessageDefaults) -> Self {
        Self {
            config,
            defaults,
            delivered: AtomicU64::new(0),
        }
    }

    /// Messages logged since construction
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, message: &Message) -> Result<DeliveryReceipt, TransportError> {
        let prepared = self.defaults.prepare(message);
        let message = &prepared.message;

        outgoing!(
            level = INFO,
            trace_id = %prepared.trace_id,
            from = %prepared.from,
            to = ?message.to,
            cc = ?message.cc,
            bcc = ?message.bcc,
            subject = %message.subject,
            "Logged message"
        );

        if self.config.verbose {
            outgoing!(
                level = DEBUG,
                trace_id = %prepared.trace_id,
                reply_to = ?message.reply_to,
                headers = ?message.headers,
                text = message.text.as_deref().unwrap_or_default(),
                html = message.html.as_deref().unwrap_or_default(),
                "Message content"
            );
        }

        self.delivered.fetch_add(1, Ordering::Relaxed);

        Ok(DeliveryReceipt::new(&prepared, "250 logged".to_string()))
    }

    async fn verify(&self) -> bool {
        true
    }
}
