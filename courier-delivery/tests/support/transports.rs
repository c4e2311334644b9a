//! In-process transports with scripted outcomes
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use courier_common::Message;
use courier_delivery::{DeliveryReceipt, MessageDefaults, Transport, TransportError};
use parking_lot::Mutex;

/// Transport that replays a script of failures, then succeeds
///
/// Queued failures are consumed one per call. Once the script is empty the
/// transport either succeeds or, if [`ScriptedTransport::fail_always`] was
/// set, returns that error forever.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    defaults: MessageDefaults,
    script: Mutex<VecDeque<TransportError>>,
    always: Mutex<Option<TransportError>>,
    latency: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    delivered: Mutex<Vec<Message>>,
    unreachable: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with `error`
    pub fn failing(error: TransportError) -> Self {
        let transport = Self::default();
        transport.fail_always(Some(error));
        transport
    }

    /// Fail the next call with `error`
    pub fn push_failure(&self, error: TransportError) {
        self.script.lock().push_back(error);
    }

    pub fn fail_always(&self, error: Option<TransportError>) {
        *self.always.lock() = error;
    }

    /// Hold every delivery this long before answering
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Message> {
        self.delivered.lock().clone()
    }

    fn outcome(&self) -> Option<TransportError> {
        self.script
            .lock()
            .pop_front()
            .or_else(|| self.always.lock().clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn deliver(&self, message: &Message) -> Result<DeliveryReceipt, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.outcome() {
            return Err(error);
        }

        let prepared = self.defaults.prepare(message);
        self.delivered.lock().push(prepared.message.clone());
        Ok(DeliveryReceipt {
            accepted: prepared.message.recipients().map(str::to_string).collect(),
            message_id: prepared.message_id,
            trace_id: prepared.trace_id,
            response: "250 OK".to_string(),
        })
    }

    async fn verify(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}
