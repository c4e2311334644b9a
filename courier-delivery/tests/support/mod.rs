#![allow(dead_code)]

pub mod mock_server;
pub mod transports;

use std::{sync::Arc, time::Duration};

use courier_common::Message;
use courier_delivery::{
    DeliveryConfig, JobEvent, MailService, RateLimitConfig, RetryPolicy, TemplateRenderer,
};
use courier_spool::{FailureSpool, TestStore};
use tokio::sync::broadcast;

pub use self::{mock_server::MockSmtpServer, transports::ScriptedTransport};

pub const WELCOME: &str = "<p>Hello {{ name }}</p>";

pub fn renderer() -> Arc<TemplateRenderer> {
    Arc::new(TemplateRenderer::inline([
        ("welcome", WELCOME),
        ("broken", "<p>{{ name </p>"),
    ]))
}

/// Config with a 1s retry base and no admission limit
pub fn config() -> DeliveryConfig {
    DeliveryConfig {
        workers: 2,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
        },
        rate_limit: RateLimitConfig {
            max_jobs: 0,
            ..RateLimitConfig::default()
        },
        ..DeliveryConfig::default()
    }
}

pub struct Harness {
    pub service: MailService,
    pub transport: Arc<ScriptedTransport>,
    pub store: TestStore,
}

impl Harness {
    pub fn new(config: DeliveryConfig, transport: ScriptedTransport) -> Self {
        let transport = Arc::new(transport);
        let store = TestStore::new();
        let service = MailService::new(
            config,
            transport.clone(),
            FailureSpool::new(Arc::new(store.clone())),
            renderer(),
        );

        Self {
            service,
            transport,
            store,
        }
    }

    pub fn started(config: DeliveryConfig, transport: ScriptedTransport) -> Self {
        let harness = Self::new(config, transport);
        harness.service.start();
        harness
    }
}

pub fn message(to: &str) -> Message {
    Message::new()
        .to(to)
        .subject("Hello")
        .html("<p>Hello there</p>")
}

/// Wait for the next event that finishes a job
pub async fn next_terminal(events: &mut broadcast::Receiver<JobEvent>) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(event) if event.is_terminal() => return event,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a terminal event")
}
