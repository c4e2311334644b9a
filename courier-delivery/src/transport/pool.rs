//! Bounded pool of carrier connections.
//!
//! At most `max_connections` connections exist in use at once; each one is
//! checked out by a single worker, returned after a successful send, and
//! retired once it has carried `max_messages_per_connection` messages. A
//! connection that reported an error is closed rather than returned.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use courier_common::outgoing;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};

use super::PreparedMessage;
use crate::TransportError;

/// Something that can open sessions with a mail carrier.
#[async_trait]
pub trait Carrier: Send + Sync + std::fmt::Debug + 'static {
    type Connection: CarrierConnection;

    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// One open carrier session.
#[async_trait]
pub trait CarrierConnection: Send + std::fmt::Debug + 'static {
    /// Hand over a message, returning the carrier's response line
    async fn send(&mut self, message: &PreparedMessage) -> Result<String, TransportError>;

    /// Cheap liveness probe for idle connections
    async fn is_alive(&mut self) -> bool;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_messages_per_connection")]
    pub max_messages_per_connection: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_messages_per_connection: default_max_messages_per_connection(),
        }
    }
}

const fn default_max_connections() -> usize {
    5
}

const fn default_max_messages_per_connection() -> u32 {
    100
}

#[derive(Debug)]
struct Idle<T> {
    connection: T,
    sent: u32,
}

#[derive(Debug)]
pub struct ConnectionPool<C: Carrier> {
    carrier: C,
    config: PoolConfig,
    permits: Semaphore,
    idle: Mutex<Vec<Idle<C::Connection>>>,
    opened: AtomicU64,
    rotated: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub opened: u64,
    pub rotated: u64,
    pub discarded: u64,
}

impl<C: Carrier> ConnectionPool<C> {
    pub fn new(carrier: C, config: PoolConfig) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            carrier,
            config: PoolConfig {
                max_connections,
                max_messages_per_connection: config.max_messages_per_connection.max(1),
            },
            permits: Semaphore::new(max_connections),
            idle: Mutex::new(Vec::with_capacity(max_connections)),
            opened: AtomicU64::new(0),
            rotated: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub const fn carrier(&self) -> &C {
        &self.carrier
    }

    /// Wait for a free slot, then reuse an idle connection or open a new one
    ///
    /// # Errors
    /// Returns the carrier's error if a new connection cannot be opened
    pub async fn checkout(&self) -> Result<Lease<'_, C>, TransportError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Connectivity("connection pool closed".to_string()))?;

        loop {
            let idle = self.idle.lock().pop();
            let Some(mut idle) = idle else { break };

            if idle.connection.is_alive().await {
                return Ok(Lease {
                    pool: self,
                    connection: idle.connection,
                    sent: idle.sent,
                    _permit: permit,
                });
            }

            outgoing!(level = DEBUG, "Dropping dead idle carrier connection");
            idle.connection.close().await;
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }

        let connection = self.carrier.connect().await?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        outgoing!(level = DEBUG, "Opened carrier connection");

        Ok(Lease {
            pool: self,
            connection,
            sent: 0,
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            in_use: self.config.max_connections - self.permits.available_permits(),
            opened: self.opened.load(Ordering::Relaxed),
            rotated: self.rotated.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Close every idle connection
    pub async fn close_idle(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for mut entry in idle {
            entry.connection.close().await;
        }
    }
}

/// A connection checked out of the pool.
///
/// Dropping a lease without [`finish`](Self::finish) or
/// [`discard`](Self::discard) frees the slot and drops the connection.
#[derive(Debug)]
pub struct Lease<'a, C: Carrier> {
    pool: &'a ConnectionPool<C>,
    connection: C::Connection,
    sent: u32,
    _permit: SemaphorePermit<'a>,
}

impl<C: Carrier> Lease<'_, C> {
    pub fn connection(&mut self) -> &mut C::Connection {
        &mut self.connection
    }

    /// The message went through: return the connection, or retire it if it
    /// has reached its message quota
    pub async fn finish(mut self) {
        self.sent += 1;

        if self.sent >= self.pool.config.max_messages_per_connection {
            outgoing!(
                level = DEBUG,
                sent = self.sent,
                "Rotating carrier connection"
            );
            self.connection.close().await;
            self.pool.rotated.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.release();
    }

    /// Return the connection without counting a message against it
    pub fn release(self) {
        let Self {
            pool,
            connection,
            sent,
            _permit,
        } = self;
        pool.idle.lock().push(Idle { connection, sent });
    }

    /// The connection misbehaved: close it instead of returning it
    pub async fn discard(mut self) {
        self.connection.close().await;
        self.pool.discarded.fetch_add(1, Ordering::Relaxed);
    }
}
