/// transport seam: broker traits plus the lazy connection session
///
/// The cache core never talks to a concrete broker client; it publishes and
/// consumes through these traits.  The crate ships an in-memory broker in
/// [`memory`] for tests and local development; an AMQP adapter plugs in
/// behind the same traits.
use async_channel::Receiver;
use async_std::sync::Mutex;
use async_trait::async_trait;
use log::*;
use std::sync::Arc;

use crate::error::TransportError;
use crate::message::{Delivery, Properties};

pub mod memory;

/// The kind of routing an exchange performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// route by pattern-matching the routing key
    Topic,
    /// broadcast to every bound queue
    Fanout,
}

/// A broker endpoint that can open connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError>;
}

/// One physical connection to the broker; channels multiplex over it.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;
    fn is_open(&self) -> bool;
    async fn close(&self);
}

/// A lightweight publish/consume handle over a connection.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError>;

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError>;

    /// publish to an exchange; the empty-string exchange routes directly
    /// to the queue named by the routing key
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// subscribe to a queue; cloned receivers compete for deliveries
    async fn consume(&self, queue: &str) -> Result<Receiver<Delivery>, TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Holds a consumer/publisher task's current channel and closes it when
/// dropped.  Cancellation drops a task's future mid-await, so the close
/// runs from `Drop` on a freshly spawned task rather than in loop code
/// that may never be reached.
pub struct ChannelGuard {
    channel: Option<Arc<dyn Channel>>,
}

impl ChannelGuard {
    pub fn new(channel: Arc<dyn Channel>) -> ChannelGuard {
        ChannelGuard {
            channel: Some(channel),
        }
    }

    /// a guard with no channel yet; senders acquire lazily
    pub fn empty() -> ChannelGuard {
        ChannelGuard { channel: None }
    }

    pub fn current(&self) -> Option<Arc<dyn Channel>> {
        self.channel.clone()
    }

    /// swap in a fresh channel, closing the previous one if still open
    pub fn replace(&mut self, channel: Arc<dyn Channel>) {
        self.close_current();
        self.channel = Some(channel);
    }

    /// discard the current channel, e.g. after a failed publish
    pub fn clear(&mut self) {
        self.close_current();
    }

    fn close_current(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.is_open() {
                async_std::task::spawn(async move { channel.close().await });
            }
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.close_current();
    }
}

/// Owns the single broker connection for a cache instance, created lazily
/// and replaced on demand when it is found closed.  Channels are handed out
/// per worker; the session never retries a publish or consume itself.
pub struct Session {
    transport: Arc<dyn Transport>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>) -> Session {
        Session {
            transport,
            connection: Mutex::new(None),
        }
    }

    /// return the live connection, connecting lazily; a closed cached
    /// connection is dropped and re-established
    pub async fn connection(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.is_open() {
                return Ok(conn.clone());
            }
            info!("cached connection is closed, reconnecting");
        }

        let conn = self.transport.connect().await?;
        *guard = Some(conn.clone());

        Ok(conn)
    }

    /// open a new channel on the cached connection; if channel creation
    /// fails the connection is re-established and tried once more
    pub async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let conn = self.connection().await?;
        match conn.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                warn!("channel create failed: {}, reconnecting once", e);
                let mut guard = self.connection.lock().await;
                *guard = None;
                drop(guard);

                let conn = self.connection().await?;
                conn.create_channel().await
            }
        }
    }

    /// close the cached connection, if any; best effort
    pub async fn close(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.take() {
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBus;
    use super::*;

    #[test]
    fn lazy_connection() {
        async_std::task::block_on(async move {
            let bus = Arc::new(MemoryBus::new());
            let session = Session::new(bus);

            let a = session.connection().await.expect("should connect");
            let b = session.connection().await.expect("should reuse");
            assert!(Arc::ptr_eq(&a, &b));
        });
    }

    #[test]
    fn reconnect_after_close() {
        async_std::task::block_on(async move {
            let bus = Arc::new(MemoryBus::new());
            let session = Session::new(bus);

            let a = session.connection().await.expect("should connect");
            a.close().await;
            assert!(!a.is_open());

            let b = session.connection().await.expect("should reconnect");
            assert!(b.is_open());
            assert!(!Arc::ptr_eq(&a, &b));
        });
    }

    #[test]
    fn channels() {
        async_std::task::block_on(async move {
            let bus = Arc::new(MemoryBus::new());
            let session = Session::new(bus);

            let channel = session.create_channel().await.expect("should open");
            assert!(channel.is_open());
            channel.close().await;
            assert!(!channel.is_open());

            // a new channel is independent of the closed one
            let channel = session.create_channel().await.expect("should reopen");
            assert!(channel.is_open());
        });
    }

    #[test]
    fn guard_closes_channel_on_drop() {
        async_std::task::block_on(async move {
            let bus = Arc::new(MemoryBus::new());
            let session = Session::new(bus);

            let channel = session.create_channel().await.expect("should open");
            drop(ChannelGuard::new(channel.clone()));

            // the close runs on a spawned task
            for _ in 0..50 {
                if !channel.is_open() {
                    break;
                }
                async_std::task::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert!(!channel.is_open());

            // replacing also closes the outgoing channel
            let first = session.create_channel().await.expect("should open");
            let second = session.create_channel().await.expect("should open");
            let mut guard = ChannelGuard::new(first.clone());
            guard.replace(second.clone());
            for _ in 0..50 {
                if !first.is_open() {
                    break;
                }
                async_std::task::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert!(!first.is_open());
            assert!(second.is_open());
        });
    }
}
