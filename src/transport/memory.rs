/// in-process message broker used for tests and local development
///
/// Implements the transport traits with the same routing semantics the
/// cache expects from a real broker: topic exchanges with `#`/`*` pattern
/// matching, fanout exchanges, and a default `""` exchange that routes
/// directly to the queue named by the routing key.  Queues are unbounded
/// mpmc channels, so multiple consumers on one queue compete for
/// deliveries just like broker round-robin.
use async_channel::{unbounded, Receiver, Sender};
use async_trait::async_trait;
use dashmap::DashMap;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TransportError;
use crate::message::{Delivery, Properties};
use crate::transport::{Channel, Connection, ExchangeKind, Transport};

#[derive(Debug, Clone)]
struct Binding {
    pattern: String,
    queue: String,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

/// shared broker state; cloned handles point at the same exchanges/queues
#[derive(Default)]
struct BrokerState {
    exchanges: DashMap<String, Exchange>,
    queues: DashMap<String, (Sender<Delivery>, Receiver<Delivery>)>,
}

impl BrokerState {
    fn deliver(&self, queue: &str, delivery: Delivery) {
        if let Some(entry) = self.queues.get(queue) {
            // unbounded queue: try_send only fails when closed
            if entry.0.try_send(delivery).is_err() {
                warn!("queue closed, delivery dropped: {}", queue);
            }
        } else {
            debug!("unroutable delivery dropped, no queue: {}", queue);
        }
    }
}

/// An in-memory broker.  `Clone` shares the underlying state, so a test
/// can hand the same bus to a cache client, a fake cache node and a spy
/// consumer.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<BrokerState>,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    open: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed(
                "connection is closed".to_string(),
            ));
        }

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            open: AtomicBool::new(true),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange {
                kind,
                bindings: Vec::new(),
            });

        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        _durable: bool,
        _auto_delete: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state
            .queues
            .entry(name.to_string())
            .or_insert_with(unbounded);

        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.state.queues.contains_key(queue) {
            return Err(TransportError::UnknownQueue(queue.to_string()));
        }

        match self.state.exchanges.get_mut(exchange) {
            Some(mut entry) => {
                let exists = entry
                    .bindings
                    .iter()
                    .any(|b| b.queue == queue && b.pattern == pattern);
                if !exists {
                    entry.bindings.push(Binding {
                        pattern: pattern.to_string(),
                        queue: queue.to_string(),
                    });
                }

                Ok(())
            }
            None => Err(TransportError::UnknownExchange(exchange.to_string())),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let delivery = Delivery {
            routing_key: routing_key.to_string(),
            properties,
            body,
        };

        // the default exchange routes straight to the named queue
        if exchange.is_empty() {
            self.state.deliver(routing_key, delivery);
            return Ok(());
        }

        let targets: Vec<String> = match self.state.exchanges.get(exchange) {
            Some(entry) => {
                let mut queues: Vec<String> = entry
                    .bindings
                    .iter()
                    .filter(|b| match entry.kind {
                        ExchangeKind::Fanout => true,
                        ExchangeKind::Topic => topic_match(&b.pattern, routing_key),
                    })
                    .map(|b| b.queue.clone())
                    .collect();
                // a queue may match through several bindings; deliver once
                queues.sort_unstable();
                queues.dedup();
                queues
            }
            None => return Err(TransportError::UnknownExchange(exchange.to_string())),
        };

        for queue in targets {
            self.state.deliver(&queue, delivery.clone());
        }

        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Receiver<Delivery>, TransportError> {
        self.ensure_open()?;
        match self.state.queues.get(queue) {
            Some(entry) => Ok(entry.1.clone()),
            None => Err(TransportError::UnknownQueue(queue.to_string())),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// AMQP-style topic matching: `.`-separated words, `*` matches exactly one
/// word, `#` matches zero or more words.
pub fn topic_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = if pattern.is_empty() {
        Vec::new()
    } else {
        pattern.split('.').collect()
    };
    let key: Vec<&str> = if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').collect()
    };

    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            // consume zero words, or one and stay on the hash
            if match_words(&pattern[1..], key) {
                true
            } else if key.is_empty() {
                false
            } else {
                match_words(pattern, &key[1..])
            }
        }
        Some(&word) => match key.first() {
            Some(&k) => (word == "*" || word == k) && match_words(&pattern[1..], &key[1..]),
            None => false,
        },
    }
}
