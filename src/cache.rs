/// the public cache facade: fire-and-forget operations over the bus
///
use async_channel::{unbounded, Receiver, Sender};
use async_std::task::JoinHandle;
use log::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::heartbeat::{run_heartbeat_monitor, run_reconciler};
use crate::message::{CommandMessage, ObjectMessage};
use crate::monitor::run_response_monitor;
use crate::nodes::NodeSet;
use crate::registry::{CallbackRegistry, RawCallback, RawLoadResult};
use crate::sender::{run_command_sender, run_object_sender};
use crate::transport::{Channel, ExchangeKind, Session, Transport};

/// the typed result delivered to a load callback: the decoded value,
/// `None` when the remote nodes hold nothing for the key, or an error
pub type LoadResult<T> = Result<Option<T>, CacheError>;

/// An asynchronous distributed cache client.  Operations are broadcast to
/// remote cache nodes over the bus; none of them acknowledge locally.
/// Create one per process, `start()` it, and `stop()` it on the way down.
/// A stopped cache cannot be restarted.
pub struct AsyncCache {
    config: CacheConfig,
    session: Arc<Session>,
    registry: Arc<CallbackRegistry>,
    nodes: Arc<NodeSet>,
    object_tx: Sender<ObjectMessage>,
    object_rx: Receiver<ObjectMessage>,
    command_tx: Sender<CommandMessage>,
    command_rx: Receiver<CommandMessage>,
    active: AtomicBool,
    tasks: Vec<JoinHandle<()>>,
    setup_channel: Option<Arc<dyn Channel>>,
}

impl AsyncCache {
    pub fn new(config: CacheConfig, transport: Arc<dyn Transport>) -> AsyncCache {
        let (object_tx, object_rx) = unbounded();
        let (command_tx, command_rx) = unbounded();

        AsyncCache {
            config,
            session: Arc::new(Session::new(transport)),
            registry: Arc::new(CallbackRegistry::new()),
            nodes: Arc::new(NodeSet::new()),
            object_tx,
            object_rx,
            command_tx,
            command_rx,
            active: AtomicBool::new(false),
            tasks: Vec::new(),
            setup_channel: None,
        }
    }

    /// this instance's id; also its private response queue name
    pub fn id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// number of distinct cache nodes seen alive so far
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// the reconciled expected-node-count estimate
    pub fn expected_nodes(&self) -> usize {
        self.nodes.expected()
    }

    /// Open the transport, declare the exchanges and this instance's
    /// queues, launch the sender/monitor tasks and solicit pongs from any
    /// live cache nodes with an initial ping.  A setup failure leaves the
    /// cache inactive, so a later `start()` may try again.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.is_active() {
            warn!("cache already started: {}", self.id());
            return Ok(());
        }

        info!("starting cache client: {}", self.id());

        if let Err(e) = self.start_workers().await {
            for handle in self.tasks.drain(..) {
                handle.cancel().await;
            }
            return Err(e);
        }

        self.active.store(true, Ordering::SeqCst);

        // solicit pongs from live nodes
        self.enqueue_command(CommandMessage::ping(&self.config.heartbeat_exchange));

        Ok(())
    }

    async fn start_workers(&mut self) -> anyhow::Result<()> {
        let channel = self.session.create_channel().await?;
        let exchange = &self.config.object_request_exchange;
        channel
            .declare_exchange(exchange, ExchangeKind::Topic, true)
            .await?;
        channel
            .declare_exchange(&self.config.heartbeat_exchange, ExchangeKind::Fanout, true)
            .await?;

        // private response queue, named by the instance id
        channel
            .declare_queue(self.id(), true, true)
            .await?;

        // a dedicated heartbeat queue keeps pongs off the response queue
        let heartbeat_queue = format!("{}.heartbeat", self.id());
        channel.declare_queue(&heartbeat_queue, true, true).await?;
        channel
            .bind_queue(&heartbeat_queue, &self.config.heartbeat_exchange, "")
            .await?;

        for _ in 0..self.config.max_workers {
            let rx = channel.consume(self.id()).await?;
            self.spawn("response monitor", run_response_monitor(rx, self.registry.clone()));

            self.spawn(
                "object sender",
                run_object_sender(
                    self.session.clone(),
                    self.object_rx.clone(),
                    self.id().to_string(),
                ),
            );
            self.spawn(
                "command sender",
                run_command_sender(
                    self.session.clone(),
                    self.command_rx.clone(),
                    self.id().to_string(),
                    self.registry.clone(),
                ),
            );
        }

        self.spawn(
            "heartbeat monitor",
            run_heartbeat_monitor(self.session.clone(), heartbeat_queue, self.nodes.clone()),
        );
        self.spawn(
            "reconciler",
            run_reconciler(
                self.nodes.clone(),
                self.registry.clone(),
                Duration::from_millis(self.config.heartbeat_interval_ms),
            ),
        );

        self.setup_channel = Some(channel);

        Ok(())
    }

    /// Cancel every running task and tear the session down.  Queued but
    /// unsent messages are discarded; pending load registrations are not
    /// notified.
    pub async fn stop(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("stopping cache client: {}", self.id());

        for handle in self.tasks.drain(..) {
            handle.cancel().await;
        }

        self.object_tx.close();
        self.command_tx.close();

        if let Some(channel) = self.setup_channel.take() {
            channel.close().await;
        }
        self.session.close().await;
    }

    /// Store an object under the key on whichever nodes claim it.  Fire
    /// and forget: there is no acknowledgment of remote persistence.
    pub fn add<T: Serialize>(&self, id: &str, obj: &T) {
        self.add_object(id, obj, None);
    }

    /// Store with an expiration hint (milliseconds ride in a header;
    /// remote nodes may ignore the hint).
    pub fn add_with_expiry<T: Serialize>(&self, id: &str, obj: &T, expiry: Duration) {
        self.add_object(id, obj, Some(expiry));
    }

    fn add_object<T: Serialize>(&self, id: &str, obj: &T, expiry: Option<Duration>) {
        if !self.check_active("add") {
            return;
        }

        let body = match serde_json::to_vec(obj) {
            Ok(body) => body,
            Err(e) => {
                error!("serialize failed for key {}: {}", id, e);
                return;
            }
        };

        let mut msg = ObjectMessage::store(id, &self.config.object_request_exchange, body);
        if let Some(expiry) = expiry {
            msg = msg.with_expiry(expiry.as_millis() as u64);
        }

        if self.object_tx.try_send(msg).is_err() {
            error!("object queue closed, store dropped: {}", id);
        }
    }

    /// Ask the nodes holding the key to clear it.
    pub fn remove(&self, id: &str) {
        if !self.check_active("remove") {
            return;
        }
        self.enqueue_command(CommandMessage::clear(
            id,
            &self.config.object_request_exchange,
        ));
    }

    /// A deferred remove; the delay is a header hint, not enforced here.
    pub fn remove_delayed(&self, id: &str, delay: Duration) {
        if !self.check_active("remove") {
            return;
        }
        self.enqueue_command(CommandMessage::clear_delayed(
            id,
            &self.config.object_request_exchange,
            delay.as_millis() as u64,
        ));
    }

    /// Clear every key on every node.
    pub fn clear(&self) {
        if !self.check_active("clear") {
            return;
        }
        self.enqueue_command(CommandMessage::clear_all(
            &self.config.object_request_exchange,
        ));
    }

    /// Request the value for a key.  The callback fires asynchronously
    /// from a response-monitor task, at most once: with the decoded value,
    /// `Ok(None)` when no node holds the key, or an error (decode failure
    /// or timeout).  Concurrent loads for the same key all fire on the
    /// first response.
    pub fn load<T, F>(&self, id: &str, callback: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(LoadResult<T>) + Send + Sync + 'static,
    {
        self.register_load(
            id,
            Box::new(move |result: RawLoadResult| {
                let typed = match result {
                    Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                        Ok(value) => Ok(Some(value)),
                        Err(e) => Err(CacheError::Decode(e.to_string())),
                    },
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                };
                callback(typed);
            }),
        );
    }

    /// Like [`AsyncCache::load`] but delivers the raw response bytes for
    /// callers that bring their own payload format.
    pub fn load_raw<F>(&self, id: &str, callback: F)
    where
        F: FnOnce(RawLoadResult) + Send + Sync + 'static,
    {
        self.register_load(id, Box::new(callback));
    }

    /// Parent/child key association is part of the cache contract but not
    /// supported by this client.
    pub fn set_parent(&self, _child_id: &str, _parent_id: &str) -> Result<(), CacheError> {
        Err(CacheError::Unsupported("set_parent"))
    }

    fn register_load(&self, id: &str, callback: RawCallback) {
        if !self.check_active("load") {
            return;
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.load_timeout_ms);
        self.registry.register(id, callback, deadline);

        self.enqueue_command(CommandMessage::load(
            id,
            &self.config.object_request_exchange,
        ));
    }

    fn enqueue_command(&self, cmd: CommandMessage) {
        if self.command_tx.try_send(cmd).is_err() {
            error!("command queue closed, command dropped");
        }
    }

    fn check_active(&self, op: &str) -> bool {
        if self.is_active() {
            true
        } else {
            warn!("cache not active, {} dropped", op);
            false
        }
    }

    /// spawn a worker task and log how it exits
    fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.id().to_string();
        let handle = async_std::task::spawn(async move {
            match fut.await {
                Ok(()) => info!("{} exit for cache id: {}", name, id),
                Err(e) => error!("{} exit with error: {:?}", name, e),
            }
        });
        self.tasks.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::memory::MemoryBus;
    use crate::transport::Connection;
    use async_trait::async_trait;

    /// a transport whose connect always fails
    struct DeadTransport;

    #[async_trait]
    impl Transport for DeadTransport {
        async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
            Err(TransportError::ConnectionClosed(
                "connection refused".to_string(),
            ))
        }
    }

    fn test_config() -> CacheConfig {
        CacheConfig {
            instance_id: "cache-test".to_string(),
            heartbeat_interval_ms: 50,
            load_timeout_ms: 200,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn lifecycle() {
        async_std::task::block_on(async move {
            let mut cache = AsyncCache::new(test_config(), Arc::new(MemoryBus::new()));
            assert!(!cache.is_active());
            assert_eq!(cache.id(), "cache-test");
            assert_eq!(cache.expected_nodes(), 1);
            assert_eq!(cache.node_count(), 0);

            cache.start().await.expect("should start");
            assert!(cache.is_active());

            // double start is a no-op
            cache.start().await.expect("restart should be a no-op");

            cache.stop().await;
            assert!(!cache.is_active());

            // double stop is a no-op
            cache.stop().await;
        });
    }

    #[test]
    fn failed_start_leaves_cache_inactive() {
        async_std::task::block_on(async move {
            let mut cache = AsyncCache::new(test_config(), Arc::new(DeadTransport));

            assert!(cache.start().await.is_err());
            assert!(!cache.is_active());

            // operations stay dropped; nothing queues up for absent workers
            cache.add("user:1", &"value".to_string());
            cache.load("user:1", |_result: LoadResult<String>| {
                panic!("callback must not fire after a failed start");
            });
            assert!(cache.object_rx.is_empty());
            assert!(cache.registry.is_empty());

            // a retry reaches the transport again instead of no-opping
            assert!(cache.start().await.is_err());
        });
    }

    #[test]
    fn inactive_calls_are_dropped() {
        async_std::task::block_on(async move {
            let cache = AsyncCache::new(test_config(), Arc::new(MemoryBus::new()));

            cache.add("user:1", &"value".to_string());
            cache.remove("user:1");
            cache.clear();
            cache.load("user:1", |_result: LoadResult<String>| {
                panic!("callback must not fire on an inactive cache");
            });

            // nothing was registered or queued
            assert!(cache.registry.is_empty());
            assert!(cache.object_rx.is_empty());
            assert!(cache.command_rx.is_empty());
        });
    }

    #[test]
    fn set_parent_is_unsupported() {
        let cache = AsyncCache::new(test_config(), Arc::new(MemoryBus::new()));
        let result = cache.set_parent("child", "parent");
        assert!(matches!(result, Err(CacheError::Unsupported(_))));
    }
}
