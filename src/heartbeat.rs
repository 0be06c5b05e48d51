/// heartbeat monitor and the periodic reconciler task
///
use anyhow::Result;
use log::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::message::MessageType;
use crate::nodes::NodeSet;
use crate::registry::CallbackRegistry;
use crate::transport::{ChannelGuard, Session};

/// Listen for ping/pong liveness traffic on the heartbeat queue and keep
/// the live node set current.  Pings are ignored -- only dedicated cache
/// nodes answer those, and this is a client.  A pong's body is the
/// responding node's id.
pub async fn run_heartbeat_monitor(
    session: Arc<Session>,
    queue: String,
    nodes: Arc<NodeSet>,
) -> Result<()> {
    let channel = session.create_channel().await?;
    let rx = channel.consume(&queue).await?;
    // closes the channel however the task ends, cancellation included
    let _guard = ChannelGuard::new(channel);

    while let Ok(delivery) = rx.recv().await {
        match MessageType::parse(&delivery.properties.message_type) {
            Some(MessageType::Ping) => {
                // clients do not answer pings
            }
            Some(MessageType::Pong) => {
                if delivery.body.is_empty() {
                    continue;
                }
                match String::from_utf8(delivery.body) {
                    Ok(node_id) => nodes.observe(&node_id),
                    Err(e) => warn!("pong body is not utf-8: {}", e),
                }
            }
            _ => {
                debug!(
                    "unexpected heartbeat type: '{}', ignored",
                    delivery.properties.message_type
                );
            }
        }
    }

    debug!("heartbeat monitor exit: {}", queue);

    Ok(())
}

/// Periodic housekeeping on one timer: snapshot the node set into the
/// expected-node-count estimate, and time out stale load registrations.
/// Runs until cancelled by `stop()`.
pub async fn run_reconciler(
    nodes: Arc<NodeSet>,
    registry: Arc<CallbackRegistry>,
    interval: Duration,
) -> Result<()> {
    loop {
        async_std::task::sleep(interval).await;

        nodes.reconcile();

        let expired = registry.sweep_expired(Instant::now());
        if expired > 0 {
            info!("timed out {} pending loads", expired);
        }
    }
}
