/// sender loops: drain the outbound queues and publish to the bus
///
/// Multiple sender tasks drain the same queue for publish throughput.
/// Publishing is fire-and-forget with a bounded retry: each attempt
/// re-acquires a channel from the session.  A store that still fails is
/// logged and dropped; a load that still fails completes its waiting
/// callbacks with the transport error instead of leaving them to time out.
use anyhow::Result;
use async_channel::Receiver;
use log::*;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::message::{CommandMessage, MessageType, ObjectMessage, Properties};
use crate::registry::CallbackRegistry;
use crate::transport::{ChannelGuard, Session};

const MAX_PUBLISH_ATTEMPTS: u32 = 3;

/// drain object (store) messages until the queue closes
pub async fn run_object_sender(
    session: Arc<Session>,
    rx: Receiver<ObjectMessage>,
    instance_id: String,
) -> Result<()> {
    let mut channel = ChannelGuard::empty();

    while let Ok(msg) = rx.recv().await {
        let properties = Properties {
            message_type: MessageType::Store.as_str().to_string(),
            reply_to: instance_id.clone(),
            correlation_id: Some(msg.id.clone()),
            headers: msg.headers,
        };
        // stores are fire-and-forget; the retry helper logs the drop
        let _ = publish_with_retry(
            &session,
            &mut channel,
            &msg.exchange,
            &msg.routing_key,
            properties,
            msg.body,
        )
        .await;
    }

    debug!("object sender exit: {}", instance_id);

    Ok(())
}

/// drain command (load/clear/ping) messages until the queue closes
pub async fn run_command_sender(
    session: Arc<Session>,
    rx: Receiver<CommandMessage>,
    instance_id: String,
    registry: Arc<CallbackRegistry>,
) -> Result<()> {
    let mut channel = ChannelGuard::empty();

    while let Ok(cmd) = rx.recv().await {
        let properties = Properties {
            message_type: cmd.kind.as_str().to_string(),
            reply_to: instance_id.clone(),
            correlation_id: None,
            headers: cmd.headers,
        };
        let published = publish_with_retry(
            &session,
            &mut channel,
            &cmd.exchange,
            &cmd.routing_key,
            properties,
            Vec::new(),
        )
        .await;

        // a load that never reached the bus will never see a response;
        // fail its callbacks now rather than waiting out the timeout
        if let Err(e) = published {
            if cmd.kind == MessageType::Load {
                registry.complete(&cmd.routing_key, Err(e.into()));
            }
        }
    }

    debug!("command sender exit: {}", instance_id);

    Ok(())
}

/// publish with up to [`MAX_PUBLISH_ATTEMPTS`] tries, re-acquiring the
/// channel between attempts; returns the last error when the message is
/// dropped
async fn publish_with_retry(
    session: &Session,
    channel: &mut ChannelGuard,
    exchange: &str,
    routing_key: &str,
    properties: Properties,
    body: Vec<u8>,
) -> Result<(), TransportError> {
    let mut last_error = TransportError::ChannelClosed;

    for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
        let cached = channel.current().filter(|ch| ch.is_open());
        let ch = match cached {
            Some(ch) => ch,
            None => match session.create_channel().await {
                Ok(ch) => {
                    channel.replace(ch.clone());
                    ch
                }
                Err(e) => {
                    warn!("channel acquire failed (attempt {}): {}", attempt, e);
                    last_error = e;
                    backoff(attempt).await;
                    continue;
                }
            },
        };

        match ch
            .publish(exchange, routing_key, properties.clone(), body.clone())
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    "publish failed (attempt {}) to {}/{}: {}",
                    attempt, exchange, routing_key, e
                );
                last_error = e;
                channel.clear();
                backoff(attempt).await;
            }
        }
    }

    error!(
        "message dropped after {} attempts: type {}, key {}: {}",
        MAX_PUBLISH_ATTEMPTS, properties.message_type, routing_key, last_error
    );

    Err(last_error)
}

async fn backoff(attempt: u32) {
    let jitter = fastrand::u64(5..25);
    async_std::task::sleep(Duration::from_millis(u64::from(attempt) * jitter)).await;
}
