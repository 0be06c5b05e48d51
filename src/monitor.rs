/// response monitor: demultiplex inbound responses to waiting callbacks
///
use anyhow::Result;
use async_channel::Receiver;
use log::*;
use std::sync::Arc;

use crate::message::{Delivery, MessageType};
use crate::registry::CallbackRegistry;

/// Consume deliveries from the instance's private queue and dispatch
/// `response` messages through the callback registry.  Several identical
/// monitors may compete on the same queue.  Anything that is not a
/// well-formed response is logged and dropped; the loop never dies on a
/// bad delivery.
pub async fn run_response_monitor(
    rx: Receiver<Delivery>,
    registry: Arc<CallbackRegistry>,
) -> Result<()> {
    while let Ok(delivery) = rx.recv().await {
        handle_delivery(delivery, &registry);
    }

    debug!("response monitor exit");

    Ok(())
}

fn handle_delivery(delivery: Delivery, registry: &CallbackRegistry) {
    match MessageType::parse(&delivery.properties.message_type) {
        Some(MessageType::Response) => {}
        _ => {
            warn!(
                "invalid message type: '{}', delivery dropped",
                delivery.properties.message_type
            );
            return;
        }
    }

    let key = match delivery.properties.correlation_id.as_deref() {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => {
            warn!("response without correlation id, delivery dropped");
            return;
        }
    };

    // an empty body is the explicit "no value" signal
    let result = if delivery.body.is_empty() {
        Ok(None)
    } else {
        Ok(Some(delivery.body))
    };

    let fired = registry.complete(&key, result);
    debug!("response for key {} fired {} callbacks", key, fired);
}
