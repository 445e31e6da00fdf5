use std::collections::HashMap;

use parley_core::UserId;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::registry::Listener;
use crate::server::metrics::{
    record_gateway_event_dropped, GATEWAY_DROP_REASON_CLOSED, GATEWAY_DROP_REASON_FULL_QUEUE,
    GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND,
};

/// Offers `payload` to every listener without waiting. Listeners whose queue
/// is closed or full are unsubscribed; full ones are also reported through
/// `slow_connections` so the caller can close them.
pub(crate) fn dispatch_gateway_payload(
    listeners: &mut HashMap<Uuid, Listener>,
    payload: &str,
    max_payload_bytes: usize,
    skip_user: Option<UserId>,
    event_type: &'static str,
    scope: &'static str,
    slow_connections: &mut Vec<Uuid>,
) -> usize {
    if payload.len() > max_payload_bytes {
        record_gateway_event_dropped(scope, event_type, GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND);
        return 0;
    }

    let mut delivered = 0usize;
    listeners.retain(|connection_id, listener| {
        if skip_user == Some(listener.user_id) {
            return true;
        }
        match listener.sender.try_send(payload.to_owned()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped(scope, event_type, GATEWAY_DROP_REASON_CLOSED);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped(scope, event_type, GATEWAY_DROP_REASON_FULL_QUEUE);
                slow_connections.push(*connection_id);
                false
            }
        }
    });
    delivered
}
