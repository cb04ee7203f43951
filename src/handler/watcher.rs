use std::sync::Arc;

use crate::{
    client::PaymentChannel,
    events::{EventSink, NodeEvent},
};

/// Watches `channel` for disputes until it is concluded or watching fails.
///
/// Deliberately unbounded: it lives as long as the channel, or until the
/// supervisor drops it at shutdown. A failure leaves the channel unwatched
/// but does not affect any other channel.
pub async fn watch_channel(channel: Arc<dyn PaymentChannel>, events: Arc<dyn EventSink>) {
    let id = channel.id();
    events.emit(NodeEvent::WatchStarted { channel: id });
    match channel.watch().await {
        Ok(()) => events.emit(NodeEvent::WatchStopped { channel: id }),
        Err(e) => events.emit(NodeEvent::WatchFailed {
            channel: id,
            error: e.to_string(),
        }),
    }
}
