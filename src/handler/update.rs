use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{Decision, UpdatePolicy};
use crate::{
    channel::{ChannelUpdate, UpdateResponder},
    client::{PaymentChannel, UpdateHandler},
    events::{EventSink, NodeEvent},
    Context,
};

/// Answers updates proposed by the peer of one channel.
///
/// Every update is resolved: transitions that fail validation are rejected
/// with the validation error as reason, valid ones go to the policy. Errors
/// are reported and swallowed so the client keeps delivering updates.
pub struct ChannelUpdateHandler {
    channel: Arc<dyn PaymentChannel>,
    policy: Arc<dyn UpdatePolicy>,
    timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl ChannelUpdateHandler {
    pub fn new(
        channel: Arc<dyn PaymentChannel>,
        policy: Arc<dyn UpdatePolicy>,
        timeout: Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        ChannelUpdateHandler {
            channel,
            policy,
            timeout,
            events,
        }
    }

    fn decide(&self, update: &ChannelUpdate) -> Decision {
        // The client should have checked this already, but a stale or forged
        // state must never be signed.
        let current = self.channel.state();
        match current.check_transition(&update.state) {
            Ok(()) => self.policy.decide(&current, update),
            Err(invalid) => Decision::Reject(invalid.to_string()),
        }
    }
}

#[async_trait]
impl UpdateHandler for ChannelUpdateHandler {
    async fn handle(&self, update: ChannelUpdate, mut responder: UpdateResponder) {
        let ctx = Context::with_timeout(self.timeout);
        let channel = self.channel.id();
        let version = update.state.version();
        self.events.emit(NodeEvent::UpdateReceived {
            channel,
            version,
            is_final: update.state.is_final,
        });

        let event = match self.decide(&update) {
            Decision::Accept => match responder.accept(&ctx).await {
                Ok(()) => NodeEvent::UpdateAccepted { channel, version },
                Err(e) => NodeEvent::UpdateFailed {
                    channel,
                    version,
                    error: e.to_string(),
                },
            },
            Decision::Reject(reason) => match responder.reject(&ctx, &reason).await {
                Ok(()) => NodeEvent::UpdateRejected {
                    channel,
                    version,
                    reason,
                },
                Err(e) => NodeEvent::UpdateFailed {
                    channel,
                    version,
                    error: e.to_string(),
                },
            },
        };
        self.events.emit(event);
        ctx.cancel();
    }
}

/// Feeds every update of `handler`'s channel to it until the channel is
/// final or closed.
pub async fn serve_updates(handler: Arc<ChannelUpdateHandler>) {
    let channel = handler.channel.clone();
    let events = handler.events.clone();
    let id = channel.id();
    events.emit(NodeEvent::UpdatesStarted { channel: id });
    match channel.handle_updates(handler).await {
        Ok(()) => events.emit(NodeEvent::UpdatesStopped { channel: id }),
        Err(e) => events.emit(NodeEvent::UpdatesFailed {
            channel: id,
            error: e.to_string(),
        }),
    }
}
