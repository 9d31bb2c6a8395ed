//! Connection registry: which identity is reachable on which channel.
//!
//! Each live channel owns a bounded outbound queue drained by a dedicated
//! egress loop at the network edge, which linearises per-channel ordering.
//! Delivery is best-effort fire-and-forget; a full queue means the peer has
//! stopped draining, and the channel is closed rather than buffered without
//! bound. At most one live channel per identity; reconnection replaces the
//! prior handle (last wins).

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::Role;
use crate::ids::{ChannelId, UserId};
use crate::protocol::OutboundEvent;

/// Authenticated identity bound to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

/// Cheap handle to one live channel's outbound queue.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub channel_id: ChannelId,
    sender: mpsc::Sender<OutboundEvent>,
}

impl ChannelHandle {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }
}

/// Tracks live channels per identity.
pub struct ConnectionRegistry {
    by_user: DashMap<UserId, ChannelHandle>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            by_user: DashMap::new(),
            queue_capacity,
        }
    }

    /// Register a freshly authenticated channel. Returns the handle plus the
    /// receiver the egress loop drains. Any prior handle for the same
    /// identity is dropped, which ends its egress loop and closes the old
    /// socket.
    pub fn attach(&self, identity: Identity) -> (ChannelHandle, mpsc::Receiver<OutboundEvent>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let handle = ChannelHandle {
            channel_id: ChannelId::new(),
            sender,
        };
        if let Some(prior) = self.by_user.insert(identity.user_id, handle.clone()) {
            debug!(
                user_id = %identity.user_id,
                old_channel = %prior.channel_id,
                new_channel = %handle.channel_id,
                "replacing prior channel"
            );
        }
        (handle, receiver)
    }

    /// Drop the registration, but only if this channel is still current.
    /// A reconnect may already have replaced it; the newer handle stays.
    pub fn detach(&self, user_id: UserId, channel_id: ChannelId) {
        self.by_user
            .remove_if(&user_id, |_, handle| handle.channel_id == channel_id);
    }

    /// Current handle for an identity, or `None` when unreachable.
    pub fn handle_for(&self, user_id: UserId) -> Option<ChannelHandle> {
        self.by_user.get(&user_id).map(|h| h.clone())
    }

    /// Best-effort delivery on a specific handle. A full queue closes the
    /// channel: the peer is treated as disconnected, position data survives.
    pub fn emit(&self, user_id: UserId, handle: &ChannelHandle, event: OutboundEvent) {
        match handle.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    user_id = %user_id,
                    channel = %handle.channel_id,
                    "egress queue full, closing channel"
                );
                self.detach(user_id, handle.channel_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.detach(user_id, handle.channel_id);
            }
        }
    }

    /// Best-effort delivery to whatever channel the identity currently has.
    /// Returns false when the identity is unreachable.
    pub fn emit_to_user(&self, user_id: UserId, event: OutboundEvent) -> bool {
        match self.handle_for(user_id) {
            Some(handle) => {
                self.emit(user_id, &handle, event);
                true
            }
            None => false,
        }
    }

    pub fn connected_count(&self) -> usize {
        self.by_user.len()
    }
}
