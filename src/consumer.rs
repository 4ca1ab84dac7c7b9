//! Command consumer seam
//!
//! Game logic lives behind [`CommandConsumer`]. It receives each decoded
//! inbound message together with a [`Session`], the narrow view of the
//! sending connection and the hub that it is allowed to use.

use std::sync::Arc;

use async_trait::async_trait;

use crate::hub::{BroadcastReport, HubError, HubHandle};
use crate::net::client::{Client, SendError};
use crate::net::protocol::{InboundMessage, OutboundMessage};
use crate::participant::{Correspondent, GroupId, Identity};
use crate::util::vec2::Vec2;

/// Interprets inbound messages. Calls are made one at a time, in arrival
/// order across all connections.
#[async_trait]
pub trait CommandConsumer: Send + Sync + 'static {
    async fn handle(&self, session: &Session, message: InboundMessage);
}

/// A connection as seen by the command consumer
#[derive(Clone)]
pub struct Session {
    client: Arc<Client>,
    hub: HubHandle,
}

impl Session {
    pub fn new(client: Arc<Client>, hub: HubHandle) -> Self {
        Self { client, hub }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn identity(&self) -> Option<Identity> {
        self.client.identity()
    }

    pub fn name(&self) -> Option<String> {
        self.client.name()
    }

    pub fn group(&self) -> Option<GroupId> {
        self.client.group()
    }

    pub fn position(&self) -> Option<Vec2> {
        self.client.position()
    }

    /// Send to this connection only
    pub fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        self.client.send_message(message)
    }

    /// Send to every member of this connection's group. Does nothing when
    /// the connection is not in a group.
    pub async fn broadcast_group(
        &self,
        message: &OutboundMessage,
        include_self: bool,
    ) -> Result<BroadcastReport, HubError> {
        let Some(group) = self.group() else {
            return Ok(BroadcastReport::default());
        };
        let exclude = (!include_self).then(|| self.client.id());
        self.hub.broadcast_group(&group, message, exclude).await
    }

    pub async fn broadcast_area(
        &self,
        center: Vec2,
        radius: f32,
        message: &OutboundMessage,
    ) -> Result<BroadcastReport, HubError> {
        self.hub.broadcast_area(center, radius, message).await
    }

    /// Area broadcast centred on this connection's position
    pub async fn broadcast_nearby(
        &self,
        radius: f32,
        message: &OutboundMessage,
    ) -> Result<BroadcastReport, HubError> {
        match self.position() {
            Some(center) => self.broadcast_area(center, radius, message).await,
            None => Ok(BroadcastReport::default()),
        }
    }

    // === Correspondent ===

    pub fn correspondent(&self) -> Option<Correspondent> {
        self.client.correspondent()
    }

    pub fn set_correspondent(&self, correspondent: Correspondent) {
        self.client.set_correspondent(correspondent)
    }

    pub fn clear_correspondent(&self) -> Option<Correspondent> {
        self.client.clear_correspondent()
    }

    // === Hub-mediated profile changes ===

    pub async fn identify(&self, identity: Identity) -> Result<(), HubError> {
        self.hub.identify(&self.client, identity).await
    }

    pub async fn join_group(&self, group: Option<GroupId>) -> Result<(), HubError> {
        self.hub.join_group(&self.client, group).await
    }

    pub async fn move_to(&self, position: Vec2) -> Result<(), HubError> {
        let identity = self
            .identity()
            .ok_or(HubError::Anonymous(self.client.id()))?;
        self.hub.update_position(identity.participant, position).await
    }

    /// Leave the spatial index, keeping the connection
    pub async fn leave_map(&self) -> Result<bool, HubError> {
        match self.identity() {
            Some(identity) => self.hub.clear_position(identity.participant).await,
            None => Ok(false),
        }
    }

    /// Unregister and close this connection
    pub async fn disconnect(&self) -> Result<bool, HubError> {
        self.hub.unregister(&self.client).await
    }
}
