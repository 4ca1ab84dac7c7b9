//! Participant identity types shared by the hub and connection actors

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::vec2::Vec2;

/// Process-unique connection identifier
pub type ConnectionId = u64;

pub type ParticipantId = Uuid;

pub type AccountId = Uuid;

/// Group/area membership key (e.g. a world or zone name)
pub type GroupId = String;

/// Application identity bound to a connection after login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub participant: ParticipantId,
    pub account: AccountId,
    pub name: String,
}

impl Identity {
    pub fn new(participant: ParticipantId, account: AccountId, name: impl Into<String>) -> Self {
        Self {
            participant,
            account,
            name: name.into(),
        }
    }
}

/// Snapshot of what the hub currently knows about a connection.
///
/// Clients hold a cached copy for collaborators to read; only the hub's
/// control loop writes it, in the same step that updates its indexes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub identity: Option<Identity>,
    pub group: Option<GroupId>,
    pub position: Option<Vec2>,
}

impl Profile {
    pub fn participant(&self) -> Option<ParticipantId> {
        self.identity.as_ref().map(|identity| identity.participant)
    }

    pub fn name(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.name.as_str())
    }
}

/// Last participant that addressed this connection directly (reply target)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correspondent {
    pub participant: ParticipantId,
    pub name: String,
}

impl From<&Identity> for Correspondent {
    fn from(identity: &Identity) -> Self {
        Self {
            participant: identity.participant,
            name: identity.name.clone(),
        }
    }
}
