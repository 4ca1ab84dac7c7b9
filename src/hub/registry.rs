//! Connection registry and secondary indexes
//!
//! Plain synchronous state, owned and mutated only by the hub control loop.
//! Every view (by connection, by participant, by group, by position) is
//! updated in the same call so they never disagree.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use crate::hub::spatial::{SpatialIndex, SpatialStats};
use crate::net::client::Client;
use crate::participant::{ConnectionId, GroupId, Identity, ParticipantId};
use crate::util::vec2::Vec2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),
    #[error("connection {0} has no identity")]
    Anonymous(ConnectionId),
    #[error("position is not finite")]
    InvalidPosition,
    #[error("participant {0} is already connected")]
    ParticipantTaken(ParticipantId),
}

/// Connections plus the group and spatial views over them
#[derive(Debug)]
pub struct Registry {
    clients: HashMap<ConnectionId, Arc<Client>>,
    participants: HashMap<ParticipantId, ConnectionId>,
    groups: HashMap<GroupId, HashSet<ConnectionId>>,
    spatial: SpatialIndex<ParticipantId>,
}

impl Registry {
    pub fn new(cell_size: f32) -> Self {
        Self {
            clients: HashMap::new(),
            participants: HashMap::new(),
            groups: HashMap::new(),
            spatial: SpatialIndex::new(cell_size),
        }
    }

    /// Add a connection, indexing whatever its profile already carries
    /// (identity, group, position).
    ///
    /// A profile naming a participant that another connection holds is
    /// refused; takeover only happens through [`Registry::bind_identity`].
    pub fn insert(&mut self, client: Arc<Client>) -> Result<(), RegistryError> {
        let id = client.id();
        if self.clients.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }

        let profile = client.profile();
        if let Some(participant) = profile.participant() {
            if self.participants.contains_key(&participant) {
                return Err(RegistryError::ParticipantTaken(participant));
            }
            self.participants.insert(participant, id);
            if let Some(position) = profile.position {
                self.spatial.upsert(participant, position);
            }
        }
        if let Some(group) = profile.group {
            self.groups.entry(group).or_default().insert(id);
        }

        self.clients.insert(id, client);
        Ok(())
    }

    /// Remove a connection from every view. Returns the removed client.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<Client>> {
        let client = self.clients.remove(&id)?;
        let profile = client.profile();

        if let Some(participant) = profile.participant() {
            // A takeover may already have pointed the participant elsewhere
            if self.participants.get(&participant) == Some(&id) {
                self.participants.remove(&participant);
                self.spatial.remove(&participant);
            }
        }
        if let Some(group) = &profile.group {
            self.leave_group(id, group);
        }
        Some(client)
    }

    fn leave_group(&mut self, id: ConnectionId, group: &GroupId) {
        if let Some(members) = self.groups.get_mut(group) {
            members.remove(&id);
            if members.is_empty() {
                self.groups.remove(group);
            }
        }
    }

    /// Bind an identity to a registered connection.
    ///
    /// If another connection already carries the same participant it is
    /// removed from the registry and returned; the caller decides how to
    /// close it.
    pub fn bind_identity(
        &mut self,
        id: ConnectionId,
        identity: Identity,
    ) -> Result<Option<Arc<Client>>, RegistryError> {
        let client = self
            .clients
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotRegistered(id))?;

        let displaced = match self.participants.get(&identity.participant) {
            Some(&other) if other != id => self.remove(other),
            _ => None,
        };

        // Re-binding a different participant on the same connection
        if let Some(previous) = client.profile().participant() {
            if previous != identity.participant && self.participants.get(&previous) == Some(&id) {
                self.participants.remove(&previous);
                self.spatial.remove(&previous);
            }
        }

        let participant = identity.participant;
        self.participants.insert(participant, id);
        client.update_profile(|profile| profile.identity = Some(identity));

        if let Some(position) = client.position() {
            self.spatial.upsert(participant, position);
        }

        Ok(displaced)
    }

    /// Move a connection into `group` (or out of any group with `None`)
    pub fn set_group(&mut self, id: ConnectionId, group: Option<GroupId>) -> Result<(), RegistryError> {
        let client = self.clients.get(&id).cloned().ok_or(RegistryError::NotRegistered(id))?;

        let current = client.group();
        if current == group {
            return Ok(());
        }
        if let Some(old) = &current {
            self.leave_group(id, old);
        }
        if let Some(new) = &group {
            self.groups.entry(new.clone()).or_default().insert(id);
        }
        client.update_profile(|profile| profile.group = group);
        Ok(())
    }

    /// Record a position. Requires an identity, since the spatial view is
    /// keyed by participant.
    pub fn update_position(&mut self, id: ConnectionId, position: Vec2) -> Result<(), RegistryError> {
        if !position.is_finite() {
            return Err(RegistryError::InvalidPosition);
        }
        let client = self.clients.get(&id).ok_or(RegistryError::NotRegistered(id))?;
        let participant = client.profile().participant().ok_or(RegistryError::Anonymous(id))?;

        self.spatial.upsert(participant, position);
        client.update_profile(|profile| profile.position = Some(position));
        Ok(())
    }

    pub fn clear_position(&mut self, id: ConnectionId) -> Result<(), RegistryError> {
        let client = self.clients.get(&id).ok_or(RegistryError::NotRegistered(id))?;
        if let Some(participant) = client.profile().participant() {
            self.spatial.remove(&participant);
        }
        client.update_profile(|profile| profile.position = None);
        Ok(())
    }

    // === Lookups ===

    pub fn get(&self, id: ConnectionId) -> Option<&Arc<Client>> {
        self.clients.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn by_participant(&self, participant: &ParticipantId) -> Option<&Arc<Client>> {
        self.participants.get(participant).and_then(|id| self.clients.get(id))
    }

    /// Case-insensitive name match over identified connections
    pub fn by_name(&self, name: &str) -> Option<&Arc<Client>> {
        self.participants
            .values()
            .filter_map(|id| self.clients.get(id))
            .find(|client| {
                client
                    .name()
                    .is_some_and(|candidate| candidate.eq_ignore_ascii_case(name))
            })
    }

    pub fn by_group(&self, group: &str) -> Vec<Arc<Client>> {
        self.groups
            .get(group)
            .map(|members| members.iter().filter_map(|id| self.clients.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.clients.values()
    }

    /// Connections whose participant is within `radius` of `center`
    pub fn within(&self, center: Vec2, radius: f32) -> Vec<Arc<Client>> {
        let mut found = Vec::new();
        self.spatial.for_each_within(center, radius, |participant, _| {
            if let Some(client) = self.by_participant(&participant) {
                found.push(client.clone());
            }
        });
        found
    }

    /// Remove and return every connection
    pub fn drain(&mut self) -> Vec<Arc<Client>> {
        self.participants.clear();
        self.groups.clear();
        self.spatial.clear();
        self.clients.drain().map(|(_, client)| client).collect()
    }

    // === Counts ===

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn identified(&self) -> usize {
        self.participants.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn spatial_stats(&self) -> SpatialStats {
        self.spatial.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::metrics::Metrics;
    use crate::net::protocol::Payload;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn client() -> (Arc<Client>, mpsc::Receiver<Payload>) {
        Client::new(None, &ConnectionConfig::default(), Arc::new(Metrics::new()))
    }

    fn identity(name: &str) -> Identity {
        Identity::new(Uuid::new_v4(), Uuid::new_v4(), name)
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let mut registry = Registry::new(128.0);
        let (a, _rx) = client();
        registry.insert(a.clone()).unwrap();
        assert_eq!(
            registry.insert(a.clone()),
            Err(RegistryError::DuplicateConnection(a.id()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_cleans_every_view() {
        let mut registry = Registry::new(128.0);
        let (a, _rx) = client();
        let ann = identity("ann");
        registry.insert(a.clone()).unwrap();
        registry.bind_identity(a.id(), ann.clone()).unwrap();
        registry.set_group(a.id(), Some("lobby".into())).unwrap();
        registry.update_position(a.id(), Vec2::new(1.0, 1.0)).unwrap();

        assert!(registry.remove(a.id()).is_some());
        assert!(registry.by_participant(&ann.participant).is_none());
        assert!(registry.by_group("lobby").is_empty());
        assert_eq!(registry.group_count(), 0);
        assert!(registry.within(Vec2::ZERO, 10.0).is_empty());
        assert!(registry.remove(a.id()).is_none());
    }

    #[test]
    fn test_insert_indexes_known_profile() {
        let mut registry = Registry::new(128.0);
        let (a, _rx) = client();
        let ann = identity("ann");
        a.update_profile(|profile| {
            profile.identity = Some(ann.clone());
            profile.group = Some("lobby".into());
            profile.position = Some(Vec2::new(10.0, 10.0));
        });

        registry.insert(a.clone()).unwrap();
        assert_eq!(registry.by_participant(&ann.participant).map(|c| c.id()), Some(a.id()));
        assert_eq!(registry.by_group("lobby").len(), 1);
        assert_eq!(registry.within(Vec2::ZERO, 20.0).len(), 1);

        // Same participant on a second connection is not a silent takeover
        let (b, _rx_b) = client();
        b.update_profile(|profile| profile.identity = Some(ann.clone()));
        assert_eq!(
            registry.insert(b.clone()),
            Err(RegistryError::ParticipantTaken(ann.participant))
        );
        assert!(!registry.contains(b.id()));

        registry.remove(a.id());
        assert!(registry.within(Vec2::ZERO, 20.0).is_empty());
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn test_takeover_displaces_older_connection() {
        let mut registry = Registry::new(128.0);
        let (old, _rx_old) = client();
        let (new, _rx_new) = client();
        let ann = identity("ann");

        registry.insert(old.clone()).unwrap();
        registry.insert(new.clone()).unwrap();
        registry.bind_identity(old.id(), ann.clone()).unwrap();
        registry.set_group(old.id(), Some("lobby".into())).unwrap();

        let displaced = registry.bind_identity(new.id(), ann.clone()).unwrap();
        assert_eq!(displaced.map(|c| c.id()), Some(old.id()));
        assert!(!registry.contains(old.id()));
        assert_eq!(registry.by_participant(&ann.participant).map(|c| c.id()), Some(new.id()));
        assert!(registry.by_group("lobby").is_empty());
    }

    #[test]
    fn test_rebinding_same_connection_is_not_takeover() {
        let mut registry = Registry::new(128.0);
        let (a, _rx) = client();
        let ann = identity("ann");
        registry.insert(a.clone()).unwrap();

        registry.bind_identity(a.id(), ann.clone()).unwrap();
        assert!(registry.bind_identity(a.id(), ann).unwrap().is_none());
        assert_eq!(registry.identified(), 1);
    }

    #[test]
    fn test_position_requires_identity() {
        let mut registry = Registry::new(128.0);
        let (a, _rx) = client();
        registry.insert(a.clone()).unwrap();

        assert_eq!(
            registry.update_position(a.id(), Vec2::ZERO),
            Err(RegistryError::Anonymous(a.id()))
        );
        registry.bind_identity(a.id(), identity("ann")).unwrap();
        assert_eq!(
            registry.update_position(a.id(), Vec2::new(f32::NAN, 0.0)),
            Err(RegistryError::InvalidPosition)
        );
        registry.update_position(a.id(), Vec2::new(3.0, 4.0)).unwrap();
        assert_eq!(a.position(), Some(Vec2::new(3.0, 4.0)));
    }

    #[test]
    fn test_clear_position_leaves_spatial_view() {
        let mut registry = Registry::new(128.0);
        let (a, _rx) = client();
        registry.insert(a.clone()).unwrap();
        registry.bind_identity(a.id(), identity("ann")).unwrap();
        registry.update_position(a.id(), Vec2::ZERO).unwrap();

        registry.clear_position(a.id()).unwrap();
        assert!(a.position().is_none());
        assert!(registry.within(Vec2::ZERO, 10.0).is_empty());
    }

    #[test]
    fn test_group_move() {
        let mut registry = Registry::new(128.0);
        let (a, _rx) = client();
        registry.insert(a.clone()).unwrap();

        registry.set_group(a.id(), Some("red".into())).unwrap();
        registry.set_group(a.id(), Some("blue".into())).unwrap();
        assert!(registry.by_group("red").is_empty());
        assert_eq!(registry.by_group("blue").len(), 1);
        assert_eq!(a.group().as_deref(), Some("blue"));

        registry.set_group(a.id(), None).unwrap();
        assert_eq!(registry.group_count(), 0);
    }

    #[test]
    fn test_lookup_by_name_ignores_case() {
        let mut registry = Registry::new(128.0);
        let (a, _rx) = client();
        registry.insert(a.clone()).unwrap();
        registry.bind_identity(a.id(), identity("Ann")).unwrap();

        assert_eq!(registry.by_name("ann").map(|c| c.id()), Some(a.id()));
        assert!(registry.by_name("bob").is_none());
    }

    #[test]
    fn test_unregistered_operations_fail() {
        let mut registry = Registry::new(128.0);
        assert_eq!(
            registry.bind_identity(42, identity("ghost")).unwrap_err(),
            RegistryError::NotRegistered(42)
        );
        assert_eq!(
            registry.set_group(42, Some("g".into())),
            Err(RegistryError::NotRegistered(42))
        );
    }
}
