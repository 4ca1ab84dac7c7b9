//! Connection hub
//!
//! The hub is the single owner of the connection registry, the group index
//! and the spatial index. Every mutation and every broadcast target
//! resolution runs inside one control loop fed by a bounded command channel;
//! callers talk to it through a cloneable [`HubHandle`].
//!
//! Inbound messages take a separate path: connection readers push them onto
//! the inbound queue and a dispatcher task hands them, one at a time, to the
//! [`CommandConsumer`]. The consumer calls back into the hub through the same
//! handle, so the control loop never waits on game logic.

pub mod registry;
pub mod spatial;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::consumer::{CommandConsumer, Session};
use crate::metrics::Metrics;
use crate::net::client::{Client, SendError};
use crate::net::protocol::{self, EncodeError, InboundMessage, OutboundMessage, Payload};
use crate::participant::{ConnectionId, GroupId, Identity, ParticipantId};
use crate::util::vec2::Vec2;

use registry::{Registry, RegistryError};
use spatial::SpatialStats;

/// Hub lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    /// Constructed, control loop not started yet
    Idle,
    Running,
    /// Refusing registrations, finishing queued work
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("hub is shutting down")]
    ShuttingDown,
    #[error("hub has stopped")]
    Stopped,
    #[error("connection is already closed")]
    ConnectionClosed,
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),
    #[error("connection {0} has no identity")]
    Anonymous(ConnectionId),
    #[error("participant {0} is not connected")]
    UnknownParticipant(ParticipantId),
    #[error("position is not finite")]
    InvalidPosition,
    #[error("participant {0} is already connected")]
    ParticipantTaken(ParticipantId),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl From<RegistryError> for HubError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateConnection(id) => Self::DuplicateConnection(id),
            RegistryError::NotRegistered(id) => Self::NotRegistered(id),
            RegistryError::Anonymous(id) => Self::Anonymous(id),
            RegistryError::InvalidPosition => Self::InvalidPosition,
            RegistryError::ParticipantTaken(participant) => Self::ParticipantTaken(participant),
        }
    }
}

/// Why a direct send did not reach its recipient
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("recipient not found")]
    NotFound,
    #[error("recipient connection closed")]
    Closed,
    #[error("recipient queue full")]
    Full,
    #[error("message exceeds the frame limit")]
    TooLarge,
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl From<SendError> for DeliveryError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Closed => Self::Closed,
            SendError::Full => Self::Full,
            SendError::TooLarge(_) => Self::TooLarge,
            SendError::Encode(e) => Self::Hub(HubError::Encode(e)),
        }
    }
}

impl From<EncodeError> for DeliveryError {
    fn from(e: EncodeError) -> Self {
        Self::Hub(HubError::Encode(e))
    }
}

/// Per-broadcast delivery tally. Failures are counted, never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub targets: usize,
    pub delivered: usize,
    pub dropped_full: usize,
    pub dropped_closed: usize,
    /// Payload larger than the recipient's frame limit
    pub rejected: usize,
}

impl BroadcastReport {
    fn record(&mut self, result: Result<(), SendError>) {
        match result {
            Ok(()) => self.delivered += 1,
            Err(SendError::Full) => self.dropped_full += 1,
            Err(SendError::Closed) => self.dropped_closed += 1,
            Err(SendError::TooLarge(_) | SendError::Encode(_)) => self.rejected += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub identified: usize,
    pub groups: usize,
    pub positioned: usize,
    pub spatial_cells: usize,
}

#[derive(Debug, Clone)]
enum BroadcastScope {
    All,
    Group {
        group: GroupId,
        exclude: Option<ConnectionId>,
    },
    Area {
        center: Vec2,
        radius: f32,
    },
}

#[derive(Debug)]
enum Lookup {
    Id(ConnectionId),
    Participant(ParticipantId),
    Name(String),
}

#[derive(Debug)]
enum LookupMany {
    All,
    Group(GroupId),
    Area { center: Vec2, radius: f32 },
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Register {
        client: Arc<Client>,
        reply: Reply<Result<(), HubError>>,
    },
    Unregister {
        client: Arc<Client>,
        reply: Reply<bool>,
    },
    Identify {
        client: Arc<Client>,
        identity: Identity,
        reply: Reply<Result<(), HubError>>,
    },
    JoinGroup {
        client: Arc<Client>,
        group: Option<GroupId>,
        reply: Reply<Result<(), HubError>>,
    },
    UpdatePosition {
        participant: ParticipantId,
        position: Vec2,
        reply: Reply<Result<(), HubError>>,
    },
    ClearPosition {
        participant: ParticipantId,
        reply: Reply<bool>,
    },
    Find {
        lookup: Lookup,
        reply: Reply<Option<Arc<Client>>>,
    },
    Collect {
        lookup: LookupMany,
        reply: Reply<Vec<Arc<Client>>>,
    },
    SendTo {
        participant: ParticipantId,
        payload: Payload,
        reply: Reply<Result<(), DeliveryError>>,
    },
    Broadcast {
        scope: BroadcastScope,
        payload: Payload,
        reply: Reply<BroadcastReport>,
    },
    Stats {
        reply: Reply<HubStats>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

type Inbound = (Arc<Client>, InboundMessage);

/// The hub control loop, before it is started
pub struct Hub {
    registry: Registry,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Receiver<Inbound>,
    state: watch::Sender<HubState>,
    handle: HubHandle,
    metrics: Arc<Metrics>,
}

impl Hub {
    /// Create a hub in the `Idle` state and a handle to it. Requests sent
    /// before [`Hub::run`] are queued.
    pub fn new(config: HubConfig, metrics: Arc<Metrics>) -> (Self, HubHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_queue_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(HubState::Idle);

        let handle = HubHandle {
            commands: commands_tx,
            inbound: inbound_tx,
            state: state_rx,
            metrics: metrics.clone(),
        };

        let hub = Self {
            registry: Registry::new(config.spatial_cell_size),
            commands: commands_rx,
            inbound: inbound_rx,
            state: state_tx,
            handle: handle.clone(),
            metrics,
        };
        (hub, handle)
    }

    /// Start the control loop on its own task
    pub fn spawn(
        config: HubConfig,
        metrics: Arc<Metrics>,
        consumer: Arc<dyn CommandConsumer>,
    ) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config, metrics);
        let task = tokio::spawn(hub.run(consumer));
        (handle, task)
    }

    /// Run until shut down. Returns once the hub is `Stopped` and the
    /// dispatcher has exited.
    pub async fn run(self, consumer: Arc<dyn CommandConsumer>) {
        let Hub {
            registry,
            mut commands,
            inbound,
            state,
            handle,
            metrics,
        } = self;

        let mut control = Control {
            registry,
            state,
            metrics,
        };
        control.set_state(HubState::Running);
        info!("Hub running");

        let dispatcher = tokio::spawn(dispatch(inbound, handle, consumer, control.state.subscribe()));

        let mut waiters = Vec::new();
        while let Some(command) = commands.recv().await {
            match command {
                Command::Shutdown { reply } => {
                    waiters.push(reply);
                    break;
                }
                other => control.handle(other),
            }
        }

        // Refuse new work, finish whatever is already queued
        control.set_state(HubState::Draining);
        info!("Hub draining {} connections", control.registry.len());
        commands.close();
        while let Some(command) = commands.recv().await {
            match command {
                Command::Shutdown { reply } => waiters.push(reply),
                other => control.handle(other),
            }
        }

        control.close_all();
        control.set_state(HubState::Stopped);
        info!("Hub stopped");

        for waiter in waiters {
            let _ = waiter.send(());
        }
        let _ = dispatcher.await;
    }
}

/// Serializes inbound messages into the consumer
async fn dispatch(
    mut inbound: mpsc::Receiver<Inbound>,
    hub: HubHandle,
    consumer: Arc<dyn CommandConsumer>,
    mut state: watch::Receiver<HubState>,
) {
    loop {
        let (client, message) = tokio::select! {
            biased;
            _ = state.wait_for(|s| *s == HubState::Stopped) => break,
            item = inbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        if client.is_closed() {
            continue;
        }

        let session = Session::new(client, hub.clone());
        consumer.handle(&session, message).await;
    }
    debug!("Inbound dispatcher finished");
}

/// State owned by the running control loop
struct Control {
    registry: Registry,
    state: watch::Sender<HubState>,
    metrics: Arc<Metrics>,
}

impl Control {
    fn set_state(&self, next: HubState) {
        self.state.send_replace(next);
    }

    fn accepting(&self) -> bool {
        *self.state.borrow() == HubState::Running
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { client, reply } => {
                let _ = reply.send(self.register(client));
            }
            Command::Unregister { client, reply } => {
                let _ = reply.send(self.unregister(&client));
            }
            Command::Identify {
                client,
                identity,
                reply,
            } => {
                let _ = reply.send(self.identify(&client, identity));
            }
            Command::JoinGroup {
                client,
                group,
                reply,
            } => {
                let result = self.registry.set_group(client.id(), group).map_err(HubError::from);
                let _ = reply.send(result);
            }
            Command::UpdatePosition {
                participant,
                position,
                reply,
            } => {
                let result = match self.registry.by_participant(&participant).map(|c| c.id()) {
                    Some(id) => self.registry.update_position(id, position).map_err(HubError::from),
                    None => Err(HubError::UnknownParticipant(participant)),
                };
                let _ = reply.send(result);
            }
            Command::ClearPosition { participant, reply } => {
                let cleared = match self.registry.by_participant(&participant).map(|c| c.id()) {
                    Some(id) => self.registry.clear_position(id).is_ok(),
                    None => false,
                };
                let _ = reply.send(cleared);
            }
            Command::Find { lookup, reply } => {
                let found = match lookup {
                    Lookup::Id(id) => self.registry.get(id),
                    Lookup::Participant(participant) => self.registry.by_participant(&participant),
                    Lookup::Name(name) => self.registry.by_name(&name),
                };
                let _ = reply.send(found.cloned());
            }
            Command::Collect { lookup, reply } => {
                let found = match lookup {
                    LookupMany::All => self.registry.all().cloned().collect(),
                    LookupMany::Group(group) => self.registry.by_group(&group),
                    LookupMany::Area { center, radius } => self.query_area(center, radius),
                };
                let _ = reply.send(found);
            }
            Command::SendTo {
                participant,
                payload,
                reply,
            } => {
                let result = match self.registry.by_participant(&participant) {
                    Some(client) => client.send(payload).map_err(DeliveryError::from),
                    None => Err(DeliveryError::NotFound),
                };
                let _ = reply.send(result);
            }
            Command::Broadcast {
                scope,
                payload,
                reply,
            } => {
                let _ = reply.send(self.broadcast(scope, payload));
            }
            Command::Stats { reply } => {
                let spatial: SpatialStats = self.registry.spatial_stats();
                let _ = reply.send(HubStats {
                    connections: self.registry.len(),
                    identified: self.registry.identified(),
                    groups: self.registry.group_count(),
                    positioned: spatial.entries,
                    spatial_cells: spatial.cells,
                });
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn register(&mut self, client: Arc<Client>) -> Result<(), HubError> {
        if !self.accepting() {
            client.close();
            return Err(HubError::ShuttingDown);
        }
        // Lost a race with its own unregister
        if client.is_closed() {
            return Err(HubError::ConnectionClosed);
        }

        self.registry.insert(client.clone())?;
        self.metrics.connection_opened();
        debug!(conn_id = client.id(), "registered ({} online)", self.registry.len());
        Ok(())
    }

    fn unregister(&mut self, client: &Arc<Client>) -> bool {
        let removed = self.registry.remove(client.id()).is_some();
        if removed {
            self.metrics.connection_closed();
            debug!(conn_id = client.id(), "unregistered ({} online)", self.registry.len());
        }
        client.close();
        removed
    }

    fn identify(&mut self, client: &Arc<Client>, identity: Identity) -> Result<(), HubError> {
        let name = identity.name.clone();
        let displaced = self.registry.bind_identity(client.id(), identity)?;

        if let Some(old) = displaced {
            self.metrics.connection_closed();
            self.metrics.session_takeovers.fetch_add(1, Ordering::Relaxed);
            info!(
                conn_id = client.id(),
                "{} signed in again, closing connection {}",
                name,
                old.id()
            );
            let _ = old.send_message(&OutboundMessage::error(
                "session_replaced",
                "signed in from another connection",
            ));
            old.close();
        }
        Ok(())
    }

    fn query_area(&self, center: Vec2, radius: f32) -> Vec<Arc<Client>> {
        let started = Instant::now();
        let found = self.registry.within(center, radius);
        self.metrics.record_area_query(started.elapsed());
        found
    }

    fn broadcast(&mut self, scope: BroadcastScope, payload: Payload) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let mut deliver = |client: &Arc<Client>| {
            report.targets += 1;
            report.record(client.send(payload.clone()));
        };

        match &scope {
            BroadcastScope::All => {
                self.metrics.broadcasts_all.fetch_add(1, Ordering::Relaxed);
                self.registry.all().for_each(&mut deliver);
            }
            BroadcastScope::Group { group, exclude } => {
                self.metrics.broadcasts_group.fetch_add(1, Ordering::Relaxed);
                self.registry
                    .by_group(group)
                    .iter()
                    .filter(|client| Some(client.id()) != *exclude)
                    .for_each(&mut deliver);
            }
            BroadcastScope::Area { center, radius } => {
                self.metrics.broadcasts_area.fetch_add(1, Ordering::Relaxed);
                self.query_area(*center, *radius).iter().for_each(&mut deliver);
            }
        }

        self.metrics
            .broadcast_targets
            .fetch_add(report.targets as u64, Ordering::Relaxed);
        if report.dropped_full > 0 {
            warn!(
                "{:?} broadcast shed {} of {} messages on full queues",
                scope, report.dropped_full, report.targets
            );
        }
        report
    }

    /// Close and forget every registered connection
    fn close_all(&mut self) {
        for client in self.registry.drain() {
            client.close();
            self.metrics.connection_closed();
        }
    }
}

/// Cloneable request interface to a hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    inbound: mpsc::Sender<Inbound>,
    state: watch::Receiver<HubState>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle").field("state", &self.state()).finish()
    }
}

impl HubHandle {
    pub fn state(&self) -> HubState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<HubState> {
        self.state.clone()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn unavailable(&self) -> HubError {
        match self.state() {
            HubState::Draining => HubError::ShuttingDown,
            _ => HubError::Stopped,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(build(tx)).await.is_err() {
            return Err(self.unavailable());
        }
        rx.await.map_err(|_| self.unavailable())
    }

    // === Registry ===

    /// Add a connection to the registry
    pub async fn register(&self, client: Arc<Client>) -> Result<(), HubError> {
        self.request(|reply| Command::Register { client, reply }).await?
    }

    /// Remove a connection from every index and close it. Returns whether
    /// it was registered; repeating the call is harmless.
    pub async fn unregister(&self, client: &Arc<Client>) -> Result<bool, HubError> {
        let client = client.clone();
        self.request(|reply| Command::Unregister { client, reply }).await
    }

    /// Bind a participant identity, replacing any older connection that
    /// carries the same participant
    pub async fn identify(&self, client: &Arc<Client>, identity: Identity) -> Result<(), HubError> {
        let client = client.clone();
        self.request(|reply| Command::Identify {
            client,
            identity,
            reply,
        })
        .await?
    }

    pub async fn join_group(&self, client: &Arc<Client>, group: Option<GroupId>) -> Result<(), HubError> {
        let client = client.clone();
        self.request(|reply| Command::JoinGroup { client, group, reply })
            .await?
    }

    pub async fn update_position(&self, participant: ParticipantId, position: Vec2) -> Result<(), HubError> {
        self.request(|reply| Command::UpdatePosition {
            participant,
            position,
            reply,
        })
        .await?
    }

    /// Remove a participant from the spatial index without unregistering
    pub async fn clear_position(&self, participant: ParticipantId) -> Result<bool, HubError> {
        self.request(|reply| Command::ClearPosition { participant, reply })
            .await
    }

    // === Lookups ===

    pub async fn lookup_by_id(&self, id: ConnectionId) -> Result<Option<Arc<Client>>, HubError> {
        self.request(|reply| Command::Find {
            lookup: Lookup::Id(id),
            reply,
        })
        .await
    }

    pub async fn lookup_by_participant(
        &self,
        participant: ParticipantId,
    ) -> Result<Option<Arc<Client>>, HubError> {
        self.request(|reply| Command::Find {
            lookup: Lookup::Participant(participant),
            reply,
        })
        .await
    }

    /// Case-insensitive display name lookup
    pub async fn lookup_by_name(&self, name: &str) -> Result<Option<Arc<Client>>, HubError> {
        let name = name.to_string();
        self.request(|reply| Command::Find {
            lookup: Lookup::Name(name),
            reply,
        })
        .await
    }

    pub async fn lookup_by_group(&self, group: &str) -> Result<Vec<Arc<Client>>, HubError> {
        let group = group.to_string();
        self.request(|reply| Command::Collect {
            lookup: LookupMany::Group(group),
            reply,
        })
        .await
    }

    pub async fn lookup_area(&self, center: Vec2, radius: f32) -> Result<Vec<Arc<Client>>, HubError> {
        self.request(|reply| Command::Collect {
            lookup: LookupMany::Area { center, radius },
            reply,
        })
        .await
    }

    /// Snapshot of every registered connection (O(N))
    pub async fn lookup_all(&self) -> Result<Vec<Arc<Client>>, HubError> {
        self.request(|reply| Command::Collect {
            lookup: LookupMany::All,
            reply,
        })
        .await
    }

    // === Delivery ===

    pub async fn send_to(
        &self,
        participant: ParticipantId,
        message: &OutboundMessage,
    ) -> Result<(), DeliveryError> {
        let payload = protocol::encode(message)?;
        self.request(|reply| Command::SendTo {
            participant,
            payload,
            reply,
        })
        .await?
    }

    pub async fn broadcast_all(&self, message: &OutboundMessage) -> Result<BroadcastReport, HubError> {
        self.broadcast(BroadcastScope::All, message).await
    }

    pub async fn broadcast_group(
        &self,
        group: &str,
        message: &OutboundMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<BroadcastReport, HubError> {
        let scope = BroadcastScope::Group {
            group: group.to_string(),
            exclude,
        };
        self.broadcast(scope, message).await
    }

    /// Deliver to every participant within `radius` of `center`
    pub async fn broadcast_area(
        &self,
        center: Vec2,
        radius: f32,
        message: &OutboundMessage,
    ) -> Result<BroadcastReport, HubError> {
        self.broadcast(BroadcastScope::Area { center, radius }, message)
            .await
    }

    async fn broadcast(&self, scope: BroadcastScope, message: &OutboundMessage) -> Result<BroadcastReport, HubError> {
        // Encoded once for every recipient
        let payload = protocol::encode(message)?;
        self.request(|reply| Command::Broadcast { scope, payload, reply })
            .await
    }

    // === Inbound ===

    /// Queue a decoded message for the command consumer. Waits while the
    /// inbound queue is full.
    pub async fn route_inbound(&self, client: Arc<Client>, message: InboundMessage) -> Result<(), HubError> {
        self.inbound
            .send((client, message))
            .await
            .map_err(|_| self.unavailable())
    }

    // === Lifecycle ===

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Drain and stop the hub. Resolves once it is `Stopped`; calling it
    /// again afterwards is a no-op.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let mut state = self.state.clone();
                let _ = state.wait_for(|s| *s == HubState::Stopped).await;
                Ok(())
            }
        }
    }
}
