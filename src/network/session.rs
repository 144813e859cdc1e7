//! Peer session: the single actor that owns everything a device knows.
//!
//! One task per device processes transport events, timer expiries and API
//! commands strictly one at a time. The connection registry, hub link,
//! dataset and endpoint are plain fields of [`SessionActor`]; callers only
//! ever hold a [`SyncHandle`].
//!
//! Every scheduled callback (debounce, restart cooldown, hub retry) carries
//! the generation it was scheduled under and is dropped if the session has
//! moved on. The generation advances on every `start()` and on every
//! external teardown (hidden, logout, shutdown), but not on an error-driven
//! destroy, whose own restart timer must still fire.

use crate::auth::{AuthDecision, CredentialRelay};
use crate::config::{Config, SyncConfig};
use crate::error::{SyncError, TransportError};
use crate::identity::{self, PeerIdentity, Role};
use crate::network::connection_registry::{ConnectionInfo, ConnectionRegistry};
use crate::network::connection_state::{SessionStateMachine, SyncStatus};
use crate::network::heartbeat::HeartbeatScheduler;
use crate::network::hub_link::{HubLinkState, HubSupervisor};
use crate::network::message::{Credentials, SyncMessage};
use crate::network::transport::{
    Channel, Direction, Endpoint, EventSink, TaggedEvent, Transport, TransportEvent,
};
use crate::replication::{Dataset, Record, Snapshot};
use crate::storage::SnapshotStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Who a session is and how it paces itself.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub role: Role,
    pub namespace: String,
    pub local_id: String,
    pub sync: SyncConfig,
}

impl SessionSettings {
    pub fn new(role: Role, namespace: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            role,
            namespace: namespace.into(),
            local_id: local_id.into(),
            sync: SyncConfig::default(),
        }
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            role: config.node.role,
            namespace: config.node.namespace.clone(),
            local_id: config.node.local_id.clone(),
            sync: config.sync.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    /// Merged from a message received from this peer.
    Remote(String),
}

/// Announced on the change feed whenever collections actually changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetChange {
    pub collections: Vec<String>,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub role: Role,
    pub endpoint_id: Option<String>,
    pub state: &'static str,
    pub status: SyncStatus,
    pub generation: u64,
    pub hub_link: Option<HubLinkState>,
    pub hub_attempt: u32,
    pub peer_count: usize,
    /// Transport error behind the last restart, cleared once the endpoint opens.
    pub last_error: Option<SyncError>,
}

type CollectionUpdate = Box<dyn FnOnce(&[Record]) -> Vec<Record> + Send>;

enum Command {
    Start,
    SetVisible(bool),
    Logout,
    Upsert {
        collection: String,
        record: Record,
        reply: oneshot::Sender<Record>,
    },
    UpdateCollection {
        collection: String,
        update: CollectionUpdate,
        reply: oneshot::Sender<usize>,
    },
    RemoteLogin {
        credentials: Credentials,
        reply: oneshot::Sender<Result<Record, SyncError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Info {
        reply: oneshot::Sender<SessionInfo>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Rendezvous loss outlived the debounce window.
    Debounce,
    /// Cooldown after an error-driven destroy.
    Restart,
    HubRetry,
}

#[derive(Debug)]
struct TimerFired {
    generation: u64,
    kind: TimerKind,
}

struct PendingLogin {
    credentials: Credentials,
    reply: oneshot::Sender<Result<Record, SyncError>>,
    /// Request is on the current hub link.
    sent: bool,
}

/// Cloneable client of a running session.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SyncStatus>,
    changes: broadcast::Sender<DatasetChange>,
    auth_timeout: Duration,
}

impl SyncHandle {
    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::SessionClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// (Re)start the session: destroys any current endpoint and binds a fresh identity.
    pub fn start(&self) -> Result<(), SyncError> {
        self.send(Command::Start)
    }

    /// Manual reconnect affordance; same as `start()`.
    pub fn force_reconnect(&self) -> Result<(), SyncError> {
        self.send(Command::Start)
    }

    /// Application visibility changed. Hidden frees the endpoint, visible restarts it.
    pub fn set_visible(&self, visible: bool) -> Result<(), SyncError> {
        self.send(Command::SetVisible(visible))
    }

    /// Destroy the endpoint and discard the identity. `start()` brings it back.
    pub fn logout(&self) -> Result<(), SyncError> {
        self.send(Command::Logout)
    }

    /// Destroy the endpoint and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Insert or replace `record` (by id), stamping `updatedAt`, then flood the snapshot.
    pub async fn upsert(
        &self,
        collection: impl Into<String>,
        record: Record,
    ) -> Result<Record, SyncError> {
        let collection = collection.into();
        self.request(|reply| Command::Upsert {
            collection,
            record,
            reply,
        })
        .await
    }

    /// Functional update of one collection, applied to the latest state.
    ///
    /// Returns the resulting record count.
    pub async fn update_collection<F>(
        &self,
        collection: impl Into<String>,
        update: F,
    ) -> Result<usize, SyncError>
    where
        F: FnOnce(&[Record]) -> Vec<Record> + Send + 'static,
    {
        let collection = collection.into();
        self.request(|reply| Command::UpdateCollection {
            collection,
            update: Box::new(update),
            reply,
        })
        .await
    }

    pub async fn replace_collection(
        &self,
        collection: impl Into<String>,
        records: Vec<Record>,
    ) -> Result<usize, SyncError> {
        self.update_collection(collection, move |_| records).await
    }

    /// Log in through the hub, bootstrapping the local replica on success.
    ///
    /// The request waits for the hub link if it is not up yet. Bounded by
    /// `auth_timeout`.
    pub async fn remote_login(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Record, SyncError> {
        let credentials = Credentials {
            email: email.into(),
            password: password.into(),
        };
        let (tx, rx) = oneshot::channel();
        self.send(Command::RemoteLogin {
            credentials,
            reply: tx,
        })?;

        match tokio::time::timeout(self.auth_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::SessionClosed),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    pub async fn snapshot(&self) -> Result<Snapshot, SyncError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn collection(&self, name: &str) -> Result<Vec<Record>, SyncError> {
        let mut snapshot = self.snapshot().await?;
        Ok(snapshot.remove(name).unwrap_or_default())
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, SyncError> {
        self.request(|reply| Command::Connections { reply }).await
    }

    pub async fn info(&self) -> Result<SessionInfo, SyncError> {
        self.request(|reply| Command::Info { reply }).await
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Wait until the status equals `target`, or give up after `limit`.
    pub async fn wait_for_status(
        &self,
        target: SyncStatus,
        limit: Duration,
    ) -> Result<(), SyncError> {
        let mut rx = self.status.clone();
        let result = match tokio::time::timeout(limit, rx.wait_for(|status| *status == target)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SyncError::SessionClosed),
            Err(_) => Err(SyncError::Timeout),
        };
        result
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatasetChange> {
        self.changes.subscribe()
    }
}

/// Entry point: load the replica and spawn the session actor (in `Idle`).
pub struct SyncSession;

impl SyncSession {
    pub async fn spawn(
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<(SyncHandle, JoinHandle<()>), SyncError> {
        settings.sync.validate()?;

        let snapshot = store.load().await?;
        let dataset = Dataset::from_snapshot(snapshot);
        info!(
            "📂 Loaded {} record(s) in {} collection(s)",
            dataset.record_count(),
            dataset.collection_names().len()
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus::Disconnected);
        let (changes_tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        let hub = match settings.role {
            Role::Spoke => Some(HubSupervisor::new(
                identity::hub_id(&settings.namespace),
                settings.sync.backoff_base(),
                settings.sync.backoff_cap(),
            )),
            Role::Hub => None,
        };

        let handle = SyncHandle {
            commands: cmd_tx,
            status: status_rx,
            changes: changes_tx.clone(),
            auth_timeout: settings.sync.auth_timeout(),
        };

        let actor = SessionActor {
            heartbeat: HeartbeatScheduler::new(
                settings.sync.heartbeat_interval(),
                settings.sync.max_missed_pongs,
            ),
            relay: CredentialRelay::new(settings.sync.roster_collection.clone()),
            settings,
            transport,
            store,
            identity: None,
            endpoint: None,
            generation: 0,
            state: SessionStateMachine::new(),
            registry: ConnectionRegistry::new(),
            hub,
            dataset,
            rendezvous_lost: false,
            debounce_pending: false,
            pending_login: None,
            last_error: None,
            event_tx,
            timer_tx,
            status_tx,
            changes_tx,
        };

        let task = tokio::spawn(actor.run(cmd_rx, event_rx, timer_rx));
        Ok((handle, task))
    }
}

struct SessionActor {
    settings: SessionSettings,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SnapshotStore>,
    identity: Option<PeerIdentity>,
    endpoint: Option<Box<dyn Endpoint>>,
    generation: u64,
    state: SessionStateMachine,
    registry: ConnectionRegistry,
    /// Present for spokes only.
    hub: Option<HubSupervisor>,
    heartbeat: HeartbeatScheduler,
    relay: CredentialRelay,
    dataset: Dataset,
    rendezvous_lost: bool,
    debounce_pending: bool,
    pending_login: Option<PendingLogin>,
    last_error: Option<SyncError>,
    event_tx: mpsc::UnboundedSender<TaggedEvent>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    status_tx: watch::Sender<SyncStatus>,
    changes_tx: broadcast::Sender<DatasetChange>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TaggedEvent>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        let mut ticker = self.heartbeat.ticker();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(tagged) = events.recv() => self.handle_event(tagged).await,
                Some(fired) = timers.recv() => self.handle_timer(fired),
                _ = ticker.tick() => self.heartbeat_tick(),
            }
        }

        info!("🛑 Session actor stopped");
    }

    // ---- lifecycle ----------------------------------------------------

    fn endpoint_id(&self) -> Option<String> {
        self.identity.as_ref().map(PeerIdentity::endpoint_id)
    }

    fn is_spoke(&self) -> bool {
        self.settings.role == Role::Spoke
    }

    fn is_live(&self) -> bool {
        self.endpoint.is_some() && !self.state.state().is_destroyed()
    }

    fn publish_status(&self) {
        let status = self.state.state().status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    fn start(&mut self) {
        if self.endpoint.is_some() {
            self.destroy_endpoint("restart");
        }
        self.generation += 1;

        let identity = PeerIdentity::resolve(
            self.settings.role,
            &self.settings.namespace,
            &self.settings.local_id,
        );
        let endpoint_id = identity.endpoint_id();
        info!(
            "🚀 Starting {} session as {} (generation {})",
            self.settings.role, endpoint_id, self.generation
        );

        self.state.mark_opening();
        self.publish_status();
        self.identity = Some(identity);

        let sink = EventSink::new(self.generation, self.event_tx.clone());
        self.endpoint = Some(self.transport.bind(&endpoint_id, sink));
    }

    /// Release the endpoint and every connection. Does not touch the generation.
    fn destroy_endpoint(&mut self, reason: &str) {
        if let Some(endpoint) = self.endpoint.take() {
            info!("🔌 Destroying endpoint {} ({})", endpoint.id(), reason);
            endpoint.destroy();
        }
        self.registry.clear();
        if let Some(hub) = self.hub.as_mut() {
            hub.reset();
        }
        if let Some(pending) = self.pending_login.as_mut() {
            pending.sent = false;
        }
        self.rendezvous_lost = false;
        self.debounce_pending = false;
        self.state.mark_destroyed();
        self.publish_status();
    }

    /// Deliberate teardown: invalidates every pending timer.
    fn teardown(&mut self, reason: &str) {
        self.generation += 1;
        self.destroy_endpoint(reason);
    }

    fn shutdown(&mut self) {
        self.teardown("shutdown");
        self.identity = None;
        if let Some(pending) = self.pending_login.take() {
            let _ = pending.reply.send(Err(SyncError::SessionClosed));
        }
    }

    fn schedule(&self, kind: TimerKind, delay: Duration) {
        let fired = TimerFired {
            generation: self.generation,
            kind,
        };
        let tx = self.timer_tx.clone();
        debug!(
            "⏱️  Scheduled {:?} in {}ms (generation {})",
            kind,
            delay.as_millis(),
            fired.generation
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(fired);
        });
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        if fired.generation != self.generation {
            debug!(
                "Dropping stale {:?} timer (generation {} != {})",
                fired.kind, fired.generation, self.generation
            );
            return;
        }

        match fired.kind {
            TimerKind::Restart => {
                if self.state.state().is_destroyed() {
                    info!("🔄 Cooldown elapsed, restarting session");
                    self.start();
                }
            }
            TimerKind::Debounce => {
                self.debounce_pending = false;
                if !self.rendezvous_lost || !self.state.state().is_open() {
                    return;
                }
                warn!("📴 Rendezvous lost for longer than the debounce window");
                self.state.mark_disconnected();
                self.publish_status();
                if let Some(endpoint) = self.endpoint.as_ref() {
                    endpoint.reconnect();
                    self.state.mark_reconnecting();
                    self.publish_status();
                }
            }
            TimerKind::HubRetry => {
                if self.is_live() {
                    self.connect_hub();
                }
            }
        }
    }

    // ---- commands -----------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::SetVisible(true) => {
                debug!("👁️  Application visible");
                self.start();
            }
            Command::SetVisible(false) => {
                debug!("🙈 Application hidden");
                self.teardown("hidden");
            }
            Command::Logout => {
                self.teardown("logout");
                self.identity = None;
                if let Some(pending) = self.pending_login.take() {
                    let _ = pending.reply.send(Err(SyncError::SessionClosed));
                }
            }
            Command::Upsert {
                collection,
                record,
                reply,
            } => {
                let stored = self.dataset.upsert(&collection, record);
                self.after_local_change(vec![collection]).await;
                let _ = reply.send(stored);
            }
            Command::UpdateCollection {
                collection,
                update,
                reply,
            } => {
                let records = update(self.dataset.collection(&collection));
                self.dataset.replace_collection(&collection, records);
                let count = self.dataset.collection(&collection).len();
                self.after_local_change(vec![collection]).await;
                let _ = reply.send(count);
            }
            Command::RemoteLogin { credentials, reply } => {
                self.begin_remote_login(credentials, reply)
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.dataset.snapshot());
            }
            Command::Connections { reply } => {
                let _ = reply.send(self.registry.connections());
            }
            Command::Info { reply } => {
                let _ = reply.send(SessionInfo {
                    role: self.settings.role,
                    endpoint_id: self.endpoint_id(),
                    state: self.state.state().name(),
                    status: self.state.state().status(),
                    generation: self.generation,
                    hub_link: self.hub.as_ref().map(HubSupervisor::state),
                    hub_attempt: self.hub.as_ref().map_or(0, HubSupervisor::attempt),
                    peer_count: self.registry.peer_count(),
                    last_error: self.last_error.clone(),
                });
            }
            // Handled in the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn begin_remote_login(
        &mut self,
        credentials: Credentials,
        reply: oneshot::Sender<Result<Record, SyncError>>,
    ) {
        if !self.is_spoke() {
            // The hub holds the roster itself
            let result = match self.relay.authenticate(&self.dataset, &credentials) {
                AuthDecision::Granted(user) => Ok(user),
                AuthDecision::Rejected(message) => Err(SyncError::AuthFailure(message.to_string())),
            };
            let _ = reply.send(result);
            return;
        }

        if let Some(previous) = self.pending_login.take() {
            let _ = previous
                .reply
                .send(Err(SyncError::AuthFailure("superseded by a newer login".to_string())));
        }

        info!("🔑 Remote login requested for {}", credentials.email);
        self.pending_login = Some(PendingLogin {
            credentials,
            reply,
            sent: false,
        });
        self.flush_pending_login();
    }

    /// Send the queued login request if the hub link is up.
    fn flush_pending_login(&mut self) {
        let Some(hub_id) = self
            .hub
            .as_ref()
            .filter(|hub| hub.is_up())
            .map(|hub| hub.hub_id().to_string())
        else {
            return;
        };

        let Some(pending) = self.pending_login.as_mut() else {
            return;
        };
        if pending.reply.is_closed() {
            debug!("Dropping abandoned remote login");
            self.pending_login = None;
            return;
        }
        if pending.sent {
            return;
        }

        let request = SyncMessage::RemoteAuthRequest {
            payload: pending.credentials.clone(),
        };
        match self.registry.send_to_peer(&hub_id, request) {
            Ok(()) => {
                pending.sent = true;
                debug!("📤 Sent REMOTE_AUTH_REQUEST to {}", hub_id);
            }
            Err(e) => {
                warn!("❌ Failed to send login request to {}: {}", hub_id, e);
                self.on_connections_dropped(&[hub_id], "send failed");
            }
        }
    }

    fn resolve_login(&mut self, result: Result<Record, SyncError>) {
        match self.pending_login.take() {
            Some(pending) => {
                let _ = pending.reply.send(result);
            }
            None => debug!("Auth response with no login pending, ignoring"),
        }
    }

    // ---- replication --------------------------------------------------

    async fn persist(&self, collections: &[String]) {
        for name in collections {
            if let Err(e) = self
                .store
                .save_collection(name, self.dataset.collection(name))
                .await
            {
                warn!("⚠️ Failed to persist collection {}: {}", name, e);
            }
        }
    }

    fn announce(&self, collections: Vec<String>, origin: ChangeOrigin) {
        // No subscribers is fine
        let _ = self.changes_tx.send(DatasetChange {
            collections,
            origin,
        });
    }

    fn broadcast_snapshot(&mut self) {
        let message = SyncMessage::DataUpdate {
            payload: self.dataset.snapshot(),
        };
        let failed = self.registry.broadcast(&message);
        if !failed.is_empty() {
            self.on_connections_dropped(&failed, "send failed");
        }
    }

    async fn after_local_change(&mut self, collections: Vec<String>) {
        self.persist(&collections).await;
        self.announce(collections, ChangeOrigin::Local);
        self.broadcast_snapshot();
    }

    /// Merge a remote snapshot. Anything that changed is persisted, announced
    /// and flooded onward; a no-op merge stops the relay here.
    async fn apply_remote_snapshot(&mut self, from: &str, payload: &Snapshot) {
        let changed = self.dataset.merge_snapshot(payload);
        if changed.is_empty() {
            debug!("DATA_UPDATE from {} changed nothing", from);
            return;
        }

        info!("🔄 Merged {:?} from {}", changed, from);
        self.persist(&changed).await;
        self.announce(changed, ChangeOrigin::Remote(from.to_string()));
        self.broadcast_snapshot();
    }

    // ---- hub link -----------------------------------------------------

    fn connect_hub(&mut self) {
        let Some(hub) = self.hub.as_mut() else {
            return;
        };
        if !hub.begin_connect() {
            return;
        }
        let hub_id = hub.hub_id().to_string();
        if let Some(endpoint) = self.endpoint.as_ref() {
            endpoint.connect(&hub_id);
        }
    }

    fn hub_link_failed(&mut self, link_id: Option<u64>, reason: &str) {
        let Some(hub) = self.hub.as_mut() else {
            return;
        };
        if let Some(pending) = self.pending_login.as_mut() {
            pending.sent = false;
        }
        if !self.state.state().is_destroyed() {
            if let Some(delay) = hub.on_failure(link_id, reason) {
                self.schedule(TimerKind::HubRetry, delay);
            }
        }
    }

    fn is_hub_id(&self, remote_id: &str) -> bool {
        self.hub.as_ref().is_some_and(|hub| hub.is_hub(remote_id))
    }

    /// Connections the registry already dropped (send failure, eviction).
    fn on_connections_dropped(&mut self, remote_ids: &[String], reason: &str) {
        for remote_id in remote_ids {
            debug!("🔌 Dropped connection to {} ({})", remote_id, reason);
            if self.is_hub_id(remote_id) {
                self.hub_link_failed(None, reason);
            }
        }
    }

    fn heartbeat_tick(&mut self) {
        if !self.is_live() {
            return;
        }
        let report = self.heartbeat.tick(&mut self.registry);
        if !report.evicted.is_empty() {
            self.on_connections_dropped(&report.evicted, "heartbeat");
        }
    }

    // ---- transport events ---------------------------------------------

    async fn handle_event(&mut self, tagged: TaggedEvent) {
        let TaggedEvent { generation, event } = tagged;

        if generation != self.generation || !self.is_live() {
            debug!(
                "Ignoring {} event from generation {} (current {})",
                event.kind(),
                generation,
                self.generation
            );
            if let TransportEvent::ChannelOpened { channel, .. } = event {
                channel.close();
            }
            return;
        }

        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Error(error) => self.on_error(error),
            TransportEvent::ChannelOpened { channel, direction } => {
                self.on_channel_opened(channel, direction)
            }
            TransportEvent::ChannelData {
                remote_id,
                link_id,
                message,
            } => self.on_message(remote_id, link_id, message).await,
            TransportEvent::ChannelFailed { remote_id, reason } => {
                debug!("Channel to {} failed: {}", remote_id, reason);
                if self.is_hub_id(&remote_id) {
                    self.hub_link_failed(None, &reason);
                }
            }
            TransportEvent::ChannelClosed { remote_id, link_id } => {
                if self.registry.unregister_link(&remote_id, link_id) {
                    debug!("🔌 Channel to {} closed", remote_id);
                }
                if self.is_hub_id(&remote_id) {
                    self.hub_link_failed(Some(link_id), "closed");
                }
            }
        }
    }

    fn on_open(&mut self) {
        if self.state.state().is_open() {
            if self.rendezvous_lost {
                debug!("Rendezvous recovered within the debounce window");
                self.rendezvous_lost = false;
            }
            return;
        }
        if !self.state.mark_open() {
            return;
        }

        self.rendezvous_lost = false;
        self.last_error = None;
        if let Some(hub) = self.hub.as_mut() {
            hub.reset_backoff();
        }
        info!(
            "✅ Endpoint {} open",
            self.endpoint_id().unwrap_or_default()
        );
        self.publish_status();
        self.connect_hub();
    }

    fn on_disconnected(&mut self) {
        if !self.state.state().is_open() {
            return;
        }
        self.rendezvous_lost = true;
        if !self.debounce_pending {
            self.debounce_pending = true;
            self.schedule(TimerKind::Debounce, self.settings.sync.disconnect_debounce());
        }
    }

    fn on_error(&mut self, error: TransportError) {
        let cooldown = if error.is_identity_collision() {
            warn!("⚠️ {}, another session still holds it", error);
            self.settings.sync.collision_cooldown()
        } else {
            error!("❌ Transport error: {}", error);
            self.settings.sync.transport_cooldown()
        };

        self.last_error = Some(error.into());
        self.destroy_endpoint("transport error");
        info!("⏳ Restarting in {}ms", cooldown.as_millis());
        self.schedule(TimerKind::Restart, cooldown);
    }

    fn on_channel_opened(&mut self, channel: Channel, direction: Direction) {
        let remote_id = channel.remote_id().to_string();
        let link_id = channel.link_id();
        info!("🤝 Channel {:?} with {} open", direction, remote_id);

        self.registry.register(channel, direction);

        let is_hub_link = self.is_hub_id(&remote_id);
        if is_hub_link {
            if let Some(hub) = self.hub.as_mut() {
                hub.on_open(link_id);
            }
        }

        // Every new peer gets our full snapshot, whoever dialled
        let update = SyncMessage::DataUpdate {
            payload: self.dataset.snapshot(),
        };
        if let Err(e) = self.registry.send_to_peer(&remote_id, update) {
            warn!("❌ Failed to send snapshot to {}: {}", remote_id, e);
            self.on_connections_dropped(&[remote_id], "send failed");
            return;
        }

        if is_hub_link {
            self.flush_pending_login();
        }
    }

    async fn on_message(&mut self, remote_id: String, link_id: u64, message: SyncMessage) {
        if !self.registry.is_current_link(&remote_id, link_id) {
            debug!(
                "Ignoring {} from superseded link to {}",
                message.message_type(),
                remote_id
            );
            return;
        }
        self.registry.mark_active(&remote_id);

        if message.is_auth_response() && !self.is_hub_id(&remote_id) {
            warn!(
                "🚫 Ignoring {} from {}: only the hub answers logins",
                message.message_type(),
                remote_id
            );
            return;
        }
        if !message.is_heartbeat() {
            debug!("📨 {} from {}", message.message_type(), remote_id);
        }

        match message {
            SyncMessage::DataUpdate { payload } => {
                self.apply_remote_snapshot(&remote_id, &payload).await;
            }
            SyncMessage::Ping => {
                if self.registry.send_to_peer(&remote_id, SyncMessage::Pong).is_err() {
                    self.on_connections_dropped(&[remote_id], "send failed");
                }
            }
            SyncMessage::Pong => {}
            SyncMessage::RemoteAuthRequest { payload } => {
                if self.is_spoke() {
                    debug!("Ignoring REMOTE_AUTH_REQUEST from {}: not the hub", remote_id);
                    return;
                }
                let reply = self.relay.respond(&self.dataset, &payload);
                if self.registry.send_to_peer(&remote_id, reply).is_err() {
                    self.on_connections_dropped(&[remote_id], "send failed");
                }
            }
            SyncMessage::RemoteAuthSuccess { payload } => {
                if self.pending_login.is_none() {
                    debug!("Unsolicited REMOTE_AUTH_SUCCESS from {}, ignoring", remote_id);
                    return;
                }
                info!("🔓 Remote login succeeded for user {}", payload.user.id);
                self.apply_remote_snapshot(&remote_id, &payload.full_data)
                    .await;
                self.resolve_login(Ok(payload.user));
            }
            SyncMessage::RemoteAuthFailure { message } => {
                warn!("🚫 Remote login failed: {}", message);
                self.resolve_login(Err(SyncError::AuthFailure(message)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::MemoryNetwork;
    use crate::storage::MemoryStore;
    use chrono::Utc;

    fn fast_sync() -> SyncConfig {
        SyncConfig {
            heartbeat_interval_ms: 60_000,
            disconnect_debounce_ms: 50,
            collision_cooldown_ms: 100,
            transport_cooldown_ms: 50,
            backoff_base_ms: 20,
            backoff_cap_ms: 200,
            auth_timeout_ms: 2_000,
            ..SyncConfig::default()
        }
    }

    async fn spawn(network: &MemoryNetwork, role: Role, local_id: &str) -> SyncHandle {
        let settings = SessionSettings::new(role, "acme", local_id).with_sync(fast_sync());
        let (handle, _task) = SyncSession::spawn(
            settings,
            Arc::new(network.clone()),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();
        handle
    }

    #[tokio::test]
    async fn test_idle_until_started() {
        let network = MemoryNetwork::new();
        let hub = spawn(&network, Role::Hub, "admin").await;

        assert_eq!(hub.status(), SyncStatus::Disconnected);
        assert_eq!(hub.info().await.unwrap().state, "idle");

        hub.start().unwrap();
        hub.wait_for_status(SyncStatus::Synced, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(network.is_bound("hub-acme"));
    }

    #[tokio::test]
    async fn test_hidden_releases_identifier() {
        let network = MemoryNetwork::new();
        let hub = spawn(&network, Role::Hub, "admin").await;
        hub.start().unwrap();
        hub.wait_for_status(SyncStatus::Synced, Duration::from_secs(2))
            .await
            .unwrap();

        hub.set_visible(false).unwrap();
        hub.wait_for_status(SyncStatus::Disconnected, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!network.is_bound("hub-acme"));

        hub.set_visible(true).unwrap();
        hub.wait_for_status(SyncStatus::Synced, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_upsert_announced() {
        let network = MemoryNetwork::new();
        let hub = spawn(&network, Role::Hub, "admin").await;
        let mut changes = hub.subscribe();

        let stored = hub
            .upsert("clients", Record::new("c1", Utc::now()).with_field("name", "Jane"))
            .await
            .unwrap();
        assert_eq!(stored.id, "c1");

        let change = changes.recv().await.unwrap();
        assert_eq!(change.collections, vec!["clients".to_string()]);
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert_eq!(hub.collection("clients").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hub_login_checks_own_roster() {
        let network = MemoryNetwork::new();
        let hub = spawn(&network, Role::Hub, "admin").await;
        hub.upsert(
            "users",
            Record::new("u1", Utc::now())
                .with_field("email", "ana@example.com")
                .with_field("password", "pw"),
        )
        .await
        .unwrap();

        let user = hub.remote_login("ANA@example.com", "pw").await.unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(
            hub.remote_login("ana@example.com", "bad").await,
            Err(SyncError::AuthFailure("invalid credentials".into()))
        );
    }

    #[tokio::test]
    async fn test_spawn_rejects_invalid_sync_config() {
        let network = MemoryNetwork::new();
        let settings = SessionSettings::new(Role::Hub, "acme", "admin").with_sync(SyncConfig {
            heartbeat_interval_ms: 0,
            ..fast_sync()
        });

        let result = SyncSession::spawn(
            settings,
            Arc::new(network.clone()),
            Arc::new(MemoryStore::new()),
        )
        .await;
        assert!(matches!(result, Err(SyncError::Config(msg)) if msg.contains("heartbeat_interval_ms")));
        assert!(!network.is_bound("hub-acme"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let network = MemoryNetwork::new();
        let hub = spawn(&network, Role::Hub, "admin").await;
        hub.start().unwrap();
        hub.shutdown().await.unwrap();

        assert_eq!(hub.snapshot().await, Err(SyncError::SessionClosed));
        assert!(!network.is_bound("hub-acme"));
    }
}
