use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::cluster::handlers::{handle_ping, PingOutcome};
use crate::cluster::state::{ClusterState, MasterRole};
use crate::cluster::timer::{delay_after, random_election_delay, EventClock};
use crate::config::{NodeAddr, NodeConfig};
use crate::error::Result;
use crate::network::{self, client, send_or_skip};
use crate::protocol::{
    read_message, Event, EventArgs, Message, NodeInfo, Payload, Ping, SyncRequest, VersionVector,
    TOKEN_FAILED, TOKEN_OK,
};
use crate::store::EventLog;
use crate::subscription::{SubscriberRegistry, Subscription};

/// A node of the event bus.
///
/// Owns the event log, the subscriber registry and the mastership state.
/// [`Eventer::start`] spawns the TCP server and the election loop; both stop
/// on [`Eventer::shutdown`].
pub struct Eventer {
    id: String,
    config: NodeConfig,
    delay: RwLock<Duration>,
    state: RwLock<ClusterState>,
    /// Writes run on the blocking pool while the owned guard is held.
    event_log: Arc<Mutex<EventLog>>,
    subscribers: SubscriberRegistry,
    /// Held for the duration of an election round; `emit` waits on it.
    emit_barrier: Mutex<()>,
    /// Restarts the election loop from a fresh sleep.
    restart_election: Notify,
    clock: EventClock,
    shutdown: CancellationToken,
}

impl Eventer {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let id = config.listen_addr.id();
        let event_log = EventLog::open(&config.data_dir, config.max_log_size)?;
        let last_own = event_log.versions().get(&id).copied().unwrap_or(0.0);
        let delay =
            random_election_delay(config.election_delay_min_ms, config.election_delay_max_ms);

        tracing::info!(
            node = %id,
            delay_ms = delay.as_millis() as u64,
            peers = config.peers.len(),
            events = event_log.len(),
            "Node created"
        );

        Ok(Self {
            state: RwLock::new(ClusterState::new(
                config.listen_addr.clone(),
                !config.peers.is_empty(),
            )),
            id,
            delay: RwLock::new(delay),
            event_log: Arc::new(Mutex::new(event_log)),
            subscribers: SubscriberRegistry::new(),
            emit_barrier: Mutex::new(()),
            restart_election: Notify::new(),
            clock: EventClock::starting_after(last_own),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// Start serving peers, look for an existing master, then start the
    /// election loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = network::bind(&self.config.listen_addr).await?;
        let node = self.clone();
        tokio::spawn(network::serve(
            listener,
            move |stream, remote| {
                let node = node.clone();
                async move { node.handle_connection(stream, remote).await }
            },
            self.shutdown.clone(),
        ));

        if let Some((master, info)) = self.find_master().await {
            let master_delay = Duration::try_from_secs_f64(info.delay).unwrap_or_default();
            let delay = delay_after(master_delay);
            *self.delay.write().await = delay;
            let start_sync = self.state.write().await.follow(master.clone());
            tracing::info!(
                node = %self.id,
                master = %master,
                delay_ms = delay.as_millis() as u64,
                "Discovered master"
            );
            if start_sync {
                self.sync_with(master).await;
            }
        }

        let node = self.clone();
        tokio::spawn(async move { node.run_election_loop().await });
        Ok(())
    }

    /// Stop the server and the election loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Publish an event to the cluster.
    ///
    /// Fails only for events that cannot be encoded or stored; unreachable
    /// peers are skipped.
    pub async fn emit(&self, name: impl Into<String>, args: EventArgs) -> Result<()> {
        drop(self.emit_barrier.lock().await);

        let event = Event::with_timestamp(self.clock.next(), name, args);
        let frame = Message::new(self.id.clone(), Payload::Event(event.clone())).encode()?;

        let forward_to = {
            let state = self.state.read().await;
            if state.is_master() {
                None
            } else {
                state.master().cloned()
            }
        };

        match forward_to {
            None => {
                self.replicate(&self.id, event, &frame).await?;
            }
            Some(master) => {
                if !send_or_skip(&master, &frame, self.peer_timeout().await).await {
                    tracing::debug!(node = %self.id, master = %master, "Master unreachable, event not forwarded");
                }
            }
        }
        Ok(())
    }

    pub async fn subscribe<F>(&self, name: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&EventArgs) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(name, callback).await
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.subscribers.unsubscribe(subscription).await
    }

    pub async fn is_master(&self) -> bool {
        self.state.read().await.is_master()
    }

    pub async fn role(&self) -> MasterRole {
        self.state.read().await.role()
    }

    pub async fn master(&self) -> Option<NodeAddr> {
        self.state.read().await.master().cloned()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn delay(&self) -> Duration {
        *self.delay.read().await
    }

    pub async fn versions(&self) -> VersionVector {
        self.event_log.lock().await.versions().clone()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.event_log.lock().await.events().cloned().collect()
    }

    pub async fn last_event(&self) -> Option<Event> {
        self.event_log.lock().await.last().cloned()
    }

    /// Timeout for peer traffic: the election delay, never below the floor.
    async fn peer_timeout(&self) -> Duration {
        let floor = Duration::from_millis(self.config.min_peer_timeout_ms);
        self.delay().await.max(floor)
    }

    // =========================================================================
    // Election
    // =========================================================================

    async fn run_election_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.restart_election.notified() => {
                    tracing::trace!(node = %self.id, "Election loop restarted");
                }
                _ = self.election_iteration() => {}
            }
        }
        tracing::debug!(node = %self.id, "Election loop stopped");
    }

    async fn election_iteration(&self) {
        tokio::time::sleep(self.delay().await).await;
        self.election_round().await;
    }

    /// Ping every peer with our version vector. If all accept, become master.
    async fn election_round(&self) -> bool {
        let _barrier = self.emit_barrier.lock().await;
        let epoch = self.state.read().await.epoch();
        let versions = self.versions().await;

        let ping = Ping {
            versions,
            host: self.config.listen_addr.host.clone(),
            port: self.config.listen_addr.port,
        };
        let frame = match Message::new(self.id.clone(), Payload::Ping(ping)).encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(node = %self.id, error = %e, "Cannot encode PING");
                return false;
            }
        };

        let limit = self.peer_timeout().await;
        for peer in &self.config.peers {
            match client::request_token(peer, &frame, limit).await {
                Ok(token) if token.as_slice() == TOKEN_OK => {}
                Ok(_) => {
                    tracing::debug!(node = %self.id, peer = %peer, "PING rejected");
                    return false;
                }
                Err(e) if self.config.tolerate_unreachable_peers && e.is_transient() => {
                    tracing::trace!(node = %self.id, peer = %peer, error = %e, "Skipping unreachable peer");
                }
                Err(e) => {
                    tracing::debug!(node = %self.id, peer = %peer, error = %e, "PING failed");
                    return false;
                }
            }
        }

        if self.state.write().await.complete_round(epoch) {
            tracing::info!(node = %self.id, "Became master");
        }
        true
    }

    /// Ask peers in order whether they are master.
    async fn find_master(&self) -> Option<(NodeAddr, NodeInfo)> {
        let frame = match Message::new(self.id.clone(), Payload::NodeInfo).encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(node = %self.id, error = %e, "Cannot encode NODE_INFO");
                return None;
            }
        };

        for peer in &self.config.peers {
            match client::request_message(peer, &frame, self.config.discovery_timeout()).await {
                Ok(Message {
                    payload: Payload::NodeInfoResponse(info),
                    ..
                }) => {
                    if info.is_master {
                        return Some((peer.clone(), info));
                    }
                }
                Ok(other) => {
                    tracing::debug!(peer = %peer, kind = %other.kind(), "Unexpected discovery reply");
                }
                Err(e) => {
                    tracing::trace!(peer = %peer, error = %e, "Discovery skipped peer");
                }
            }
        }
        None
    }

    /// Ask `master` to stream its log to us.
    async fn sync_with(&self, master: NodeAddr) {
        let sync = SyncRequest {
            host: self.config.listen_addr.host.clone(),
            port: self.config.listen_addr.port,
        };
        let ok = match Message::new(self.id.clone(), Payload::Sync(sync)).encode() {
            Ok(frame) => {
                match client::request_token(&master, &frame, self.config.discovery_timeout()).await
                {
                    Ok(token) => token.as_slice() == TOKEN_OK,
                    Err(e) => {
                        tracing::debug!(node = %self.id, master = %master, error = %e, "SYNC failed");
                        false
                    }
                }
            }
            Err(e) => {
                tracing::warn!(node = %self.id, error = %e, "Cannot encode SYNC");
                false
            }
        };

        if ok {
            tracing::info!(node = %self.id, master = %master, "Sync requested");
        }
        self.state.write().await.finish_sync(ok);
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Record `event` unless it is already logged. Replayed events (a SYNC
    /// stream to a node that already holds part of the log) are skipped here;
    /// redelivery of an origin's latest event is caught by the log itself.
    async fn store_event(&self, origin: &str, event: &Event) -> Result<bool> {
        let mut log = self.event_log.clone().lock_owned().await;
        if log.contains(event) {
            return Ok(false);
        }
        let origin = origin.to_string();
        let event = event.clone();
        tokio::task::spawn_blocking(move || log.append(&origin, event)).await?
    }

    /// Master path: append, fan out to every peer, then run callbacks.
    async fn replicate(&self, origin: &str, event: Event, frame: &[u8]) -> Result<bool> {
        if !self.store_event(origin, &event).await? {
            tracing::trace!(node = %self.id, origin, "Duplicate event ignored");
            return Ok(false);
        }

        let limit = self.peer_timeout().await;
        for peer in &self.config.peers {
            send_or_skip(peer, frame, limit).await;
        }

        self.subscribers.dispatch(&event).await;
        Ok(true)
    }

    /// Follower path: append, then run callbacks.
    async fn accept(&self, origin: &str, event: Event) -> Result<bool> {
        if !self.store_event(origin, &event).await? {
            tracing::trace!(node = %self.id, origin, "Duplicate event ignored");
            return Ok(false);
        }
        self.subscribers.dispatch(&event).await;
        Ok(true)
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) {
        let message = match timeout(
            self.config.inbound_read_timeout(),
            read_message(&mut stream),
        )
        .await
        {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                tracing::warn!(node = %self.id, remote = %remote, error = %e, "Dropping malformed message");
                return;
            }
            Err(_) => {
                tracing::debug!(node = %self.id, remote = %remote, "Timed out reading message");
                return;
            }
        };

        let Message { node_id, payload } = message;
        let result = match payload {
            Payload::Ping(ping) => self.on_ping(ping, &mut stream).await,
            Payload::Event(event) => self.on_event(&node_id, event).await,
            Payload::Sync(sync) => self.on_sync(sync, &mut stream).await,
            Payload::NodeInfo => self.on_node_info(&mut stream).await,
            Payload::NodeInfoResponse(_) => {
                tracing::debug!(node = %self.id, sender = %node_id, "Ignoring unsolicited NODE_INFO_RESPONSE");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::debug!(node = %self.id, sender = %node_id, error = %e, "Inbound message failed");
        }
    }

    async fn on_ping(self: &Arc<Self>, ping: Ping, stream: &mut TcpStream) -> Result<()> {
        // stop any round in flight; the epoch bump below keeps it from
        // promoting us if it already passed its last suspension point
        self.restart_election.notify_one();

        let ours = self.versions().await;
        let outcome = handle_ping(&mut *self.state.write().await, &ours, &ping);
        let token = match outcome {
            PingOutcome::Accepted { .. } => TOKEN_OK,
            PingOutcome::Rejected => TOKEN_FAILED,
        };
        let written = stream.write_all(token).await;

        if outcome == (PingOutcome::Accepted { start_sync: true }) {
            let node = self.clone();
            let master = NodeAddr::new(ping.host, ping.port);
            tokio::spawn(async move { node.sync_with(master).await });
        }

        self.restart_election.notify_one();
        written.map_err(Into::into)
    }

    async fn on_event(&self, sender: &str, event: Event) -> Result<()> {
        if self.is_master().await {
            let frame = Message::new(self.id.clone(), Payload::Event(event.clone())).encode()?;
            self.replicate(sender, event, &frame).await?;
        } else {
            self.accept(sender, event).await?;
        }
        Ok(())
    }

    async fn on_sync(self: &Arc<Self>, sync: SyncRequest, stream: &mut TcpStream) -> Result<()> {
        stream.write_all(TOKEN_OK).await?;

        let target = NodeAddr::new(sync.host, sync.port);
        let node = self.clone();
        tokio::spawn(async move { node.stream_log(target).await });
        Ok(())
    }

    async fn on_node_info(&self, stream: &mut TcpStream) -> Result<()> {
        let info = NodeInfo {
            is_master: self.is_master().await,
            delay: self.delay().await.as_secs_f64(),
        };
        let frame = Message::new(self.id.clone(), Payload::NodeInfoResponse(info)).encode()?;
        stream.write_all(&frame).await?;
        Ok(())
    }

    /// Replay our whole log to `target`, one EVENT per connection.
    async fn stream_log(&self, target: NodeAddr) {
        let events = self.events().await;
        let limit = self.peer_timeout().await;
        tracing::info!(node = %self.id, target = %target, events = events.len(), "Streaming log");

        for event in events {
            let frame = match Message::new(self.id.clone(), Payload::Event(event)).encode() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(node = %self.id, error = %e, "Cannot encode logged event");
                    continue;
                }
            };
            if !send_or_skip(&target, &frame, limit).await {
                tracing::debug!(node = %self.id, target = %target, "Sync target unreachable, abandoning");
                return;
            }
        }
    }
}
