//! Dht node.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::common::messages::{Message, MessageType, PeerInfo};
use crate::common::{Cid, ContentId, Peer, PeerId};
use crate::query::DistributedQuery;
use crate::server::{Server, StreamHandler};
use crate::swarm::{read_message, write_message, Swarm, SwarmEvent, DHT_PROTOCOL};
use crate::{Config, DhtBuilder, Error, Result};

#[derive(Debug, Clone)]
/// A DHT node running on top of a [Swarm].
///
/// Cheap to clone, all clones share the same node. The node does nothing
/// until [Dht::start] is called, and cancels everything it runs on [Dht::stop].
pub struct Dht(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    config: Config,
    server: Arc<Server>,
    state: Mutex<State>,
    subscribers: Mutex<Vec<flume::Sender<DhtEvent>>>,
    running_queries: AtomicUsize,
}

#[derive(Debug)]
enum State {
    Stopped,
    Started(Running),
}

#[derive(Debug)]
struct Running {
    /// Parent of every query token.
    token: CancellationToken,
    started_at: Instant,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle notifications, see [Dht::events].
pub enum DhtEvent {
    Started,
    Stopped,
}

impl Dht {
    /// Create a stopped node with the given [Config].
    pub fn new(swarm: Arc<dyn Swarm>, config: Config) -> Self {
        let server = Arc::new(Server::new(swarm, &config));

        Dht(Arc::new(Inner {
            config,
            server,
            state: Mutex::new(State::Stopped),
            subscribers: Mutex::new(Vec::new()),
            running_queries: AtomicUsize::new(0),
        }))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Info {
        let server = &self.0.server;

        let uptime = match &*self.0.state.lock() {
            State::Started(running) => Some(running.started_at.elapsed()),
            State::Stopped => None,
        };

        Info {
            id: server.local_id(),
            routing_table_size: server.routing_table().read().size(),
            provider_records: server.providers().live_len(),
            running_queries: self.0.running_queries.load(Ordering::Relaxed),
            uptime,
        }
    }

    /// The [Config] this node was built with.
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Peers in the routing table, in no particular order.
    pub fn routing_table_peers(&self) -> Vec<Peer> {
        self.0.server.routing_table().read().to_owned_peers()
    }

    /// Peers providing `cid` according to local provider records.
    pub fn local_providers(&self, cid: &Cid) -> Vec<PeerId> {
        self.0.server.providers().get(cid)
    }

    /// Subscribe to [DhtEvent]s, dropping the receiver unsubscribes.
    pub fn events(&self) -> flume::Receiver<DhtEvent> {
        let (sender, receiver) = flume::unbounded();
        self.0.subscribers.lock().push(sender);

        receiver
    }

    // === Lifecycle ===

    /// Start serving DHT requests and tracking the swarm's peers.
    ///
    /// Seeds the routing table with every peer the swarm knows. Starting a
    /// started node does nothing.
    pub async fn start(&self) -> Result<()> {
        let server = &self.0.server;
        let swarm = server.swarm();

        {
            let mut state = self.0.state.lock();

            if matches!(*state, State::Started(_)) {
                return Ok(());
            }

            let token = CancellationToken::new();

            // Subscribe before seeding, so no peer is missed in between.
            let events = swarm.subscribe();

            {
                let mut routing_table = server.routing_table().write();
                for peer in swarm.known_peers() {
                    routing_table.add(peer);
                }
            }

            let tasks = vec![
                tokio::spawn(mirror_swarm_events(
                    Arc::downgrade(server),
                    events,
                    token.clone(),
                )),
                tokio::spawn(purge_expired_providers(
                    Arc::downgrade(server),
                    self.0.config.maintenance_interval,
                    token.clone(),
                )),
            ];

            swarm.add_protocol(
                DHT_PROTOCOL,
                Arc::new(StreamHandler(Arc::downgrade(server))),
            );

            *state = State::Started(Running {
                token,
                started_at: Instant::now(),
                tasks,
            });
        }

        info!(
            id = %server.local_id(),
            routing_table_size = server.routing_table().read().size(),
            "Dht started"
        );

        self.emit(DhtEvent::Started);

        Ok(())
    }

    /// Stop the node, cancelling every query it is running.
    ///
    /// Stopping a stopped node does nothing.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.0.state.lock(), State::Stopped);

        let State::Started(running) = previous else {
            return;
        };

        running.shutdown();
        self.0.server.swarm().remove_protocol(DHT_PROTOCOL);

        info!(id = %self.0.server.local_id(), "Dht stopped");

        self.emit(DhtEvent::Stopped);
    }

    // === Public Methods ===

    /// Find a peer by its id.
    ///
    /// Returns immediately if the peer is the local peer, or is already known
    /// with addresses. Otherwise asks the network, and returns `None` if no
    /// peer knows it.
    pub async fn find_peer(&self, id: &PeerId, cancel: &CancellationToken) -> Result<Option<Peer>> {
        self.ensure_started()?;

        let server = Arc::clone(&self.0.server);
        let swarm = server.swarm();

        if id == &server.local_id() {
            return Ok(Some(swarm.local_peer()));
        }
        if let Some(peer) = swarm.peer(id).filter(Peer::has_addresses) {
            return Ok(Some(peer));
        }

        let target = id.clone();
        let query = DistributedQuery::new(
            self,
            MessageType::FindNode,
            id.to_bytes(),
            1,
            move |_, response| {
                response
                    .closer_peers
                    .iter()
                    .filter(|info| info.id == target)
                    .map(|info| server.swarm().register_peer(Peer::from(info.clone())))
                    .collect()
            },
        )?;

        query.run(cancel).await;

        Ok(query.answers().into_iter().next())
    }

    /// Find up to `limit` peers providing `cid`, zero meaning as many as can be found.
    pub async fn find_providers(
        &self,
        cid: &Cid,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>> {
        self.find_providers_with(cid, limit, cancel, |_| {}).await
    }

    /// Same as [Dht::find_providers], calling `on_provider` with each new
    /// provider as soon as it is found.
    ///
    /// Local provider records are used first, then the network is asked.
    pub async fn find_providers_with<F>(
        &self,
        cid: &Cid,
        limit: usize,
        cancel: &CancellationToken,
        on_provider: F,
    ) -> Result<Vec<Peer>>
    where
        F: Fn(&Peer) + Send + Sync + 'static,
    {
        self.ensure_started()?;

        let server = Arc::clone(&self.0.server);

        let query = DistributedQuery::new(
            self,
            MessageType::GetProviders,
            cid.key(),
            limit,
            move |_, response| {
                response
                    .provider_peers
                    .iter()
                    .map(|info| server.swarm().register_peer(Peer::from(info.clone())))
                    .collect()
            },
        )?
        .on_answer(on_provider);

        for id in self.0.server.providers().get(cid) {
            let peer = self
                .0
                .server
                .resolve(&id)
                .unwrap_or_else(|| Peer::new(id));

            query.add_answer(peer);
        }

        query.run(cancel).await;

        Ok(query.answers())
    }

    /// Record the local peer as a provider of `cid`.
    ///
    /// If `advertise` is `true`, also find the peers closest to `cid` and
    /// send each of them an AddProvider message. Either `cancel` or
    /// [Dht::stop] abandons the AddProvider messages not sent yet.
    pub async fn provide(&self, cid: &Cid, advertise: bool, cancel: &CancellationToken) -> Result<()> {
        let lifetime = self.lifetime_token().ok_or(Error::NotStarted)?;

        let server = &self.0.server;
        let local = server.swarm().local_peer();

        server.providers().add(cid, local.id.clone());

        if !advertise {
            return Ok(());
        }

        let query =
            DistributedQuery::<Peer>::new(self, MessageType::FindNode, cid.key(), 0, |_, _| {
                vec![]
            })?;

        query.run(cancel).await;

        if cancel.is_cancelled() || lifetime.is_cancelled() {
            return Ok(());
        }

        let count = self.0.config.query_peer_count;
        let mut targets = query.closest_responders(count);
        if targets.is_empty() {
            targets = server.closest_peers(&cid.key(), count);
        }

        debug!(?cid, targets = targets.len(), "Advertising provider record");

        let message = Message::new(MessageType::AddProvider, cid.key())
            .with_provider_peers(vec![PeerInfo::from(&local)]);
        let request_timeout = self.0.config.request_timeout;

        let mut requests = JoinSet::new();
        for peer in targets {
            let dht = self.clone();
            let message = message.clone();

            requests.spawn(async move {
                let result =
                    tokio::time::timeout(request_timeout, dht.send_request(&peer, &message)).await;

                (peer, result)
            });
        }

        let drain = async {
            while let Some(joined) = requests.join_next().await {
                match joined {
                    Ok((peer, Ok(Err(error)))) => {
                        debug!(?peer, ?error, "AddProvider failed");
                    }
                    Ok((peer, Err(_))) => {
                        debug!(?peer, "AddProvider timed out");
                    }
                    _ => {}
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = lifetime.cancelled() => {}
            _ = drain => {}
        }

        Ok(())
    }

    /// Send a ping to `peer` and return the round trip time.
    ///
    /// Fails with [Error::NotStarted] if the node stops before the response.
    pub async fn ping(&self, peer: &Peer) -> Result<Duration> {
        let lifetime = self.lifetime_token().ok_or(Error::NotStarted)?;

        let started_at = Instant::now();
        let request = Message::new(MessageType::Ping, Bytes::new());

        let response = tokio::select! {
            _ = lifetime.cancelled() => return Err(Error::NotStarted),
            response = tokio::time::timeout(
                self.0.config.request_timeout,
                self.send_request(peer, &request),
            ) => response,
        };

        response
            .map_err(|_| Error::Timeout)??
            .ok_or(Error::UnexpectedResponse("missing ping response"))?;

        Ok(started_at.elapsed())
    }

    // === Crate Methods ===

    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.0.server
    }

    /// Child token of the lifetime token, `None` if stopped.
    pub(crate) fn lifetime_token(&self) -> Option<CancellationToken> {
        match &*self.0.state.lock() {
            State::Started(running) => Some(running.token.child_token()),
            State::Stopped => None,
        }
    }

    /// Count a query as running until the returned guard is dropped.
    pub(crate) fn track_query(&self) -> QueryGuard<'_> {
        self.0.running_queries.fetch_add(1, Ordering::Relaxed);

        QueryGuard(&self.0.running_queries)
    }

    /// Send a request to `peer` on a new stream, and wait for its response
    /// unless the request is one way.
    pub(crate) async fn send_request(
        &self,
        peer: &Peer,
        request: &Message,
    ) -> Result<Option<Message>> {
        trace!(?peer, message_type = ?request.message_type, "Sending request");

        let mut stream = self.0.server.swarm().dial(peer, DHT_PROTOCOL).await?;

        write_message(&mut stream, request).await?;

        if !request.message_type.expects_response() {
            return Ok(None);
        }

        let response = read_message(&mut stream).await?;

        if response.message_type != request.message_type {
            return Err(Error::UnexpectedResponse("response type doesn't match the request"));
        }

        Ok(Some(response))
    }

    // === Private Methods ===

    fn is_started(&self) -> bool {
        matches!(*self.0.state.lock(), State::Started(_))
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    fn emit(&self, event: DhtEvent) {
        self.0
            .subscribers
            .lock()
            .retain(|sender| sender.send(event).is_ok());
    }
}

impl Running {
    fn shutdown(self) {
        self.token.cancel();

        for task in self.tasks {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let previous = std::mem::replace(self.state.get_mut(), State::Stopped);

        if let State::Started(running) = previous {
            running.shutdown();
            self.server.swarm().remove_protocol(DHT_PROTOCOL);
        }
    }
}

pub(crate) struct QueryGuard<'a>(&'a AtomicUsize);

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Mirror the swarm's peer registry into the routing table, until cancelled.
async fn mirror_swarm_events(
    server: Weak<Server>,
    events: flume::Receiver<SwarmEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        let Some(server) = server.upgrade() else {
            break;
        };

        let mut routing_table = server.routing_table().write();

        match event {
            SwarmEvent::PeerDiscovered(peer) => {
                trace!(?peer, "Peer discovered");
                routing_table.add(peer);
            }
            SwarmEvent::PeerRemoved(peer) => {
                trace!(?peer, "Peer removed");
                routing_table.remove(&peer.id);
            }
        }
    }
}

async fn purge_expired_providers(server: Weak<Server>, period: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(server) = server.upgrade() else {
            break;
        };

        let purged = server.providers().purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired provider records");
        }
    }
}

/// Information and statistics about a [Dht] node.
#[derive(Debug, Clone)]
pub struct Info {
    id: PeerId,
    routing_table_size: usize,
    provider_records: usize,
    running_queries: usize,
    uptime: Option<Duration>,
}

impl Info {
    /// This node's [PeerId]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Number of peers in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }

    /// Number of provider records that haven't expired.
    pub fn provider_records(&self) -> usize {
        self.provider_records
    }

    /// Number of queries currently running.
    pub fn running_queries(&self) -> usize {
        self.running_queries
    }

    /// Returns `true` if the node is started.
    pub fn started(&self) -> bool {
        self.uptime.is_some()
    }

    /// Time since the node was started, `None` if stopped.
    pub fn uptime(&self) -> Option<Duration> {
        self.uptime
    }
}
