//! Concurrent iterative queries toward a target key.

use std::collections::HashSet;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::common::messages::{Message, MessageType};
use crate::common::{ClosestPeers, Peer, PeerId};
use crate::{Dht, Error, Result};

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Process unique id of a [DistributedQuery], for log correlation.
pub struct QueryId(u64);

impl QueryId {
    fn next() -> QueryId {
        QueryId(NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A result a [DistributedQuery] collects, deduplicated by peer id.
pub trait Answer: Clone + Send + Sync + 'static {
    fn peer_id(&self) -> &PeerId;
}

impl Answer for Peer {
    fn peer_id(&self) -> &PeerId {
        &self.id
    }
}

type Process<T> = Box<dyn Fn(&Peer, &Message) -> Vec<T> + Send + Sync>;
type OnAnswer<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Answers<T> {
    ids: HashSet<PeerId>,
    items: Vec<T>,
}

/// Asks successively closer peers about a key until enough answers are
/// found, no closer unvisited peer remains, or the query is cancelled.
///
/// Every peer that answers is asked for closer peers, which are merged into
/// the routing table and into the candidates of this query. Failing peers
/// only yield nothing.
pub struct DistributedQuery<T: Answer> {
    id: QueryId,
    dht: Dht,
    message_type: MessageType,
    key: Bytes,
    /// Zero collects every answer found.
    wanted: usize,
    concurrency: usize,
    /// Child of the [Dht] lifetime token.
    token: CancellationToken,
    answers: Mutex<Answers<T>>,
    visited: Mutex<HashSet<PeerId>>,
    responders: Mutex<ClosestPeers>,
    process: Process<T>,
    on_answer: Option<OnAnswer<T>>,
}

impl<T: Answer> DistributedQuery<T> {
    /// Create a query sending `message_type` requests for `key`.
    ///
    /// `process` extracts answers from each response. Fails with
    /// [Error::NotStarted] if the dht isn't running.
    pub fn new<F>(
        dht: &Dht,
        message_type: MessageType,
        key: Bytes,
        wanted: usize,
        process: F,
    ) -> Result<Self>
    where
        F: Fn(&Peer, &Message) -> Vec<T> + Send + Sync + 'static,
    {
        let token = dht.lifetime_token().ok_or(Error::NotStarted)?;

        Ok(Self {
            id: QueryId::next(),
            dht: dht.clone(),
            message_type,
            responders: Mutex::new(ClosestPeers::new(key.clone())),
            key,
            wanted,
            concurrency: dht.config().concurrency.max(1),
            token,
            answers: Mutex::new(Answers {
                ids: HashSet::new(),
                items: Vec::new(),
            }),
            visited: Mutex::new(HashSet::new()),
            process: Box::new(process),
            on_answer: None,
        })
    }

    /// Call `callback` with every new answer as soon as it is accepted.
    pub fn on_answer<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_answer = Some(Box::new(callback));
        self
    }

    // === Getters ===

    /// Unique id of this query, shown in its logs.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Target key the query walks toward.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Answers wanted before the query stops, `0` for as many as possible.
    pub fn wanted(&self) -> usize {
        self.wanted
    }

    /// Snapshot of the answers accepted so far, in the order they were found.
    pub fn answers(&self) -> Vec<T> {
        self.answers.lock().items.clone()
    }

    /// Number of answers accepted so far.
    pub fn answer_count(&self) -> usize {
        self.answers.lock().items.len()
    }

    /// Returns `true` once [Self::wanted] answers are collected.
    pub fn is_satisfied(&self) -> bool {
        self.wanted > 0 && self.answer_count() >= self.wanted
    }

    /// Number of peers a request was sent to.
    pub fn visited_count(&self) -> usize {
        self.visited.lock().len()
    }

    /// Up to `count` of the peers that responded, closest to the key first.
    pub fn closest_responders(&self, count: usize) -> Vec<Peer> {
        self.responders.lock().take(count)
    }

    // === Public Methods ===

    /// Accept an answer, returns `false` for duplicates or once satisfied.
    pub fn add_answer(&self, answer: T) -> bool {
        {
            let mut answers = self.answers.lock();

            if self.wanted > 0 && answers.items.len() >= self.wanted {
                return false;
            }
            if !answers.ids.insert(answer.peer_id().clone()) {
                return false;
            }

            answers.items.push(answer.clone());
        }

        trace!(query_id = %self.id, peer = ?answer.peer_id(), "Query answer");

        if let Some(on_answer) = &self.on_answer {
            on_answer(&answer);
        }

        true
    }

    /// Drive the query until it is satisfied, exhausted, or cancelled by
    /// either `cancel` or the [Dht] stopping.
    ///
    /// Cancellation abandons requests in flight, the answers found so far
    /// remain available.
    pub async fn run(&self, cancel: &CancellationToken) {
        if cancel.is_cancelled() || self.token.is_cancelled() {
            return;
        }

        let _running = self.dht.track_query();

        let config = self.dht.config();
        let width = config.query_peer_count.max(1);
        let request_timeout = config.request_timeout;

        let mut candidates = ClosestPeers::new(self.key.clone());
        for peer in self.dht.server().closest_peers(&self.key, width) {
            candidates.add(peer);
        }

        debug!(
            query_id = %self.id,
            message_type = ?self.message_type,
            seeds = candidates.len(),
            "Starting query"
        );

        let mut in_flight = JoinSet::new();

        loop {
            if self.is_satisfied() {
                break;
            }

            while in_flight.len() < self.concurrency {
                let Some(peer) = self.next_candidate(&candidates, width) else {
                    break;
                };

                let dht = self.dht.clone();
                let request = Message::new(self.message_type, self.key.clone());

                in_flight.spawn(async move {
                    let response =
                        tokio::time::timeout(request_timeout, dht.send_request(&peer, &request))
                            .await
                            .map_err(|_| Error::Timeout)
                            .and_then(|response| response);

                    (peer, response)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.token.cancelled() => break,
                joined = in_flight.join_next() => joined,
            };

            match joined {
                Some(Ok((peer, Ok(Some(response))))) => {
                    self.handle_response(peer, &response, &mut candidates)
                }
                Some(Ok((peer, Ok(None)))) => {
                    debug!(query_id = %self.id, ?peer, "Empty response");
                }
                Some(Ok((peer, Err(error)))) => {
                    debug!(query_id = %self.id, ?peer, ?error, "Request failed");
                }
                Some(Err(error)) => {
                    debug!(query_id = %self.id, ?error, "Request task failed");
                }
                None => {}
            }
        }

        in_flight.abort_all();

        debug!(
            query_id = %self.id,
            answers = self.answer_count(),
            visited = self.visited_count(),
            cancelled = cancel.is_cancelled() || self.token.is_cancelled(),
            "Query done"
        );
    }

    // === Private Methods ===

    /// Pop the closest unvisited peer among the `width` closest candidates.
    fn next_candidate(&self, candidates: &ClosestPeers, width: usize) -> Option<Peer> {
        let mut visited = self.visited.lock();

        let peer = candidates
            .iter()
            .take(width)
            .find(|peer| !visited.contains(&peer.id))?
            .clone();

        visited.insert(peer.id.clone());

        Some(peer)
    }

    fn handle_response(&self, from: Peer, response: &Message, candidates: &mut ClosestPeers) {
        let server = self.dht.server();
        let local_id = server.local_id();

        trace!(
            query_id = %self.id,
            ?from,
            closer_peers = response.closer_peers.len(),
            provider_peers = response.provider_peers.len(),
            "Query response"
        );

        for info in &response.closer_peers {
            if info.id == local_id {
                continue;
            }

            let peer = server.swarm().register_peer(Peer::from(info.clone()));
            server.routing_table().write().add(peer.clone());

            if !self.visited.lock().contains(&peer.id) {
                candidates.add(peer);
            }
        }

        for answer in (self.process)(&from, response) {
            self.add_answer(answer);
        }

        self.responders.lock().add(from);
    }
}

impl<T: Answer> Debug for DistributedQuery<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedQuery")
            .field("id", &self.id)
            .field("message_type", &self.message_type)
            .field("key", &hex::encode(&self.key))
            .field("wanted", &self.wanted)
            .field("concurrency", &self.concurrency)
            .field("answers", &self.answer_count())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testnet::Testnet;
    use crate::Swarm;

    fn find_node(dht: &Dht, target: &PeerId) -> DistributedQuery<Peer> {
        let key = target.to_bytes();
        let target = target.clone();

        DistributedQuery::new(dht, MessageType::FindNode, key, 1, move |_, response| {
            response
                .closer_peers
                .iter()
                .filter(|info| info.id == target)
                .cloned()
                .map(Peer::from)
                .collect()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn pre_cancelled() {
        let testnet = Testnet::new(5).await.unwrap();

        let query = find_node(&testnet.nodes[0], &PeerId::random());

        let cancel = CancellationToken::new();
        cancel.cancel();

        query.run(&cancel).await;

        assert_eq!(query.answer_count(), 0);
        assert_eq!(query.visited_count(), 0);
        assert_eq!(testnet.dial_count(), 0);
    }

    #[tokio::test]
    async fn unique_ids() {
        let testnet = Testnet::new(1).await.unwrap();
        let dht = &testnet.nodes[0];

        let a = find_node(dht, &PeerId::random());
        let b = find_node(dht, &PeerId::random());

        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn not_started() {
        let testnet = Testnet::new(1).await.unwrap();
        let dht = &testnet.nodes[0];

        dht.stop().await;

        let result = DistributedQuery::<Peer>::new(
            dht,
            MessageType::FindNode,
            Bytes::new(),
            0,
            |_, _| vec![],
        );

        assert!(matches!(result, Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn finds_target() {
        let testnet = Testnet::new(10).await.unwrap();

        let target = testnet.swarms[9].local_peer().id;
        let query = find_node(&testnet.nodes[3], &target);

        query.run(&CancellationToken::new()).await;

        let answers = query.answers();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].id, target);
        assert!(!query.closest_responders(20).is_empty());
    }

    #[tokio::test]
    async fn exhausts_without_answers() {
        let testnet = Testnet::new(5).await.unwrap();

        let query = find_node(&testnet.nodes[0], &PeerId::random());
        query.run(&CancellationToken::new()).await;

        assert_eq!(query.answer_count(), 0);
        assert_eq!(query.visited_count(), 4);
    }

    #[tokio::test]
    async fn answers_are_deduplicated() {
        let testnet = Testnet::new(1).await.unwrap();

        let query = find_node(&testnet.nodes[0], &PeerId::random());
        let peer = Peer::new(PeerId::random());

        assert!(query.add_answer(peer.clone()));
        assert!(!query.add_answer(peer));
        assert!(query.is_satisfied());
        assert!(!query.add_answer(Peer::new(PeerId::random())));
    }

    #[tokio::test]
    async fn stop_cancels_running_query() {
        let testnet = Testnet::new(5).await.unwrap();
        let dht = testnet.nodes[0].clone();

        let query = find_node(&dht, &PeerId::random());
        dht.stop().await;

        query.run(&CancellationToken::new()).await;

        assert_eq!(query.visited_count(), 0);
    }
}
