//! End to end behavior of Dht nodes over an in-process testnet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use ipfs_dht::common::content::RAW;
use ipfs_dht::common::messages::{Message, MessageType};
use ipfs_dht::swarm::{
    read_message, write_message, BoxStream, ProtocolHandler, SwarmEvent, DHT_PROTOCOL,
};
use ipfs_dht::testnet::{MemorySwarm, Testnet};
use ipfs_dht::{Bytes, Cid, ContentId, Dht, DhtEvent, Error, Peer, PeerId, Swarm};

/// Accepts streams and never answers.
struct Blackhole;

#[async_trait]
impl ProtocolHandler for Blackhole {
    async fn handle(&self, _from: Peer, _stream: BoxStream) -> ipfs_dht::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// A [MemorySwarm] whose first dials fail, and whose later dials never complete.
#[derive(Debug)]
struct StallingSwarm {
    inner: Arc<MemorySwarm>,
    failing_dials: usize,
    dials: AtomicUsize,
}

impl StallingSwarm {
    fn new(failing_dials: usize) -> Arc<StallingSwarm> {
        Arc::new(StallingSwarm {
            inner: MemorySwarm::new(),
            failing_dials,
            dials: AtomicUsize::new(0),
        })
    }

    fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Swarm for StallingSwarm {
    fn local_peer(&self) -> Peer {
        self.inner.local_peer()
    }

    fn known_peers(&self) -> Vec<Peer> {
        self.inner.known_peers()
    }

    fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.inner.peer(id)
    }

    fn register_peer(&self, peer: Peer) -> Peer {
        self.inner.register_peer(peer)
    }

    fn deregister_peer(&self, id: &PeerId) -> Option<Peer> {
        self.inner.deregister_peer(id)
    }

    fn subscribe(&self) -> flume::Receiver<SwarmEvent> {
        self.inner.subscribe()
    }

    fn add_protocol(&self, protocol: &str, handler: Arc<dyn ProtocolHandler>) {
        self.inner.add_protocol(protocol, handler)
    }

    fn remove_protocol(&self, protocol: &str) {
        self.inner.remove_protocol(protocol)
    }

    async fn dial(&self, peer: &Peer, _protocol: &str) -> ipfs_dht::Result<BoxStream> {
        if self.dials.fetch_add(1, Ordering::Relaxed) < self.failing_dials {
            return Err(Error::Unreachable(peer.id.to_string()));
        }

        std::future::pending().await
    }
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn find_peer_across_the_network() {
    let testnet = Testnet::new(20).await.unwrap();
    let cancel = CancellationToken::new();

    let target = testnet.swarms[17].local_peer();
    assert!(testnet.swarms[5].peer(&target.id).is_none());

    let found = testnet.nodes[5]
        .find_peer(&target.id, &cancel)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(found.id, target.id);
    assert_eq!(found.addresses, target.addresses);
    assert!(testnet.swarms[5].dial_count() > 0);

    // Now known locally, no more round trips.
    let dials = testnet.dial_count();
    testnet.nodes[5]
        .find_peer(&target.id, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(testnet.dial_count(), dials);
}

#[tokio::test]
async fn find_unknown_peer() {
    let testnet = Testnet::new(10).await.unwrap();

    let found = tokio::time::timeout(
        Duration::from_secs(5),
        testnet.nodes[3].find_peer(&PeerId::random(), &CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(found.is_none());
}

#[tokio::test]
async fn find_peer_without_any_peer() {
    let testnet = Testnet::new(1).await.unwrap();

    let found = testnet.nodes[0]
        .find_peer(&PeerId::random(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(found.is_none());
    assert_eq!(testnet.dial_count(), 0);
}

#[tokio::test]
async fn provide_and_find_providers() {
    let testnet = Testnet::new(20).await.unwrap();
    let cancel = CancellationToken::new();

    let cid = Cid::from_content(RAW, b"a block of data");
    let provider = testnet.swarms[7].local_peer();

    testnet.nodes[7].provide(&cid, true, &cancel).await.unwrap();

    let nodes = testnet.nodes.clone();
    let cid_clone = cid.clone();
    eventually(move || {
        nodes
            .iter()
            .filter(|node| !node.local_providers(&cid_clone).is_empty())
            .count()
            == 20
    })
    .await;

    let found = Arc::new(AtomicUsize::new(0));
    let counter = found.clone();

    let providers = testnet.nodes[12]
        .find_providers_with(&cid, 1, &cancel, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .await
        .unwrap();

    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].id, provider.id);
    assert!(providers[0].has_addresses());
    assert_eq!(found.load(Ordering::Relaxed), 1);

    // The provider is now dialable from the finder.
    assert!(testnet.swarms[12].peer(&provider.id).is_some());
}

#[tokio::test]
async fn find_all_providers() {
    let testnet = Testnet::new(10).await.unwrap();
    let cancel = CancellationToken::new();

    let cid = Cid::from_content(RAW, b"popular");

    for i in [2, 8] {
        testnet.nodes[i].provide(&cid, true, &cancel).await.unwrap();
    }

    let nodes = testnet.nodes.clone();
    let cid_clone = cid.clone();
    eventually(move || nodes[4].local_providers(&cid_clone).len() == 2).await;

    let mut providers: Vec<PeerId> = testnet.nodes[4]
        .find_providers(&cid, 0, &cancel)
        .await
        .unwrap()
        .into_iter()
        .map(|peer| peer.id)
        .collect();
    providers.sort();

    let mut expected = vec![
        testnet.swarms[2].local_peer().id,
        testnet.swarms[8].local_peer().id,
    ];
    expected.sort();

    assert_eq!(providers, expected);
}

#[tokio::test]
async fn find_providers_of_unknown_content() {
    let testnet = Testnet::new(10).await.unwrap();

    let providers = testnet.nodes[1]
        .find_providers(
            &Cid::from_content(RAW, b"nobody"),
            5,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(providers.is_empty());
}

#[tokio::test]
async fn provide_without_advertising() {
    let testnet = Testnet::new(5).await.unwrap();
    let cid = Cid::from_content(RAW, b"private");

    testnet.nodes[2]
        .provide(&cid, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(testnet.dial_count(), 0);
    for (i, node) in testnet.nodes.iter().enumerate() {
        assert_eq!(node.local_providers(&cid).is_empty(), i != 2);
    }
}

#[tokio::test]
async fn stop_cancels_queries_in_flight() {
    let testnet = Testnet::with_builder(
        3,
        Dht::builder().request_timeout(Duration::from_secs(3600)),
    )
    .await
    .unwrap();

    for swarm in &testnet.swarms[1..] {
        swarm.add_protocol(DHT_PROTOCOL, Arc::new(Blackhole));
    }

    let dht = testnet.nodes[0].clone();
    let events = dht.events();

    let query = tokio::spawn({
        let dht = dht.clone();
        async move {
            dht.find_peer(&PeerId::random(), &CancellationToken::new())
                .await
        }
    });

    eventually({
        let dht = dht.clone();
        move || dht.info().running_queries() == 1
    })
    .await;

    dht.stop().await;

    let found = tokio::time::timeout(Duration::from_secs(1), query)
        .await
        .expect("query should end shortly after stop")
        .unwrap()
        .unwrap();

    assert!(found.is_none());
    assert_eq!(events.drain().collect::<Vec<_>>(), vec![DhtEvent::Stopped]);
    assert_eq!(dht.info().running_queries(), 0);

    assert!(matches!(
        dht.find_peer(&PeerId::random(), &CancellationToken::new())
            .await,
        Err(Error::NotStarted)
    ));
}

#[tokio::test]
async fn stop_abandons_provider_advertisement() {
    // The lookup fails on all three known peers, advertising then stalls.
    let swarm = StallingSwarm::new(3);
    for _ in 0..3 {
        swarm.register_peer(Peer::new(PeerId::random()));
    }

    let dht = Dht::builder()
        .request_timeout(Duration::from_secs(3600))
        .build(swarm.clone());
    dht.start().await.unwrap();

    let provide = tokio::spawn({
        let dht = dht.clone();
        async move {
            dht.provide(
                &Cid::from_content(RAW, b"advertised"),
                true,
                &CancellationToken::new(),
            )
            .await
        }
    });

    eventually({
        let swarm = swarm.clone();
        move || swarm.dial_count() == 6
    })
    .await;

    dht.stop().await;

    tokio::time::timeout(Duration::from_secs(2), provide)
        .await
        .expect("provide should end shortly after stop")
        .unwrap()
        .unwrap();

    assert_eq!(swarm.dial_count(), 6);
}

#[tokio::test]
async fn caller_cancellation() {
    let testnet = Testnet::with_builder(
        3,
        Dht::builder().request_timeout(Duration::from_secs(3600)),
    )
    .await
    .unwrap();

    for swarm in &testnet.swarms[1..] {
        swarm.add_protocol(DHT_PROTOCOL, Arc::new(Blackhole));
    }

    let dht = testnet.nodes[0].clone();
    let cancel = CancellationToken::new();

    let query = tokio::spawn({
        let dht = dht.clone();
        let cancel = cancel.clone();
        async move {
            dht.find_providers(&Cid::from_content(RAW, b"x"), 1, &cancel)
                .await
        }
    });

    eventually({
        let dht = dht.clone();
        move || dht.info().running_queries() == 1
    })
    .await;

    cancel.cancel();

    let providers = tokio::time::timeout(Duration::from_secs(1), query)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(providers.is_empty());
    assert!(dht.info().started());
}

#[tokio::test]
async fn restart() {
    let testnet = Testnet::new(5).await.unwrap();
    let dht = &testnet.nodes[4];

    dht.stop().await;
    dht.start().await.unwrap();

    let target = testnet.swarms[1].local_peer().id;
    let found = dht
        .find_peer(&target, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(found.map(|peer| peer.id), Some(target));
}

#[tokio::test]
async fn wire_find_node_with_malformed_keys() {
    let testnet = Testnet::with_builder(8, Dht::builder().closer_peer_count(3))
        .await
        .unwrap();

    let server = testnet.swarms[0].local_peer();
    let client = &testnet.swarms[1];

    for key in [
        Bytes::new(),
        Bytes::from_static(&[7]),
        Bytes::from(vec![0xaa; 512]),
    ] {
        let mut stream = client.dial(&server, DHT_PROTOCOL).await.unwrap();

        write_message(&mut stream, &Message::new(MessageType::FindNode, key))
            .await
            .unwrap();
        let response = read_message(&mut stream).await.unwrap();

        assert_eq!(response.message_type, MessageType::FindNode);
        assert_eq!(response.closer_peers.len(), 3);
    }
}

#[tokio::test]
async fn wire_unknown_message_type() {
    let testnet = Testnet::new(2).await.unwrap();

    let server = testnet.swarms[0].local_peer();
    let mut stream = testnet.swarms[1]
        .dial(&server, DHT_PROTOCOL)
        .await
        .unwrap();

    let request = b"d1:q9:put_valuee";
    stream.write_u32(request.len() as u32).await.unwrap();
    stream.write_all(request).await.unwrap();

    assert!(read_message(&mut stream).await.is_err());

    // The node keeps serving.
    let rtt = testnet.nodes[1].ping(&server).await;
    assert!(rtt.is_ok());
}
