//! Multi-peer election scenarios on a simulated clock

use async_trait::async_trait;
use herald_election::round::encode_candidates;
use herald_election::{
    BroadcastStore, ElectionConfig, ElectionError, EventName, MemoryBroadcast, Peer, PeerId, Role,
    StoreChange, StoreKeys,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing_subscriber::fmt::try_init;

const NAMESPACE: &str = "it";

fn config() -> ElectionConfig {
    ElectionConfig::default()
        .with_namespace(NAMESPACE)
        .with_heartbeat_ttl(Duration::from_millis(2000))
        .with_heartbeat_offset(Duration::from_millis(500))
        .with_heartbeat_jitter(Duration::ZERO)
        .with_election_time(Duration::from_millis(2000))
        .with_debug(false)
}

fn keys() -> StoreKeys {
    StoreKeys::new(NAMESPACE)
}

fn peer(hub: &MemoryBroadcast, id: u128) -> Peer {
    let mut peer = Peer::with_id(
        PeerId::from_u128(id),
        config(),
        Some(Arc::new(hub.connect())),
    );
    peer.start();
    peer
}

async fn at(origin: Instant, ms: u64) {
    sleep_until(origin + Duration::from_millis(ms)).await;
}

/// Watches the store from the outside, like any other peer would
struct Observer {
    rx: mpsc::UnboundedReceiver<StoreChange>,
}

impl Observer {
    async fn attach(hub: &MemoryBroadcast) -> Self {
        let rx = hub.connect().subscribe().await.unwrap();
        Self { rx }
    }

    fn drain(&mut self) -> Vec<StoreChange> {
        let mut changes = Vec::new();
        while let Ok(change) = self.rx.try_recv() {
            changes.push(change);
        }
        changes
    }
}

fn rounds_opened(changes: &[StoreChange]) -> usize {
    changes
        .iter()
        .filter(|c| c.key == keys().election && c.old_value.is_none() && c.new_value.is_some())
        .count()
}

fn writes_to(changes: &[StoreChange], key: &str) -> Vec<Value> {
    changes
        .iter()
        .filter(|c| c.key == key)
        .filter_map(|c| c.new_value.clone())
        .collect()
}

fn ids(values: &[u128]) -> Vec<PeerId> {
    values.iter().map(|v| PeerId::from_u128(*v)).collect()
}

/// Store that refuses every operation
struct UnreachableStore;

#[async_trait]
impl BroadcastStore for UnreachableStore {
    async fn get(&self, _key: &str) -> herald_election::Result<Option<Value>> {
        Err(ElectionError::StoreUnavailable)
    }

    async fn set(&self, _key: &str, _value: Value) -> herald_election::Result<()> {
        Err(ElectionError::StoreUnavailable)
    }

    async fn remove(&self, _key: &str) -> herald_election::Result<()> {
        Err(ElectionError::StoreUnavailable)
    }

    async fn subscribe(&self) -> herald_election::Result<mpsc::UnboundedReceiver<StoreChange>> {
        Err(ElectionError::StoreUnavailable)
    }
}

#[tokio::test(start_paused = true)]
async fn test_peer_without_store_is_master_immediately() {
    let _ = try_init();

    let won = Arc::new(Mutex::new(0));
    let mut peer = Peer::new(config(), None);
    let counter = won.clone();
    peer.on(EventName::WonElection, move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    })
    .await;
    peer.start();

    peer.wait_for_role(Role::Master, config().election_time)
        .await
        .unwrap();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(*won.lock().unwrap(), 1);
    assert_eq!(peer.leader().await.unwrap(), Some(peer.id()));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_degrades_to_solo_master() {
    let _ = try_init();

    let peer = Peer::spawn(config(), Some(Arc::new(UnreachableStore)));
    peer.wait_for_role(Role::Master, Duration::from_millis(10))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lone_peer_wins_within_one_election_time() {
    let _ = try_init();

    let hub = MemoryBroadcast::new();
    let lone = peer(&hub, 42);

    lone.wait_for_role(Role::Master, config().election_time + Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(lone.leader().await.unwrap(), Some(PeerId::from_u128(42)));
    assert_eq!(hub.peek(&keys().election).await, None);
    assert_eq!(hub.peek(&keys().election_start).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_initiator_does_not_hear_its_own_vote() {
    let _ = try_init();

    let hub = MemoryBroadcast::new();
    let origin = Instant::now();
    let lone = peer(&hub, 5);

    at(origin, 10).await;
    // An echoed write would have made the initiator vote a second time.
    assert_eq!(
        hub.peek(&keys().election).await,
        Some(encode_candidates(&ids(&[5])))
    );
    assert_eq!(lone.role(), Role::Candidate);
}

#[tokio::test(start_paused = true)]
async fn test_highest_candidate_becomes_the_only_master() {
    let _ = try_init();

    let hub = MemoryBroadcast::new();
    let origin = Instant::now();

    let mut peers = Vec::new();
    for (i, id) in [3u128, 7, 2, 9].iter().enumerate() {
        at(origin, 10 * i as u64).await;
        peers.push(peer(&hub, *id));
    }

    at(origin, 50).await;
    assert_eq!(
        hub.peek(&keys().election).await,
        Some(encode_candidates(&ids(&[3, 7, 2, 9])))
    );

    at(origin, 2100).await;
    assert_eq!(
        hub.peek(&keys().current_leader).await,
        Some(PeerId::from_u128(9).to_value())
    );
    for peer in &peers {
        let expected = if peer.id() == PeerId::from_u128(9) {
            Role::Master
        } else {
            Role::Slave
        };
        assert_eq!(peer.role(), expected, "peer {}", peer.id());
    }

    at(origin, 6000).await;
    assert_eq!(peers.iter().filter(|p| p.is_master()).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_start_settles_on_one_master() {
    let _ = try_init();

    let hub = MemoryBroadcast::new();
    let origin = Instant::now();
    let a = peer(&hub, 11);
    let b = peer(&hub, 12);

    at(origin, 3000).await;
    let masters = [&a, &b].iter().filter(|p| p.is_master()).count();
    assert_eq!(masters, 1);

    let leader = a.leader().await.unwrap().unwrap();
    let master = if a.is_master() { a.id() } else { b.id() };
    assert_eq!(leader, master);
}

#[tokio::test(start_paused = true)]
async fn test_vanished_initiator_is_replaced_by_sanity_timer() {
    let _ = try_init();

    let hub = MemoryBroadcast::new();
    let mut observer = Observer::attach(&hub).await;
    let origin = Instant::now();

    let mut initiator = peer(&hub, 1);
    at(origin, 10).await;
    let voter = peer(&hub, 2);

    at(origin, 100).await;
    initiator.shutdown().await;
    let before = observer.drain();
    assert_eq!(writes_to(&before, &keys().election_start).len(), 1);

    // Voter cast at 10ms; its sanity timer fires at 10 + 2000 + 500.
    at(origin, 2400).await;
    assert!(writes_to(&observer.drain(), &keys().election_start).is_empty());

    at(origin, 2600).await;
    assert_eq!(writes_to(&observer.drain(), &keys().election_start).len(), 1);

    at(origin, 4600).await;
    assert_eq!(voter.role(), Role::Master);
    assert_eq!(voter.leader().await.unwrap(), Some(PeerId::from_u128(2)));
}

#[tokio::test(start_paused = true)]
async fn test_restarted_round_elects_a_live_peer() {
    let _ = try_init();

    let hub = MemoryBroadcast::new();
    let origin = Instant::now();

    let mut initiator = peer(&hub, 9);
    at(origin, 10).await;
    let low = peer(&hub, 2);
    at(origin, 20).await;
    let high = peer(&hub, 3);

    at(origin, 100).await;
    initiator.shutdown().await;
    assert_eq!(
        hub.peek(&keys().election).await,
        Some(encode_candidates(&ids(&[9, 2, 3])))
    );

    // Peer 2's sanity timer reopens the round at 2510; peer 3 votes again.
    at(origin, 2600).await;
    assert_eq!(
        hub.peek(&keys().election).await,
        Some(encode_candidates(&ids(&[2, 3])))
    );

    at(origin, 4600).await;
    assert_eq!(low.leader().await.unwrap(), Some(PeerId::from_u128(3)));
    assert_eq!(high.role(), Role::Master);
    assert_eq!(low.role(), Role::Slave);
}

/// Bring up master 9 and, once it heartbeats, follower 1
async fn master_and_follower(hub: &MemoryBroadcast, origin: Instant) -> (Peer, Peer) {
    let master = peer(hub, 9);
    at(origin, 2100).await;
    assert_eq!(master.role(), Role::Master);

    at(origin, 3500).await;
    let follower = peer(hub, 1);
    at(origin, 3510).await;
    assert_eq!(follower.role(), Role::Slave);

    (master, follower)
}

#[tokio::test(start_paused = true)]
async fn test_dead_master_triggers_exactly_one_election() {
    let _ = try_init();

    let hub = MemoryBroadcast::new();
    let mut observer = Observer::attach(&hub).await;
    let origin = Instant::now();

    let (mut master, follower) = master_and_follower(&hub, origin).await;

    // Last heartbeat lands at 4000ms.
    at(origin, 4500).await;
    master.shutdown().await;
    observer.drain();

    at(origin, 6400).await;
    assert_eq!(rounds_opened(&observer.drain()), 0);

    at(origin, 6600).await;
    assert_eq!(rounds_opened(&observer.drain()), 1);

    at(origin, 8400).await;
    assert_eq!(rounds_opened(&observer.drain()), 0);
    assert_ne!(follower.role(), Role::Master);

    at(origin, 8600).await;
    assert_eq!(follower.role(), Role::Master);
    assert_eq!(rounds_opened(&observer.drain()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resignation_silences_heartbeat_and_followers_react() {
    let _ = try_init();

    let hub = MemoryBroadcast::new();
    let mut observer = Observer::attach(&hub).await;
    let origin = Instant::now();

    let (master, follower) = master_and_follower(&hub, origin).await;
    let mut events = master.subscribe();

    at(origin, 4500).await;
    master.resign().unwrap();
    at(origin, 4510).await;
    assert_eq!(master.role(), Role::Slave);
    let event = events.try_recv().unwrap();
    assert_eq!(event.event_name, EventName::LostElection);
    observer.drain();

    at(origin, 6400).await;
    let quiet = observer.drain();
    assert!(writes_to(&quiet, &keys().heartbeat).is_empty());
    assert_eq!(rounds_opened(&quiet), 0);

    // 4000ms last heartbeat + 2000 TTL + 500 offset
    at(origin, 6600).await;
    assert_eq!(rounds_opened(&observer.drain()), 1);

    // Both voted; the higher id takes mastership back.
    at(origin, 8600).await;
    assert_eq!(master.role(), Role::Master);
    assert_eq!(follower.role(), Role::Slave);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_start_yields_single_result() {
    let _ = try_init();

    let hub = MemoryBroadcast::new();
    let mut observer = Observer::attach(&hub).await;
    let origin = Instant::now();

    let lone = peer(&hub, 5);
    at(origin, 100).await;
    lone.start_election().unwrap();

    at(origin, 2050).await;
    assert!(writes_to(&observer.drain(), &keys().current_leader).is_empty());

    at(origin, 2200).await;
    let leaders = writes_to(&observer.drain(), &keys().current_leader);
    assert_eq!(leaders, vec![PeerId::from_u128(5).to_value()]);
    assert_eq!(lone.role(), Role::Master);

    at(origin, 5000).await;
    assert!(writes_to(&observer.drain(), &keys().current_leader).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_broken_listeners_do_not_starve_others() {
    let _ = try_init();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut peer = Peer::new(config(), None);

    peer.on(EventName::WonElection, |_| anyhow::bail!("first listener fails"))
        .await;
    peer.on(EventName::WonElection, |_| panic!("second listener panics"))
        .await;
    let seen = order.clone();
    peer.on(EventName::WonElection, move |event| {
        seen.lock().unwrap().push(event.to_json()["eventName"].clone());
        Ok(())
    })
    .await;
    peer.start();

    peer.wait_for_role(Role::Master, Duration::from_millis(10))
        .await
        .unwrap();
    sleep(Duration::from_millis(1)).await;
    assert_eq!(*order.lock().unwrap(), vec![Value::from("wonElection")]);
    assert_eq!(peer.role(), Role::Master);
}

#[tokio::test(start_paused = true)]
async fn test_commands_after_shutdown_fail() {
    let _ = try_init();

    let mut peer = Peer::spawn(config(), None);
    peer.wait_for_role(Role::Master, Duration::from_millis(10))
        .await
        .unwrap();
    peer.shutdown().await;

    assert!(matches!(peer.resign(), Err(ElectionError::Shutdown)));
}
