//! Failover demonstration
//!
//! Three peers share an in-memory broadcast store. After the first election
//! the master is stopped without resigning and the remaining peers elect a
//! replacement once its heartbeat goes quiet.

use herald_election::{ElectionConfig, EventName, MemoryBroadcast, Peer, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_election=info".into()),
        )
        .init();

    let config = ElectionConfig::default()
        .with_namespace("demo")
        .with_heartbeat_ttl(Duration::from_millis(600))
        .with_heartbeat_offset(Duration::from_millis(150))
        .with_heartbeat_jitter(Duration::from_millis(50))
        .with_election_time(Duration::from_millis(400));

    let hub = MemoryBroadcast::new();
    let mut peers = Vec::new();
    for _ in 0..3 {
        let mut peer = Peer::new(config.clone(), Some(Arc::new(hub.connect())));
        let id = peer.id();
        peer.on(EventName::WonElection, move |_| {
            println!("{} won the election", id);
            Ok(())
        })
        .await;
        peer.on(EventName::LostElection, move |event| {
            println!("{} follows {}", id, event.to_json()["leader"]);
            Ok(())
        })
        .await;
        peer.start();
        peers.push(peer);
    }

    sleep(Duration::from_secs(2)).await;
    print_roles(&peers);

    if let Some(index) = peers.iter().position(|p| p.role() == Role::Master) {
        let mut master = peers.remove(index);
        println!("Stopping master {}", master.id());
        master.shutdown().await;
    }

    sleep(Duration::from_secs(3)).await;
    print_roles(&peers);

    if let Some(leader) = peers[0].leader().await? {
        println!("Store names {} as leader", leader);
    }

    Ok(())
}

fn print_roles(peers: &[Peer]) {
    for peer in peers {
        println!("  {} -> {}", peer.id(), peer.role());
    }
}
