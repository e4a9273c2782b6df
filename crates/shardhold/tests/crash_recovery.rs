mod common;

use std::time::Duration;

use common::{decode_events, eventually, Counter, CounterEvent, Decrement, Get, Increment};
use shardhold::hash::shard_for_key;
use shardhold::prelude::*;
use shardhold::testing::TestCluster;

#[tokio::test]
async fn crash_and_restart_recovers_exactly_the_acknowledged_events() {
    let cluster = TestCluster::new(Counter, 1).await.unwrap();
    let region = cluster.region(0);

    assert_eq!(region.ask("U1", &Increment { by: 1 }).await.unwrap(), 1);
    assert_eq!(region.ask("U1", &Increment { by: 1 }).await.unwrap(), 2);
    assert_eq!(region.ask("U1", &Decrement { by: 1 }).await.unwrap(), 1);

    cluster.crash_region(0);
    let restarted = cluster.restart_region(0).unwrap();
    assert_eq!(restarted.ask("U1", &Get).await.unwrap(), 1);

    let events = cluster.journal().events(&OwnerKey::new("U1"));
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(
        decode_events(&events),
        vec![
            CounterEvent::Incremented(1),
            CounterEvent::Incremented(1),
            CounterEvent::Decremented(1),
        ]
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn shards_of_a_dead_region_move_to_survivors() {
    let cluster = TestCluster::new(Counter, 2).await.unwrap();
    let key = OwnerKey::new("U7");
    let shard = shard_for_key(&key, 16);

    // Requested from region 0, so region 0 wins the allocation.
    assert_eq!(cluster.region(0).ask(key.clone(), &Increment { by: 5 }).await.unwrap(), 5);
    assert_eq!(cluster.coordinator().table().owner(shard), Some(cluster.address(0)));

    cluster.crash_region(0);
    cluster.membership().leave(cluster.address(0));

    let coordinator = cluster.coordinator().clone();
    let survivor = cluster.address(1).clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let coordinator = coordinator.clone();
            let survivor = survivor.clone();
            async move { coordinator.table().owner(shard) == Some(&survivor) }
        })
        .await
    );

    assert_eq!(cluster.region(1).ask(key.clone(), &Get).await.unwrap(), 5);
    assert_eq!(cluster.region(1).ask(key, &Increment { by: 1 }).await.unwrap(), 6);

    let history = cluster.coordinator().history().await.unwrap();
    assert!(history.iter().any(|event| matches!(
        &event.change,
        shardhold::coordinator::AssignmentChange::Reassigned { shard: s, acknowledged: false, .. } if *s == shard
    )));
    cluster.shutdown().await;
}

#[tokio::test]
async fn coordinator_restart_keeps_assignments() {
    let cluster = TestCluster::new(Counter, 2).await.unwrap();
    for i in 0..10 {
        cluster
            .region(i % 2)
            .ask(format!("key-{i}").as_str(), &Increment { by: 1 })
            .await
            .unwrap();
    }
    let before = cluster.coordinator().table();

    let recovered = shardhold::coordinator::ShardCoordinator::recover(
        std::sync::Arc::new(RuntimeConfig {
            num_shards: 16,
            ..Default::default()
        }),
        cluster.journal().clone(),
        std::sync::Arc::new(shardhold::allocation::LeastShardsStrategy::new(1, 3)),
        cluster.transport().clone(),
        cluster.membership().clone(),
        std::sync::Arc::new(shardhold::metrics::RegionMetrics::unregistered()),
    )
    .await
    .unwrap();
    assert_eq!(recovered.table(), before);
    cluster.shutdown().await;
}
