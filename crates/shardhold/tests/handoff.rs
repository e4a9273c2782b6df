mod common;

use common::{key_on_shard, Counter, Get, Increment};
use shardhold::coordinator::{AssignmentChange, RebalanceOutcome};
use shardhold::envelope::CommandEnvelope;
use shardhold::prelude::*;
use shardhold::testing::TestCluster;

#[tokio::test]
async fn acknowledged_handoff_moves_entity_with_its_state() {
    let cluster = TestCluster::new(Counter, 2).await.unwrap();
    let (a, b) = (cluster.address(0).clone(), cluster.address(1).clone());
    let shard = ShardId::new(7);
    let key = key_on_shard(7, 16);

    cluster.coordinator().move_shard(shard, a.clone()).await.unwrap();
    // Asked through B, served by A.
    assert_eq!(cluster.region(1).ask(key.clone(), &Increment { by: 1 }).await.unwrap(), 1);
    assert_eq!(cluster.region(1).ask(key.clone(), &Increment { by: 1 }).await.unwrap(), 2);
    assert!(cluster.region(0).hosted_shards().contains(&shard));
    assert!(!cluster.region(1).hosted_shards().contains(&shard));

    let outcome = cluster.coordinator().move_shard(shard, b.clone()).await.unwrap();
    assert_eq!(
        outcome,
        RebalanceOutcome::HandedOff {
            shard,
            from: a.clone(),
            to: b.clone()
        }
    );
    assert!(!cluster.region(0).hosted_shards().contains(&shard));
    let snapshot = cluster.journal().snapshot(&key).expect("final snapshot written on handoff");
    assert_eq!(snapshot.sequence, 2);

    // The old owner refuses to serve the shard locally.
    let envelope =
        CommandEnvelope::for_command(RequestId(9_000), key.clone(), &Get, 16).unwrap();
    let err = cluster.region(0).deliver_local(envelope).await.unwrap_err();
    assert!(matches!(err, ClusterError::RoutingStale { .. }), "got {err:?}");

    assert_eq!(cluster.region(0).ask(key.clone(), &Increment { by: 1 }).await.unwrap(), 3);
    assert!(cluster.region(1).hosted_shards().contains(&shard));
    assert_eq!(cluster.coordinator().table().owner(shard), Some(&b));

    let history = cluster.coordinator().history().await.unwrap();
    assert_eq!(
        history.last().map(|e| e.change.clone()),
        Some(AssignmentChange::Reassigned {
            shard,
            from: a,
            to: b,
            acknowledged: true
        })
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn commands_racing_a_handoff_are_neither_lost_nor_reordered() {
    let cluster = TestCluster::new(Counter, 2).await.unwrap();
    let shard = ShardId::new(3);
    let key = key_on_shard(3, 16);
    cluster
        .coordinator()
        .move_shard(shard, cluster.address(0).clone())
        .await
        .unwrap();
    cluster.journal().set_append_delay(Some(std::time::Duration::from_millis(2)));

    let mut callers = Vec::new();
    for i in 0..20 {
        let region = cluster.region(i % 2);
        let key = key.clone();
        callers.push(tokio::spawn(async move {
            region.ask(key, &Increment { by: 1 }).await
        }));
    }
    let outcome = cluster
        .coordinator()
        .move_shard(shard, cluster.address(1).clone())
        .await
        .unwrap();
    assert!(matches!(outcome, RebalanceOutcome::HandedOff { .. }));

    let mut replies = Vec::new();
    for caller in callers {
        replies.push(caller.await.unwrap().unwrap());
    }
    replies.sort_unstable();
    assert_eq!(replies, (1..=20).collect::<Vec<i64>>());

    let sequences: Vec<u64> = cluster.journal().events(&key).iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());
    assert_eq!(cluster.region(1).ask(key, &Get).await.unwrap(), 20);
    cluster.shutdown().await;
}

#[tokio::test]
async fn moving_to_the_current_owner_is_a_no_op() {
    let cluster = TestCluster::new(Counter, 2).await.unwrap();
    let shard = ShardId::new(1);
    let a = cluster.address(0).clone();
    cluster.coordinator().move_shard(shard, a.clone()).await.unwrap();
    let generation = cluster.coordinator().table().generation;

    let outcome = cluster.coordinator().move_shard(shard, a).await.unwrap();
    assert_eq!(outcome, RebalanceOutcome::Unchanged { shard });
    assert_eq!(cluster.coordinator().table().generation, generation);
    cluster.shutdown().await;
}

#[tokio::test]
async fn moving_to_an_unknown_region_is_rejected() {
    let cluster = TestCluster::new(Counter, 1).await.unwrap();
    let err = cluster
        .coordinator()
        .move_shard(ShardId::new(0), RegionAddress::new("nowhere", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::RegionUnavailable { .. }));
    cluster.shutdown().await;
}
