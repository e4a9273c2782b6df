#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardhold::hash::shard_for_key;
use shardhold::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Increment {
    pub by: i64,
}

impl Command for Increment {
    const TYPE: &'static str = "increment";
    type Reply = i64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decrement {
    pub by: i64,
}

impl Command for Decrement {
    const TYPE: &'static str = "decrement";
    type Reply = i64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Get;

impl Command for Get {
    const TYPE: &'static str = "get";
    type Reply = i64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CounterEvent {
    Incremented(i64),
    Decremented(i64),
}

#[derive(Clone)]
pub struct Counter;

impl Behavior for Counter {
    type State = i64;
    type Event = CounterEvent;

    fn name(&self) -> &str {
        "Counter"
    }

    fn apply(&self, state: &mut i64, event: &CounterEvent) {
        match event {
            CounterEvent::Incremented(by) => *state += by,
            CounterEvent::Decremented(by) => *state -= by,
        }
    }

    fn handlers(&self) -> HandlerTable<i64, CounterEvent> {
        HandlerTable::<i64, CounterEvent>::new()
            .on::<Increment, _>(|_, cmd| {
                Ok(Effect::persist(vec![CounterEvent::Incremented(cmd.by)]).then_reply(|s: &i64| *s))
            })
            .on::<Decrement, _>(|_, cmd| {
                Ok(Effect::persist(vec![CounterEvent::Decremented(cmd.by)]).then_reply(|s: &i64| *s))
            })
            .on::<Get, _>(|state: &i64, _| Ok(Effect::reply(*state)))
    }
}

/// First key of the form `user-N` that lands on `shard`.
pub fn key_on_shard(shard: u32, num_shards: u32) -> OwnerKey {
    (0..)
        .map(|i| OwnerKey::new(format!("user-{i}")))
        .find(|key| shard_for_key(key, num_shards) == ShardId::new(shard))
        .unwrap()
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn decode_events(events: &[shardhold::journal::PersistedEvent]) -> Vec<CounterEvent> {
    #[derive(Deserialize)]
    struct Stored {
        #[allow(dead_code)]
        request_id: Option<RequestId>,
        event: CounterEvent,
    }
    events
        .iter()
        .map(|e| rmp_serde::from_slice::<Stored>(&e.payload).unwrap().event)
        .collect()
}
