use crate::{
    ChannelName, Codec, Error, PubSubConfig, PubSubListener, PubSubMultiplexer, ShardId,
    SubscriptionKind,
    executor::spawn,
    registry::SubscriptionKey,
    tests::{
        AckMode, TestConnectionProvider, TestRouter, log_try_init, sleep, test_config, wait_until,
    },
};
use std::{sync::Arc, time::Duration};

fn setup(
    ack_mode: AckMode,
    config: PubSubConfig,
) -> (Arc<TestRouter>, Arc<TestConnectionProvider>, PubSubMultiplexer) {
    let router = TestRouter::single(ShardId::new(0));
    let provider = TestConnectionProvider::new(ack_mode);
    let multiplexer =
        PubSubMultiplexer::new(config, router.clone(), provider.clone()).unwrap();
    (router, provider, multiplexer)
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn hot_channel_subscribers_share_one_wire_subscribe() {
    log_try_init();

    let (_, provider, multiplexer) = setup(AckMode::Manual, test_config());
    let channel = ChannelName::from("news");

    let (listener_a, _messages_a) = PubSubListener::new();
    let (listener_b, _messages_b) = PubSubListener::new();

    let first = {
        let multiplexer = multiplexer.clone();
        let channel = channel.clone();
        spawn(async move {
            multiplexer
                .subscribe(Codec::default(), channel, vec![listener_a])
                .await
        })
    };
    wait_until(|| {
        provider.connection_count() == 1
            && provider.connection(0).command_count(SubscriptionKind::Subscribe) == 1
    })
    .await;

    // second subscriber arrives before the acknowledgement
    let second = {
        let multiplexer = multiplexer.clone();
        let channel = channel.clone();
        spawn(async move {
            multiplexer
                .subscribe(Codec::default(), channel, vec![listener_b])
                .await
        })
    };
    sleep(Duration::from_millis(20)).await;

    provider
        .connection(0)
        .acknowledge(SubscriptionKind::Subscribe, &channel);

    let entry_a = first.await.unwrap().unwrap();
    let entry_b = second.await.unwrap().unwrap();

    assert!(Arc::ptr_eq(&entry_a, &entry_b));
    assert_eq!(
        1,
        provider.connection(0).command_count(SubscriptionKind::Subscribe)
    );
    assert_eq!(
        test_config().subscriptions_per_connection - 1,
        entry_a.free_slots()
    );
    assert_eq!(2, entry_a.count_listeners(SubscriptionKind::Subscribe, &channel));
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn full_entries_roll_over_to_a_new_connection() {
    log_try_init();

    let config = PubSubConfig {
        subscriptions_per_connection: 2,
        ..test_config()
    };
    let (_, provider, multiplexer) = setup(AckMode::Auto, config);
    let shard = ShardId::new(0);

    for channel in ["a", "b", "c"] {
        multiplexer
            .subscribe(Codec::default(), channel, vec![])
            .await
            .unwrap();
    }

    assert_eq!(2, provider.connection_count());
    assert_eq!(3, multiplexer.registry().len());

    let third = multiplexer.entry_of(&ChannelName::from("c")).unwrap();
    multiplexer.with_shard_pool(shard, |pool| {
        let pool = pool.unwrap();
        assert_eq!(3, pool.key_count());
        let free: Vec<_> = pool.free_entries().collect();
        assert_eq!(1, free.len());
        assert!(Arc::ptr_eq(free[0], &third));
        assert_eq!(1, free[0].free_slots());
    });
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn failed_connect_attempts_are_retried() {
    log_try_init();

    let config = PubSubConfig {
        retry_attempts: 2,
        retry_interval: Duration::from_millis(10),
        ..test_config()
    };
    let (_, provider, multiplexer) = setup(AckMode::Auto, config);
    provider.fail_next_connects(1);

    multiplexer
        .subscribe(Codec::default(), "news", vec![])
        .await
        .unwrap();

    assert_eq!(2, provider.attempts());
    assert_eq!(1, provider.connection_count());
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn connect_attempts_stop_after_the_configured_retries() {
    log_try_init();

    let config = PubSubConfig {
        retry_attempts: 2,
        retry_interval: Duration::from_millis(10),
        ..test_config()
    };
    let (_, provider, multiplexer) = setup(AckMode::Auto, config);
    provider.fail_next_connects(u32::MAX);

    let result = multiplexer.subscribe(Codec::default(), "news", vec![]).await;

    assert!(matches!(result, Err(Error::Connect(_))));
    assert_eq!(3, provider.attempts());
    assert_eq!(0, multiplexer.registry().len());
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn hung_connect_attempts_are_canceled_and_retried() {
    log_try_init();

    let config = PubSubConfig {
        retry_attempts: 1,
        retry_interval: Duration::from_millis(20),
        ..test_config()
    };
    let (_, provider, multiplexer) = setup(AckMode::Auto, config);
    provider.set_hang(true);

    let result = multiplexer.subscribe(Codec::default(), "news", vec![]).await;

    assert!(matches!(result, Err(Error::Connect(_))));
    assert_eq!(2, provider.attempts());
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn missing_acknowledgement_times_out_and_rolls_back() {
    log_try_init();

    let config = PubSubConfig {
        timeout: Duration::from_millis(50),
        ..test_config()
    };
    let (_, provider, multiplexer) = setup(AckMode::Manual, config);
    let channel = ChannelName::from("news");

    let (listener, _messages) = PubSubListener::new();
    let result = multiplexer
        .subscribe(Codec::default(), channel.clone(), vec![listener])
        .await;

    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(0, multiplexer.registry().len());

    // the partially accepted command is cleaned up on the wire and the idle
    // connection goes back to the pool
    wait_until(|| {
        provider.connection(0).command_count(SubscriptionKind::Unsubscribe) == 1
    })
    .await;
    wait_until(|| provider.released_count() == 1).await;
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn wire_failure_fails_the_subscriber_and_rolls_back() {
    log_try_init();

    let (_, provider, multiplexer) = setup(AckMode::Auto, test_config());
    provider.set_fail_writes(true);

    let result = multiplexer.subscribe(Codec::default(), "news", vec![]).await;

    assert!(matches!(result, Err(Error::Wire(_))));
    assert_eq!(0, multiplexer.registry().len());
    wait_until(|| provider.released_count() == 1).await;
    // nothing was accepted, nothing to clean up on the wire
    assert_eq!(
        0,
        provider.connection(0).command_count(SubscriptionKind::Unsubscribe)
    );
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn dropping_the_last_listener_tears_the_subscription_down() {
    log_try_init();

    let (_, provider, multiplexer) = setup(AckMode::Auto, test_config());
    let channel = ChannelName::from("x");

    let (listener, _messages) = PubSubListener::new();
    let listener_id = listener.id();
    multiplexer
        .subscribe(Codec::default(), channel.clone(), vec![listener])
        .await
        .unwrap();

    multiplexer
        .remove_listener(SubscriptionKind::Subscribe, channel.clone(), [listener_id])
        .await
        .unwrap();

    assert_eq!(
        1,
        provider.connection(0).command_count(SubscriptionKind::Unsubscribe)
    );
    assert_eq!(0, multiplexer.registry().len());
    wait_until(|| provider.released_count() == 1).await;
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn listeners_outliving_others_keep_the_subscription() {
    log_try_init();

    let (_, provider, multiplexer) = setup(AckMode::Auto, test_config());
    let channel = ChannelName::from("x");

    let (first, _first_messages) = PubSubListener::new();
    let (second, _second_messages) = PubSubListener::new();
    let first_id = first.id();
    multiplexer
        .subscribe(Codec::default(), channel.clone(), vec![first, second])
        .await
        .unwrap();

    multiplexer
        .remove_listener(SubscriptionKind::Subscribe, channel.clone(), [first_id])
        .await
        .unwrap();

    assert_eq!(
        0,
        provider.connection(0).command_count(SubscriptionKind::Unsubscribe)
    );
    assert_eq!(1, multiplexer.registry().len());
    let entry = multiplexer.entry_of(&channel).unwrap();
    assert_eq!(1, entry.count_listeners(SubscriptionKind::Subscribe, &channel));
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn unsubscribe_is_idempotent() {
    log_try_init();

    let (_, provider, multiplexer) = setup(AckMode::Auto, test_config());
    let codec = Codec::new("json");

    multiplexer
        .subscribe(codec.clone(), "x", vec![])
        .await
        .unwrap();

    let first = multiplexer
        .unsubscribe(SubscriptionKind::Unsubscribe, "x")
        .await
        .unwrap();
    assert_eq!(Some(codec), first);
    assert_eq!(
        1,
        provider.connection(0).command_count(SubscriptionKind::Unsubscribe)
    );

    // the second teardown completes immediately without another wire command
    let second = multiplexer
        .unsubscribe(SubscriptionKind::Unsubscribe, "x")
        .await
        .unwrap();
    assert_eq!(None, second);
    assert_eq!(
        1,
        provider.connection(0).command_count(SubscriptionKind::Unsubscribe)
    );
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn subscribe_then_unsubscribe_restores_the_initial_state() {
    log_try_init();

    let (_, provider, multiplexer) = setup(AckMode::Auto, test_config());
    let shard = ShardId::new(0);

    multiplexer
        .subscribe(Codec::default(), "x", vec![])
        .await
        .unwrap();
    multiplexer
        .unsubscribe(SubscriptionKind::Unsubscribe, "x")
        .await
        .unwrap();

    assert_eq!(0, multiplexer.registry().len());
    multiplexer.with_shard_pool(shard, |pool| assert!(pool.is_none()));
    assert_eq!(1, provider.connection_count());
    assert_eq!(1, provider.released_count());
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn silent_unsubscribe_completes_through_the_synthesized_acknowledgement() {
    log_try_init();

    let config = PubSubConfig {
        timeout: Duration::from_millis(100),
        ..test_config()
    };
    let (_, provider, multiplexer) = setup(AckMode::Auto, config);

    multiplexer
        .subscribe(Codec::default(), "x", vec![])
        .await
        .unwrap();

    // the backend stops answering; teardown must still complete
    provider.connection(0).set_muted(true);
    let codec = multiplexer
        .unsubscribe(SubscriptionKind::Unsubscribe, "x")
        .await
        .unwrap();

    assert!(codec.is_some());
    assert_eq!(0, multiplexer.registry().len());
    wait_until(|| provider.released_count() == 1).await;
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn notification_patterns_broadcast_across_all_shards() {
    log_try_init();

    let shards = vec![ShardId::new(0), ShardId::new(1), ShardId::new(2)];
    let router = TestRouter::cluster(shards.clone());
    let provider = TestConnectionProvider::new(AckMode::Auto);
    let multiplexer =
        PubSubMultiplexer::new(test_config(), router, provider.clone()).unwrap();
    let channel = ChannelName::from("__keyevent@0__:expired");

    let (listener, _messages) = PubSubListener::new();
    let entries = multiplexer
        .psubscribe(Codec::default(), channel.clone(), vec![listener.clone()])
        .await
        .unwrap();

    assert_eq!(3, entries.len());
    assert_eq!(3, provider.connection_count());
    assert_eq!(3, multiplexer.registry().len());
    for shard in &shards {
        assert!(multiplexer.registry().contains(&SubscriptionKey {
            channel: channel.clone(),
            shard: *shard,
        }));
    }

    // detaching the shared listener tears every shard down
    multiplexer
        .remove_listener(SubscriptionKind::PSubscribe, channel.clone(), [listener.id()])
        .await
        .unwrap();
    assert_eq!(0, multiplexer.registry().len());
    wait_until(|| provider.released_count() == 3).await;
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn regular_patterns_route_to_a_single_shard() {
    log_try_init();

    let router = TestRouter::cluster(vec![ShardId::new(0), ShardId::new(1)]);
    let provider = TestConnectionProvider::new(AckMode::Auto);
    let multiplexer =
        PubSubMultiplexer::new(test_config(), router, provider.clone()).unwrap();

    let entries = multiplexer
        .psubscribe(Codec::default(), "news.*", vec![])
        .await
        .unwrap();

    assert_eq!(1, entries.len());
    assert_eq!(1, provider.connection_count());
    assert_eq!(1, multiplexer.registry().len());
}

#[cfg_attr(feature = "tokio-runtime", tokio::test)]
#[cfg_attr(feature = "async-std-runtime", async_std::test)]
async fn shutdown_short_circuits_teardown_and_fails_subscribe() {
    log_try_init();

    let (router, provider, multiplexer) = setup(AckMode::Auto, test_config());

    multiplexer
        .subscribe(Codec::default(), "x", vec![])
        .await
        .unwrap();
    router.set_shutting_down(true);

    let unsubscribed = multiplexer
        .unsubscribe(SubscriptionKind::Unsubscribe, "x")
        .await
        .unwrap();
    assert_eq!(None, unsubscribed);
    assert_eq!(
        0,
        provider.connection(0).command_count(SubscriptionKind::Unsubscribe)
    );

    let removed = multiplexer
        .remove_all_listeners(SubscriptionKind::Subscribe, "x")
        .await;
    assert!(removed.is_ok());

    let subscribed = multiplexer.subscribe(Codec::default(), "y", vec![]).await;
    assert!(matches!(subscribed, Err(Error::NodeNotFound(_))));
}
