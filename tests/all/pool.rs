use crate::helpers::{build_pool, pool_settings, FakeFactory, FakeProbe};
use carrot_pool::amqp::configuration::PoolSettings;
use carrot_pool::amqp::LapinChannelFactory;
use carrot_pool::health::AlivenessProbe;
use carrot_pool::pool::{ChannelPool, PoolError, RabbitMqChannelPool};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn the_pool_is_filled_when_built() {
    let factory = FakeFactory::default();

    let pool = build_pool(pool_settings(3, 600), &factory, &FakeProbe::healthy()).await;

    assert_eq!(factory.created(), 3);
    let status = pool.status();
    assert_eq!(status.max_size, 3);
    assert_eq!(status.available, 3);
}

#[tokio::test(start_paused = true)]
async fn lazy_pools_open_channels_on_first_acquisition() {
    let factory = FakeFactory::default();
    let pool = ChannelPool::builder(pool_settings(2, 600), factory.clone(), FakeProbe::healthy())
        .prepopulate(false)
        .build()
        .await
        .unwrap();
    assert_eq!(factory.created(), 0);
    assert_eq!(pool.status().available, 2);

    let channel = pool.acquire().await.unwrap();

    assert_eq!(factory.created(), 1);
    assert!(channel.is_open());
    assert_eq!(pool.status().available, 1);
    pool.release(channel).await;
    assert_eq!(pool.status().available, 2);
}

#[tokio::test(start_paused = true)]
async fn released_channels_are_reused() {
    let factory = FakeFactory::default();
    let pool = build_pool(pool_settings(1, 600), &factory, &FakeProbe::healthy()).await;

    let channel = pool.acquire().await.unwrap();
    let serial = channel.serial;
    pool.release(channel).await;
    let channel = pool.acquire().await.unwrap();

    assert_eq!(channel.serial, serial);
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.destroyed(), 0);
}

#[tokio::test(start_paused = true)]
async fn acquire_waits_until_a_channel_is_released() {
    let factory = FakeFactory::default();
    let pool = build_pool(pool_settings(1, 600), &factory, &FakeProbe::healthy()).await;
    let channel = pool.acquire().await.unwrap();

    // Act
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move {
            let channel = pool.acquire().await.unwrap();
            let serial = channel.serial;
            pool.release(channel).await;
            serial
        }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!waiter.is_finished());
    let serial = channel.serial;
    pool.release(channel).await;

    // Assert
    assert_eq!(waiter.await.unwrap(), serial);
    assert_eq!(factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn acquire_timeout_gives_up_on_an_empty_pool() {
    let pool = build_pool(
        pool_settings(1, 600),
        &FakeFactory::default(),
        &FakeProbe::healthy(),
    )
    .await;
    let _channel = pool.acquire().await.unwrap();

    let outcome = pool.acquire_timeout(Duration::from_millis(100)).await;

    assert!(matches!(outcome, Err(PoolError::Timeout)));
}

#[tokio::test(start_paused = true)]
async fn broken_channels_are_replaced_and_the_pool_stays_full() {
    let factory = FakeFactory::default();
    let pool = build_pool(pool_settings(2, 600), &factory, &FakeProbe::healthy()).await;

    for round in 0..5 {
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.status().available, 0);

        pool.release_broken(first).await;
        assert_eq!(pool.status().available, 1);
        pool.release(second).await;

        let status = pool.status();
        assert_eq!(status.available, 2);
        assert!(status.available <= status.max_size);
        assert_eq!(factory.destroyed(), round + 1);
        assert_eq!(factory.created(), 2 + round + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn closed_channels_given_back_as_healthy_are_replaced() {
    let factory = FakeFactory::default();
    let pool = build_pool(pool_settings(1, 600), &factory, &FakeProbe::healthy()).await;

    let channel = pool.acquire().await.unwrap();
    channel.close();
    pool.release(channel).await;

    assert_eq!(factory.destroyed(), 1);
    assert_eq!(factory.created(), 2);
    let channel = pool.acquire().await.unwrap();
    assert!(channel.is_open());
    assert_eq!(channel.serial, 1);
}

#[tokio::test(start_paused = true)]
async fn expired_channels_are_recycled_on_acquire() {
    let factory = FakeFactory::default();
    let pool = build_pool(pool_settings(1, 60), &factory, &FakeProbe::healthy()).await;
    let channel = pool.acquire().await.unwrap();
    assert_eq!(channel.serial, 0);
    pool.release(channel).await;

    tokio::time::advance(Duration::from_secs(61)).await;
    let channel = pool.acquire().await.unwrap();

    assert_eq!(channel.serial, 1);
    assert_eq!(factory.destroyed(), 1);
    assert!(channel.recycle_at().unwrap() >= Instant::now());
}

#[tokio::test(start_paused = true)]
async fn acquiring_extends_the_recycle_deadline() {
    let factory = FakeFactory::default();
    let pool = build_pool(pool_settings(1, 60), &factory, &FakeProbe::healthy()).await;

    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(50)).await;
        let channel = pool.acquire().await.unwrap();
        assert_eq!(channel.serial, 0);
        assert_eq!(
            channel.recycle_at(),
            Some(Instant::now() + Duration::from_secs(60))
        );
        pool.release(channel).await;
    }
    assert_eq!(factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn closed_channels_are_reopened_on_acquire() {
    let factory = FakeFactory::default();
    // The pooled channel and its first replacement are both closed.
    factory.next_born_closed(2);
    let pool = build_pool(pool_settings(1, 600), &factory, &FakeProbe::healthy()).await;

    let channel = pool.acquire().await.unwrap();

    assert!(channel.is_open());
    assert_eq!(channel.serial, 2);
    assert_eq!(factory.destroyed(), 2);
}

#[tokio::test(start_paused = true)]
async fn reopening_gives_up_after_the_configured_attempts() {
    let factory = FakeFactory::default();
    let mut settings = pool_settings(1, 600);
    settings.pool = PoolSettings {
        max_reopen_attempts: 3,
        ..settings.pool
    };
    factory.next_born_closed(usize::MAX);
    let pool = build_pool(settings, &factory, &FakeProbe::healthy()).await;
    let started = Instant::now();

    let outcome = pool.acquire().await;

    assert!(matches!(outcome, Err(PoolError::Connect(_))));
    // The initial channel plus three replacements, all destroyed.
    assert_eq!(factory.created(), 4);
    assert_eq!(factory.destroyed(), 4);
    // Backoff between the 2nd and 3rd replacement: 100ms then 200ms.
    assert!(started.elapsed() >= Duration::from_millis(300));
    // The slot is not lost.
    assert_eq!(pool.status().available, 1);

    factory.next_born_closed(0);
    let channel = pool.acquire().await.unwrap();
    assert!(channel.is_open());
}

#[tokio::test(start_paused = true)]
async fn connection_failures_surface_from_acquire_without_losing_the_slot() {
    let factory = FakeFactory::default();
    let pool = build_pool(pool_settings(1, 600), &factory, &FakeProbe::healthy()).await;
    let channel = pool.acquire().await.unwrap();

    factory.make_unreachable("primary");
    pool.release_broken(channel).await;
    assert_eq!(pool.status().available, 1);

    assert!(matches!(pool.acquire().await, Err(PoolError::Connect(_))));
    assert_eq!(pool.status().available, 1);

    factory.make_reachable("primary");
    let channel = pool.acquire().await.unwrap();
    assert!(channel.is_open());
    assert_eq!(factory.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn building_fails_when_the_broker_is_unreachable() {
    let factory = FakeFactory::default();
    factory.make_unreachable("primary");

    let outcome = ChannelPool::builder(pool_settings(2, 600), factory, FakeProbe::healthy())
        .build()
        .await;

    assert!(matches!(outcome, Err(PoolError::Connect(_))));
}

#[tokio::test(start_paused = true)]
async fn destroy_failures_do_not_prevent_replacement() {
    let factory = FakeFactory::default();
    factory.fail_destroy();
    let pool = build_pool(pool_settings(1, 600), &factory, &FakeProbe::healthy()).await;

    let channel = pool.acquire().await.unwrap();
    pool.release_broken(channel).await;

    assert_eq!(factory.destroyed(), 1);
    assert_eq!(pool.status().available, 1);
    let channel = pool.acquire().await.unwrap();
    assert_eq!(channel.serial, 1);
}

#[tokio::test(start_paused = true)]
async fn without_pooling_every_acquisition_opens_a_new_channel() {
    let factory = FakeFactory::default();
    let pool = build_pool(pool_settings(1, -1), &factory, &FakeProbe::healthy()).await;
    assert_eq!(factory.created(), 0);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(factory.created(), 2);
    assert_eq!(first.recycle_at(), None);

    pool.release(first).await;
    pool.release_broken(second).await;

    assert_eq!(factory.destroyed(), 2);
    assert_eq!(factory.created(), 2);
    assert_eq!(pool.status().max_size, 0);
}

#[tokio::test(start_paused = true)]
async fn closing_the_pool_destroys_idle_channels() {
    let factory = FakeFactory::default();
    let pool = build_pool(pool_settings(2, 600), &factory, &FakeProbe::healthy()).await;
    let _channel = pool.acquire().await.unwrap();

    pool.close().await;

    assert_eq!(factory.destroyed(), 1);
    assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
}

#[tokio::test]
async fn an_empty_pool_is_rejected() {
    let outcome = ChannelPool::builder(
        pool_settings(0, 600),
        FakeFactory::default(),
        FakeProbe::healthy(),
    )
    .build()
    .await;

    assert!(matches!(outcome, Err(PoolError::Configuration(_))));
}

#[tokio::test]
async fn rabbitmq_pools_can_be_built_lazily_while_the_broker_is_down() {
    let probe = AlivenessProbe::new(15672, Duration::from_secs(1)).unwrap();

    let pool: RabbitMqChannelPool =
        ChannelPool::builder(pool_settings(2, 600), LapinChannelFactory::new(), probe)
            .prepopulate(false)
            .build()
            .await
            .unwrap();

    let status = pool.status();
    assert_eq!(status.max_size, 2);
    assert_eq!(status.available, 2);
    assert_eq!(pool.current_endpoint().host, "primary");
}
