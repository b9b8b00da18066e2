mod common;

use std::sync::Arc;
use std::time::Duration;

use candela::Router;
use candela_core::{ErrorCode, GatewayError, Settings};
use candela_mock::{MockVenue, frame_for, quote};
use common::{Script, spawn_fixture};

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.connector.inactivity_timeout = Duration::from_secs(5);
    settings.connector.reconnect_delay = Duration::from_millis(100);
    settings
}

fn router_with(venue: MockVenue, settings: Settings) -> Router {
    Router::builder(settings)
        .with_venue(Arc::new(venue))
        .build()
        .unwrap()
}

async fn wait_for_sessions(router: &Router, venue: &str, expected: usize) {
    for _ in 0..100 {
        if router.active_sessions(venue) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "venue {venue} never reached {expected} active sessions (now {})",
        router.active_sessions(venue)
    );
}

/// Scenario: a slow subscriber overflows its bounded mailbox and is detached
/// with a backpressure error; the fast subscriber on the same upstream
/// session is unaffected.
#[tokio::test(flavor = "multi_thread")]
async fn slow_subscriber_is_detached_with_backpressure() {
    let frames = vec![
        frame_for(&quote("BTCUSDT", 1_700_000_000_000, true)),
        frame_for(&quote("BTCUSDT", 1_700_000_060_000, true)),
        frame_for(&quote("BTCUSDT", 1_700_000_120_000, true)),
    ];
    let addr = spawn_fixture(vec![Script::SendSpaced {
        initial: Duration::from_millis(400),
        gap: Duration::from_millis(200),
        frames,
    }])
    .await;

    let mut settings = settings();
    settings.connector.router_queue_max = 1;
    let router = router_with(MockVenue::new(format!("ws://{addr}")), settings);

    let symbols = vec!["BTCUSDT".to_string()];
    let mut fast = router.subscribe("mock", None, &symbols).unwrap();
    let mut slow = router.subscribe("mock", None, &symbols).unwrap();
    assert_eq!(router.active_sessions("mock"), 1, "one shared session");

    let fast_task = tokio::spawn(async move {
        let mut received = 0;
        while received < 3 {
            match tokio::time::timeout(Duration::from_secs(5), fast.next()).await {
                Ok(Some(Ok(_))) => received += 1,
                other => panic!("fast subscriber hit {other:?}"),
            }
        }
        received
    });

    // The slow subscriber does not read until the pump has already tried to
    // deliver more than its single mailbox slot.
    tokio::time::sleep(Duration::from_millis(900)).await;

    let first = tokio::time::timeout(Duration::from_secs(5), slow.next())
        .await
        .unwrap();
    assert!(
        matches!(first, Some(Ok(_))),
        "the buffered quote drains first, got {first:?}"
    );
    let second = tokio::time::timeout(Duration::from_secs(5), slow.next())
        .await
        .unwrap();
    match second {
        Some(Err(e)) => assert_eq!(e.code(), ErrorCode::InternalQueueBackpressure),
        other => panic!("expected a backpressure error, got {other:?}"),
    }
    assert!(slow.next().await.is_none());

    assert_eq!(fast_task.await.unwrap(), 3);
}

/// Scenario: the venue session cap rejects new upstream sessions with
/// `CONNECTION_POOL_BUSY`, while identical batches keep sharing.
#[tokio::test(flavor = "multi_thread")]
async fn venue_session_cap_rejects_new_sessions() {
    let addr = spawn_fixture(vec![Script::Silent, Script::Silent]).await;
    let mut settings = settings();
    settings.connector.max_sessions_per_venue = 1;
    let router = router_with(MockVenue::new(format!("ws://{addr}")), settings);

    let first = router
        .subscribe("mock", None, &["AAAUSDT".to_string()])
        .unwrap();
    assert_eq!(router.active_sessions("mock"), 1);

    match router.subscribe("mock", None, &["BBBUSDT".to_string()]) {
        Err(GatewayError::PoolBusy(venue)) => assert_eq!(venue, "mock"),
        other => panic!("expected pool-busy, got {other:?}"),
    }

    // The same batch shares the existing session instead of opening one.
    let shared = router
        .subscribe("mock", None, &["AAAUSDT".to_string()])
        .unwrap();
    assert_eq!(router.active_sessions("mock"), 1);

    drop(first);
    drop(shared);
    wait_for_sessions(&router, "mock", 0).await;
}

/// When the last subscriber detaches, the upstream session is cancelled and
/// the registry entry released.
#[tokio::test(flavor = "multi_thread")]
async fn last_detach_releases_the_upstream_session() {
    let addr = spawn_fixture(vec![Script::Silent]).await;
    let router = router_with(MockVenue::new(format!("ws://{addr}")), settings());

    let symbols = vec!["BTCUSDT".to_string()];
    let a = router.subscribe("mock", None, &symbols).unwrap();
    let b = router.subscribe("mock", None, &symbols).unwrap();
    assert_eq!(router.active_sessions("mock"), 1);

    drop(a);
    assert_eq!(
        router.active_sessions("mock"),
        1,
        "one subscriber remains attached"
    );
    drop(b);
    wait_for_sessions(&router, "mock", 0).await;

    // The venue is usable again afterwards.
    let _again = router.subscribe("mock", None, &symbols).unwrap();
    assert_eq!(router.active_sessions("mock"), 1);
}

/// Symbol lists are deduplicated, sorted, and batched by the endpoint cap;
/// the session count equals the number of distinct batches.
#[tokio::test(flavor = "multi_thread")]
async fn symbols_are_normalized_and_batched() {
    let addr = spawn_fixture(vec![Script::Silent, Script::Silent, Script::Silent]).await;
    let router = router_with(
        MockVenue::new(format!("ws://{addr}")).with_session_cap(1),
        settings(),
    );

    let symbols = vec![
        "BBBUSDT".to_string(),
        "AAAUSDT".to_string(),
        "BBBUSDT".to_string(),
        "CCCUSDT".to_string(),
    ];
    let _sub = router.subscribe("mock", None, &symbols).unwrap();
    assert_eq!(
        router.active_sessions("mock"),
        3,
        "three distinct symbols at cap 1"
    );
}

/// An engine-fatal subscribe rejection reaches every subscriber of the
/// shared session.
#[tokio::test(flavor = "multi_thread")]
async fn fatal_errors_are_broadcast_to_all_subscribers() {
    let addr = spawn_fixture(vec![Script::Silent]).await;
    let router = router_with(
        MockVenue::new(format!("ws://{addr}")).rejecting("rate limit", Some("rate limit".into())),
        settings(),
    );

    let symbols = vec!["BTCUSDT".to_string()];
    let mut a = router.subscribe("mock", None, &symbols).unwrap();
    let mut b = router.subscribe("mock", None, &symbols).unwrap();

    for subscriber in [&mut a, &mut b] {
        match tokio::time::timeout(Duration::from_secs(5), subscriber.next())
            .await
            .unwrap()
        {
            Some(Err(e)) => assert_eq!(e.code(), ErrorCode::RateLimited),
            other => panic!("expected the rejection, got {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_requests_are_rejected_up_front() {
    let addr = spawn_fixture(vec![]).await;
    let router = router_with(MockVenue::new(format!("ws://{addr}")), settings());

    match router.subscribe("nope", None, &["BTCUSDT".to_string()]) {
        Err(GatewayError::UnsupportedContractType(_)) => {}
        other => panic!("unknown venue must be rejected, got {other:?}"),
    }
    match router.subscribe("mock", Some("futures"), &["BTCUSDT".to_string()]) {
        Err(GatewayError::UnsupportedContractType(_)) => {}
        other => panic!("unknown family must be rejected, got {other:?}"),
    }
    match router.subscribe("mock", None, &[]) {
        Err(GatewayError::InvalidArg(_)) => {}
        other => panic!("empty symbols must be rejected, got {other:?}"),
    }
    assert_eq!(router.active_sessions("mock"), 0);
}
