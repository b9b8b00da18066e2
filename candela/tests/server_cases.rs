mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use candela::{Router, server};
use candela_core::Settings;
use candela_mock::{MockVenue, frame_for, quote};
use common::{Script, refused_addr, spawn_fixture};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.connector.inactivity_timeout = Duration::from_secs(5);
    settings.connector.reconnect_delay = Duration::from_millis(50);
    settings.connector.stream_idle_timeout = Duration::from_secs(5);
    settings.server.subscribe_timeout = Duration::from_millis(500);
    settings
}

async fn start_server(
    venue: MockVenue,
    settings: Settings,
) -> (SocketAddr, watch::Sender<bool>, Router) {
    let router = Router::builder(settings.clone())
        .with_venue(Arc::new(venue))
        .build()
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::serve(
        listener,
        router.clone(),
        Arc::new(settings),
        shutdown_rx,
    ));
    (addr, shutdown_tx, router)
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

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

async fn send_text(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string().into()))
        .await
        .unwrap();
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("server sent nothing in time")
            .expect("connection ended while waiting for an event")
            .expect("websocket error while waiting for an event");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn connection_closes(client: &mut Client) {
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "server kept the connection open");
}

/// Envelope without symbols: a single WS_SUBSCRIBE_REJECTED error event,
/// echoing the exchange, then the connection closes.
#[tokio::test(flavor = "multi_thread")]
async fn missing_symbols_reject_the_subscription() {
    let (addr, _guard, _router) =
        start_server(MockVenue::new("ws://127.0.0.1:1/"), test_settings()).await;
    let mut client = connect(addr).await;

    send_text(&mut client, &json!({"exchange": "binance"}).to_string()).await;

    let event = next_json(&mut client).await;
    assert_eq!(event["type"], "error");
    assert_eq!(event["code"], "WS_SUBSCRIBE_REJECTED");
    assert_eq!(event["exchange"], "binance");
    connection_closes(&mut client).await;
}

/// Non-JSON envelope: a single WS_PROTOCOL_ERROR error event.
#[tokio::test(flavor = "multi_thread")]
async fn malformed_envelope_is_a_protocol_error() {
    let (addr, _guard, _router) =
        start_server(MockVenue::new("ws://127.0.0.1:1/"), test_settings()).await;
    let mut client = connect(addr).await;

    send_text(&mut client, "{not-json").await;

    let event = next_json(&mut client).await;
    assert_eq!(event["type"], "error");
    assert_eq!(event["code"], "WS_PROTOCOL_ERROR");
    connection_closes(&mut client).await;
}

/// No envelope at all: the subscribe timeout fires with WS_STREAM_TIMEOUT.
#[tokio::test(flavor = "multi_thread")]
async fn subscribe_timeout_is_reported() {
    let (addr, _guard, _router) =
        start_server(MockVenue::new("ws://127.0.0.1:1/"), test_settings()).await;
    let mut client = connect(addr).await;

    let event = next_json(&mut client).await;
    assert_eq!(event["code"], "WS_STREAM_TIMEOUT");
    connection_closes(&mut client).await;
}

/// Unknown contract family: acknowledged, then UNSUPPORTED_CONTRACT_TYPE.
#[tokio::test(flavor = "multi_thread")]
async fn unknown_family_is_unsupported() {
    let fixture = spawn_fixture(vec![]).await;
    let (addr, _guard, _router) =
        start_server(MockVenue::new(format!("ws://{fixture}")), test_settings()).await;
    let mut client = connect(addr).await;

    send_text(
        &mut client,
        &json!({"exchange": "mock", "symbols": ["BTCUSDT"], "contract_type": "swap"}).to_string(),
    )
    .await;

    let ack = next_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    let event = next_json(&mut client).await;
    assert_eq!(event["code"], "UNSUPPORTED_CONTRACT_TYPE");
    assert_eq!(event["exchange"], "mock");
    connection_closes(&mut client).await;
}

/// Unreachable venue: the engine exhausts its breaker budget and the client
/// sees WS_CONNECT_FAILED echoing the subscription context.
#[tokio::test(flavor = "multi_thread")]
async fn connect_failure_reaches_the_client() {
    let refused = refused_addr().await;
    let mut settings = test_settings();
    settings.connector.breaker_failure_threshold = 1;
    settings.connector.breaker_recovery_timeout = Duration::from_millis(20);
    settings.connector.reconnect_delay = Duration::from_millis(10);
    let (addr, _guard, _router) =
        start_server(MockVenue::new(format!("ws://{refused}")), settings).await;
    let mut client = connect(addr).await;

    send_text(
        &mut client,
        &json!({"exchange": "mock", "symbols": ["BTCUSDT"], "contract_type": "spot"}).to_string(),
    )
    .await;

    let ack = next_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    let event = next_json(&mut client).await;
    assert_eq!(event["code"], "WS_CONNECT_FAILED");
    assert_eq!(event["exchange"], "mock");
    assert_eq!(event["contract_type"], "spot");
    assert_eq!(event["symbols"], json!(["BTCUSDT"]));
    connection_closes(&mut client).await;
}

/// Venue rejects the subscription with rate-limit wording: RATE_LIMITED with
/// the venue's verbatim message attached.
#[tokio::test(flavor = "multi_thread")]
async fn rate_limited_rejection_is_classified() {
    let fixture = spawn_fixture(vec![Script::Silent]).await;
    let venue = MockVenue::new(format!("ws://{fixture}"))
        .rejecting("rate limit", Some("rate limit".to_string()));
    let (addr, _guard, _router) = start_server(venue, test_settings()).await;
    let mut client = connect(addr).await;

    send_text(
        &mut client,
        &json!({"exchange": "mock", "symbols": ["BTCUSDT"]}).to_string(),
    )
    .await;

    let ack = next_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    let event = next_json(&mut client).await;
    assert_eq!(event["code"], "RATE_LIMITED");
    assert_eq!(event["exchange_message"], "rate limit");
    connection_closes(&mut client).await;
}

/// A quiet stream trips the downstream idle timeout.
#[tokio::test(flavor = "multi_thread")]
async fn stream_idle_timeout_cancels_the_subscription() {
    let fixture = spawn_fixture(vec![Script::Silent]).await;
    let mut settings = test_settings();
    settings.connector.stream_idle_timeout = Duration::from_millis(300);
    let (addr, _guard, _router) =
        start_server(MockVenue::new(format!("ws://{fixture}")), settings).await;
    let mut client = connect(addr).await;

    send_text(
        &mut client,
        &json!({"exchange": "mock", "symbols": ["BTCUSDT"]}).to_string(),
    )
    .await;

    let ack = next_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    let event = next_json(&mut client).await;
    assert_eq!(event["code"], "WS_STREAM_TIMEOUT");
    connection_closes(&mut client).await;
}

/// Happy path: acknowledgement, normalized candle events, and the limit
/// closing the stream after exactly `limit` deliveries.
#[tokio::test(flavor = "multi_thread")]
async fn candle_events_flow_until_the_limit() {
    let frames = vec![
        frame_for(&quote("BTCUSDT", 1_704_067_200_000, false)),
        frame_for(&quote("BTCUSDT", 1_704_067_260_000, true)),
        frame_for(&quote("BTCUSDT", 1_704_067_320_000, true)),
    ];
    let fixture = spawn_fixture(vec![Script::DelayThenSend(
        Duration::from_millis(200),
        frames,
    )])
    .await;
    let (addr, _guard, _router) =
        start_server(MockVenue::new(format!("ws://{fixture}")), test_settings()).await;
    let mut client = connect(addr).await;

    send_text(
        &mut client,
        &json!({"exchange": "mock", "symbols": ["BTCUSDT"], "limit": 2}).to_string(),
    )
    .await;

    let ack = next_json(&mut client).await;
    assert_eq!(
        ack,
        json!({
            "type": "subscribed",
            "exchange": "mock",
            "contract_type": null,
            "symbols": ["BTCUSDT"],
            "limit": 2
        })
    );

    let first = next_json(&mut client).await;
    assert_eq!(first["e"], "candle");
    assert_eq!(first["s"], "BTCUSDT");
    assert_eq!(first["k"]["t"], 1_704_067_200_000i64);
    assert_eq!(first["k"]["i"], "1m");
    assert_eq!(first["k"]["x"], false);
    assert!(first["E"].as_i64().is_some());

    let second = next_json(&mut client).await;
    assert_eq!(second["k"]["t"], 1_704_067_260_000i64);
    assert_eq!(second["k"]["x"], true);

    // Limit reached: the server closes without a third candle.
    connection_closes(&mut client).await;
}

/// The global shutdown signal cancels live upstream sessions, not just the
/// accept loop: an engine still streaming for a subscribed client is torn
/// down and its registry entry released.
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_active_upstream_sessions() {
    let fixture = spawn_fixture(vec![Script::Silent]).await;
    let (addr, shutdown, router) =
        start_server(MockVenue::new(format!("ws://{fixture}")), test_settings()).await;
    let mut client = connect(addr).await;

    send_text(
        &mut client,
        &json!({"exchange": "mock", "symbols": ["BTCUSDT"]}).to_string(),
    )
    .await;
    let ack = next_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    wait_for_sessions(&router, "mock", 1).await;

    shutdown.send(true).unwrap();

    wait_for_sessions(&router, "mock", 0).await;
    // The subscribed client observes its stream ending.
    connection_closes(&mut client).await;
}
