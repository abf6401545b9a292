//! Hub plus client pumps, driven through in-memory streams and sinks in
//! place of real sockets.

use std::time::Duration;

use axum::extract::ws::Message;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use messenger::config::WebSocketSettings;
use messenger::presentation::websocket::{Client, Hub, HubHandle, PumpConfig};

type Inbound = fmpsc::UnboundedSender<Result<Message, axum::Error>>;
type Outbound = fmpsc::UnboundedReceiver<Message>;

fn spawn_hub(settings: &WebSocketSettings) -> (HubHandle, CancellationToken) {
    let (hub, handle) = Hub::new(settings);
    let shutdown = CancellationToken::new();
    tokio::spawn(hub.run(shutdown.clone()));
    (handle, shutdown)
}

/// Register a client and run both pumps over channel-backed "sockets".
fn connect(hub: &HubHandle, user_id: i64, config: PumpConfig) -> (std::sync::Arc<Client>, Inbound, Outbound) {
    let (client, queue) = Client::new(user_id, "pump-test", "127.0.0.1", hub.clone(), 16);
    hub.register(client.clone());

    let (inbound_tx, inbound_rx) = fmpsc::unbounded();
    let (outbound_tx, outbound_rx) = fmpsc::unbounded::<Message>();
    let sink = outbound_tx.sink_map_err(axum::Error::new);

    tokio::spawn(client.clone().write_pump(sink, queue, config.clone()));
    tokio::spawn(client.clone().read_pump(inbound_rx, config));
    (client, inbound_tx, outbound_rx)
}

fn quiet_settings() -> WebSocketSettings {
    WebSocketSettings {
        health_check_interval_secs: 0,
        ..WebSocketSettings::default()
    }
}

async fn next_text(outbound: &mut Outbound) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), outbound.next())
            .await
            .expect("no frame in time")
            .expect("socket closed");
        match frame {
            Message::Text(text) => return text.as_str().to_owned(),
            Message::Ping(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_inbound_frame_is_fanned_out_to_every_client() {
    let settings = quiet_settings();
    let (hub, _shutdown) = spawn_hub(&settings);
    let config = PumpConfig::from(&settings);

    let (_alice, alice_in, mut alice_out) = connect(&hub, 1, config.clone());
    let (_bob, _bob_in, mut bob_out) = connect(&hub, 2, config);
    assert_eq!(hub.client_count().await.unwrap(), 2);

    assert_ok!(alice_in.unbounded_send(Ok(Message::Text("hello".to_string().into()))));

    assert_eq!(next_text(&mut alice_out).await, "hello");
    assert_eq!(next_text(&mut bob_out).await, "hello");
}

#[tokio::test]
async fn test_peer_close_unregisters_client() {
    let settings = quiet_settings();
    let (hub, _shutdown) = spawn_hub(&settings);
    let (client, inbound, _outbound) = connect(&hub, 1, PumpConfig::from(&settings));
    assert_eq!(hub.client_count().await.unwrap(), 1);

    assert_ok!(inbound.unbounded_send(Ok(Message::Close(None))));

    tokio::time::timeout(Duration::from_secs(5), client.done().cancelled())
        .await
        .unwrap();
    assert!(!client.is_active());
    assert_eq!(hub.client_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_oversized_frame_drops_connection() {
    let settings = WebSocketSettings {
        max_message_size: 8,
        ..quiet_settings()
    };
    let (hub, _shutdown) = spawn_hub(&settings);
    let (client, inbound, _outbound) = connect(&hub, 1, PumpConfig::from(&settings));

    inbound
        .unbounded_send(Ok(Message::Text("far more than eight bytes".to_string().into())))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), client.done().cancelled())
        .await
        .unwrap();
    assert_eq!(hub.client_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_pings_close_the_client() {
    let settings = WebSocketSettings {
        ping_period_secs: 5,
        pong_wait_secs: 600,
        max_ping_failures: 3,
        ..quiet_settings()
    };
    let (hub, _shutdown) = spawn_hub(&settings);
    let (client, _inbound, mut outbound) = connect(&hub, 1, PumpConfig::from(&settings));

    tokio::time::timeout(Duration::from_secs(60), client.done().cancelled())
        .await
        .unwrap();

    let mut pings = 0;
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(1), outbound.next()).await {
        if matches!(frame, Message::Ping(_)) {
            pings += 1;
        }
    }
    assert_eq!(pings, 4);
    assert_eq!(hub.client_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pongs_keep_the_client_alive() {
    let settings = WebSocketSettings {
        ping_period_secs: 5,
        pong_wait_secs: 12,
        max_ping_failures: 2,
        ..quiet_settings()
    };
    let (hub, _shutdown) = spawn_hub(&settings);
    let (client, inbound, mut outbound) = connect(&hub, 1, PumpConfig::from(&settings));

    for _ in 0..6 {
        let frame = tokio::time::timeout(Duration::from_secs(10), outbound.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Message::Ping(_)));
        assert_ok!(inbound.unbounded_send(Ok(Message::Pong(Default::default()))));
    }

    assert!(client.is_active());
    assert_eq!(hub.client_count().await.unwrap(), 1);
}
