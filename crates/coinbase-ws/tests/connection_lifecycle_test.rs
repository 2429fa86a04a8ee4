mod common;

use std::{sync::atomic::Ordering, time::Duration};

use coinbase_ws::{
    error::WsError,
    websocket::{ConnectionState, TopicRequest, WsClient, WsEvent, WsKey},
};
use common::*;
use futures::future::join_all;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_concurrent_connects_share_one_socket() {
    let (connector, mut conns) = MockConnector::new();
    let connector = connector.with_delay(Duration::from_millis(50));
    let connects = connector.connects.clone();
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();

    let results = join_all((0..5).map(|_| client.connect(WsKey::ExchangeMarketData))).await;
    for result in results {
        assert_eq!(result.unwrap(), WsKey::ExchangeMarketData);
    }
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    let conn = next_conn(&mut conns).await;
    assert_eq!(conn.url, "ws://mock/exchangeMarketData");

    // Already open: resolves without a new socket.
    client.connect(WsKey::ExchangeMarketData).await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert!(client.is_connected(WsKey::ExchangeMarketData).await.unwrap());
    assert_eq!(
        client
            .connection_state(WsKey::ExchangeMarketData)
            .await
            .unwrap(),
        Some(ConnectionState::Connected)
    );
}

#[tokio::test]
async fn test_keys_get_separate_sockets() {
    let (connector, mut conns) = MockConnector::new();
    let connects = connector.connects.clone();
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();

    client
        .connect_all(&[WsKey::ExchangeMarketData, WsKey::AdvTradeMarketData])
        .await
        .unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    let mut urls = vec![next_conn(&mut conns).await.url, next_conn(&mut conns).await.url];
    urls.sort();
    assert_eq!(
        urls,
        vec!["ws://mock/advTradeMarketData", "ws://mock/exchangeMarketData"]
    );
}

#[tokio::test]
async fn test_open_event_precedes_ready() {
    let (connector, mut conns) = MockConnector::new();
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();
    let mut events = client.events();

    client.connect(WsKey::ExchangeMarketData).await.unwrap();
    let _conn = next_conn(&mut conns).await;
    assert_eq!(
        next_event(&mut events).await,
        WsEvent::Open {
            ws_key: WsKey::ExchangeMarketData
        }
    );
}

#[tokio::test]
async fn test_unexpected_close_reconnects_and_resubscribes() {
    let (connector, mut conns) = MockConnector::new();
    let connects = connector.connects.clone();
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();
    let mut events = client.events();
    let key = WsKey::ExchangeMarketData;

    client.subscribe(["ticker", "level2"], key).await.unwrap();
    let mut first = next_conn(&mut conns).await;
    assert_eq!(
        first.recv_json().await,
        json!({"op": "subscribe", "topics": ["ticker", "level2"]})
    );
    wait_for(&mut events, |e| matches!(e, WsEvent::Open { .. })).await;

    first.hang_up();
    assert_eq!(
        next_event(&mut events).await,
        WsEvent::Reconnect { ws_key: key }
    );

    // Dropped while the reconnect is pending: must not be resent.
    client.unsubscribe(["level2"], key).await.unwrap();

    let mut second = next_conn(&mut conns).await;
    assert_eq!(
        wait_for(&mut events, |e| !matches!(e, WsEvent::Exception { .. })).await,
        WsEvent::Reconnected { ws_key: key }
    );
    assert_eq!(
        second.recv_json().await,
        json!({"op": "subscribe", "topics": ["ticker"]})
    );
    second.expect_silence(Duration::from_millis(100)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        client.subscribed_topics(key).await.unwrap(),
        vec![TopicRequest::new("ticker")]
    );
}

#[tokio::test]
async fn test_deliberate_close_does_not_reconnect() {
    let (connector, mut conns) = MockConnector::new();
    let connects = connector.connects.clone();
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();
    let mut events = client.events();
    let key = WsKey::ExchangeMarketData;

    client.connect(key).await.unwrap();
    let mut conn = next_conn(&mut conns).await;
    wait_for(&mut events, |e| matches!(e, WsEvent::Open { .. })).await;

    client.close(key, false).await.unwrap();
    assert_eq!(conn.recv_frame().await, Some(Message::Close(None)));
    // Peer answers the close handshake.
    conn.hang_up();

    assert_eq!(next_event(&mut events).await, WsEvent::Close { ws_key: key });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(
        client.connection_state(key).await.unwrap(),
        Some(ConnectionState::Initial)
    );
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_graceful_close_times_out_without_peer() {
    let (connector, mut conns) = MockConnector::new();
    let config = fast_config().connect_timeout(Duration::from_millis(100));
    let client = WsClient::with_connector(config, TestAdapter, connector).unwrap();
    let mut events = client.events();
    let key = WsKey::ExchangeMarketData;

    client.connect(key).await.unwrap();
    let _conn = next_conn(&mut conns).await;

    client.close(key, false).await.unwrap();
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, WsEvent::Close { .. })).await,
        WsEvent::Close { ws_key: key }
    );
}

#[tokio::test]
async fn test_forced_close_completes_immediately() {
    let (connector, mut conns) = MockConnector::new();
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();
    let mut events = client.events();
    let key = WsKey::AdvTradeMarketData;

    client.connect(key).await.unwrap();
    let mut conn = next_conn(&mut conns).await;
    wait_for(&mut events, |e| matches!(e, WsEvent::Open { .. })).await;

    client.close(key, true).await.unwrap();
    assert_eq!(next_event(&mut events).await, WsEvent::Close { ws_key: key });
    // The socket was torn down without a close frame.
    assert_eq!(conn.recv_frame().await, None);
}

#[tokio::test]
async fn test_close_during_connect_rejects_waiters() {
    let (connector, _conns) = MockConnector::new();
    let connector = connector.with_delay(Duration::from_millis(200));
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();
    let key = WsKey::ExchangeMarketData;

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(key).await })
    };
    settle().await;
    client.close(key, false).await.unwrap();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(WsError::Disconnected { .. })));
    assert_eq!(
        client.connection_state(key).await.unwrap(),
        Some(ConnectionState::Initial)
    );
}

#[tokio::test]
async fn test_connect_failure_emits_exception_and_retries() {
    let (connector, mut conns) = MockConnector::new();
    let connector = connector.failing(1);
    let connects = connector.connects.clone();
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();
    let mut events = client.events();
    let key = WsKey::ExchangeMarketData;

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(key).await })
    };

    match next_event(&mut events).await {
        WsEvent::Exception { ws_key, message, .. } => {
            assert_eq!(ws_key, key);
            assert!(message.contains("503"), "{message}");
        }
        other => panic!("expected exception, got {other:?}"),
    }
    assert_eq!(next_event(&mut events).await, WsEvent::Reconnect { ws_key: key });

    let _conn = next_conn(&mut conns).await;
    assert_eq!(
        next_event(&mut events).await,
        WsEvent::Reconnected { ws_key: key }
    );
    // The original caller is settled by the retry.
    assert_eq!(waiter.await.unwrap().unwrap(), key);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_sandbox_endpoint_is_config_error() {
    use coinbase_ws::websocket::handlers::CoinbaseAdapter;

    let (connector, _conns) = MockConnector::new();
    let connects = connector.connects.clone();
    let config = fast_config().use_sandbox(true);
    let client = WsClient::with_connector(config, CoinbaseAdapter::new(), connector).unwrap();
    let mut events = client.events();

    let result = client.connect(WsKey::PrimeMarketData).await;
    assert!(matches!(result, Err(WsError::Config { .. })));
    assert!(matches!(
        next_event(&mut events).await,
        WsEvent::Exception { .. }
    ));
    settle().await;
    assert_eq!(connects.load(Ordering::SeqCst), 0);
    assert_eq!(
        client
            .connection_state(WsKey::PrimeMarketData)
            .await
            .unwrap(),
        Some(ConnectionState::Initial)
    );
}

#[tokio::test]
async fn test_missed_pong_reconnects() {
    let (connector, mut conns) = MockConnector::new();
    let config = fast_config()
        .ping_interval(Duration::from_millis(50))
        .pong_timeout(Duration::from_millis(50));
    let client = WsClient::with_connector(config, TestAdapter, connector).unwrap();
    let mut events = client.events();
    let key = WsKey::ExchangeMarketData;

    client.connect(key).await.unwrap();
    let mut first = next_conn(&mut conns).await;
    wait_for(&mut events, |e| matches!(e, WsEvent::Open { .. })).await;

    assert!(matches!(first.recv_frame().await, Some(Message::Ping(_))));
    // No answer: the pong timer fires.
    assert_eq!(
        next_event(&mut events).await,
        WsEvent::Reconnect { ws_key: key }
    );
    let _second = next_conn(&mut conns).await;
    assert_eq!(
        next_event(&mut events).await,
        WsEvent::Reconnected { ws_key: key }
    );
}

#[tokio::test]
async fn test_pong_keeps_connection_alive() {
    let (connector, mut conns) = MockConnector::new();
    let connects = connector.connects.clone();
    let config = fast_config()
        .ping_interval(Duration::from_millis(40))
        .pong_timeout(Duration::from_millis(30));
    let client = WsClient::with_connector(config, TestAdapter, connector).unwrap();
    let mut events = client.events();
    let key = WsKey::ExchangeMarketData;

    client.connect(key).await.unwrap();
    let mut conn = next_conn(&mut conns).await;
    wait_for(&mut events, |e| matches!(e, WsEvent::Open { .. })).await;

    let mut pings = 0;
    while pings < 4 {
        match conn.recv_frame().await {
            Some(Message::Ping(payload)) => {
                conn.send_frame(Message::Pong(payload));
                pings += 1;
            }
            other => panic!("expected ping, got {other:?}"),
        }
    }
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert!(events.try_recv().is_none());
    assert!(client.is_connected(key).await.unwrap());
}

#[tokio::test]
async fn test_dropping_client_shuts_down() {
    let (connector, mut conns) = MockConnector::new();
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();
    let mut events = client.events();

    client.connect(WsKey::ExchangeMarketData).await.unwrap();
    let mut conn = next_conn(&mut conns).await;
    drop(client);

    // The actor closes the socket on the way out.
    assert_eq!(conn.recv_frame().await, Some(Message::Close(None)));
    let drained = tokio::time::timeout(WAIT, async { while events.recv().await.is_some() {} }).await;
    assert!(drained.is_ok(), "event bus stayed open after the client was dropped");
}

#[tokio::test]
async fn test_ping_is_skipped_while_pong_outstanding() {
    let (connector, mut conns) = MockConnector::new();
    let config = fast_config()
        .ping_interval(Duration::from_millis(20))
        .pong_timeout(Duration::from_millis(200));
    let client = WsClient::with_connector(config, TestAdapter, connector).unwrap();
    let key = WsKey::ExchangeMarketData;

    client.connect(key).await.unwrap();
    let mut conn = next_conn(&mut conns).await;

    // Several ping ticks elapse inside one pong window; only the first sends.
    let mut pings = 0;
    let _ = tokio::time::timeout(Duration::from_millis(150), async {
        while let Some(frame) = conn.recv_frame().await {
            if matches!(frame, Message::Ping(_)) {
                pings += 1;
            }
        }
    })
    .await;
    assert_eq!(pings, 1);
    assert!(client.is_connected(key).await.unwrap());
}

#[tokio::test]
async fn test_close_during_connect_rejects_every_waiter() {
    let (connector, _conns) = MockConnector::new();
    let connector = connector.with_delay(Duration::from_millis(200));
    let connects = connector.connects.clone();
    let client = WsClient::with_connector(fast_config(), TestAdapter, connector).unwrap();
    let key = WsKey::InternationalMarketData;

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.connect(key).await })
        })
        .collect();
    settle().await;
    client.close(key, false).await.unwrap();

    for waiter in waiters {
        assert!(matches!(
            waiter.await.unwrap(),
            Err(WsError::Disconnected { ws_key }) if ws_key == key
        ));
    }
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}
