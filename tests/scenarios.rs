//! End-to-end coverage of the six concrete scenarios in §8: real loopback
//! `axum::serve` paired with the real `ClientTransport`.

use futures::StreamExt;
use sse_duplex::client::ClientTransport;
use sse_duplex::handler::{HandlerConfig, ServerHandler};
use sse_duplex::message::ClientId;
use std::time::Duration;

async fn spawn_server(config: HandlerConfig) -> (ServerHandler, url::Url) {
    let handler = ServerHandler::new(config);
    let router = handler.clone().router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    let url = format!("http://{addr}/sse").parse().unwrap();
    (handler, url)
}

async fn drain(duration_ms: u64) {
    tokio::time::sleep(Duration::from_millis(duration_ms)).await;
}

#[tokio::test]
async fn round_trip() {
    let (handler, url) = spawn_server(HandlerConfig::default()).await;
    let mut connections = handler.connections();

    let client = ClientTransport::connect(url, false);
    let connection = connections.next().await.unwrap();
    drain(20).await;

    // Server submits "blah" to the client over SSE...
    connection.sink().submit("blah").unwrap();
    let mut client_inbound = client.inbound();
    let at_client = tokio::time::timeout(Duration::from_secs(2), client_inbound.next())
        .await
        .expect("timed out")
        .expect("client inbound ended")
        .expect("client inbound error");
    assert_eq!(at_client.as_str(), "blah");

    // ...the client echoes it back over POST...
    client.submit(at_client).await.unwrap();

    // ...and the server's own stream observes exactly that echo.
    let mut server_inbound = connection.stream();
    let echoed = tokio::time::timeout(Duration::from_secs(2), server_inbound.next())
        .await
        .expect("timed out")
        .expect("stream ended");
    assert_eq!(echoed.as_str(), "blah");
}

#[tokio::test]
async fn multiple_clients_are_isolated() {
    let (handler, url) = spawn_server(HandlerConfig::default()).await;
    let mut connections = handler.connections();

    let client_a = ClientTransport::connect(url.clone(), false);
    let client_b = ClientTransport::connect(url, false);

    let conn1 = connections.next().await.unwrap();
    let conn2 = connections.next().await.unwrap();
    let (conn_a, conn_b) = if conn1.id().as_str() == client_a.id().as_str() {
        (conn1, conn2)
    } else {
        (conn2, conn1)
    };

    conn_a.sink().submit("foo").unwrap();
    conn_b.sink().submit("bar").unwrap();

    let mut inbound_a = client_a.inbound();
    let mut inbound_b = client_b.inbound();

    let got_a = tokio::time::timeout(Duration::from_secs(2), inbound_a.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let got_b = tokio::time::timeout(Duration::from_secs(2), inbound_b.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(got_a.as_str(), "foo");
    assert_eq!(got_b.as_str(), "bar");
}

#[tokio::test]
async fn server_initiated_close_decrements_client_count() {
    let (handler, url) = spawn_server(HandlerConfig::default()).await;
    let mut connections = handler.connections();
    assert_eq!(handler.number_of_clients(), 0);

    let _client = ClientTransport::connect(url, false);
    let connection = connections.next().await.unwrap();
    drain(20).await;
    assert_eq!(handler.number_of_clients(), 1);

    connection.sink().close().await;
    drain(20).await;

    assert!(connection.is_closed());
    assert_eq!(handler.number_of_clients(), 0);
}

#[tokio::test]
async fn client_initiated_close_via_control_ends_inbound_stream() {
    let (handler, url) = spawn_server(HandlerConfig::default()).await;
    let mut connections = handler.connections();

    let client = ClientTransport::connect(url, false);
    let connection = connections.next().await.unwrap();
    drain(20).await;

    connection.sink().send_close_control().await;
    drain(20).await;
    assert!(connection.is_closed());

    let mut inbound = client.inbound();
    let ended = tokio::time::timeout(Duration::from_secs(2), inbound.next()).await;
    match ended {
        Ok(Some(Err(_))) | Ok(None) => {}
        other => panic!("expected inbound stream to end or error, got {other:?}"),
    }
}

#[tokio::test]
async fn keep_alive_replays_buffered_messages_on_reattach() {
    let (handler, url) = spawn_server(HandlerConfig {
        path: "/sse".to_string(),
        keep_alive: Some(Duration::from_secs(5)),
    })
    .await;
    let mut connections = handler.connections();

    let id = ClientId::generate();
    let client = ClientTransport::connect_as(id.clone(), url.clone(), true);
    let connection = connections.next().await.unwrap();
    drain(20).await;

    connection.close_sink().await;
    drain(20).await;
    assert!(connection.is_in_keep_alive_period().await);
    assert_eq!(handler.number_of_clients(), 1);

    connection.sink().submit("one").unwrap();
    connection.sink().submit("two").unwrap();
    drain(20).await;
    assert!(!connection.is_closed());

    // `EventSource`'s own built-in retry reopens the subscription under the
    // same id without any action from this test; the server reattaches to
    // the existing keep-alive connection and replays the buffered messages.
    let mut inbound = client.inbound();
    let first = tokio::time::timeout(Duration::from_secs(5), inbound.next())
        .await
        .expect("timed out waiting for EventSource to reconnect")
        .expect("inbound stream ended")
        .expect("inbound error");
    assert_eq!(first.as_str(), "one");
}

#[tokio::test]
async fn no_keep_alive_drop_closes_connection_and_ends_stream() {
    let (handler, url) = spawn_server(HandlerConfig::default()).await;
    let mut connections = handler.connections();

    let _client = ClientTransport::connect(url, false);
    let connection = connections.next().await.unwrap();
    drain(20).await;

    connection.close_sink().await;
    drain(20).await;

    assert!(connection.is_closed());
    assert_eq!(handler.number_of_clients(), 0);
}
