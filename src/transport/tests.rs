use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use super::message::{decode, encode};
use super::{Endpoints, bind_and_run, run_relay};
use crate::config::{BindConfig, Endpoint, RelaySettings};
use crate::relay::message::{Directive, Message};
use crate::relay::{Relay, SharedRelay, lock, shared};
use crate::utils::RelayError;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    frontend: SocketAddr,
    backend: SocketAddr,
    relay: SharedRelay,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), RelayError>>,
}

fn loopback(frontend_port: u16, backend_port: u16) -> BindConfig {
    BindConfig {
        scheme: "tcp".to_string(),
        frontend: Endpoint::new("127.0.0.1", frontend_port),
        backend: Endpoint::new("127.0.0.1", backend_port),
    }
}

async fn start_relay(settings: RelaySettings) -> TestRelay {
    let endpoints = Endpoints::bind(&loopback(0, 0)).await.expect("bind");
    let frontend = endpoints.frontend_addr().unwrap();
    let backend = endpoints.backend_addr().unwrap();
    let relay = shared();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_relay(endpoints, relay.clone(), settings, shutdown_rx));
    TestRelay {
        frontend,
        backend,
        relay,
        shutdown,
        handle,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("websocket handshake failed");
    ws
}

async fn send(client: &mut Client, message: &Message) {
    client
        .send(WsMessage::binary(encode(message)))
        .await
        .expect("send failed");
}

async fn send_control(client: &mut Client, directive: Directive) {
    send(client, &directive.to_message()).await;
}

/// Next binary message, failing the test after two seconds.
async fn recv(client: &mut Client) -> Message {
    timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Binary(data))) => return decode(&data).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

/// Whether nothing arrives within a short window.
async fn stays_silent(client: &mut Client) -> bool {
    timeout(Duration::from_millis(200), client.next()).await.is_err()
}

async fn wait_until(relay: &SharedRelay, cond: impl Fn(&Relay) -> bool) {
    for _ in 0..500 {
        let done = {
            let relay = lock(relay);
            cond(&*relay)
        };
        if done {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never reached the expected state");
}

#[test]
fn codec_keeps_frames_and_empty_frames() {
    let message = Message::new(vec![b"topic".to_vec(), Vec::new(), vec![0, 1, 2]]).unwrap();
    let payload = encode(&message);
    assert_eq!(&payload[..9], &[0, 0, 0, 5, b't', b'o', b'p', b'i', b'c']);
    assert_eq!(payload.len(), 4 + 5 + 4 + 4 + 3);
    assert_eq!(decode(&payload).unwrap(), message);
}

#[test]
fn codec_rejects_bad_payloads() {
    assert!(matches!(decode(&[]), Err(RelayError::EmptyMessage)));
    assert!(matches!(
        decode(&[0, 0, 1]),
        Err(RelayError::TruncatedFrame { needed: 4, available: 3 })
    ));
    assert!(matches!(
        decode(&[0, 0, 0, 9, b'a']),
        Err(RelayError::TruncatedFrame { needed: 9, available: 1 })
    ));
    // a valid frame followed by a dangling header
    assert!(matches!(
        decode(&[0, 0, 0, 1, b'a', 0, 0]),
        Err(RelayError::TruncatedFrame { .. })
    ));
}

#[tokio::test]
async fn subscriber_receives_only_matching_messages() {
    let test = start_relay(RelaySettings::default()).await;

    let mut subscriber = connect(test.backend).await;
    send_control(&mut subscriber, Directive::Subscribe(b"A".to_vec())).await;
    wait_until(&test.relay, |r| r.aggregate.count(b"A") == 1).await;

    let mut publisher = connect(test.frontend).await;
    // a late publisher learns the existing subscription
    assert_eq!(
        Directive::parse(&recv(&mut publisher).await).unwrap(),
        Directive::Subscribe(b"A".to_vec())
    );

    let ab = Message::with_topic("AB", vec![b"first".to_vec(), b"second".to_vec()]);
    let b = Message::with_topic("B", vec![b"skipped".to_vec()]);
    let ac = Message::with_topic("AC", vec![b"last".to_vec()]);
    send(&mut publisher, &ab).await;
    send(&mut publisher, &b).await;
    send(&mut publisher, &ac).await;

    assert_eq!(recv(&mut subscriber).await, ab);
    assert_eq!(recv(&mut subscriber).await, ac);
    assert!(stays_silent(&mut subscriber).await);

    let _ = test.shutdown.send(true);
}

#[tokio::test]
async fn empty_subscription_receives_everything() {
    let test = start_relay(RelaySettings::default()).await;

    let mut subscriber = connect(test.backend).await;
    send_control(&mut subscriber, Directive::Subscribe(Vec::new())).await;
    wait_until(&test.relay, |r| r.aggregate.count(b"") == 1).await;

    let mut publisher = connect(test.frontend).await;
    let _replayed = recv(&mut publisher).await;

    for topic in ["x", "y", ""] {
        let message = Message::with_topic(topic, vec![b"payload".to_vec()]);
        send(&mut publisher, &message).await;
        assert_eq!(recv(&mut subscriber).await, message);
    }

    let _ = test.shutdown.send(true);
}

#[tokio::test]
async fn directives_forwarded_once_per_prefix() {
    let test = start_relay(RelaySettings::default()).await;
    let mut publisher = connect(test.frontend).await;
    wait_until(&test.relay, |r| r.publishers.len() == 1).await;

    let mut first = connect(test.backend).await;
    let mut second = connect(test.backend).await;
    let mut third = connect(test.backend).await;
    for subscriber in [&mut first, &mut second, &mut third] {
        send_control(subscriber, Directive::Subscribe(b"P".to_vec())).await;
    }
    wait_until(&test.relay, |r| r.aggregate.count(b"P") == 3).await;

    assert_eq!(
        Directive::parse(&recv(&mut publisher).await).unwrap(),
        Directive::Subscribe(b"P".to_vec())
    );
    assert!(stays_silent(&mut publisher).await);

    // one explicit unsubscribe, one clean close, one abrupt drop
    send_control(&mut second, Directive::Unsubscribe(b"P".to_vec())).await;
    first.close(None).await.expect("close");
    drop(third);
    wait_until(&test.relay, |r| r.aggregate.is_empty()).await;

    assert_eq!(
        Directive::parse(&recv(&mut publisher).await).unwrap(),
        Directive::Unsubscribe(b"P".to_vec())
    );
    assert!(stays_silent(&mut publisher).await);

    let _ = test.shutdown.send(true);
}

#[tokio::test]
async fn disconnecting_one_subscriber_keeps_others_flowing() {
    let test = start_relay(RelaySettings::default()).await;

    let mut leaving = connect(test.backend).await;
    let mut staying = connect(test.backend).await;
    send_control(&mut leaving, Directive::Subscribe(b"t".to_vec())).await;
    send_control(&mut staying, Directive::Subscribe(b"t".to_vec())).await;
    wait_until(&test.relay, |r| r.aggregate.count(b"t") == 2).await;

    let mut publisher = connect(test.frontend).await;
    let _replayed = recv(&mut publisher).await;

    let before = Message::with_topic("t", vec![b"1".to_vec()]);
    send(&mut publisher, &before).await;
    assert_eq!(recv(&mut leaving).await, before);
    assert_eq!(recv(&mut staying).await, before);

    drop(leaving);
    wait_until(&test.relay, |r| r.subscribers.len() == 1).await;

    for i in 2..5u8 {
        let message = Message::with_topic("t", vec![vec![i]]);
        send(&mut publisher, &message).await;
        assert_eq!(recv(&mut staying).await, message);
    }

    let _ = test.shutdown.send(true);
}

#[tokio::test]
async fn malformed_control_frame_closes_only_that_subscriber() {
    let test = start_relay(RelaySettings::default()).await;

    let mut bad = connect(test.backend).await;
    let mut good = connect(test.backend).await;
    send_control(&mut good, Directive::Subscribe(b"t".to_vec())).await;
    send_control(&mut bad, Directive::Subscribe(b"t".to_vec())).await;
    wait_until(&test.relay, |r| r.aggregate.count(b"t") == 2).await;

    let garbage = Message::new(vec![vec![9, b't']]).unwrap();
    send(&mut bad, &garbage).await;

    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match bad.next().await {
                Some(Ok(WsMessage::Binary(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "malformed subscriber should be disconnected");
    wait_until(&test.relay, |r| r.subscribers.len() == 1).await;
    assert_eq!(lock(&test.relay).aggregate.count(b"t"), 1);

    let mut publisher = connect(test.frontend).await;
    let _replayed = recv(&mut publisher).await;
    let message = Message::with_topic("t", Vec::new());
    send(&mut publisher, &message).await;
    assert_eq!(recv(&mut good).await, message);

    let _ = test.shutdown.send(true);
}

#[tokio::test]
async fn connections_over_the_limit_are_rejected() {
    let settings = RelaySettings {
        max_connections: 1,
        ..RelaySettings::default()
    };
    let test = start_relay(settings).await;

    let _first = connect(test.backend).await;
    wait_until(&test.relay, |r| r.subscribers.len() == 1).await;

    let second = connect_async(format!("ws://{}", test.backend)).await;
    assert!(second.is_err());
    assert_eq!(lock(&test.relay).subscribers.len(), 1);

    let _ = test.shutdown.send(true);
}

#[tokio::test]
async fn concurrent_connections_respect_the_limit() {
    let settings = RelaySettings {
        max_connections: 1,
        ..RelaySettings::default()
    };
    let test = start_relay(settings).await;

    let url = format!("ws://{}", test.backend);
    let (a, b, c) = tokio::join!(
        connect_async(url.as_str()),
        connect_async(url.as_str()),
        connect_async(url.as_str())
    );
    let accepted = [a.is_ok(), b.is_ok(), c.is_ok()]
        .into_iter()
        .filter(|ok| *ok)
        .count();
    assert_eq!(accepted, 1);

    wait_until(&test.relay, |r| r.subscribers.len() == 1).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(lock(&test.relay).subscribers.len(), 1);

    let _ = test.shutdown.send(true);
}

#[tokio::test]
async fn publisher_that_never_reads_is_still_consumed() {
    let test = start_relay(RelaySettings::default()).await;

    // directives are written to it but it never reads them
    let mut publisher = connect(test.frontend).await;
    wait_until(&test.relay, |r| r.publishers.len() == 1).await;

    let mut subscriber = connect(test.backend).await;
    send_control(&mut subscriber, Directive::Subscribe(b"t".to_vec())).await;

    let churn = vec![b'x'; 64 * 1024];
    for _ in 0..300 {
        send_control(&mut subscriber, Directive::Subscribe(churn.clone())).await;
        send_control(&mut subscriber, Directive::Unsubscribe(churn.clone())).await;
    }
    send_control(&mut subscriber, Directive::Subscribe(b"done".to_vec())).await;
    wait_until(&test.relay, |r| r.aggregate.count(b"done") == 1).await;

    let message = Message::with_topic("t", vec![b"still flowing".to_vec()]);
    send(&mut publisher, &message).await;
    assert_eq!(recv(&mut subscriber).await, message);

    let _ = test.shutdown.send(true);
}

#[tokio::test]
async fn backend_bind_failure_returns_before_serving() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = taken.local_addr().unwrap().port();
    let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let frontend_port = free.local_addr().unwrap().port();
    drop(free);

    let relay = shared();
    let (_shutdown, shutdown_rx) = watch::channel(false);
    let result = timeout(
        Duration::from_secs(1),
        bind_and_run(
            &loopback(frontend_port, backend_port),
            relay.clone(),
            RelaySettings::default(),
            shutdown_rx,
        ),
    )
    .await
    .expect("relay kept running after a failed bind");

    assert!(matches!(
        result,
        Err(RelayError::Bind {
            endpoint: "backend",
            ..
        })
    ));
    // the frontend was bound first and has been released again
    TcpListener::bind(("127.0.0.1", frontend_port))
        .await
        .expect("frontend still bound");
    assert!(lock(&relay).publishers.is_empty());
}

#[tokio::test]
async fn bind_failure_names_the_endpoint() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = Endpoints::bind(&loopback(0, port))
        .await
        .expect_err("backend port is taken");
    assert_eq!(err.exit_code(), 1);
    match err {
        RelayError::Bind { endpoint, .. } => assert_eq!(endpoint, "backend"),
        other => panic!("expected a bind error, got {other:?}"),
    }

    match Endpoints::bind(&loopback(port, 0)).await {
        Err(RelayError::Bind { endpoint, url, .. }) => {
            assert_eq!(endpoint, "frontend");
            assert_eq!(url, format!("tcp://127.0.0.1:{port}"));
        }
        other => panic!("expected a bind error, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_stops_relay_promptly() {
    let test = start_relay(RelaySettings::default()).await;

    let mut subscriber = connect(test.backend).await;
    let _publisher = connect(test.frontend).await;
    wait_until(&test.relay, |r| {
        r.subscribers.len() == 1 && r.publishers.len() == 1
    })
    .await;

    test.shutdown.send(true).unwrap();
    let result = timeout(Duration::from_secs(1), test.handle)
        .await
        .expect("relay did not stop in time")
        .expect("relay task panicked");
    assert!(result.is_ok());

    // aborted connection tasks deregister themselves
    let relay = lock(&test.relay);
    assert!(relay.subscribers.is_empty());
    assert!(relay.publishers.is_empty());
    drop(relay);

    let ended = timeout(Duration::from_secs(1), subscriber.next()).await;
    assert!(matches!(ended, Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_))))));

    // both addresses are released
    TcpListener::bind(test.frontend).await.expect("frontend still bound");
    TcpListener::bind(test.backend).await.expect("backend still bound");
}

#[tokio::test]
async fn text_frames_are_rejected() {
    let test = start_relay(RelaySettings::default()).await;

    let mut publisher = connect(test.frontend).await;
    wait_until(&test.relay, |r| r.publishers.len() == 1).await;

    publisher
        .send(WsMessage::Text("hello".to_string().into()))
        .await
        .expect("send");
    wait_until(&test.relay, |r| r.publishers.is_empty()).await;

    let _ = test.shutdown.send(true);
}
