mod common;

use std::time::Duration;

use common::{WAIT, connect};
use tokio::time::timeout;
use winmount_client::rpc::{CLIENT_VERSION, Connection, Phase};
use winmount_client::transport::memory;
use winmount_client::{Client, Error, TransportError};

#[tokio::test]
async fn test_accept_captures_daemon_version() {
    let (client, _peer) = connect("9.9.9").await;
    assert_eq!(client.daemon_version(), "9.9.9");
    assert_eq!(client.connection().state(), Phase::Open);
}

#[tokio::test]
async fn test_handshake_announces_client_version() {
    let (connector, peer) = memory::pair();
    let (result, hello) = tokio::join!(
        Connection::connect(&connector, "memory://daemon"),
        async {
            let hello = peer.recv_frame().await;
            peer.send_text("WinMount accept v0.1.0").unwrap();
            hello
        }
    );
    result.expect("connect");
    assert_eq!(
        hello.as_deref(),
        Some(format!("WinMount connect v{CLIENT_VERSION}").as_str())
    );
}

#[tokio::test]
async fn test_reject_frame_fails_connect() {
    let (connector, peer) = memory::pair();
    let (result, _) = tokio::join!(Client::connect_with(&connector, "memory://daemon"), async {
        peer.recv_frame().await;
        peer.send_text("WinMount reject v2.0.0").unwrap();
    });

    match result {
        Err(Error::HandshakeRejected(reason)) => assert!(reason.contains("2.0.0")),
        other => panic!("expected HandshakeRejected, got {other:?}"),
    }
    assert!(peer.is_closed(), "half-open transport must be released");
}

#[tokio::test]
async fn test_unexpected_first_frame_fails_connect() {
    let (connector, peer) = memory::pair();
    let (result, _) = tokio::join!(Client::connect_with(&connector, "memory://daemon"), async {
        peer.recv_frame().await;
        peer.send_text(r#"{"type":"response","syn":0,"code":0}"#).unwrap();
    });
    assert!(matches!(result, Err(Error::HandshakeRejected(_))));
}

#[tokio::test]
async fn test_disconnect_before_reply_fails_connect() {
    let (connector, peer) = memory::pair();
    let (result, _) = tokio::join!(Client::connect_with(&connector, "memory://daemon"), async {
        peer.recv_frame().await;
        peer.disconnect(None).unwrap();
    });
    assert!(matches!(result, Err(Error::HandshakeRejected(_))));
    assert!(peer.is_closed());
}

#[tokio::test]
async fn test_refused_transport_is_a_transport_error() {
    let (connector, peer) = memory::pair();
    peer.refuse_connections();
    let result = Client::connect_with(&connector, "memory://daemon").await;
    assert!(matches!(
        result,
        Err(Error::Transport(TransportError::Connect(_)))
    ));
}

#[tokio::test]
async fn test_cancelled_connect_closes_transport() {
    let (connector, peer) = memory::pair();

    // The peer reads the handshake but never answers.
    let attempt = timeout(
        Duration::from_millis(100),
        Client::connect_with(&connector, "memory://daemon"),
    );
    let (result, hello) = tokio::join!(attempt, peer.recv_frame());
    assert!(result.is_err(), "connect should still be waiting");
    assert!(hello.is_some());

    timeout(WAIT, peer.closed())
        .await
        .expect("transport left open after cancelled connect");
}
