#![allow(dead_code)]

use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::timeout;
use winmount_client::Client;
use winmount_client::transport::memory::{self, MemoryPeer};

pub const WAIT: Duration = Duration::from_secs(5);

/// Connects a client to a scripted peer that accepts with `version`.
pub async fn connect(version: &str) -> (Client, MemoryPeer) {
    let (connector, peer) = memory::pair();
    let accept = format!("WinMount accept v{version}");
    let (client, hello) = tokio::join!(
        Client::connect_with(&connector, "memory://daemon"),
        async {
            let hello = peer.recv_frame().await;
            peer.send_text(accept).expect("peer send");
            hello
        }
    );
    assert!(
        hello.expect("handshake frame").starts_with("WinMount connect v"),
        "unexpected handshake"
    );
    (client.expect("connect"), peer)
}

/// Reads the next request the client wrote.
pub async fn next_request(peer: &MemoryPeer) -> Value {
    let frame = timeout(WAIT, peer.recv_frame())
        .await
        .expect("timeout waiting for request")
        .expect("client closed");
    serde_json::from_str(&frame).expect("request is JSON")
}

pub fn syn_of(request: &Value) -> u64 {
    request["syn"].as_u64().expect("request has a syn")
}

pub fn respond(peer: &MemoryPeer, syn: u64, data: Value) {
    let frame = json!({"type": "response", "syn": syn, "code": 0, "msg": "", "data": data});
    peer.send_text(frame.to_string()).expect("peer send");
}

pub fn respond_error(peer: &MemoryPeer, syn: u64, code: i32, msg: &str) {
    let frame = json!({"type": "response", "syn": syn, "code": code, "msg": msg, "data": null});
    peer.send_text(frame.to_string()).expect("peer send");
}
