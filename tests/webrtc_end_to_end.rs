#[path = "common/mod.rs"]
mod common;

use tokio::time::Duration;

use common::{eventually, recv_within, start_node};
use overlay_dht::protocol::MessageType;
use overlay_dht::webrtc::is_offering;
use overlay_dht::{ConnectionType, Message};

#[tokio::test]
async fn unreachable_peers_negotiate_webrtc_through_the_entry_point() {
    let entry = start_node("entrypoint", Some(0), None).await;
    let entry_descriptor = entry.local_descriptor().clone();
    let alice = start_node("nat-alice", None, Some(&entry_descriptor)).await;
    let bob = start_node("nat-bob", None, Some(&entry_descriptor)).await;
    assert!(alice.local_descriptor().websocket.is_none());
    assert!(bob.local_descriptor().websocket.is_none());
    assert_ne!(
        is_offering(&alice.peer_id(), &bob.peer_id()),
        is_offering(&bob.peer_id(), &alice.peer_id()),
        "exactly one side offers"
    );

    for node in [&alice, &bob] {
        node.send(
            Message::new("hello", MessageType::Rpc, Vec::new()),
            &entry_descriptor,
        )
        .await
        .expect("signaling path through the entry point");
    }

    let mut inbox = bob.subscribe("chat").await;
    alice
        .send(
            Message::new("chat", MessageType::Rpc, b"over a data channel".to_vec()),
            bob.local_descriptor(),
        )
        .await
        .expect("webrtc connection established");

    let incoming = recv_within(&mut inbox, Duration::from_secs(20)).await;
    assert_eq!(incoming.sender.peer_id, alice.peer_id());
    assert_eq!(incoming.message.body, b"over a data channel".to_vec());
    assert_eq!(
        alice
            .connection_manager()
            .connection_type(&bob.peer_id())
            .await,
        Some(ConnectionType::WebRtc)
    );
    let bob_side = bob.clone();
    let alice_id = alice.peer_id();
    assert!(
        eventually(Duration::from_secs(5), move || {
            let bob = bob_side.clone();
            async move {
                bob.connection_manager().connection_type(&alice_id).await == Some(ConnectionType::WebRtc)
            }
        })
        .await,
        "bob sees the same data channel"
    );

    alice.stop().await.expect("stop alice");
    bob.stop().await.expect("stop bob");
    entry.stop().await.expect("stop entry");
}
