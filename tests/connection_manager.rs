#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;

use common::{eventually, recv_within};
use overlay_dht::protocol::MessageType;
use overlay_dht::{
    derive_peer_id, ConnectionManager, ConnectionManagerConfig, ConnectionType, DhtError, Message,
    PeerDescriptor, Result, Transport,
};

struct NoSignaling;

#[async_trait]
impl Transport for NoSignaling {
    async fn send(&self, _message: Message, target: &PeerDescriptor) -> Result<()> {
        Err(DhtError::CouldNotRoute(format!("no signaling path to {target}")))
    }
}

async fn started(
    name: &str,
    port: Option<u16>,
    entry_point: Option<&PeerDescriptor>,
) -> (Arc<ConnectionManager>, PeerDescriptor) {
    let config = ConnectionManagerConfig {
        websocket_port: port,
        connect_timeout: Duration::from_secs(5),
        entry_points: entry_point.cloned().into_iter().collect(),
        ..ConnectionManagerConfig::default()
    };
    let manager = ConnectionManager::new(config).expect("manager");
    let connectivity = manager.start().await.expect("start");
    let mut local = PeerDescriptor::new(derive_peer_id(name));
    if connectivity.open_internet {
        local.websocket = connectivity.websocket;
    }
    manager
        .enable_connectivity(local.clone(), Arc::new(NoSignaling), Duration::from_secs(2))
        .await;
    (manager, local)
}

fn message(app_id: &str, body: &[u8]) -> Message {
    Message::new(app_id, MessageType::Rpc, body.to_vec())
}

#[tokio::test]
async fn messages_flow_both_ways_over_one_websocket() {
    let (server, server_descriptor) = started("server", Some(0), None).await;
    let (client, client_descriptor) = started("client", None, None).await;
    assert!(server_descriptor.websocket.is_some(), "server advertises its address");
    assert!(client_descriptor.websocket.is_none());

    let mut server_inbox = server.subscribe("test").await;
    let mut client_inbox = client.subscribe("test").await;

    client
        .send(message("test", b"first"), &server_descriptor)
        .await
        .expect("client dials the server");
    client
        .send(message("test", b"second"), &server_descriptor)
        .await
        .expect("second send reuses the connection");

    let first = recv_within(&mut server_inbox, Duration::from_secs(5)).await;
    let second = recv_within(&mut server_inbox, Duration::from_secs(5)).await;
    assert_eq!(first.sender.peer_id, client_descriptor.peer_id);
    assert_eq!(first.message.body, b"first".to_vec());
    assert_eq!(second.message.body, b"second".to_vec(), "order is preserved");

    assert_eq!(
        client.connection_type(&server_descriptor.peer_id).await,
        Some(ConnectionType::WebSocketClient)
    );
    assert_eq!(
        server.connection_type(&client_descriptor.peer_id).await,
        Some(ConnectionType::WebSocketServer)
    );

    server
        .send(message("test", b"reply"), &client_descriptor)
        .await
        .expect("server answers over the inbound link");
    let reply = recv_within(&mut client_inbox, Duration::from_secs(5)).await;
    assert_eq!(reply.sender.peer_id, server_descriptor.peer_id);
    assert_eq!(reply.message.body, b"reply".to_vec());
    assert_eq!(client.connected_peers().await, vec![server_descriptor.clone()]);

    client.stop().await.expect("stop client");
    server.stop().await.expect("stop server");
}

#[tokio::test]
async fn scheduled_disconnect_closes_unless_a_send_cancels_it() {
    let (server, server_descriptor) = started("server", Some(0), None).await;
    let (client, client_descriptor) = started("client", None, None).await;
    let server_id = server_descriptor.peer_id;
    let client_id = client_descriptor.peer_id;

    client
        .send(message("test", b"hello"), &server_descriptor)
        .await
        .expect("connect");
    assert!(
        eventually(Duration::from_secs(5), || {
            let server = server.clone();
            async move { server.has_open_connection(&client_id).await }
        })
        .await,
        "server sees the client"
    );

    client
        .disconnect(&server_id, "test over", Some(Duration::from_millis(50)))
        .await;
    assert!(
        eventually(Duration::from_secs(5), || {
            let client = client.clone();
            async move { !client.has_connection(&server_id).await }
        })
        .await,
        "client closes after the grace period"
    );
    assert!(
        eventually(Duration::from_secs(5), || {
            let server = server.clone();
            async move { !server.has_connection(&client_id).await }
        })
        .await,
        "server notices the close"
    );

    client
        .send(message("test", b"again"), &server_descriptor)
        .await
        .expect("reconnect");
    client
        .disconnect(&server_id, "changed my mind", Some(Duration::from_millis(200)))
        .await;
    client
        .send(message("test", b"still here"), &server_descriptor)
        .await
        .expect("send cancels the pending disconnect");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(client.has_open_connection(&server_id).await, "cancelled disconnect keeps the link");

    client.stop().await.expect("stop client");
    server.stop().await.expect("stop server");
}

#[tokio::test]
async fn connectivity_probe_reports_reachable_peer() {
    let (entry, entry_descriptor) = started("entrypoint", Some(0), None).await;
    let config = ConnectionManagerConfig {
        websocket_port: Some(0),
        entry_points: vec![entry_descriptor.clone()],
        ..ConnectionManagerConfig::default()
    };
    let peer = ConnectionManager::new(config).expect("manager");
    let connectivity = peer.start().await.expect("start");

    assert!(connectivity.open_internet, "entry point could dial back");
    assert_eq!(connectivity.ip, "127.0.0.1");
    let advertised = connectivity.websocket.expect("advertised address");
    assert_ne!(advertised.port, 0);

    peer.stop().await.expect("stop peer");
    entry.stop().await.expect("stop entry");
}

#[tokio::test]
async fn probe_against_dead_entry_point_reports_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let dead = PeerDescriptor::new(derive_peer_id("dead"))
        .with_websocket(overlay_dht::ConnectivityMethod::new("127.0.0.1", port));

    let config = ConnectionManagerConfig {
        websocket_port: Some(0),
        entry_points: vec![dead],
        connect_timeout: Duration::from_secs(2),
        ..ConnectionManagerConfig::default()
    };
    let peer = ConnectionManager::new(config).expect("manager");
    let connectivity = peer.start().await.expect("start still succeeds");
    assert!(!connectivity.open_internet);
    assert!(connectivity.websocket.is_none());
    peer.stop().await.expect("stop");
}

#[tokio::test]
async fn dialing_a_closed_port_fails_the_send_only() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let (client, _) = started("client", None, None).await;
    let gone = PeerDescriptor::new(derive_peer_id("gone"))
        .with_websocket(overlay_dht::ConnectivityMethod::new("127.0.0.1", port));

    let result = client.send(message("test", b"lost"), &gone).await;
    assert!(result.is_err(), "establishment failure rejects the send");
    assert!(!client.has_connection(&gone.peer_id).await, "failed handle is discarded");

    client.stop().await.expect("manager keeps working and stops cleanly");
}

#[tokio::test]
async fn sends_sharing_a_failed_dial_all_fail() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let (client, _) = started("client", None, None).await;
    let gone = PeerDescriptor::new(derive_peer_id("gone"))
        .with_websocket(overlay_dht::ConnectivityMethod::new("127.0.0.1", port));

    let (first, second) = tokio::join!(
        client.send(message("test", b"one"), &gone),
        client.send(message("test", b"two"), &gone),
    );
    assert!(first.is_err(), "the dialing send fails");
    assert!(second.is_err(), "the buffered send fails with it");
    assert!(!client.has_connection(&gone.peer_id).await);

    client.stop().await.expect("stop");
}
