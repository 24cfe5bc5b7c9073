// Federation round-trips between two live instances: handshake, initial
// sync, delta push with acks, trust rejection, push-mode gating, and the
// protocol-mismatch handshake failure. Links run over the in-process
// duplex transport except for one real WebSocket round-trip.

use rhizomedb::federation::{
    DuplexTransport, FederationLink, FederationMessage, FederationPeer, FrameCodec,
    InitialSyncPolicy, LinkConfig, LinkMode, MessageTransport, PeerAnnouncement, TrustPolicy,
    WireFrame, PROTOCOL_VERSION,
};
use rhizomedb::{DatabaseConfig, RhizomeDb};
use std::sync::Arc;
use std::time::Duration;

async fn instance(system_id: &str) -> RhizomeDb {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    RhizomeDb::open(DatabaseConfig::memory().with_system_id(system_id))
        .await
        .unwrap()
}

/// Poll until the delta shows up in the instance's log, or give up after
/// five seconds.
async fn wait_for_delta(db: &RhizomeDb, id: &str) -> bool {
    for _ in 0..200 {
        if db.get_delta(id).await.unwrap().is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Poll a synchronous condition (stats, link state) with the same budget.
async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Wire two peers together over a duplex pair; returns (server link, client link).
async fn connect(
    server: &Arc<FederationPeer>,
    client: &Arc<FederationPeer>,
    server_config: LinkConfig,
    client_config: LinkConfig,
) -> (Arc<FederationLink>, Arc<FederationLink>) {
    let (server_end, client_end) = DuplexTransport::pair();
    let accepting = {
        let server = Arc::clone(server);
        tokio::spawn(async move { server.accept_with(server_end, server_config).await })
    };
    let client_link = client.connect_with(client_end, client_config).await.unwrap();
    let server_link = accepting.await.unwrap().unwrap();
    (server_link, client_link)
}

#[tokio::test]
async fn test_initial_sync_and_bidirectional_push() {
    let server_db = instance("sys-server").await;
    let client_db = instance("sys-client").await;

    // D1 exists on the server before the client ever connects.
    server_db
        .persist(
            server_db
                .delta("alice")
                .with_id("d-1")
                .with_timestamp(1000)
                .set_property("e1", "name", "Alice")
                .build(),
        )
        .await
        .unwrap();

    let server = FederationPeer::new(server_db.clone());
    let client = FederationPeer::new(client_db.clone());

    let (_server_link, client_link) = connect(
        &server,
        &client,
        LinkConfig::default(),
        LinkConfig::default()
            .with_mode(LinkMode::Bidirectional)
            .with_initial_sync(InitialSyncPolicy::Full),
    )
    .await;

    // Initial sync lands D1 in the client's log.
    assert!(
        wait_for_delta(&client_db, "d-1").await,
        "client never received d-1 through initial sync"
    );

    // A fresh client write propagates to the server and is acknowledged.
    client_db
        .persist(
            client_db
                .delta("bob")
                .with_id("d-2")
                .with_timestamp(2000)
                .set_property("e2", "name", "Bob")
                .build(),
        )
        .await
        .unwrap();

    assert!(
        wait_for_delta(&server_db, "d-2").await,
        "server never received d-2"
    );
    assert!(
        wait_until(|| client_link.stats().acks_received >= 1).await,
        "client never saw the delta_ack"
    );
}

#[tokio::test]
async fn test_trust_policy_rejects_with_nack() {
    let server_db = instance("sys-server").await;
    let client_db = instance("sys-client").await;

    let server = FederationPeer::new(server_db.clone());
    let client = FederationPeer::new(client_db.clone());

    let (_server_link, client_link) = connect(
        &server,
        &client,
        LinkConfig::default().with_trust_policy(TrustPolicy::authors(["alice"])),
        LinkConfig::default(),
    )
    .await;

    client_db
        .persist(client_db.delta("mallory").with_id("d-m").with_timestamp(1000).build())
        .await
        .unwrap();

    assert!(
        wait_until(|| client_link.stats().nacks_received >= 1).await,
        "client never received the delta_nack"
    );
    assert!(server_db.get_delta("d-m").await.unwrap().is_none());

    // A trusted author still gets through on the same link.
    client_db
        .persist(client_db.delta("alice").with_id("d-a").with_timestamp(1100).build())
        .await
        .unwrap();
    assert!(wait_for_delta(&server_db, "d-a").await);
}

#[tokio::test]
async fn test_push_mode_link_never_accepts_inbound() {
    let server_db = instance("sys-server").await;
    let client_db = instance("sys-client").await;

    let server = FederationPeer::new(server_db.clone());
    let client = FederationPeer::new(client_db.clone());

    // The server treats this link as push-only: outbound only.
    let (_server_link, client_link) = connect(
        &server,
        &client,
        LinkConfig::default().with_mode(LinkMode::Push),
        LinkConfig::default(),
    )
    .await;

    client_db
        .persist(client_db.delta("alice").with_id("d-in").with_timestamp(1000).build())
        .await
        .unwrap();

    assert!(
        wait_until(|| client_link.stats().nacks_received >= 1).await,
        "push-mode server should nack inbound deltas"
    );
    assert!(server_db.get_delta("d-in").await.unwrap().is_none());

    // Outbound still flows: a server write reaches the client.
    server_db
        .persist(server_db.delta("alice").with_id("d-out").with_timestamp(1100).build())
        .await
        .unwrap();
    assert!(wait_for_delta(&client_db, "d-out").await);
}

#[tokio::test]
async fn test_protocol_mismatch_is_fatal() {
    let server_db = instance("sys-server").await;
    let server = FederationPeer::new(server_db.clone());

    let (server_end, mut client_end) = DuplexTransport::pair();
    let accepting = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_with(server_end, LinkConfig::default()).await })
    };

    // Hand-rolled hello speaking the wrong protocol.
    let hello = FrameCodec::decode(
        r#"{"type":"hello","timestamp":1,"system_id":"sys-x",
            "config":{"mode":"bidirectional","initial_sync":"none"},
            "protocol":"rhizomedb-federation-v0"}"#,
    )
    .unwrap();
    client_end.send(hello).await.unwrap();

    let reply = client_end.recv().await.unwrap().unwrap();
    match reply.message {
        FederationMessage::Error { code, fatal, .. } => {
            assert_eq!(code, "PROTOCOL_MISMATCH");
            assert!(fatal);
        }
        other => panic!("expected fatal error frame, got {other:?}"),
    }

    let result = accepting.await.unwrap();
    assert!(matches!(
        result,
        Err(rhizomedb::RhizomeError::ProtocolMismatch { .. })
    ));
    assert_eq!(server.link_count(), 0);
}

#[tokio::test]
async fn test_sync_from_timestamp_skips_older_deltas() {
    let server_db = instance("sys-server").await;
    let client_db = instance("sys-client").await;

    for (id, ts) in [("d-old", 1000u64), ("d-new", 5000)] {
        server_db
            .persist(server_db.delta("alice").with_id(id).with_timestamp(ts).build())
            .await
            .unwrap();
    }

    let server = FederationPeer::new(server_db.clone());
    let client = FederationPeer::new(client_db.clone());

    connect(
        &server,
        &client,
        LinkConfig::default(),
        LinkConfig::default().with_sync_from(3000),
    )
    .await;

    assert!(wait_for_delta(&client_db, "d-new").await);
    assert!(client_db.get_delta("d-old").await.unwrap().is_none());
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let server_db = instance("sys-server").await;
    let client_db = instance("sys-client").await;

    server_db
        .persist(
            server_db
                .delta("alice")
                .with_id("d-ws")
                .with_timestamp(1000)
                .set_property("e1", "name", "Alice")
                .build(),
        )
        .await
        .unwrap();

    let server = FederationPeer::new(server_db.clone());
    let client = FederationPeer::new(client_db.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve_ws(listener, LinkConfig::default()).await });
    }

    let link = client
        .connect_ws(
            &format!("ws://{addr}"),
            LinkConfig::default().with_initial_sync(InitialSyncPolicy::Full),
        )
        .await
        .unwrap();
    assert_eq!(link.remote_system(), Some("sys-server".to_string()));

    assert!(
        wait_for_delta(&client_db, "d-ws").await,
        "initial sync over websocket failed"
    );

    client_db
        .persist(client_db.delta("bob").with_id("d-back").with_timestamp(2000).build())
        .await
        .unwrap();
    assert!(
        wait_for_delta(&server_db, "d-back").await,
        "delta push over websocket failed"
    );
}

#[tokio::test]
async fn test_ping_pong_heartbeat_frames() {
    // Drive the protocol by hand: a raw transport acting as the remote
    // must get a pong for its ping.
    let server_db = instance("sys-server").await;
    let server = FederationPeer::new(server_db.clone());

    let (server_end, mut remote) = DuplexTransport::pair();
    let accepting = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.accept_with(server_end, LinkConfig::default()).await })
    };

    remote
        .send(WireFrame::new(FederationMessage::Hello {
            system_id: "sys-remote".to_string(),
            config: PeerAnnouncement {
                mode: LinkMode::Bidirectional,
                initial_sync: InitialSyncPolicy::None,
            },
            protocol: PROTOCOL_VERSION.to_string(),
        }))
        .await
        .unwrap();

    let ack = remote.recv().await.unwrap().unwrap();
    assert!(matches!(ack.message, FederationMessage::HelloAck { .. }));
    accepting.await.unwrap().unwrap();

    remote.send(WireFrame::new(FederationMessage::Ping)).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), remote.recv())
        .await
        .expect("timed out waiting for pong")
        .unwrap()
        .unwrap();
    assert_eq!(reply.message, FederationMessage::Pong);
}
