//! Integration tests for the tunnel handler
//!
//! An in-process agent talks to the handler over an in-memory duplex pipe,
//! so registration, identity binding and full transfers run end to end
//! without sockets.

use backhaul_control::{
    HandlerConfig, HandlerError, SessionRegistry, TransferConfig, TransferCoordinator,
    TransferRecord, TransferService, TransferStatus, TunnelHandler,
};
use backhaul_proto::{encode_chunk, TunnelCodec, TunnelMessage};
use backhaul_store::MemoryStore;
use backhaul_transport_websocket::PeerIdentity;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type AgentSocket = WebSocketStream<DuplexStream>;

struct Harness {
    handler: Arc<TunnelHandler>,
    registry: Arc<SessionRegistry>,
    service: TransferService,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(SessionRegistry::new(store.clone()));
    let transfers = Arc::new(TransferCoordinator::new(
        store,
        TransferConfig {
            download_dir: dir.path().to_path_buf(),
            ..Default::default()
        },
    ));
    let handler = Arc::new(
        TunnelHandler::new(registry.clone(), transfers.clone()).with_config(HandlerConfig {
            heartbeat_interval: Duration::from_millis(50),
            outbound_buffer: 16,
        }),
    );

    Harness {
        handler,
        service: TransferService::new(registry.clone(), transfers),
        registry,
        _dir: dir,
    }
}

async fn connect(
    handler: Arc<TunnelHandler>,
    peer: PeerIdentity,
) -> (AgentSocket, JoinHandle<Result<(), HandlerError>>) {
    let (agent_io, coordinator_io) = tokio::io::duplex(1 << 20);

    let server = tokio::spawn(async move {
        let websocket = tokio_tungstenite::accept_async(coordinator_io).await.unwrap();
        handler
            .handle_connection(websocket, peer, "127.0.0.1:40000".parse().unwrap())
            .await
    });

    let (agent, _) = tokio_tungstenite::client_async("ws://localhost/", agent_io)
        .await
        .unwrap();
    (agent, server)
}

async fn send(agent: &mut AgentSocket, message: TunnelMessage) {
    let frame = TunnelCodec::encode(&message).unwrap();
    agent.send(Message::Text(frame)).await.unwrap();
}

/// Next protocol message, or `None` once the coordinator closes the tunnel
async fn recv(agent: &mut AgentSocket) -> Option<TunnelMessage> {
    loop {
        let frame = timeout(Duration::from_secs(5), agent.next())
            .await
            .expect("timed out waiting for coordinator");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(TunnelCodec::decode(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn register(agent: &mut AgentSocket, client_id: &str) -> TunnelMessage {
    send(
        agent,
        TunnelMessage::Register {
            client_id: client_id.to_string(),
        },
    )
    .await;
    recv(agent).await.expect("registration reply")
}

/// Ping and wait for the pong; everything sent before has been handled
async fn round_trip(agent: &mut AgentSocket) {
    agent.send(Message::Ping(b"sync".to_vec())).await.unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            match agent.next().await {
                Some(Ok(Message::Pong(_))) => return,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
    })
    .await
    .unwrap();
}

async fn wait_for_terminal(service: &TransferService, id: &str) -> TransferRecord {
    for _ in 0..100 {
        if let Some(record) = service.get_transfer(id).await {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("transfer {} never finished", id);
}

async fn wait_until_disconnected(registry: &SessionRegistry, client_id: &str) {
    for _ in 0..100 {
        if !registry.is_connected(client_id).await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} still connected", client_id);
}

#[tokio::test]
async fn test_out_of_order_transfer_completes() {
    let h = harness();
    let (mut agent, _server) = connect(h.handler.clone(), PeerIdentity::plaintext()).await;

    assert_eq!(
        register(&mut agent, "site-1").await,
        TunnelMessage::Registered {
            client_id: "site-1".to_string(),
            message: "Registration successful".to_string(),
            secure: Some(false),
            mutual_auth: Some(false),
        }
    );
    assert!(h.registry.is_connected("site-1").await.unwrap());

    let id = h
        .service
        .request_transfer("site-1", "/data/report.bin")
        .await
        .unwrap();
    assert_eq!(
        recv(&mut agent).await.unwrap(),
        TunnelMessage::DownloadRequest {
            download_id: id.clone(),
            file_path: "/data/report.bin".to_string(),
        }
    );

    send(
        &mut agent,
        TunnelMessage::FileMetadata {
            download_id: id.clone(),
            file_name: "report.bin".to_string(),
            file_size: 9,
            total_chunks: 3,
        },
    )
    .await;
    for (index, data, is_last) in [(1, b"111", false), (0, b"000", false), (2, b"222", true)] {
        send(
            &mut agent,
            TunnelMessage::FileChunk {
                download_id: id.clone(),
                chunk_index: index,
                data: encode_chunk(data),
                is_last,
            },
        )
        .await;
    }

    let record = wait_for_terminal(&h.service, &id).await;
    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(
        std::fs::read(record.output_path.unwrap()).unwrap(),
        b"000111222"
    );
}

#[tokio::test]
async fn test_identity_mismatch_closes_tunnel() {
    let h = harness();
    let (mut agent, server) = connect(h.handler.clone(), PeerIdentity::mutual("site-2")).await;

    let reply = register(&mut agent, "site-3").await;
    assert!(matches!(reply, TunnelMessage::Error { .. }));
    assert!(recv(&mut agent).await.is_none());

    let result = timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(HandlerError::IdentityMismatch { ref claimed, ref verified })
            if claimed == "site-3" && verified == "site-2"
    ));

    assert!(!h.registry.is_connected("site-2").await.unwrap());
    assert!(!h.registry.is_connected("site-3").await.unwrap());
    assert!(h.registry.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_matching_identity_registers_with_mutual_auth() {
    let h = harness();
    let (mut agent, _server) = connect(h.handler.clone(), PeerIdentity::mutual("site-2")).await;

    match register(&mut agent, "site-2").await {
        TunnelMessage::Registered {
            client_id,
            secure,
            mutual_auth,
            ..
        } => {
            assert_eq!(client_id, "site-2");
            assert_eq!(secure, Some(true));
            assert_eq!(mutual_auth, Some(true));
        }
        other => panic!("Expected registered, got {:?}", other),
    }
    assert!(h.registry.is_connected("site-2").await.unwrap());
}

#[tokio::test]
async fn test_empty_client_id_is_rejected() {
    let h = harness();
    let (mut agent, server) = connect(h.handler.clone(), PeerIdentity::plaintext()).await;

    assert!(matches!(
        register(&mut agent, "  ").await,
        TunnelMessage::Error { .. }
    ));
    let result = timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(HandlerError::ConnectionError(_))));
    assert_eq!(h.registry.count().await, 0);
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let h = harness();
    let (mut agent, server) = connect(h.handler.clone(), PeerIdentity::plaintext()).await;
    register(&mut agent, "site-1").await;

    agent.close(None).await.unwrap();
    let result = timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    assert!(!h.registry.is_connected("site-1").await.unwrap());
    assert!(h.registry.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_superseded_tunnel_does_not_evict_replacement() {
    let h = harness();
    let (mut first, first_server) = connect(h.handler.clone(), PeerIdentity::plaintext()).await;
    register(&mut first, "site-1").await;
    let (mut second, _second_server) = connect(h.handler.clone(), PeerIdentity::plaintext()).await;
    register(&mut second, "site-1").await;

    first.close(None).await.unwrap();
    timeout(Duration::from_secs(5), first_server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(h.registry.is_connected("site-1").await.unwrap());

    // Work goes down the newest tunnel
    let id = h.service.request_transfer("site-1", "/x").await.unwrap();
    assert!(matches!(
        recv(&mut second).await,
        Some(TunnelMessage::DownloadRequest { download_id, .. }) if download_id == id
    ));
}

#[tokio::test]
async fn test_malformed_and_early_frames_are_ignored() {
    let h = harness();
    let (mut agent, _server) = connect(h.handler.clone(), PeerIdentity::plaintext()).await;

    agent.send(Message::Text("{not json".into())).await.unwrap();
    agent.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    send(
        &mut agent,
        TunnelMessage::FileChunk {
            download_id: "early".to_string(),
            chunk_index: 0,
            data: encode_chunk(b"x"),
            is_last: true,
        },
    )
    .await;

    assert!(matches!(
        register(&mut agent, "site-1").await,
        TunnelMessage::Registered { .. }
    ));
    assert!(h.service.list_transfers().await.is_empty());
}

#[tokio::test]
async fn test_agent_error_fails_transfer() {
    let h = harness();
    let (mut agent, _server) = connect(h.handler.clone(), PeerIdentity::plaintext()).await;
    register(&mut agent, "site-1").await;

    let id = h.service.request_transfer("site-1", "/missing").await.unwrap();
    recv(&mut agent).await.unwrap();
    send(
        &mut agent,
        TunnelMessage::Error {
            download_id: id.clone(),
            message: "No such file or directory".to_string(),
        },
    )
    .await;

    let record = wait_for_terminal(&h.service, &id).await;
    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("No such file or directory"));
}

#[tokio::test]
async fn test_ping_is_answered() {
    let h = harness();
    let (mut agent, _server) = connect(h.handler.clone(), PeerIdentity::plaintext()).await;
    register(&mut agent, "site-1").await;

    agent.send(Message::Ping(b"hb".to_vec())).await.unwrap();
    let pong = timeout(Duration::from_secs(5), async {
        loop {
            match agent.next().await {
                Some(Ok(Message::Pong(payload))) => return payload,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(pong, b"hb".to_vec());
}

#[tokio::test]
async fn test_heartbeat_keeps_session_alive() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(
        SessionRegistry::new(store.clone()).with_liveness_ttl(Duration::from_millis(200)),
    );
    let transfers = Arc::new(TransferCoordinator::new(store, TransferConfig::default()));
    let handler = Arc::new(
        TunnelHandler::new(registry.clone(), transfers).with_config(HandlerConfig {
            heartbeat_interval: Duration::from_millis(50),
            outbound_buffer: 16,
        }),
    );

    let (mut agent, _server) = connect(handler, PeerIdentity::plaintext()).await;
    register(&mut agent, "site-1").await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(registry.is_connected("site-1").await.unwrap());

    agent.close(None).await.unwrap();
    wait_until_disconnected(&registry, "site-1").await;
}

#[tokio::test]
async fn test_agent_cannot_touch_another_agents_transfer() {
    let h = harness();
    let (mut owner, _owner_server) =
        connect(h.handler.clone(), PeerIdentity::mutual("site-a")).await;
    register(&mut owner, "site-a").await;
    let (mut other, _other_server) =
        connect(h.handler.clone(), PeerIdentity::mutual("site-b")).await;
    register(&mut other, "site-b").await;

    let id = h.service.request_transfer("site-a", "/data/a.bin").await.unwrap();
    recv(&mut owner).await.unwrap();

    send(
        &mut other,
        TunnelMessage::FileMetadata {
            download_id: id.clone(),
            file_name: "forged.bin".to_string(),
            file_size: 1,
            total_chunks: 1,
        },
    )
    .await;
    send(
        &mut other,
        TunnelMessage::Error {
            download_id: id.clone(),
            message: "forged".to_string(),
        },
    )
    .await;
    round_trip(&mut other).await;

    let record = h.service.get_transfer(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Initiated);
    assert!(record.file_name.is_none());
    assert!(record.error.is_none());

    send(
        &mut owner,
        TunnelMessage::FileMetadata {
            download_id: id.clone(),
            file_name: "a.bin".to_string(),
            file_size: 2,
            total_chunks: 1,
        },
    )
    .await;
    send(
        &mut other,
        TunnelMessage::FileChunk {
            download_id: id.clone(),
            chunk_index: 0,
            data: encode_chunk(b"xx"),
            is_last: true,
        },
    )
    .await;
    round_trip(&mut other).await;
    round_trip(&mut owner).await;

    let record = h.service.get_transfer(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Downloading);
    assert_eq!(record.received_chunks, 0);

    send(
        &mut owner,
        TunnelMessage::FileChunk {
            download_id: id.clone(),
            chunk_index: 0,
            data: encode_chunk(b"ok"),
            is_last: true,
        },
    )
    .await;
    let record = wait_for_terminal(&h.service, &id).await;
    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(std::fs::read(record.output_path.unwrap()).unwrap(), b"ok");
}
