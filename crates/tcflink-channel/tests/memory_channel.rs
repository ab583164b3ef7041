use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tcflink_channel::{
    connect, Channel, ChannelConfig, ChannelError, CommandError, CommandTable, ConnectionState,
    LifecycleEvent, MemoryServer, MEMORY_TRANSPORT,
};
use tcflink_frame::{Arg, ArgKind};
use tcflink_transport::{PeerAttributes, TransportRegistry, ATTR_TRANSPORT_NAME};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn pong_table() -> CommandTable {
    let mut table = CommandTable::new();
    table
        .add_sync_command("Pong", "echo", vec![ArgKind::Json], |_, args| Ok(args))
        .add_command("Pong", "slow", Vec::new(), |_, args| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(args)
        })
        .add_sync_command("Pong", "fail", Vec::new(), |_, _| {
            Err(CommandError::Failed("refused".to_string()))
        });
    table
}

fn registry_with(server: MemoryServer) -> (TransportRegistry, Arc<MemoryServer>) {
    let server = Arc::new(server);
    let mut registry = TransportRegistry::new();
    registry.register(server.clone());
    (registry, server)
}

fn memory_attrs() -> PeerAttributes {
    PeerAttributes::new().with(ATTR_TRANSPORT_NAME, MEMORY_TRANSPORT)
}

async fn open(server: MemoryServer, config: ChannelConfig) -> (Channel, Arc<MemoryServer>) {
    let (registry, server) = registry_with(server);
    let client = connect(&registry, &memory_attrs(), None, config).unwrap();
    timeout(WAIT, client.wait_connected())
        .await
        .expect("handshake timed out")
        .unwrap();
    (client, server)
}

async fn wait_for_state(channel: &Channel, state: ConnectionState) {
    timeout(WAIT, async {
        while channel.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state change timed out");
}

#[tokio::test]
async fn echo_over_memory_pipe() {
    let (client, server) = open(
        MemoryServer::new(Arc::new(pong_table())),
        ChannelConfig::default(),
    )
    .await;
    assert_eq!(client.peer_services(), vec!["Pong".to_string()]);

    let reply = client.send_command("Pong", "echo", &[Arg::from("ok")], &[]);
    let result = timeout(WAIT, reply).await.unwrap().unwrap();
    assert_eq!(result, vec![Arg::from("ok")]);

    let accepted = server.channels();
    assert_eq!(accepted.len(), 1);
    wait_for_state(&accepted[0], ConnectionState::Connected).await;
}

#[tokio::test]
async fn chunking_does_not_change_results() {
    for chunk in [1, 3, 7, 4096] {
        let (client, _server) = open(
            MemoryServer::new(Arc::new(pong_table())).with_chunk_size(chunk),
            ChannelConfig::default(),
        )
        .await;
        let payload = Arg::Json(serde_json::json!({"text": "\u{3}escaped\u{3}", "n": [1, 2, 3]}));
        let reply = client.send_command("Pong", "echo", &[payload.clone()], &[]);
        let result = timeout(WAIT, reply).await.unwrap().unwrap();
        assert_eq!(result, vec![payload], "chunk size {chunk}");
    }
}

#[tokio::test]
async fn replies_are_matched_by_token() {
    let (client, _server) = open(
        MemoryServer::new(Arc::new(pong_table())),
        ChannelConfig::default(),
    )
    .await;

    let slow = client.send_command("Pong", "slow", &[Arg::from("slow")], &[]);
    let fast = client.send_command("Pong", "echo", &[Arg::from("fast")], &[]);

    let fast = timeout(WAIT, fast).await.unwrap().unwrap();
    assert_eq!(fast, vec![Arg::from("fast")]);
    assert_eq!(client.pending_commands(), 1);

    let slow = timeout(WAIT, slow).await.unwrap().unwrap();
    assert_eq!(slow, vec![Arg::from("slow")]);
}

#[tokio::test]
async fn unknown_command_is_not_recognized() {
    let (client, _server) = open(
        MemoryServer::new(Arc::new(pong_table())),
        ChannelConfig::default(),
    )
    .await;
    let reply = client.send_command("Pong", "missing", &[], &[]);
    assert!(matches!(
        timeout(WAIT, reply).await.unwrap(),
        Err(ChannelError::NotRecognized { .. })
    ));
    assert!(client.is_connected());
}

#[tokio::test]
async fn failing_command_tears_down_both_sides() {
    let (client, server) = open(
        MemoryServer::new(Arc::new(pong_table())),
        ChannelConfig::default(),
    )
    .await;
    let accepted = server.channels().remove(0);
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    client.add_handler(LifecycleEvent::Close, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let reply = client.send_command("Pong", "fail", &[], &[]);
    assert!(matches!(
        timeout(WAIT, reply).await.unwrap(),
        Err(ChannelError::ChannelClosed)
    ));
    wait_for_state(&client, ConnectionState::Disconnected).await;
    wait_for_state(&accepted, ConnectionState::Disconnected).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_close_reaches_server() {
    let (client, server) = open(
        MemoryServer::new(Arc::new(pong_table())),
        ChannelConfig::default(),
    )
    .await;
    let accepted = server.channels().remove(0);
    wait_for_state(&accepted, ConnectionState::Connected).await;

    client.close();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    wait_for_state(&accepted, ConnectionState::Disconnected).await;
    timeout(WAIT, async {
        while !server.channels().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("closed channel was not pruned");
    assert!(matches!(
        client.send_command("Pong", "echo", &[], &[]).await,
        Err(ChannelError::ChannelClosed)
    ));
}

#[tokio::test]
async fn server_events_reach_client_handler() {
    let (client, server) = open(
        MemoryServer::new(Arc::new(pong_table())),
        ChannelConfig::default(),
    )
    .await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .add_event_handler("Pong", "tick", vec![ArgKind::Json, ArgKind::Binary], move |args| {
            let _ = tx.send(args);
        })
        .unwrap();

    let accepted = server.channels().remove(0);
    wait_for_state(&accepted, ConnectionState::Connected).await;
    accepted
        .send_event("Pong", "tick", &[Arg::from("t1"), Arg::from(vec![1u8, 3, 0])])
        .unwrap();

    let args = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(args, vec![Arg::from("t1"), Arg::from(vec![1u8, 3, 0])]);
}

#[tokio::test]
async fn zero_copy_is_negotiated_when_both_sides_want_it() {
    let config = ChannelConfig {
        zero_copy: true,
        ..ChannelConfig::default()
    };
    let (client, server) = open(
        MemoryServer::new(Arc::new(pong_table())).with_config(config.clone()),
        config,
    )
    .await;
    assert!(client.is_zero_copy_enabled());
    assert!(client.peer_services().contains(&"ZeroCopy".to_string()));

    let accepted = server.channels().remove(0);
    wait_for_state(&accepted, ConnectionState::Connected).await;
    assert!(accepted.is_zero_copy_enabled());
}

#[tokio::test]
async fn zero_copy_stays_off_for_one_sided_request() {
    let config = ChannelConfig {
        zero_copy: true,
        ..ChannelConfig::default()
    };
    let (client, _server) = open(MemoryServer::new(Arc::new(pong_table())), config).await;
    assert!(!client.is_zero_copy_enabled());
}

