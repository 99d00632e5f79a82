//! End-to-end chunk delivery and block action scenarios, driven
//! through a recording connection instead of a socket.

use std::sync::Arc;
use std::time::Duration;

use glam::DVec3;
use uuid::Uuid;
use vaste_core::chunk::generator::WorldGenerator;
use vaste_core::chunk::{
    ChunkBlocks, ChunkStore, GenerationPool, SerializePool,
};
use vaste_core::config::{ServerConfig, WorldGeneratorType};
use vaste_core::player::block_actions::{ActionKind, handle_block_action};
use vaste_core::player::{
    ChunkStreamer, PlayerSession, RecordingConnection, StreamerEvent,
};
use vaste_core::server::Server;
use vaste_protocol::{ChunkFull, ServerMessage, decode_frame};
use vaste_utils::{BlockPos, CHUNK_VOLUME, ChunkPos};

/// Generates a world with exactly one non-air block, at (8, 0, 8).
struct SingleBlockGenerator;

impl WorldGenerator for SingleBlockGenerator {
    fn generate(&self, pos: ChunkPos) -> ChunkBlocks {
        let mut blocks: ChunkBlocks = Box::new([0; CHUNK_VOLUME]);
        if pos == ChunkPos::new(0, 0, 0) {
            blocks[usize::from(BlockPos::new(8, 0, 8).local_index())] = 1;
        }
        blocks
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        license_key: "test".to_string(),
        world_generator: WorldGeneratorType::Empty,
        ..ServerConfig::default()
    }
}

fn server_with_generator<G: WorldGenerator + 'static>(generator: G) -> Arc<Server> {
    let store = Arc::new(ChunkStore::new(
        GenerationPool::with_generator(2, generator),
        4096,
    ));
    Server::with_parts(test_config(), store, Arc::new(SerializePool::new(2)))
}

fn session_on(server: &Arc<Server>, connection: Arc<RecordingConnection>) -> Arc<PlayerSession> {
    let id = server.next_session_id();
    let session = Arc::new(PlayerSession::new(
        id,
        format!("u-{id}"),
        Uuid::new_v4(),
        format!("player{id}"),
        DVec3::ZERO,
        connection,
    ));
    server.register_session(session.clone());
    session
}

/// Drains streamer events until `done` holds or the event stream goes
/// quiet for a second.
async fn drive(
    streamer: &mut ChunkStreamer,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<StreamerEvent>,
    done: impl Fn() -> bool,
) {
    while !done() {
        let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(1), events.recv()).await
        else {
            break;
        };
        streamer.handle_event(event);
    }
}

fn parse_messages(frames: &[String]) -> Vec<ServerMessage> {
    frames
        .iter()
        .map(|text| serde_json::from_str(text).expect("well-formed server message"))
        .collect()
}

#[tokio::test]
async fn single_chunk_delivery_and_ack() {
    let server = server_with_generator(SingleBlockGenerator);
    let connection = Arc::new(RecordingConnection::new());
    let session = session_on(&server, connection.clone());

    let (mut streamer, mut events) = ChunkStreamer::new(
        session,
        Arc::clone(server.store()),
        Arc::clone(server.serialize_pool()),
        2,
        Duration::from_millis(1200),
        None,
    );
    streamer.on_authenticated(DVec3::new(8.0, 5.0, 8.0));
    drive(&mut streamer, &mut events, || {
        !connection.binary_frames().is_empty()
    })
    .await;

    // The whole spawn neighborhood collapses to one CHUNK_FULL frame:
    // every other chunk is all air.
    let frames = connection.binary_frames();
    assert_eq!(frames.len(), 1);
    let decoded = decode_frame(&frames[0]).expect("valid frame");
    assert_eq!(
        decoded,
        vec![ChunkFull {
            seq: 1,
            pos: ChunkPos::new(0, 0, 0),
            version: 1,
            entries: vec![(136, 1)],
        }]
    );
    assert_eq!(streamer.outstanding_len(), 1);

    streamer.on_chunk_ack("0,0,0:1:1", 1);
    assert_eq!(streamer.outstanding_len(), 0);
    assert!(streamer.snapshot().is_empty());
    streamer.shutdown();
}

#[tokio::test]
async fn place_block_confirms_and_patches() {
    let server = server_with_generator(SingleBlockGenerator);
    let connection = Arc::new(RecordingConnection::new());
    let session = session_on(&server, connection.clone());
    session.set_position(DVec3::new(0.0, 2.0, 0.0));
    connection.clear();

    handle_block_action(
        &server,
        &session,
        ActionKind::Place,
        BlockPos::new(1, 2, 0),
        Some(1),
        "a-1".to_string(),
    )
    .await;

    let messages = parse_messages(&connection.text_frames());
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[0],
        ServerMessage::BlockActionResult {
            action_id: "a-1".to_string(),
            success: true,
            reason: None,
            x: Some(1),
            y: Some(2),
            z: Some(0),
        }
    );
    let ServerMessage::BlockPatch { patches } = &messages[1] else {
        panic!("expected block_patch, got {:?}", messages[1]);
    };
    assert_eq!(patches.len(), 1);
    assert_eq!((patches[0].x, patches[0].y, patches[0].z), (1, 2, 0));
    assert_eq!(patches[0].block_type, 1);
    assert_eq!(patches[0].action_id.as_deref(), Some("a-1"));

    // A subsequent break at the same cell succeeds.
    connection.clear();
    handle_block_action(
        &server,
        &session,
        ActionKind::Break,
        BlockPos::new(1, 2, 0),
        None,
        "a-2".to_string(),
    )
    .await;
    let messages = parse_messages(&connection.text_frames());
    assert!(matches!(
        &messages[0],
        ServerMessage::BlockActionResult { success: true, .. }
    ));
}

#[tokio::test]
async fn rejected_place_gets_reason_and_no_broadcast() {
    let server = server_with_generator(SingleBlockGenerator);
    let connection = Arc::new(RecordingConnection::new());
    let session = session_on(&server, connection.clone());
    connection.clear();

    // (8, 0, 8) is the generator's one occupied cell.
    handle_block_action(
        &server,
        &session,
        ActionKind::Place,
        BlockPos::new(8, 0, 8),
        Some(1),
        "a-2".to_string(),
    )
    .await;

    let messages = parse_messages(&connection.text_frames());
    assert_eq!(
        messages,
        vec![ServerMessage::BlockActionResult {
            action_id: "a-2".to_string(),
            success: false,
            reason: Some("occupied".to_string()),
            x: None,
            y: None,
            z: None,
        }]
    );
}

#[tokio::test]
async fn out_of_bounds_action_is_refused() {
    let server = server_with_generator(SingleBlockGenerator);
    let connection = Arc::new(RecordingConnection::new());
    let session = session_on(&server, connection.clone());
    connection.clear();

    // Just past the bound, and the integer extremes a hostile client
    // can put on the wire; every one gets a result, never a crash.
    for (pos, action_id) in [
        (BlockPos::new(10_001, 0, 0), "a-3"),
        (BlockPos::new(i32::MIN, 0, 0), "a-4"),
        (BlockPos::new(0, i32::MAX, 0), "a-5"),
    ] {
        handle_block_action(
            &server,
            &session,
            ActionKind::Break,
            pos,
            None,
            action_id.to_string(),
        )
        .await;
    }

    let messages = parse_messages(&connection.text_frames());
    assert_eq!(messages.len(), 3);
    for message in &messages {
        assert!(matches!(
            message,
            ServerMessage::BlockActionResult {
                success: false,
                reason: Some(reason),
                ..
            } if reason == "out_of_bounds"
        ));
    }
}

#[tokio::test]
async fn patch_broadcast_reaches_only_nearby_sessions() {
    let server = server_with_generator(SingleBlockGenerator);
    let actor_conn = Arc::new(RecordingConnection::new());
    let actor = session_on(&server, actor_conn.clone());
    let near_conn = Arc::new(RecordingConnection::new());
    let near = session_on(&server, near_conn.clone());
    near.set_position(DVec3::new(100.0, 0.0, 0.0));
    let far_conn = Arc::new(RecordingConnection::new());
    let far = session_on(&server, far_conn.clone());
    far.set_position(DVec3::new(300.0, 0.0, 0.0));
    for conn in [&actor_conn, &near_conn, &far_conn] {
        conn.clear();
    }

    handle_block_action(
        &server,
        &actor,
        ActionKind::Place,
        BlockPos::new(0, 3, 0),
        Some(2),
        "a-4".to_string(),
    )
    .await;

    let is_patch = |text: &String| text.contains("block_patch");
    assert!(actor_conn.text_frames().iter().any(is_patch));
    assert!(near_conn.text_frames().iter().any(is_patch));
    assert!(!far_conn.text_frames().iter().any(is_patch));
}

#[tokio::test]
async fn movement_streams_new_chunks() {
    let server = server_with_generator(vaste_core::chunk::generator::FlatGenerator::default());
    let connection = Arc::new(RecordingConnection::new());
    let session = session_on(&server, connection.clone());

    let (mut streamer, mut events) = ChunkStreamer::new(
        session,
        Arc::clone(server.store()),
        Arc::clone(server.serialize_pool()),
        1,
        Duration::from_millis(1200),
        None,
    );
    streamer.on_authenticated(DVec3::new(8.0, 5.0, 8.0));
    drive(&mut streamer, &mut events, || {
        !connection.binary_frames().is_empty()
    })
    .await;
    let initial: usize = connection
        .binary_frames()
        .iter()
        .map(|frame| decode_frame(frame).expect("valid").len())
        .sum();
    // Radius 1 around the spawn chunk: a 3x3 surface patch.
    assert_eq!(initial, 9);

    // Cross two chunk boundaries east: three new surface chunks appear.
    streamer.on_position_update(DVec3::new(40.0, 5.0, 8.0));
    drive(&mut streamer, &mut events, || {
        connection
            .binary_frames()
            .iter()
            .map(|frame| decode_frame(frame).expect("valid").len())
            .sum::<usize>()
            >= initial + 3
    })
    .await;

    let all: Vec<ChunkFull> = connection
        .binary_frames()
        .iter()
        .flat_map(|frame| decode_frame(frame).expect("valid"))
        .collect();
    assert!(all.iter().any(|frame| frame.pos == ChunkPos::new(3, 0, 0)));
    streamer.shutdown();
}

#[tokio::test]
async fn resume_preserves_sequences() {
    let server = server_with_generator(SingleBlockGenerator);
    let connection = Arc::new(RecordingConnection::new());
    let session = session_on(&server, connection.clone());

    let (mut streamer, mut events) = ChunkStreamer::new(
        session.clone(),
        Arc::clone(server.store()),
        Arc::clone(server.serialize_pool()),
        2,
        Duration::from_millis(1200),
        None,
    );
    streamer.on_authenticated(DVec3::new(8.0, 5.0, 8.0));
    drive(&mut streamer, &mut events, || {
        !connection.binary_frames().is_empty()
    })
    .await;
    assert_eq!(streamer.outstanding_len(), 1);

    // Connection drops before the ack: persist and rebuild.
    let snapshot = streamer.snapshot();
    assert_eq!(snapshot.outstanding, vec![(ChunkPos::new(0, 0, 0), 1)]);
    streamer.shutdown();
    server.store_resume_snapshot(&session.user_id, snapshot);

    let resumed_conn = Arc::new(RecordingConnection::new());
    let resumed = session_on(&server, resumed_conn.clone());
    let (mut streamer, mut events) = ChunkStreamer::new(
        resumed,
        Arc::clone(server.store()),
        Arc::clone(server.serialize_pool()),
        2,
        Duration::from_millis(1200),
        server.take_resume_snapshot(&session.user_id),
    );
    streamer.on_authenticated(DVec3::new(8.0, 5.0, 8.0));
    while streamer.outstanding_len() == 0 {
        let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(1), events.recv()).await
        else {
            break;
        };
        streamer.handle_event(event);
    }

    // The frame is back in flight under its original seq, unsent until
    // the client's manifest or the grace timeout.
    assert_eq!(streamer.outstanding_len(), 1);
    assert!(resumed_conn.binary_frames().is_empty());
    let snapshot = streamer.snapshot();
    assert_eq!(snapshot.outstanding, vec![(ChunkPos::new(0, 0, 0), 1)]);

    // The client already applied seq 1: nothing is ever resent.
    streamer.on_chunk_have(&[1], &[]);
    assert_eq!(streamer.outstanding_len(), 0);
    streamer.shutdown();
}
