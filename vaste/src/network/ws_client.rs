//! Per-socket WebSocket state machine.
//!
//! A socket starts in `AwaitAuth`, where the only accepted message is
//! `auth_info`. A valid token upgrades it to an authenticated session
//! whose task owns the chunk streamer; everything else closes the
//! socket with policy code 1008.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use glam::DVec3;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vaste_core::player::block_actions::{ActionKind, handle_block_action};
use vaste_core::player::chunk_streamer::TICK_INTERVAL;
use vaste_core::player::connection::{ConnectionClosed, SessionConnection};
use vaste_core::player::{ChunkStreamer, PlayerSession};
use vaste_core::server::Server;
use vaste_protocol::{ClientMessage, ServerMessage};
use vaste_utils::BlockPos;

use crate::network::account::{AccountClient, VerifiedUser};

/// Absolute deadline for the auth handshake.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Protocol violations tolerated before the socket closes.
const MAX_PROTOCOL_VIOLATIONS: u32 = 3;
/// Where authenticated players appear.
const SPAWN_POSITION: DVec3 = DVec3::new(8.0, 5.0, 8.0);
/// Reported positions clamp to this cube; matches the block-action
/// coordinate bound.
const MAX_PLAYER_COORDINATE: f64 = 10_000.0;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// A frame queued for the socket writer task.
enum WsOutbound {
    Text(String),
    Binary(Arc<[u8]>),
    Close(Option<CloseFrame<'static>>),
}

/// The session side of a live WebSocket.
struct WsConnection {
    outgoing: UnboundedSender<WsOutbound>,
    cancel_token: CancellationToken,
}

impl SessionConnection for WsConnection {
    fn send_text(&self, text: String) -> Result<(), ConnectionClosed> {
        if self.closed() {
            return Err(ConnectionClosed);
        }
        self.outgoing
            .send(WsOutbound::Text(text))
            .map_err(|_| ConnectionClosed)
    }

    fn send_binary(&self, bytes: Arc<[u8]>) -> Result<(), ConnectionClosed> {
        if self.closed() {
            return Err(ConnectionClosed);
        }
        self.outgoing
            .send(WsOutbound::Binary(bytes))
            .map_err(|_| ConnectionClosed)
    }

    fn close(&self) {
        self.cancel_token.cancel();
    }

    fn closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// How a pre-auth frame is treated.
#[derive(Debug, PartialEq, Eq)]
enum PreAuth {
    /// An `auth_info` token to validate.
    Token(String),
    /// Anything else a client may not send before authenticating.
    Violation,
    /// Transport frames that carry no message.
    Ignore,
    /// The client went away.
    Disconnect,
}

fn classify_pre_auth(message: &Message) -> PreAuth {
    match message {
        Message::Text(text) => match ClientMessage::parse(text) {
            Ok(ClientMessage::AuthInfo { token }) => PreAuth::Token(token),
            _ => PreAuth::Violation,
        },
        Message::Binary(_) => PreAuth::Violation,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => PreAuth::Ignore,
        Message::Close(_) => PreAuth::Disconnect,
    }
}

enum AuthPhase {
    Authenticated(VerifiedUser),
    Refused(&'static str),
    Disconnected,
}

/// One client socket, from handshake to teardown.
pub struct WsClient {
    id: u64,
    address: SocketAddr,
    server: Arc<Server>,
    account: Arc<AccountClient>,
    cancel_token: CancellationToken,
}

impl WsClient {
    /// Creates the state machine for a freshly accepted socket.
    #[must_use]
    pub fn new(
        id: u64,
        address: SocketAddr,
        server: Arc<Server>,
        account: Arc<AccountClient>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            id,
            address,
            server,
            account,
            cancel_token,
        }
    }

    /// Runs the socket to completion.
    pub async fn run(self, stream: TcpStream) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::debug!("websocket handshake failed for {}: {e}", self.address);
                return;
            }
        };
        let (sink, mut stream) = ws.split();
        let (outgoing, outgoing_rx) = unbounded_channel();
        tokio::spawn(write_loop(
            sink,
            outgoing_rx,
            self.cancel_token.clone(),
            self.id,
        ));

        let user = match tokio::time::timeout(AUTH_TIMEOUT, self.await_auth(&mut stream)).await {
            Ok(AuthPhase::Authenticated(user)) => user,
            Ok(AuthPhase::Refused(reason)) => {
                self.refuse(&outgoing, reason);
                return;
            }
            Ok(AuthPhase::Disconnected) => {
                self.cancel_token.cancel();
                return;
            }
            Err(_) => {
                self.refuse(&outgoing, "Authentication timeout");
                return;
            }
        };
        if !self.server.has_capacity() {
            self.refuse(&outgoing, "Server full");
            return;
        }
        log::info!(
            "client {} authenticated as {} ({})",
            self.id,
            user.username,
            user.id
        );

        self.run_session(stream, outgoing, user).await;
    }

    async fn await_auth(&self, stream: &mut WsStream) -> AuthPhase {
        while let Some(message) = stream.next().await {
            let Ok(message) = message else {
                return AuthPhase::Disconnected;
            };
            match classify_pre_auth(&message) {
                PreAuth::Token(token) => {
                    return match self.account.verify(&token).await {
                        Ok(user) => AuthPhase::Authenticated(user),
                        Err(e) => {
                            log::info!("client {} failed auth: {e}", self.id);
                            AuthPhase::Refused("Authentication failed")
                        }
                    };
                }
                PreAuth::Violation => return AuthPhase::Refused("Authentication required"),
                PreAuth::Ignore => {}
                PreAuth::Disconnect => return AuthPhase::Disconnected,
            }
        }
        AuthPhase::Disconnected
    }

    /// Closes the socket with policy code 1008 and the given reason.
    fn refuse(&self, outgoing: &UnboundedSender<WsOutbound>, reason: &'static str) {
        log::info!("closing client {}: {reason}", self.id);
        let _ = outgoing.send(WsOutbound::Close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: reason.into(),
        })));
    }

    async fn run_session(
        &self,
        mut stream: WsStream,
        outgoing: UnboundedSender<WsOutbound>,
        user: VerifiedUser,
    ) {
        let connection: Arc<dyn SessionConnection> = Arc::new(WsConnection {
            outgoing: outgoing.clone(),
            cancel_token: self.cancel_token.clone(),
        });
        let session = Arc::new(PlayerSession::new(
            self.id,
            user.id.clone(),
            user.uuid.unwrap_or_else(Uuid::new_v4),
            user.username,
            SPAWN_POSITION,
            connection,
        ));
        session.send(&ServerMessage::WorldInit {
            player_id: user.id,
            world_size: self.server.config().world_size,
        });

        let resume = self.server.take_resume_snapshot(&session.user_id);
        let (mut streamer, mut events) = ChunkStreamer::new(
            Arc::clone(&session),
            Arc::clone(self.server.store()),
            Arc::clone(self.server.serialize_pool()),
            self.server.config().render_distance_chunks,
            Duration::from_millis(self.server.config().initial_chunk_generation_wait_ms),
            resume,
        );
        self.server.register_session(Arc::clone(&session));
        streamer.on_authenticated(SPAWN_POSITION);

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let mut violations = 0u32;
        loop {
            select! {
                () = self.cancel_token.cancelled() => break,
                _ = tick.tick() => streamer.tick(),
                event = events.recv() => {
                    let Some(event) = event else { break };
                    streamer.handle_event(event);
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(message)) => {
                            if self
                                .handle_message(message, &session, &mut streamer, &mut violations)
                                .await
                            {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            log::debug!("read failed for client {}: {e}", self.id);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        self.server
            .store_resume_snapshot(&session.user_id, streamer.snapshot());
        streamer.shutdown();
        self.server.remove_session(session.id);
        self.cancel_token.cancel();
        log::info!("client {} ({}) disconnected", self.id, session.username);
    }

    /// Handles one frame from an authenticated client. Returns whether
    /// the session should close.
    async fn handle_message(
        &self,
        message: Message,
        session: &Arc<PlayerSession>,
        streamer: &mut ChunkStreamer,
        violations: &mut u32,
    ) -> bool {
        match message {
            Message::Text(text) => match ClientMessage::parse(&text) {
                Ok(message) => {
                    self.route(message, session, streamer).await;
                    false
                }
                Err(e) => {
                    log::warn!("client {} sent a malformed message: {e}", self.id);
                    self.strike(session, violations)
                }
            },
            Message::Binary(_) => {
                log::warn!("client {} sent an unexpected binary frame", self.id);
                self.strike(session, violations)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => false,
            Message::Close(_) => true,
        }
    }

    /// Counts a protocol violation; repeated violations close the socket.
    fn strike(&self, session: &Arc<PlayerSession>, violations: &mut u32) -> bool {
        *violations += 1;
        if *violations >= MAX_PROTOCOL_VIOLATIONS {
            log::warn!(
                "closing client {} after {violations} protocol violations",
                self.id
            );
            session.connection().close();
            true
        } else {
            false
        }
    }

    async fn route(
        &self,
        message: ClientMessage,
        session: &Arc<PlayerSession>,
        streamer: &mut ChunkStreamer,
    ) {
        match message {
            ClientMessage::ChunkAck { chunk_key, seq } => {
                streamer.on_chunk_ack(&chunk_key, seq);
                self.server
                    .store_resume_snapshot(&session.user_id, streamer.snapshot());
            }
            ClientMessage::ChunkHave { seqs, ranges } => {
                streamer.on_chunk_have(&seqs, &ranges);
            }
            ClientMessage::PlayerMove { x, y, z } => {
                let clamp = |v: f64| {
                    if v.is_finite() {
                        v.clamp(-MAX_PLAYER_COORDINATE, MAX_PLAYER_COORDINATE)
                    } else {
                        0.0
                    }
                };
                let position = DVec3::new(clamp(x), clamp(y), clamp(z));
                if position != session.position() {
                    streamer.on_position_update(position);
                    self.server.broadcast_except(
                        session.id,
                        &ServerMessage::PlayerMove {
                            id: session.id,
                            x: position.x,
                            y: position.y,
                            z: position.z,
                        },
                    );
                }
            }
            ClientMessage::BreakBlock { x, y, z, action_id } => {
                handle_block_action(
                    &self.server,
                    session,
                    ActionKind::Break,
                    BlockPos::new(x, y, z),
                    None,
                    action_id,
                )
                .await;
            }
            ClientMessage::PlaceBlock {
                x,
                y,
                z,
                block_type,
                action_id,
            } => {
                handle_block_action(
                    &self.server,
                    session,
                    ActionKind::Place,
                    BlockPos::new(x, y, z),
                    block_type,
                    action_id,
                )
                .await;
            }
            ClientMessage::AuthInfo { .. } => {
                log::debug!("client {} re-sent auth_info, ignoring", self.id);
            }
        }
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut outgoing: UnboundedReceiver<WsOutbound>,
    cancel_token: CancellationToken,
    id: u64,
) {
    loop {
        select! {
            () = cancel_token.cancelled() => break,
            frame = outgoing.recv() => {
                let message = match frame {
                    Some(WsOutbound::Text(text)) => Message::Text(text),
                    Some(WsOutbound::Binary(bytes)) => Message::Binary(bytes.to_vec()),
                    Some(WsOutbound::Close(frame)) => {
                        let _ = sink.send(Message::Close(frame)).await;
                        cancel_token.cancel();
                        break;
                    }
                    None => {
                        cancel_token.cancel();
                        break;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    log::debug!("write failed for client {id}: {e}");
                    cancel_token.cancel();
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
