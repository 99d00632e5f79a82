//! # Vaste Server
//!
//! The server binary crate: configuration file I/O, logger bootstrap,
//! the WebSocket accept loop and the per-socket auth state machine.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use vaste_core::server::Server;

use crate::network::account::AccountClient;
use crate::network::ws_client::WsClient;

pub mod config;
pub mod logger;
pub mod network;

/// The listening server: accepts sockets and spawns a client task per
/// connection.
pub struct VasteServer {
    /// The bound listener.
    pub tcp_listener: TcpListener,
    /// Cancelled to stop accepting and tear every client down.
    pub cancel_token: CancellationToken,
    /// Shared server state.
    pub server: Arc<Server>,
    /// Account service client shared by every socket's auth step.
    pub account: Arc<AccountClient>,
    client_id: u64,
    task_tracker: TaskTracker,
}

impl VasteServer {
    /// Binds the listener on the configured port.
    pub async fn bind(server: Arc<Server>, account: Arc<AccountClient>) -> std::io::Result<Self> {
        let port = server.config().port;
        let tcp_listener = TcpListener::bind(("0.0.0.0", port)).await?;
        log::info!("listening on port {port}");
        Ok(Self {
            tcp_listener,
            cancel_token: CancellationToken::new(),
            server,
            account,
            client_id: 0,
            task_tracker: TaskTracker::new(),
        })
    }

    /// Accepts connections until the cancel token fires.
    pub async fn start(&mut self) {
        loop {
            select! {
                () = self.cancel_token.cancelled() => {
                    break;
                }
                accept_result = self.tcp_listener.accept() => {
                    let Ok((stream, address)) = accept_result else {
                        continue;
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        log::warn!("failed to set TCP_NODELAY: {e}");
                    }
                    self.client_id = self.client_id.wrapping_add(1);
                    let client = WsClient::new(
                        self.client_id,
                        address,
                        Arc::clone(&self.server),
                        Arc::clone(&self.account),
                        self.cancel_token.child_token(),
                    );
                    log::info!("accepted connection from {address} (id {})", self.client_id);
                    self.task_tracker.spawn(client.run(stream));
                }
            }
        }
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }
}
