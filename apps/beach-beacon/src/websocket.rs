use std::borrow::Cow;
use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::DispatchError;
use crate::protocol::{self, Envelope};
use crate::registry::ConnectionId;
use crate::server::AppState;
use crate::session::Outbound;

/// Upgrade a signaling client to a WebSocket
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let connection = ConnectionId::new();
    let (sender, mut receiver) = socket.split();

    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(write_outbound(connection, sender, rx));

    info!(connection = %connection, remote_addr = %remote_addr, "websocket connected");

    if let Err(err) = state
        .dispatcher
        .on_connection_opened(connection, tx.clone())
        .await
    {
        warn!(connection = %connection, error = %err, "could not open negotiation session");
        let _ = tx.send(Outbound::Close {
            code: close_code::ERROR,
            reason: "media engine unavailable".into(),
        });
        drop(tx);
        if err.is_fatal() {
            state.report_fatal(err);
        }
        let _ = writer.await;
        return;
    }
    drop(tx);

    while let Some(frame) = receiver.next().await {
        let result = match frame {
            Ok(Message::Text(text)) => state.dispatcher.on_text_message(connection, &text),
            Ok(Message::Binary(data)) => state.dispatcher.on_binary_message(connection, data.len()),
            Ok(Message::Close(frame)) => {
                debug!(
                    connection = %connection,
                    reason = ?frame.map(|frame| frame.reason.into_owned()),
                    "client sent close frame"
                );
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(err) => {
                warn!(connection = %connection, error = %err, "websocket receive failed");
                break;
            }
        };

        match result {
            Ok(()) => {}
            Err(err @ (DispatchError::NoSession(_) | DispatchError::SessionClosed(_))) => {
                debug!(connection = %connection, error = %err, "dropping message for closed session");
            }
            Err(err) => {
                warn!(connection = %connection, error = %err, "dropping invalid signaling message");
            }
        }
    }

    state.dispatcher.on_connection_closed(connection);
    writer.abort();
    info!(connection = %connection, remote_addr = %remote_addr, "websocket disconnected");
}

async fn write_outbound(
    connection: ConnectionId,
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Signal(message) => {
                let text = match Envelope::try_from(message).and_then(|envelope| protocol::encode(&envelope)) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(connection = %connection, error = %err, "failed to encode signaling message");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: Cow::Owned(reason),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    debug!(connection = %connection, "websocket writer finished");
}
