//! Websocket transport for the relay.
//!
//! One task per connection reads client frames and the session mailbox; a
//! second task writes serialized events back to the socket so a slow client
//! never stalls the reader.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use huddle_shared::constants::MAX_FRAME_SIZE;
use huddle_shared::models::UserSnapshot;
use huddle_shared::protocol::ServerEvent;

use crate::api::{actor, AppState};
use crate::error::ApiError;
use crate::relay::{Connection, RelayContext};

/// The upgrade is refused unless the id header names an active account;
/// that account is the sender of every chat message on the connection.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = actor(&headers, &state).await?;
    let relay = state.relay.clone();
    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| run_connection(socket, relay, user)))
}

async fn run_connection(socket: WebSocket, relay: RelayContext, user: UserSnapshot) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(relay.mailbox);

    let (mut conn, mut mailbox) = Connection::open(&relay, user, tx).await;
    let session = conn.id();

    let outgoing_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match event.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode server event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => conn.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %session.short(), error = %e, "websocket read failed");
                    break;
                }
            },
            Some(dispatch) = mailbox.recv() => conn.handle_dispatch(dispatch),
        }
    }

    conn.close().await;
    outgoing_task.abort();
}
