//! WebSocket transport for the relay.
//!
//! One task per connection owns the socket and multiplexes two sources:
//! frames arriving from the client and events queued for it by the relay.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{Extensions, HeaderMap};
use axum::response::{IntoResponse, Response};
use lanchat_shared::protocol::{ClientEvent, ServerEvent};
use lanchat_shared::types::PeerIp;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::error::ServerError;
use crate::identity::ConnectionMeta;
use crate::relay::Session;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let meta = ConnectionMeta::from_request(&headers, &extensions);
    let Some(ip) = state.resolver.resolve(&meta) else {
        warn!(?meta, "Rejecting socket with no resolvable address");
        return ServerError::BadRequest("Could not determine client address".into())
            .into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, ip))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, ip: PeerIp) {
    let (mut session, mut outbox) = state.relay.connect(ip).await;

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(frame)) => {
                        if handle_frame(&mut session, frame).await == Inbound::Close {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(conn = %session.id(), error = %e, "Socket read failed");
                        break;
                    }
                    None => break,
                }
            }
            event = outbox.recv() => {
                let Some(event) = event else { break };
                if !send_event(&mut socket, &session, &event).await {
                    break;
                }
            }
        }
    }

    session.close().await;
}

#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Continue,
    Close,
}

/// Apply one frame from the client. Bad frames are answered with an `error`
/// event and leave the connection open.
async fn handle_frame(session: &mut Session, frame: WsMessage) -> Inbound {
    match frame {
        WsMessage::Text(text) => match ClientEvent::from_frame(text.as_str()) {
            Ok(event) => session.handle(event).await,
            Err(e) => {
                debug!(conn = %session.id(), error = %e, "Malformed frame");
                session.reject(format!("Malformed event: {e}")).await;
            }
        },
        WsMessage::Binary(_) => {
            session.reject("Binary frames are not supported").await;
        }
        WsMessage::Close(_) => return Inbound::Close,
        // Ping/Pong handled by axum
        WsMessage::Ping(_) | WsMessage::Pong(_) => {}
    }
    Inbound::Continue
}

async fn send_event(socket: &mut WebSocket, session: &Session, event: &ServerEvent) -> bool {
    let frame = match event.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn = %session.id(), error = %e, "Failed to encode event");
            return true;
        }
    };
    match socket.send(WsMessage::Text(frame.into())).await {
        Ok(()) => true,
        Err(e) => {
            debug!(conn = %session.id(), ip = %session.ip(), error = %e, "Socket write failed");
            false
        }
    }
}
