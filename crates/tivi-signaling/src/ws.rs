//! Websocket transport: authenticate at upgrade time, then pump frames
//! between the socket and the coordinator.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tivi_proto::events::ErrorCode;
use tivi_proto::{ClientEvent, ServerEvent};
use tracing::{debug, warn};

use crate::api::{rate_limited, unauthorized, AppState};
use crate::auth::{extract_bearer_token, AuthError, Principal};
use crate::rate_limit::RateClass;

/// How long a closing connection may spend flushing queued events.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

// GET /ws?token=...
pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(limited) = state.rate_limiter.check(addr.ip(), RateClass::Connect).await {
        return rate_limited(&state, addr, limited);
    }

    let token = params
        .token
        .as_deref()
        .or_else(|| extract_bearer_token(headers.get(AUTHORIZATION)));
    let principal = match token.ok_or(AuthError::Malformed).and_then(|t| state.verifier.verify(t)) {
        Ok(principal) => principal,
        Err(e) => {
            warn!(ip = %addr.ip(), "websocket authentication failed");
            return unauthorized(&state, e);
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, state, principal))
}

async fn serve_socket(socket: WebSocket, state: AppState, principal: Principal) {
    let coordinator = Arc::clone(&state.coordinator);
    let mut shutdown = state.shutdown.clone();
    let (conn, mut outbound) = coordinator.connect(&principal);
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode outbound event: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => coordinator.handle(&conn, &principal, event),
                    Err(e) => {
                        debug!(conn = %conn.id(), error = %e, "unparseable frame");
                        conn.send(ServerEvent::error(ErrorCode::BadMessage, e.to_string()));
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    conn.send(ServerEvent::error(ErrorCode::BadMessage, "binary frames are not supported"));
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by the websocket layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %conn.id(), error = %e, "websocket read failed");
                    break;
                }
            },
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(conn = %conn.id(), "closing for shutdown");
                    break;
                }
            }
        }
    }

    coordinator.disconnect(&conn, &principal);
    // Once every sender is gone the writer drains and closes the socket.
    drop(conn);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}
