// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket server implementation.
//!
//! Each connection joins one scope, named in the handshake query
//! (`?scope=...&token=...`). Requests are answered on the same socket and
//! applied commands are fanned out to every connection in the scope.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use tether_core::protocol::{ClientFrame, CommandBody, RequestKind, ServerFrame};

use crate::state::{now_millis, ApplyOutcome, ServerState};

/// Run the WebSocket server on the given address.
pub async fn run(addr: SocketAddr, state: ServerState) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on: {}", addr);
    serve(listener, state).await?;
    Ok(())
}

/// Accept connections from an already bound listener.
pub async fn serve(listener: TcpListener, state: ServerState) -> std::io::Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                error!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }
}

/// Connection parameters taken from the handshake query.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Handshake {
    pub scope: Option<String>,
    pub token: Option<String>,
}

impl Handshake {
    pub(crate) fn from_query(query: Option<&str>) -> Self {
        let mut handshake = Handshake::default();
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "scope" if !value.is_empty() => handshake.scope = Some(value.into_owned()),
                "token" => handshake.token = Some(value.into_owned()),
                _ => {}
            }
        }
        handshake
    }
}

fn refuse(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Handle a single WebSocket connection.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: ServerState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut scope = String::new();
    let callback = |request: &Request, response: Response| {
        let handshake = Handshake::from_query(request.uri().query());
        if !state.authorize(handshake.token.as_deref()) {
            return Err(refuse(StatusCode::UNAUTHORIZED, "invalid token"));
        }
        match handshake.scope {
            Some(s) => {
                scope = s;
                Ok(response)
            }
            None => Err(refuse(StatusCode::BAD_REQUEST, "missing scope")),
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    info!(%peer_addr, %scope, "client joined");

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let mut broadcast_rx = state.subscribe(&scope).await;

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_frame(&text, &scope, &state).await;
                        ws_sink.send(Message::Text(reply.to_json()?.into())).await?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} disconnected", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Client {} stream ended", peer_addr);
                        break;
                    }
                }
            }

            broadcast = broadcast_rx.recv() => {
                match broadcast {
                    Ok(frame) => {
                        let json = frame.to_json()?;
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            warn!("Failed to send broadcast to {}: {}", peer_addr, e);
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} lagged by {} messages", peer_addr, n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    info!("Connection closed: {}", peer_addr);
    Ok(())
}

/// Process one text frame and build the reply.
///
/// Unparseable frames have no correlation id to answer, so they are reported
/// with an `error` event instead.
pub(crate) async fn handle_client_frame(text: &str, scope: &str, state: &ServerState) -> ServerFrame {
    let frame = match ClientFrame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "invalid frame");
            return ServerFrame::event("error", Some(json!({ "message": e.to_string() })));
        }
    };
    debug!(kind = %frame.kind, correlation_id = %frame.correlation_id, "request");

    let result = match frame.kind {
        RequestKind::Command => apply_command(&frame, scope, state).await,
        RequestKind::Query => state
            .applied(scope)
            .map_err(|e| e.to_string())
            .and_then(|applied| serde_json::to_value(applied).map_err(|e| e.to_string())),
        RequestKind::ServerTimestamp => Ok(json!(now_millis())),
    };

    match result {
        Ok(data) => tether_core::Response::ok(frame.correlation_id, data).into(),
        Err(message) => tether_core::Response::err(frame.correlation_id, message).into(),
    }
}

async fn apply_command(
    frame: &ClientFrame,
    scope: &str,
    state: &ServerState,
) -> Result<serde_json::Value, String> {
    let command = CommandBody::decode(&frame.payload)?;
    if !command.scope_id.is_empty() && command.scope_id != scope {
        return Err(format!(
            "command for scope {} sent on scope {}",
            command.scope_id, scope
        ));
    }

    let id = command.id.clone();
    match state.apply(scope, command).await.map_err(|e| e.to_string())? {
        ApplyOutcome::Applied(applied) => {
            debug!(%id, action = %applied.command.action, "command applied");
            Ok(json!({ "id": id, "duplicate": false }))
        }
        ApplyOutcome::Duplicate => {
            debug!(%id, "duplicate command skipped");
            Ok(json!({ "id": id, "duplicate": true }))
        }
    }
}
