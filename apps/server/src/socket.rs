//! Client tunnel endpoint
//!
//! Each upgraded socket gets a write task fed by an mpsc channel and a read task that
//! handles the identify handshake and then dispatches typed messages.

use axum::{
    extract::{
        Path, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use broker_common::{
    BrokerError, Message, NotificationLevel,
    constants::{CAPABILITY_RECEIVE_POST_STREAMS, OUTGOING_CHANNEL_SIZE},
    hash_token, mask_token,
    protocol::Identification,
    stream::handle_legacy_chunk,
    validation::version_below,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{AppState, ClientSocket, auth, relay};

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Upgrade handler for `/primus/{token}/`
pub async fn upgrade(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let claims = match auth::authenticate(&state.config, &headers) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("Rejecting tunnel for {}: {}", mask_token(&token), e);
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    let broker_app_client_id = claims.and_then(|c| c.azp);
    let token = token.to_lowercase();

    ws.on_upgrade(move |socket| handle_socket(state, token, broker_app_client_id, socket))
}

/// Per-socket bookkeeping shared by the read loop
struct Session {
    token: String,
    broker_app_client_id: Option<String>,
    client: Option<ClientSocket>,
}

/// Run one client socket until it closes
pub async fn handle_socket(
    state: Arc<AppState>,
    token: String,
    broker_app_client_id: Option<String>,
    socket: WebSocket,
) {
    info!(
        "New client connection: {} ({})",
        mask_token(&token),
        hash_token(&token)
    );
    let (write, read) = socket.split();
    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CHANNEL_SIZE);

    let challenge = Message::IdentifyRequest {
        capabilities: vec![CAPABILITY_RECEIVE_POST_STREAMS.to_string()],
    };
    if let Err(e) = send(&outgoing_tx, &challenge).await {
        error!("Failed to queue identify challenge: {}", e);
        return;
    }

    let mut session = Session {
        token,
        broker_app_client_id,
        client: None,
    };

    let mut write_handle = tokio::spawn(write_task(write, outgoing_rx));

    // Read inline so the session is available for cleanup afterwards
    tokio::select! {
        result = &mut write_handle => {
            warn!("Write task ended: {:?}", result);
        }
        close_queued = read_loop(read, &state, &mut session, &outgoing_tx) => {
            if close_queued {
                // let the notification and close frame go out
                let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut write_handle).await;
            }
        }
    }
    write_handle.abort();

    close_session(&state, &session);
}

async fn write_task(
    mut write: SplitSink<WebSocket, WsMessage>,
    mut outgoing_rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        let closing = matches!(message, WsMessage::Close(_));
        if let Err(e) = write.send(message).await {
            error!("Failed to send message: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    debug!("Write task exiting");
}

/// Read until the socket ends; returns true when a close frame was queued
async fn read_loop(
    mut read: SplitStream<WebSocket>,
    state: &Arc<AppState>,
    session: &mut Session,
    outgoing_tx: &mpsc::Sender<WsMessage>,
) -> bool {
    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                match handle_text_message(text.as_str(), state, session, outgoing_tx).await {
                    Ok(true) => {}
                    Ok(false) => return true,
                    Err(e) => error!("Error handling message: {}", e),
                }
            }
            Ok(WsMessage::Binary(_)) => {
                warn!("Received unexpected binary message");
            }
            Ok(WsMessage::Close(_)) => {
                debug!("Client closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
        }
    }
    false
}

/// Handle one text frame; `Ok(false)` ends the socket
async fn handle_text_message(
    text: &str,
    state: &Arc<AppState>,
    session: &mut Session,
    outgoing_tx: &mpsc::Sender<WsMessage>,
) -> broker_common::Result<bool> {
    let message = Message::from_json(text)?;

    let Some(client) = session.client.clone() else {
        return match message {
            Message::Identify(identification) => {
                match identify(state, session, identification, outgoing_tx).await {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        warn!("Identify rejected: {}", e);
                        let _ = outgoing_tx.send(WsMessage::Close(None)).await;
                        Ok(false)
                    }
                }
            }
            Message::Ping => {
                send(outgoing_tx, &Message::Pong).await?;
                Ok(true)
            }
            _ => {
                warn!("Ignoring message from unidentified client");
                Ok(true)
            }
        };
    };

    match message {
        Message::Ping => {
            if client.is_terminating() {
                debug!(
                    "Disabling client ping since client {} is terminating",
                    client.metadata.client_id
                );
            } else {
                send(outgoing_tx, &Message::Pong).await?;
            }
        }

        Message::Pong => {}

        Message::Request { id, payload } => {
            debug!("Received client request {}: {} {}", id, payload.method, payload.url);
            let state = state.clone();
            let token = session.token.clone();
            tokio::spawn(async move {
                let response = relay::handle_client_request(&state, &token, &client, payload).await;
                if let Err(e) = client.send(&Message::Response { id, payload: response }).await {
                    error!("Failed to answer client request: {}", e);
                }
            });
        }

        Message::Response { id, payload } => {
            if !client.pending().complete(&id, payload) {
                debug!("Discarding late response {}", id);
            }
        }

        Message::Chunk {
            streaming_id,
            data,
            finished,
            head,
            error,
        } => {
            handle_legacy_chunk(&state.streams, &streaming_id, &data, finished, head, error)
                .await?;
        }

        Message::Terminate { signal } => {
            info!(
                "Client {} is terminating ({})",
                client.metadata.client_id, signal
            );
            state
                .pool
                .mark_terminating(&session.token, &client.metadata.client_id);
        }

        Message::Identify(_) => {
            debug!("Ignoring repeated identify");
        }

        Message::Error {
            request_id,
            code,
            message,
        } => {
            error!(
                "Client error: {:?} - {} (request_id: {:?})",
                code, message, request_id
            );
        }

        _ => {
            warn!("Received unexpected message type");
        }
    }

    Ok(true)
}

/// Check the client version and register the socket in the pool
async fn identify(
    state: &AppState,
    session: &mut Session,
    identification: Identification,
    outgoing_tx: &mpsc::Sender<WsMessage>,
) -> broker_common::Result<()> {
    let token = identification.token.to_lowercase();
    if token.is_empty() {
        return Err(BrokerError::InvalidMessage(
            "client identified without a token".to_string(),
        ));
    }

    let mut metadata = identification.metadata;
    let version = metadata.version.clone();
    let config = &state.config;
    if version != "local" && version_below(&version, &config.minimal_supported_version) {
        let notification = Message::Notification {
            level: NotificationLevel::Error,
            message: format!(
                "Broker client version is outdated. Minimal version: {}. Please upgrade to latest version.",
                config.minimal_supported_version
            ),
        };
        send(outgoing_tx, &notification).await?;
        return Err(BrokerError::ProtocolVersionRejected {
            version,
            minimum: config.minimal_supported_version.clone(),
        });
    }
    if version != "local" && version_below(&version, &config.minimal_recommended_version) {
        let notification = Message::Notification {
            level: NotificationLevel::Warning,
            message: format!(
                "Broker client version is deprecated. Minimal version: {}. Please upgrade to latest version.",
                config.minimal_recommended_version
            ),
        };
        send(outgoing_tx, &notification).await?;
    }

    if session.broker_app_client_id.is_some() {
        metadata.broker_app_client_id = session.broker_app_client_id.clone();
    }
    info!(
        "New client connection identified: {} ({}) client {} version {} role {}",
        mask_token(&token),
        hash_token(&token),
        metadata.client_id,
        version,
        metadata.role
    );

    let client = ClientSocket::new(outgoing_tx.clone(), metadata);
    if state.pool.register(&token, client.clone()) {
        debug!("Replaced previous socket of client {}", client.metadata.client_id);
    }
    session.token = token;
    session.client = Some(client);
    Ok(())
}

fn close_session(state: &AppState, session: &Session) {
    let masked = mask_token(&session.token);
    match &session.client {
        Some(client) => {
            let remaining = state.pool.remove(&session.token, client.socket_id());
            info!(
                "Client connection closed: {} ({} remaining)",
                masked, remaining
            );
            if remaining == 0 {
                info!("Removing client {}", masked);
            }
        }
        None => warn!("Client disconnected before identifying itself: {}", masked),
    }
}

async fn send(tx: &mpsc::Sender<WsMessage>, message: &Message) -> broker_common::Result<()> {
    let text = message.to_json()?;
    tx.send(WsMessage::Text(text.into()))
        .await
        .map_err(|_| BrokerError::ConnectionError("socket closed".to_string()))
}
