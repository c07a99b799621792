use anyhow::Result;
use broker_common::{
    BrokerError, ClientMetadata, Message, NotificationLevel, Role,
    constants::{BROKER_VERSION, CAPABILITY_POST_STREAMS, OUTGOING_CHANNEL_SIZE},
    mask_token,
    protocol::Identification,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message as WsMessage,
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
    },
};
use tracing::{debug, error, info, warn};

use super::{Backoff, ConnectionState, TunnelHandle};
use crate::{auth, context::BrokerContext, service, workload};

type WebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// What a socket needs to know about the connection it serves
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub connection_name: String,
    pub identifier: String,
    pub role: Role,
    pub server_id: Option<String>,
    pub supported_integration_type: Option<String>,
}

/// Tunnel endpoint for a token, carrying the HA routing query parameters
pub fn websocket_url(
    server_url: &str,
    identifier: &str,
    server_id: Option<&str>,
    role: Role,
) -> broker_common::Result<String> {
    let mut url = url::Url::parse(server_url)
        .map_err(|e| BrokerError::ConnectionError(format!("Invalid server URL: {}", e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| BrokerError::ConnectionError("Invalid server URL scheme".to_string()))?;
    url.set_path(&format!("/primus/{}/", identifier));
    {
        let mut query = url.query_pairs_mut();
        if let Some(server_id) = server_id {
            query.append_pair("server_id", server_id);
        }
        query.append_pair("connection_role", role.as_str());
    }
    Ok(url.to_string())
}

/// Run one tunnel member until it is aborted or its reconnect attempts run out
pub fn spawn_tunnel(
    ctx: Arc<BrokerContext>,
    settings: TunnelSettings,
    handle: TunnelHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move { run(ctx, settings, handle).await })
}

/// Main run loop with automatic reconnection
async fn run(ctx: Arc<BrokerContext>, settings: TunnelSettings, handle: TunnelHandle) {
    let mut backoff = Backoff::new(ctx.config.reconnect_config.clone());

    loop {
        handle.set_state(ConnectionState::Connecting).await;

        match establish_connection(&ctx, &settings, &handle).await {
            Ok(ws_stream) => {
                info!(
                    "Tunnel {} ({}) established",
                    settings.connection_name, settings.role
                );
                backoff.reset();

                if let Err(e) = handle_connection(&ctx, &settings, &handle, ws_stream).await {
                    error!("Connection error: {}", e);
                }
            }
            Err(e) => {
                error!(
                    "Failed to connect {} ({}): {}",
                    settings.connection_name, settings.role, e
                );
            }
        }
        handle.detach().await;

        let Some(delay) = backoff.next_delay() else {
            error!(
                "Reconnect failed for {} ({}) after {} attempts",
                settings.connection_name,
                settings.role,
                backoff.attempt()
            );
            handle.set_state(ConnectionState::Closed).await;
            ctx.exit.exit(1);
            return;
        };

        handle
            .set_state(ConnectionState::Reconnecting {
                attempt: backoff.attempt(),
                next_delay: delay,
            })
            .await;
        info!(
            "Reconnecting {} ({}) in {:?} (attempt {})",
            settings.connection_name,
            settings.role,
            delay,
            backoff.attempt()
        );
        tokio::time::sleep(delay).await;
    }
}

/// Open the socket and answer the server's identify challenge
async fn establish_connection(
    ctx: &BrokerContext,
    settings: &TunnelSettings,
    handle: &TunnelHandle,
) -> Result<WebSocket> {
    let url = websocket_url(
        &ctx.config.server_url,
        &settings.identifier,
        settings.server_id.as_deref(),
        settings.role,
    )?;
    debug!(
        "Connecting to {} for {}",
        ctx.config.server_url,
        mask_token(&settings.identifier)
    );

    let mut request = url
        .into_client_request()
        .map_err(|e| BrokerError::ConnectionError(format!("Invalid URL: {}", e)))?;
    let mut headers = vec![
        ("x-snyk-broker-client-id", ctx.client_id.clone()),
        ("x-snyk-broker-client-role", settings.role.to_string()),
        ("x-broker-client-version", BROKER_VERSION.to_string()),
    ];
    if let Some(auth) = ctx.auth_header().await {
        headers.push(("authorization", auth));
    }
    for (name, value) in headers {
        request.headers_mut().insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(&value)
                .map_err(|e| BrokerError::ConnectionError(format!("Invalid header {}: {}", name, e)))?,
        );
    }

    let (mut ws_stream, _) = tokio::time::timeout(ctx.config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| BrokerError::ConnectionError("Connection timeout".to_string()))?
        .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

    handle.set_state(ConnectionState::Identifying).await;
    debug!("WebSocket connected, waiting for identify challenge");

    // Wait for the identify challenge with timeout
    let capabilities = tokio::time::timeout(ctx.config.connect_timeout, async {
        while let Some(message) = ws_stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    if let Ok(Message::IdentifyRequest { capabilities }) = Message::from_json(&text) {
                        return Ok(capabilities);
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    return Err(BrokerError::ConnectionError(
                        "Server closed connection during handshake".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(BrokerError::WebSocketError(e.to_string()));
                }
                _ => {}
            }
        }
        Err(BrokerError::ConnectionError(
            "Connection closed before handshake".to_string(),
        ))
    })
    .await
    .map_err(|_| BrokerError::ConnectionError("Connection handshake timeout".to_string()))??;

    handle.set_server_capabilities(capabilities).await;

    let mut metadata = ClientMetadata::new(ctx.client_id.clone(), BROKER_VERSION, settings.role);
    metadata.capabilities = vec![CAPABILITY_POST_STREAMS.to_string()];
    metadata.filters = ctx.rules().await;
    metadata.server_id = settings.server_id.clone();
    metadata.supported_integration_type = settings.supported_integration_type.clone();
    metadata.broker_app_client_id = ctx.broker_app_client_id();

    let identify = Message::Identify(Identification {
        token: settings.identifier.clone(),
        metadata,
    });
    ws_stream
        .send(WsMessage::Text(identify.to_json()?.into()))
        .await
        .map_err(|e| BrokerError::WebSocketError(format!("Failed to send identify: {}", e)))?;

    Ok(ws_stream)
}

/// Handle an identified socket with split read/write tasks
async fn handle_connection(
    ctx: &Arc<BrokerContext>,
    settings: &TunnelSettings,
    handle: &TunnelHandle,
    ws_stream: WebSocket,
) -> Result<()> {
    let (write, read) = ws_stream.split();
    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CHANNEL_SIZE);
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    handle.attach(outgoing_tx.clone()).await;

    let renewal = auth::spawn_renewal(
        ctx.clone(),
        settings.identifier.clone(),
        settings.role,
        settings.server_id.clone(),
    )
    .await;

    let mut write_handle = tokio::spawn(spawn_write_task(write, outgoing_rx));
    let mut read_handle = tokio::spawn(spawn_read_task(
        read,
        ctx.clone(),
        handle.clone(),
        outgoing_tx.clone(),
        last_pong.clone(),
    ));
    let mut heartbeat_handle = tokio::spawn(spawn_heartbeat_task(
        outgoing_tx,
        ctx.config.heartbeat_interval,
        ctx.config.pong_timeout,
        last_pong,
    ));

    // Wait for any task to complete (usually means connection dropped)
    tokio::select! {
        result = &mut write_handle => {
            warn!("Write task ended: {:?}", result);
        }
        result = &mut read_handle => {
            warn!("Read task ended: {:?}", result);
        }
        result = &mut heartbeat_handle => {
            warn!("Heartbeat task ended: {:?}", result);
        }
    }

    for task in [write_handle, read_handle, heartbeat_handle] {
        task.abort();
    }
    if let Some(renewal) = renewal {
        renewal.abort();
    }
    handle.detach().await;
    Ok(())
}

/// Write task sends outgoing messages through WebSocket
async fn spawn_write_task(
    mut write: SplitSink<WebSocket, WsMessage>,
    mut outgoing_rx: mpsc::Receiver<WsMessage>,
) -> Result<()> {
    while let Some(message) = outgoing_rx.recv().await {
        if let Err(e) = write.send(message).await {
            error!("Failed to send message: {}", e);
            break;
        }
    }

    debug!("Write task exiting");
    Ok(())
}

/// Read task receives incoming messages and dispatches them
async fn spawn_read_task(
    mut read: SplitStream<WebSocket>,
    ctx: Arc<BrokerContext>,
    handle: TunnelHandle,
    outgoing_tx: mpsc::Sender<WsMessage>,
    last_pong: Arc<Mutex<Instant>>,
) -> Result<()> {
    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                if let Err(e) =
                    handle_text_message(&text, &ctx, &handle, &outgoing_tx, &last_pong).await
                {
                    error!("Error handling message: {}", e);
                }
            }
            Ok(WsMessage::Binary(_)) => {
                warn!("Received unexpected binary message");
            }
            Ok(WsMessage::Ping(data)) => {
                if let Err(e) = outgoing_tx.send(WsMessage::Pong(data)).await {
                    error!("Failed to send pong: {}", e);
                    break;
                }
            }
            Ok(WsMessage::Pong(_)) => {
                *last_pong.lock().await = Instant::now();
            }
            Ok(WsMessage::Close(_)) => {
                info!("Server closed connection");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    debug!("Read task exiting");
    Ok(())
}

/// Handle incoming text messages
async fn handle_text_message(
    text: &str,
    ctx: &Arc<BrokerContext>,
    handle: &TunnelHandle,
    outgoing_tx: &mpsc::Sender<WsMessage>,
    last_pong: &Mutex<Instant>,
) -> Result<()> {
    match Message::from_json(text)? {
        Message::Ping => {
            let pong = Message::Pong.to_json()?;
            outgoing_tx
                .send(WsMessage::Text(pong.into()))
                .await
                .map_err(|e| BrokerError::WebSocketError(e.to_string()))?;
        }

        Message::Pong => {
            *last_pong.lock().await = Instant::now();
        }

        Message::Request { id, payload } => {
            debug!("Received request {}: {} {}", id, payload.method, payload.url);

            // Spawn a new task to handle this request concurrently
            let ctx = ctx.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                workload::handle_tunnel_request(ctx, handle, id, payload).await;
            });
        }

        Message::Response { id, payload } => {
            if !handle.pending().complete(&id, payload) {
                debug!("Discarding late response {}", id);
            }
        }

        Message::Service { id, command } => {
            let ctx = ctx.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let payload = service::handle_command(&ctx, &command).await;
                if let Err(e) = handle.send(&Message::Response { id, payload }).await {
                    error!("Failed to answer service command {}: {}", command, e);
                }
            });
        }

        Message::IdentifyRequest { capabilities } => {
            debug!("Server capabilities updated: {:?}", capabilities);
            handle.set_server_capabilities(capabilities).await;
        }

        Message::Notification { level, message } => match level {
            NotificationLevel::Warning => warn!("Broker server: {}", message),
            NotificationLevel::Error => error!("Broker server: {}", message),
        },

        Message::Error {
            request_id,
            code,
            message,
        } => {
            error!(
                "Server error: {:?} - {} (request_id: {:?})",
                code, message, request_id
            );
        }

        _ => {
            warn!("Received unexpected message type");
        }
    }

    Ok(())
}

/// Heartbeat task sends periodic pings and ends when pongs stop arriving
async fn spawn_heartbeat_task(
    outgoing_tx: mpsc::Sender<WsMessage>,
    interval: Duration,
    pong_timeout: Duration,
    last_pong: Arc<Mutex<Instant>>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let silent_for = last_pong.lock().await.elapsed();
        if silent_for > interval + pong_timeout {
            warn!("No pong for {:?}, dropping connection", silent_for);
            break;
        }

        let ping_json = Message::Ping.to_json()?;
        if let Err(e) = outgoing_tx.send(WsMessage::Text(ping_json.into())).await {
            error!("Failed to send heartbeat: {}", e);
            break;
        }

        debug!("Sent heartbeat");
    }

    debug!("Heartbeat task exiting");
    Ok(())
}
