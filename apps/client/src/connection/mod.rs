//! Tunnel sockets: one primary and one secondary per configured connection

mod backoff;
mod socket;

pub use backoff::Backoff;
pub use socket::{TunnelSettings, spawn_tunnel, websocket_url};

use broker_common::{
    BrokerError, Message, PendingRequests, RequestPayload, ResponsePayload, Result, Role,
    constants::CAPABILITY_RECEIVE_POST_STREAMS,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

/// Connection state of one tunnel socket
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Identifying,
    Open,
    Reconnecting { attempt: usize, next_delay: Duration },
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Identifying => "identifying",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
struct HandleInner {
    identifier: String,
    role: Role,
    state: Mutex<ConnectionState>,
    outgoing: Mutex<Option<mpsc::Sender<WsMessage>>>,
    server_capabilities: RwLock<Vec<String>>,
    pending: PendingRequests,
}

/// Cloneable view of one tunnel socket that can only send and receive
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    inner: Arc<HandleInner>,
}

impl TunnelHandle {
    pub fn new(identifier: &str, role: Role) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                identifier: identifier.to_string(),
                role,
                state: Mutex::new(ConnectionState::Pending),
                outgoing: Mutex::new(None),
                server_capabilities: RwLock::new(Vec::new()),
                pending: PendingRequests::new(),
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state.lock().await.clone()
    }

    pub(crate) async fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock().await = state;
    }

    pub async fn is_open(&self) -> bool {
        matches!(*self.inner.state.lock().await, ConnectionState::Open)
    }

    /// Bind an open socket's write channel and mark the handle open
    pub(crate) async fn attach(&self, tx: mpsc::Sender<WsMessage>) {
        *self.inner.outgoing.lock().await = Some(tx);
        self.set_state(ConnectionState::Open).await;
    }

    pub(crate) async fn detach(&self) {
        self.inner.outgoing.lock().await.take();
    }

    pub(crate) async fn set_server_capabilities(&self, capabilities: Vec<String>) {
        *self.inner.server_capabilities.write().await = capabilities;
    }

    /// Whether the server accepts streamed responses over HTTP POST
    pub async fn server_accepts_post_streams(&self) -> bool {
        self.inner
            .server_capabilities
            .read()
            .await
            .iter()
            .any(|c| c == CAPABILITY_RECEIVE_POST_STREAMS)
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.inner.pending
    }

    /// Queue a message on the socket
    pub async fn send(&self, message: &Message) -> Result<()> {
        let text = message.to_json()?;
        let tx = self
            .inner
            .outgoing
            .lock()
            .await
            .clone()
            .ok_or_else(|| BrokerError::ConnectionError("socket is not open".to_string()))?;
        tx.send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| BrokerError::WebSocketError(e.to_string()))
    }

    /// Relay a request to the server and wait for its response
    pub async fn request(&self, payload: RequestPayload, timeout: Duration) -> Result<ResponsePayload> {
        let id = broker_common::utils::generate_request_id();
        let rx = self.inner.pending.register(&id);
        debug!("Relaying {} {} as {}", payload.method, payload.url, id);

        if let Err(e) = self
            .send(&Message::Request {
                id: id.clone(),
                payload,
            })
            .await
        {
            self.inner.pending.cancel(&id);
            return Err(e);
        }
        self.inner.pending.wait(&id, rx, timeout).await
    }
}

/// Handles of both sockets of a pair, shared with the webserver and shutdown
#[derive(Debug, Clone)]
pub struct PairHandles {
    pub name: String,
    pub integration_type: Option<String>,
    pub primary: TunnelHandle,
    pub secondary: TunnelHandle,
}

impl PairHandles {
    pub fn new(
        name: &str,
        integration_type: Option<String>,
        primary: TunnelHandle,
        secondary: TunnelHandle,
    ) -> Self {
        Self {
            name: name.to_string(),
            integration_type,
            primary,
            secondary,
        }
    }

    /// The primary socket when open, otherwise the secondary when open
    pub async fn open_handle(&self) -> Option<TunnelHandle> {
        if self.primary.is_open().await {
            Some(self.primary.clone())
        } else if self.secondary.is_open().await {
            Some(self.secondary.clone())
        } else {
            None
        }
    }
}

/// A live pair of tunnel sockets; both members are torn down together
#[derive(Debug)]
pub struct TunnelPair {
    pub handles: PairHandles,
    tasks: Vec<JoinHandle<()>>,
}

impl TunnelPair {
    pub fn new(handles: PairHandles, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { handles, tasks }
    }

    pub async fn is_open(&self) -> bool {
        self.handles.open_handle().await.is_some()
    }

    pub async fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
        for handle in [&self.handles.primary, &self.handles.secondary] {
            handle.detach().await;
            handle.set_state(ConnectionState::Closed).await;
        }
        debug!("Closed connection pair {}", self.handles.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_variants() {
        let state = ConnectionState::Pending;
        assert_eq!(state.name(), "pending");

        let state = ConnectionState::Reconnecting {
            attempt: 1,
            next_delay: Duration::from_secs(1),
        };
        assert!(matches!(state, ConnectionState::Reconnecting { .. }));
        assert_eq!(state.name(), "reconnecting");
    }

    #[tokio::test]
    async fn test_send_requires_open_socket() {
        let handle = TunnelHandle::new("tok", Role::Primary);
        assert!(handle.send(&Message::Ping).await.is_err());

        let (tx, mut rx) = mpsc::channel(1);
        handle.attach(tx).await;
        assert!(handle.is_open().await);
        handle.send(&Message::Ping).await.unwrap();
        assert!(matches!(rx.recv().await, Some(WsMessage::Text(_))));
    }

    #[tokio::test]
    async fn test_open_handle_prefers_primary() {
        let primary = TunnelHandle::new("tok", Role::Primary);
        let secondary = TunnelHandle::new("tok", Role::Secondary);
        let pair = PairHandles::new("c", None, primary.clone(), secondary.clone());
        assert!(pair.open_handle().await.is_none());

        let (tx, _rx) = mpsc::channel(1);
        secondary.attach(tx).await;
        assert_eq!(pair.open_handle().await.unwrap().role(), Role::Secondary);

        let (tx, _rx2) = mpsc::channel(1);
        primary.attach(tx).await;
        assert_eq!(pair.open_handle().await.unwrap().role(), Role::Primary);
    }

    #[tokio::test]
    async fn test_request_completes_from_response() {
        let handle = TunnelHandle::new("tok", Role::Primary);
        let (tx, mut rx) = mpsc::channel(1);
        handle.attach(tx).await;

        let responder = handle.clone();
        tokio::spawn(async move {
            let Some(WsMessage::Text(text)) = rx.recv().await else {
                panic!("expected request frame");
            };
            let Message::Request { id, .. } = Message::from_json(&text).unwrap() else {
                panic!("expected request message");
            };
            responder
                .pending()
                .complete(&id, ResponsePayload::json(200, &serde_json::json!({"ok": true})));
        });

        let resp = handle
            .request(RequestPayload::new("GET", "/x"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(handle.pending().is_empty());
    }
}
