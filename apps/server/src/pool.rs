//! Registry of identified client sockets keyed by hashed broker token

use axum::extract::ws::Message as WsMessage;
use broker_common::{
    BrokerError, ClientMetadata, Message, PendingRequests, RequestPayload, ResponsePayload,
    hash_token, utils::generate_request_id,
};
use dashmap::DashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// An identified client socket, cheap to clone
#[derive(Debug, Clone)]
pub struct ClientSocket {
    socket_id: u64,
    sender: mpsc::Sender<WsMessage>,
    pub metadata: ClientMetadata,
    pending: Arc<PendingRequests>,
    terminating: Arc<AtomicBool>,
}

impl ClientSocket {
    pub fn new(sender: mpsc::Sender<WsMessage>, metadata: ClientMetadata) -> Self {
        Self {
            socket_id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            sender,
            metadata,
            pending: Arc::new(PendingRequests::new()),
            terminating: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }

    pub fn set_terminating(&self) {
        self.terminating.store(true, Ordering::Relaxed);
    }

    pub async fn send(&self, message: &Message) -> broker_common::Result<()> {
        let text = message.to_json()?;
        self.sender
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| BrokerError::ConnectionError("client socket closed".to_string()))
    }

    /// Relay a request and wait for the correlated `response`
    pub async fn request(
        &self,
        payload: RequestPayload,
        timeout: Duration,
    ) -> broker_common::Result<ResponsePayload> {
        let id = generate_request_id();
        self.exchange(Message::Request { id: id.clone(), payload }, &id, timeout)
            .await
    }

    /// Send a service command and wait for the correlated `response`
    pub async fn service(
        &self,
        command: &str,
        timeout: Duration,
    ) -> broker_common::Result<ResponsePayload> {
        let id = generate_request_id();
        let message = Message::Service {
            id: id.clone(),
            command: command.to_string(),
        };
        self.exchange(message, &id, timeout).await
    }

    async fn exchange(
        &self,
        message: Message,
        id: &str,
        timeout: Duration,
    ) -> broker_common::Result<ResponsePayload> {
        let rx = self.pending.register(id);
        if let Err(e) = self.send(&message).await {
            self.pending.cancel(id);
            return Err(e);
        }
        self.pending.wait(id, rx, timeout).await
    }
}

/// Sockets per hashed token, newest first
///
/// Callers pass the raw token; only its hash is kept as the key.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    inner: DashMap<String, Vec<ClientSocket>>,
}

fn key(token: &str) -> String {
    hash_token(&token.to_ascii_lowercase())
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket; returns true when it replaced an entry with the same client id and role
    pub fn register(&self, token: &str, socket: ClientSocket) -> bool {
        let mut entries = self.inner.entry(key(token)).or_default();
        let existing = entries.iter().position(|entry| {
            !socket.metadata.client_id.is_empty()
                && entry.metadata.client_id == socket.metadata.client_id
                && entry.metadata.role == socket.metadata.role
        });
        match existing {
            Some(idx) => {
                entries[idx] = socket;
                true
            }
            None => {
                entries.insert(0, socket);
                false
            }
        }
    }

    /// Remove a socket, dropping the token once no sockets remain; returns what is left
    pub fn remove(&self, token: &str, socket_id: u64) -> usize {
        let key = key(token);
        let remaining = match self.inner.get_mut(&key) {
            Some(mut entries) => {
                entries.retain(|entry| entry.socket_id != socket_id);
                entries.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            self.inner.remove_if(&key, |_, entries| entries.is_empty());
            debug!("Removed last socket for token");
        }
        remaining
    }

    /// The most recently identified socket for a token
    pub fn newest(&self, token: &str) -> Option<ClientSocket> {
        self.inner.get(&key(token)).and_then(|entries| entries.first().cloned())
    }

    pub fn clients(&self, token: &str) -> Vec<ClientSocket> {
        self.inner
            .get(&key(token))
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Flag every socket of a client as terminating
    pub fn mark_terminating(&self, token: &str, client_id: &str) {
        if let Some(entries) = self.inner.get(&key(token)) {
            entries
                .iter()
                .filter(|entry| entry.metadata.client_id == client_id)
                .for_each(ClientSocket::set_terminating);
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.inner.contains_key(&key(token))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_common::Role;

    fn socket(client_id: &str, role: Role, version: &str) -> ClientSocket {
        let (tx, _rx) = mpsc::channel(1);
        ClientSocket::new(tx, ClientMetadata::new(client_id, version, role))
    }

    #[test]
    fn test_new_clients_are_inserted_first() {
        let pool = ConnectionPool::new();
        assert!(!pool.register("tok", socket("a", Role::Primary, "4.190.0")));
        assert!(!pool.register("tok", socket("b", Role::Primary, "4.191.0")));

        assert_eq!(pool.newest("tok").unwrap().metadata.client_id, "b");
        assert_eq!(pool.clients("tok").len(), 2);
    }

    #[test]
    fn test_same_client_and_role_is_replaced() {
        let pool = ConnectionPool::new();
        pool.register("tok", socket("a", Role::Primary, "4.190.0"));
        pool.register("tok", socket("a", Role::Secondary, "4.190.0"));
        assert!(pool.register("tok", socket("a", Role::Primary, "4.200.0")));

        let clients = pool.clients("tok");
        assert_eq!(clients.len(), 2);
        assert!(
            clients
                .iter()
                .any(|c| c.metadata.role == Role::Primary && c.metadata.version == "4.200.0")
        );
    }

    #[test]
    fn test_key_removed_with_last_socket() {
        let pool = ConnectionPool::new();
        let primary = socket("a", Role::Primary, "4.190.0");
        let secondary = socket("a", Role::Secondary, "4.190.0");
        pool.register("tok", primary.clone());
        pool.register("tok", secondary.clone());

        assert_eq!(pool.remove("tok", primary.socket_id()), 1);
        assert!(pool.contains("tok"));
        assert_eq!(pool.remove("tok", secondary.socket_id()), 0);
        assert!(!pool.contains("tok"));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_mark_terminating() {
        let pool = ConnectionPool::new();
        let a = socket("a", Role::Primary, "4.190.0");
        let b = socket("b", Role::Primary, "4.190.0");
        pool.register("tok", a.clone());
        pool.register("tok", b.clone());

        pool.mark_terminating("tok", "a");
        assert!(a.is_terminating());
        assert!(!b.is_terminating());
    }

    #[tokio::test]
    async fn test_request_is_correlated() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = ClientSocket::new(tx, ClientMetadata::new("a", "4.190.0", Role::Primary));

        let responder = client.clone();
        tokio::spawn(async move {
            let Some(WsMessage::Text(text)) = rx.recv().await else {
                panic!("expected text frame");
            };
            let Message::Request { id, .. } = Message::from_json(&text).unwrap() else {
                panic!("expected request");
            };
            responder
                .pending()
                .complete(&id, ResponsePayload::from_bytes(201, Default::default(), b"ok"));
        });

        let response = client
            .request(RequestPayload::new("GET", "/x"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.status, 201);
    }

    #[test]
    fn test_pool_keeps_only_token_hashes() {
        let pool = ConnectionPool::new();
        pool.register("Secret-Token", socket("a", Role::Primary, "4.190.0"));

        assert!(pool.contains("secret-token"));
        assert!(pool.inner.contains_key(&hash_token("secret-token")));
        assert!(!pool.inner.contains_key("secret-token"));
        assert!(pool.inner.iter().all(|entry| !entry.key().contains("secret")));
    }
}
