/// Application-level ping interval on an open tunnel socket (25 seconds)
pub const PING_INTERVAL_MS: u64 = 25_000;

/// Time allowed for a pong before the socket is considered dead (10 seconds)
pub const PONG_TIMEOUT_MS: u64 = 10_000;

/// Timeout for establishing a tunnel socket and completing the handshake
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Minimum delay for exponential backoff reconnection (1 second)
pub const RECONNECT_MIN_DELAY_MS: u64 = 1_000;

/// Maximum delay for exponential backoff reconnection (20 minutes)
pub const RECONNECT_MAX_DELAY_MS: u64 = 20 * 60 * 1_000;

/// Multiplier for exponential backoff reconnection
pub const RECONNECT_FACTOR: f64 = 1.5;

/// Reconnect attempts before a tunnel member gives up and the process exits
pub const RECONNECT_MAX_RETRIES: usize = 30;

/// Retries for a downstream request failing at the transport level
pub const DOWNSTREAM_RETRIES: u32 = 3;

/// Fixed delay between downstream retries
pub const DOWNSTREAM_RETRY_DELAY_MS: u64 = 500;

/// Timeout for the streamed response POST back to the server (20 minutes)
pub const STREAM_POST_TIMEOUT_MS: u64 = 1_200_000;

/// How long a streaming record may live without completion (1 hour)
pub const STREAM_TTL_SECS: u64 = 3_600;

/// Sweep period for expired streaming records
pub const STREAM_CHECK_PERIOD_SECS: u64 = 60;

/// Chunks buffered per streaming record before writers are suspended
pub const STREAM_BUFFER_CHUNKS: usize = 16;

/// Time the relaying side waits for a buffered tunnel response
pub const TUNNEL_RESPONSE_TIMEOUT_SECS: u64 = 300;

/// Safety margin subtracted from `expires_in` before renewing credentials
pub const AUTH_RENEW_MARGIN_SECS: u64 = 60;

/// Grace period between a termination signal and process exit (12 seconds)
pub const SHUTDOWN_GRACE_PERIOD_MS: u64 = 12_000;

/// Interval of the configuration synchronization loop
pub const SYNC_INTERVAL_SECS: u64 = 60;

/// Interval of the backup watcher that re-runs synchronization when nothing is open
pub const BACKUP_WATCH_INTERVAL_SECS: u64 = 30;

/// Outgoing websocket messages buffered per socket
pub const OUTGOING_CHANNEL_SIZE: usize = 100;

/// Broker clients older than this are refused
pub const MINIMAL_SUPPORTED_BROKER_VERSION: &str = "4.100.0";

/// Broker clients older than this receive a warning notification
pub const MINIMAL_RECOMMENDED_BROKER_VERSION: &str = "4.182.0";

/// Capability a server offers when it accepts streamed responses over HTTP POST
pub const CAPABILITY_RECEIVE_POST_STREAMS: &str = "receive-post-streams";

/// Capability a client advertises when it can answer with streamed responses
pub const CAPABILITY_POST_STREAMS: &str = "post-streams";

/// Content type of the framed streaming response body
pub const STREAM_CONTENT_TYPE: &str = "application/vnd.broker.stream+octet-stream";

/// API version used when asking the dispatcher for a server allocation
pub const DISPATCHER_API_VERSION: &str = "2022-12-01~experimental";

/// Version string reported by clients and compared by servers
pub const BROKER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_values() {
        // These are compile-time checks for constant sanity
        const _: () = assert!(PONG_TIMEOUT_MS < PING_INTERVAL_MS);
        const _: () = assert!(RECONNECT_MIN_DELAY_MS < RECONNECT_MAX_DELAY_MS);
        const _: () = assert!(RECONNECT_FACTOR > 1.0);
        const _: () = assert!(STREAM_CHECK_PERIOD_SECS < STREAM_TTL_SECS);
        const _: () = assert!(BACKUP_WATCH_INTERVAL_SECS <= SYNC_INTERVAL_SECS);
        const _: () = assert!(STREAM_BUFFER_CHUNKS > 0);

        assert_eq!(STREAM_POST_TIMEOUT_MS, 20 * 60 * 1000);
        assert_eq!(SHUTDOWN_GRACE_PERIOD_MS, 12_000);
    }
}
