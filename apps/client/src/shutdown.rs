//! Process exit and signal handling

use broker_common::{Message, constants::SHUTDOWN_GRACE_PERIOD_MS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::context::BrokerContext;

/// Terminates the process; replaced in tests to observe exits
pub trait ProcessExit: Send + Sync {
    fn exit(&self, code: i32);
}

/// Exits through `std::process::exit`, at most once
#[derive(Debug, Default)]
pub struct StdProcessExit {
    exited: AtomicBool,
}

impl ProcessExit for StdProcessExit {
    fn exit(&self, code: i32) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Exiting with code {}", code);
        std::process::exit(code);
    }
}

/// Resolve when SIGINT or SIGTERM arrives, returning the signal name
pub async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

/// Tell the server we are going away, then exit after the grace period
pub async fn shutdown(ctx: &BrokerContext, signal: &str) {
    info!("Received {}, shutting down gracefully...", signal);

    let pairs: Vec<_> = ctx.tunnels.iter().map(|e| e.value().clone()).collect();
    let mut open = None;
    for pair in pairs {
        if let Some(handle) = pair.open_handle().await {
            open = Some(handle);
            break;
        }
    }
    match open {
        Some(handle) => {
            let message = Message::Terminate {
                signal: signal.to_string(),
            };
            if let Err(e) = handle.send(&message).await {
                warn!("Failed to send terminate message: {}", e);
            }
        }
        None => warn!("No open connection to announce termination on"),
    }

    tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_PERIOD_MS)).await;
    ctx.exit.exit(0);
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{PairHandles, TunnelHandle};
    use crate::context::test_context;
    use broker_common::Role;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_sends_terminate_then_exits() {
        let (ctx, exit) = test_context("http://127.0.0.1:9", None, None);

        let primary = TunnelHandle::new("tok", Role::Primary);
        let secondary = TunnelHandle::new("tok", Role::Secondary);
        let (tx, mut rx) = mpsc::channel(4);
        primary.attach(tx).await;
        ctx.tunnels.insert(
            "default".to_string(),
            PairHandles::new("default", None, primary, secondary),
        );

        shutdown(&ctx, "SIGTERM").await;

        match rx.recv().await.unwrap() {
            WsMessage::Text(text) => {
                assert_eq!(text.as_str(), r#"{"type":"terminate","signal":"SIGTERM"}"#)
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(exit.codes(), vec![0]);
    }
}
