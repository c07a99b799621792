//! Reconciles configured connections against live tunnel pairs

use anyhow::Result;
use async_trait::async_trait;
use broker_common::{
    BrokerConfig, ConnectionConfig, Role,
    constants::{BACKUP_WATCH_INTERVAL_SECS, SYNC_INTERVAL_SECS},
    mask_token,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{PairHandles, TunnelHandle, TunnelPair, TunnelSettings, spawn_tunnel};
use crate::context::BrokerContext;
use crate::dispatcher;

/// A configured connection that should have a live pair
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredConnection {
    pub name: String,
    pub identifier: String,
    pub connection_type: String,
    pub integration_type: Option<String>,
}

/// Creates and destroys pairs for the manager
#[async_trait]
pub trait PairFactory: Send + Sync {
    type Pair: Send + Sync + 'static;

    async fn create(&self, connection: &DesiredConnection) -> Result<Self::Pair>;

    async fn is_open(&self, pair: &Self::Pair) -> bool;

    async fn teardown(&self, name: &str, pair: Self::Pair);
}

/// Opens real tunnel sockets, asking the dispatcher for a server id in HA mode
pub struct TunnelPairFactory {
    ctx: Arc<BrokerContext>,
}

impl TunnelPairFactory {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl PairFactory for TunnelPairFactory {
    type Pair = TunnelPair;

    async fn create(&self, connection: &DesiredConnection) -> Result<TunnelPair> {
        let server_id = match &self.ctx.config.dispatcher {
            Some(dispatcher) => {
                let auth = self.ctx.auth_header().await;
                dispatcher::get_server_id(
                    &self.ctx.http,
                    dispatcher,
                    &connection.identifier,
                    &self.ctx.client_id,
                    auth.as_deref(),
                )
                .await
            }
            None => None,
        };

        let mut handles = Vec::with_capacity(2);
        let mut tasks = Vec::with_capacity(2);
        for role in [Role::Primary, Role::Secondary] {
            let handle = TunnelHandle::new(&connection.identifier, role);
            let settings = TunnelSettings {
                connection_name: connection.name.clone(),
                identifier: connection.identifier.clone(),
                role,
                server_id: server_id.clone(),
                supported_integration_type: connection.integration_type.clone(),
            };
            tasks.push(spawn_tunnel(self.ctx.clone(), settings, handle.clone()));
            handles.push(handle);
        }

        let secondary = handles.pop().ok_or_else(|| anyhow::anyhow!("missing secondary"))?;
        let primary = handles.pop().ok_or_else(|| anyhow::anyhow!("missing primary"))?;
        let handles = PairHandles::new(
            &connection.name,
            connection.integration_type.clone(),
            primary,
            secondary,
        );
        self.ctx.tunnels.insert(connection.name.clone(), handles.clone());
        info!(
            "Created connection pair {} for {}",
            connection.name,
            mask_token(&connection.identifier)
        );
        Ok(TunnelPair::new(handles, tasks))
    }

    async fn is_open(&self, pair: &TunnelPair) -> bool {
        pair.is_open().await
    }

    async fn teardown(&self, name: &str, pair: TunnelPair) {
        self.ctx.tunnels.remove(name);
        pair.close().await;
    }
}

/// What one synchronization pass changed, by connection name
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub recreated: Vec<String>,
    pub torn_down: Vec<String>,
    pub rehooked: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.recreated.is_empty()
            && self.torn_down.is_empty()
            && self.rehooked.is_empty()
    }
}

struct LivePair<P> {
    identifier: String,
    contexts: BTreeMap<String, Map<String, Value>>,
    pair: P,
}

enum Action {
    Create,
    Recreate,
    Rehook,
    Keep,
}

pub struct ConnectionManager<F: PairFactory> {
    ctx: Arc<BrokerContext>,
    factory: F,
    live: Mutex<HashMap<String, LivePair<F::Pair>>>,
}

impl<F: PairFactory + 'static> ConnectionManager<F> {
    pub fn new(ctx: Arc<BrokerContext>, factory: F) -> Self {
        Self {
            ctx,
            factory,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Reload configuration and bring live pairs in line with it
    pub async fn sync_once(&self) -> SyncReport {
        self.ctx.reload_broker_config().await;
        let config = self.ctx.broker_config().await;
        let mut live = self.live.lock().await;
        let mut report = SyncReport::default();

        for (name, connection) in &config.connections {
            if connection.is_disabled {
                error!("Connection {} is disabled, not starting it", name);
                if let Some(existing) = live.remove(name) {
                    self.factory.teardown(name, existing.pair).await;
                    report.torn_down.push(name.clone());
                }
                continue;
            }

            let Some(identifier) = &connection.identifier else {
                match live.remove(name) {
                    Some(existing) => {
                        warn!("Connection {} lost its identifier, tearing it down", name);
                        self.factory.teardown(name, existing.pair).await;
                        report.torn_down.push(name.clone());
                    }
                    None => info!("Connection {} has no identifier, it is not in use", name),
                }
                continue;
            };

            let action = match live.get(name) {
                None => Action::Create,
                Some(existing) if existing.identifier != *identifier => Action::Recreate,
                Some(existing) if existing.contexts != connection.contexts => Action::Rehook,
                Some(_) => Action::Keep,
            };

            match action {
                Action::Keep => {}
                Action::Rehook => {
                    info!("Contexts of {} changed, re-running startup hooks", name);
                    self.run_hooks(&config, name, connection).await;
                    if let Some(existing) = live.get_mut(name) {
                        existing.contexts = connection.contexts.clone();
                    }
                    report.rehooked.push(name.clone());
                }
                Action::Create | Action::Recreate => {
                    let recreate = matches!(action, Action::Recreate);
                    if let Some(existing) = live.remove(name) {
                        info!("Identifier of {} changed, recreating its pair", name);
                        self.factory.teardown(name, existing.pair).await;
                    }

                    self.run_hooks(&config, name, connection).await;
                    let desired = self.desired(name, identifier, connection);
                    match self.factory.create(&desired).await {
                        Ok(pair) => {
                            live.insert(
                                name.clone(),
                                LivePair {
                                    identifier: identifier.clone(),
                                    contexts: connection.contexts.clone(),
                                    pair,
                                },
                            );
                            if recreate {
                                report.recreated.push(name.clone());
                            } else {
                                report.created.push(name.clone());
                            }
                        }
                        Err(e) => error!("Failed to create pair for {}: {}", name, e),
                    }
                }
            }
        }

        let removed: Vec<String> = live
            .keys()
            .filter(|name| !config.connections.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(existing) = live.remove(&name) {
                info!("Connection {} is no longer configured, tearing it down", name);
                self.factory.teardown(&name, existing.pair).await;
                report.torn_down.push(name);
            }
        }

        report
    }

    /// Whether any live pair has an open socket
    pub async fn any_open(&self) -> bool {
        let live = self.live.lock().await;
        for existing in live.values() {
            if self.factory.is_open(&existing.pair).await {
                return true;
            }
        }
        false
    }

    /// Periodic and on-demand synchronization, plus the backup watcher
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let sync = {
            let manager = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(SYNC_INTERVAL_SECS));
                // the first tick completes immediately; startup already synced
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = manager.ctx.sync_requested.notified() => {
                            info!("Configuration sync requested");
                        }
                    }
                    manager.log_report(&manager.sync_once().await);
                }
            })
        };

        let backup = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(BACKUP_WATCH_INTERVAL_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if !self.any_open().await {
                    warn!("No connection is open, running a backup synchronization");
                    self.log_report(&self.sync_once().await);
                }
            }
        });

        vec![sync, backup]
    }

    async fn run_hooks(&self, config: &BrokerConfig, name: &str, connection: &ConnectionConfig) {
        let runtime = self.ctx.plugins.store().get(name);
        match config.resolve_connection(name, runtime.as_ref()) {
            Ok(effective) => {
                let context_ids: Vec<String> = connection.contexts.keys().cloned().collect();
                self.ctx
                    .plugins
                    .run_start_up(name, &effective, &context_ids)
                    .await;
            }
            Err(e) => error!("Cannot resolve configuration of {}: {}", name, e),
        }
    }

    fn desired(
        &self,
        name: &str,
        identifier: &str,
        connection: &ConnectionConfig,
    ) -> DesiredConnection {
        DesiredConnection {
            name: name.to_string(),
            identifier: identifier.to_string(),
            connection_type: connection.connection_type.clone(),
            integration_type: self
                .ctx
                .config
                .is_universal()
                .then(|| connection.connection_type.clone()),
        }
    }

    fn log_report(&self, report: &SyncReport) {
        if report.is_empty() {
            debug!("Configuration in sync");
        } else {
            info!(
                "Synchronized connections: created {:?}, recreated {:?}, torn down {:?}, rehooked {:?}",
                report.created, report.recreated, report.torn_down, report.rehooked
            );
        }
    }
}
