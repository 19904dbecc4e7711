//! Wiring: build every component from configuration, start the
//! background loops, and tear everything down in order on shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use tb_domain::config::BrokerConfig;
use tb_domain::event::RegistryEvent;
use tb_domain::model::LanguageModel;
use tb_domain::Result;
use tb_engine::{JobDispatcher, TurnEngineBuilder, WorkerPool};
use tb_sandbox::{GateConfig, GatedRuntime, PoolConfig, SandboxPool, SandboxRuntime, SandboxSpec};
use tb_servers::{ConnectionManager, HealthConfig, HealthMonitor, ToolServerRegistry};
use tb_sessions::{ConversationStore, JanitorService, SessionManager};
use tb_sessions::janitor::JanitorConfig;
use tb_store::StateStore;

use crate::state::AppState;

/// Everything injectable at startup. The store, runtime, and model are
/// capabilities: production wires vendor adapters, tests wire doubles.
pub struct BrokerOptions {
    pub config: BrokerConfig,
    pub registry_path: PathBuf,
    pub store: Arc<dyn StateStore>,
    pub runtime: Arc<dyn SandboxRuntime>,
    pub model: Arc<dyn LanguageModel>,
    /// Sandbox spec used when a session does not override the image.
    pub default_spec: SandboxSpec,
}

/// A running broker: shared state plus its background loops.
pub struct Broker {
    pub state: AppState,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pool: Option<Arc<SandboxPool>>,
}

impl Broker {
    pub async fn start(options: BrokerOptions) -> Result<Broker> {
        let config = Arc::new(options.config);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // ── Registry ────────────────────────────────────────────
        let registry = Arc::new(ToolServerRegistry::load(options.registry_path)?);
        let settings = registry.settings();

        // ── Sandbox plane ───────────────────────────────────────
        let runtime: Arc<dyn SandboxRuntime> =
            Arc::new(GatedRuntime::new(options.runtime, GateConfig::default()));

        let pool = if config.pool.enabled {
            let pool = Arc::new(SandboxPool::new(
                runtime.clone(),
                PoolConfig {
                    min_idle: config.pool.min_idle,
                    max_total: config.pool.max_total,
                    idle_ttl: config.pool.idle_ttl,
                    high_water: config.pool.max_total,
                    spec: options.default_spec.clone(),
                    ..Default::default()
                },
            ));
            tasks.push(tokio::spawn(
                pool.clone().run_maintenance(shutdown_rx.clone()),
            ));
            Some(pool)
        } else {
            None
        };

        // ── Connection plane ────────────────────────────────────
        let connections = Arc::new(ConnectionManager::new(registry.clone(), runtime.clone()));
        if settings.auto_connect {
            connections.initialize().await;
        }

        let health = Arc::new(HealthMonitor::new(
            connections.clone(),
            HealthConfig {
                check_interval: Duration::from_millis(settings.health_check_interval_ms),
                ..Default::default()
            },
        ));
        // Seed the baseline states so the health endpoint reflects the
        // connected fleet before the first scheduled sweep.
        health.check_all().await;
        tasks.push(tokio::spawn(health.clone().run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(registry_event_loop(
            registry.clone(),
            connections.clone(),
            health.clone(),
            shutdown_rx.clone(),
        )));

        // ── Sessions ────────────────────────────────────────────
        let conversations = Arc::new(ConversationStore::new(
            options.store.clone(),
            config.conversation.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            options.store.clone(),
            runtime.clone(),
            pool.clone(),
            conversations.clone(),
            config.session.clone(),
            options.default_spec,
        ));
        let janitor = Arc::new(JanitorService::new(
            options.store.clone(),
            sessions.clone(),
            JanitorConfig {
                idle_ttl: config.session.idle_ttl,
                ..Default::default()
            },
        ));
        tasks.push(tokio::spawn(janitor.clone().run(shutdown_rx.clone())));

        // ── Turn engine (+ optional dispatch plane) ─────────────
        let mut engine_builder = TurnEngineBuilder::new(
            options.model,
            connections.clone(),
            conversations.clone(),
        )
        .settings(config.engine.clone());

        if config.dispatch.enabled {
            let dispatcher = Arc::new(JobDispatcher::new(
                options.store.clone(),
                config.dispatch.clone(),
            ));
            engine_builder = engine_builder.dispatcher(dispatcher);

            let workers = Arc::new(WorkerPool::new(
                options.store.clone(),
                connections.clone(),
                config.dispatch.clone(),
            ));
            tasks.push(tokio::spawn(workers.run(shutdown_rx.clone())));
            tracing::info!(
                concurrency = config.dispatch.worker_concurrency,
                "worker mode enabled"
            );
        }
        let engine = engine_builder.build();

        tracing::info!("broker started");
        Ok(Broker {
            state: AppState {
                config,
                registry,
                connections,
                health,
                sessions,
                conversations,
                janitor,
                engine,
            },
            shutdown,
            tasks,
            pool,
        })
    }

    /// Stop the loops, drain workers, release sandboxes, and close every
    /// tool-server connection.
    pub async fn shutdown(self) {
        tracing::info!("broker shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "background task panicked during shutdown");
            }
        }
        self.state.connections.cleanup().await;
        if let Some(pool) = self.pool {
            pool.shutdown().await;
        }
        tracing::info!("broker stopped");
    }
}

/// React to registry mutations: connect added/enabled servers, drop
/// removed/disabled ones, and re-drive reconnection after a config
/// change to a parked server.
async fn registry_event_loop(
    registry: Arc<ToolServerRegistry>,
    connections: Arc<ConnectionManager>,
    health: Arc<HealthMonitor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut events = registry.subscribe();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => return,
        };
        let event = match event {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "registry event stream lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        match event {
            RegistryEvent::Added { name } | RegistryEvent::Enabled { name } => {
                if let Err(err) = connections.connect(&name).await {
                    tracing::warn!(server = %name, error = %err, "failed to connect new server");
                }
            }
            RegistryEvent::Updated { name } => {
                if connections.is_connected(&name).await {
                    if let Err(err) = connections.reconnect(&name).await {
                        tracing::warn!(server = %name, error = %err, "failed to reconnect updated server");
                    }
                } else {
                    // A config change revives parked servers.
                    health.force_reconnect(&name);
                }
            }
            RegistryEvent::Removed { name } | RegistryEvent::Disabled { name } => {
                connections.disconnect(&name).await;
            }
            RegistryEvent::Settings | RegistryEvent::Reloaded => {
                tracing::debug!("registry settings changed");
            }
        }
    }
}
