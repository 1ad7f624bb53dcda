//! Process wiring: construct all components in dependency order, serve,
//! tear down in reverse.
//!
//! Order: store → preset catalog → registry → monitor/guard →
//! conversations → webhooks → residency → dispatcher → bus + ticker →
//! router. Everything is injected through [`AppState`]; nothing is global.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use modelrelay_events::EventBus;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AppEnv, Settings};
use crate::dispatch::{Dispatcher, WebhookDelivery};
use crate::gpu::{GpuGuard, NvidiaSmiProbe, VramMonitor, spawn_gpu_stats_ticker};
use crate::http::{AppState, router};
use crate::presets::{ModelDefaultsCatalog, PresetCatalog, ResolvedPreset};
use crate::providers::echo::ECHO_MODEL_NAME;
use crate::providers::registry::RegistryConfig;
use crate::providers::{EchoProvider, ModelResidency, ProviderRegistry};
use crate::store::{ConversationStore, RedisHandle, StoreConfig, TaskStore};

/// Event bus fan-out capacity (per-subscriber queue).
const EVENT_BUS_CAPACITY: usize = 1024;

/// A fully wired gateway, ready to serve.
pub struct Gateway {
    state: AppState,
    dispatcher: Arc<Dispatcher>,
    ticker: JoinHandle<()>,
    ticker_shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Construct every component in dependency order.
    ///
    /// An unreachable key-value store is fatal in `production` and a
    /// warning elsewhere (the store will reconnect lazily).
    pub async fn bootstrap(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);
        tracing::info!(
            env = %settings.app_env,
            redis_url = %settings.redis_url,
            bind = %settings.bind_addr(),
            "bootstrapping gateway"
        );

        let handle = Arc::new(
            RedisHandle::open(&settings.redis_url).context("invalid key-value store URL")?,
        );
        if let Err(err) = handle.ping().await {
            if settings.app_env == AppEnv::Production {
                anyhow::bail!("key-value store unreachable in production: {err}");
            }
            tracing::warn!(error = %err, "key-value store unreachable; continuing degraded");
        }
        let store = Arc::new(TaskStore::new(
            Arc::clone(&handle),
            StoreConfig {
                session_ttl_secs: settings.session_ttl_secs(),
                idempotency_ttl_secs: settings.idempotency_ttl_secs(),
                logs_max_recent: settings.logs_max_recent,
                queue_max_size: settings.queue_max_size,
            },
        ));
        let conversations = Arc::new(ConversationStore::new(
            Arc::clone(&handle),
            settings.session_ttl_secs(),
        ));

        let catalog = Arc::new(
            PresetCatalog::load_dir(Path::new(&settings.presets_dir))
                .context("cannot load preset catalog")?,
        );
        let defaults = Arc::new(ModelDefaultsCatalog::with_builtin());
        let registry = Arc::new(ProviderRegistry::new(
            Arc::clone(&catalog),
            RegistryConfig::from_settings(&settings),
        ));
        registry
            .register(ECHO_MODEL_NAME, Arc::new(EchoProvider::new()))
            .await
            .context("cannot register echo provider")?;
        for preset in catalog.autoload_presets() {
            let name = match &preset {
                ResolvedPreset::Local(p) => p.name.clone(),
                ResolvedPreset::Cloud(p) => p.name.clone(),
                ResolvedPreset::Embedding(p) => p.name.clone(),
            };
            match registry.get_or_create(&name).await {
                Ok(_) => tracing::info!(model = %name, "autoloaded preset registered"),
                Err(err) => {
                    tracing::warn!(model = %name, error = %err, "autoload registration failed");
                }
            }
        }

        let monitor = Arc::new(VramMonitor::new(
            Box::new(NvidiaSmiProbe::new(settings.gpu_index)),
            settings.gpu_index,
            settings.max_vram_usage_percent,
            settings.vram_reserve_mb,
        ));
        let guard = Arc::new(GpuGuard::new(Arc::clone(&monitor)));

        let bus = EventBus::new(EVENT_BUS_CAPACITY);
        let residency = Arc::new(ModelResidency::new(Arc::clone(&monitor), bus.clone()));
        let webhooks = Arc::new(
            WebhookDelivery::new(settings.webhook_timeout(), settings.webhook_max_retries)
                .context("cannot build webhook client")?,
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&conversations),
            Arc::clone(&registry),
            Arc::clone(&residency),
            Arc::clone(&guard),
            webhooks,
            bus.clone(),
        ));
        dispatcher.start().await;

        let (ticker_shutdown, ticker_rx) = watch::channel(false);
        let ticker = spawn_gpu_stats_ticker(
            Arc::clone(&monitor),
            Arc::clone(&guard),
            Arc::clone(&store),
            bus.clone(),
            settings.gpu_stats_interval(),
            ticker_rx,
        );

        let state = AppState {
            settings,
            store,
            conversations,
            registry,
            residency,
            dispatcher: Arc::clone(&dispatcher),
            guard,
            monitor,
            bus,
            defaults,
        };

        Ok(Self {
            state,
            dispatcher,
            ticker,
            ticker_shutdown,
        })
    }

    /// The wired application state (handy for tests).
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until SIGINT/SIGTERM, then tear down in reverse order.
    pub async fn run(self) -> Result<()> {
        let bind_addr = self.state.settings.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("cannot bind {bind_addr}"))?;
        let app = router(self.state.clone());
        tracing::info!(bind = %bind_addr, "gateway listening (Ctrl+C/SIGTERM to stop)");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;

        self.teardown().await;
        Ok(())
    }

    /// Reverse-order teardown: ticker, dispatcher (between tasks), models,
    /// providers.
    pub async fn teardown(self) {
        tracing::info!("shutting down gateway");
        let _ = self.ticker_shutdown.send(true);
        self.ticker.abort();
        self.dispatcher.stop().await;
        self.state.residency.cleanup().await;
        self.state.registry.cleanup_all().await;
        tracing::info!("gateway stopped");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let ctrl_c = tokio::signal::ctrl_c();
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM; Ctrl+C only");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
