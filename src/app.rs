use crate::{
    backend::{InvalidationSender, LocalBackend, UsageBackend, invalidation_channel},
    config::AppConfig,
    ingest,
    plans::{PlanConfig, PlanRegistry},
    pricing::PriceTable,
    remote::HttpBackend,
    server,
    storage::Storage,
    sync::SyncController,
    tui::{self, TuiContext},
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};

/// Startup switches that come from the command line rather than the config file.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub rebuild: bool,
    pub plan: Option<String>,
    pub headless: bool,
    pub remote: Option<String>,
}

/// High-level application orchestrator.
pub struct App {
    config: Arc<AppConfig>,
}

impl App {
    pub async fn new(config: AppConfig) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub async fn run(self, options: RunOptions) -> Result<()> {
        let storage = Storage::connect(&self.config.storage.database_path).await?;
        storage.ensure_schema().await?;

        let plans = PlanRegistry::new(&self.config.plans.default_plan);
        if let Some(id) = options.plan.as_deref() {
            plans.select(&storage, id).await?;
        }
        let plan = plans.resolve(&storage).await;
        tracing::info!(plan = plan.id, "active plan");

        match options.remote.as_deref() {
            Some(url) => {
                let backend = Arc::new(HttpBackend::new(url)?);
                tracing::info!(remote = url, "reading usage from remote instance");
                self.present(backend, None, storage, plans, plan, url.to_string())
                    .await
            }
            None => self.run_local(storage, plans, plan, &options).await,
        }
    }

    async fn run_local(
        &self,
        storage: Storage,
        plans: PlanRegistry,
        plan: &'static PlanConfig,
        options: &RunOptions,
    ) -> Result<()> {
        if options.rebuild {
            tracing::info!("rebuilding usage data from session logs");
            storage.truncate_usage().await?;
        }

        let invalidations = invalidation_channel();
        let ingest_handle = ingest::spawn(
            self.config.sessions.root_dirs.clone(),
            Duration::from_secs(self.config.sessions.poll_interval_secs),
            storage.clone(),
            PriceTable::new(self.config.pricing.clone()),
            invalidations.clone(),
        )
        .await?;

        let backend = Arc::new(LocalBackend::new(storage.clone()));
        let server_handle = if self.config.server.enabled || options.headless {
            Some(server::spawn(&self.config.server.listen_addr, backend.clone()).await?)
        } else {
            None
        };

        let result = match (&server_handle, options.headless) {
            (Some(server), true) => {
                println!(
                    "Serving usage API on http://{} (Ctrl-C to stop)",
                    server.local_addr()
                );
                tokio::signal::ctrl_c()
                    .await
                    .context("failed to listen for ctrl-c")
            }
            _ => {
                self.present(
                    backend,
                    Some(&invalidations),
                    storage,
                    plans,
                    plan,
                    "local".to_string(),
                )
                .await
            }
        };

        if let Some(server) = server_handle {
            server.shutdown().await?;
        }
        ingest_handle.shutdown().await?;
        result
    }

    /// Runs the sync controller for `backend` and shows it until the user quits.
    async fn present<B: UsageBackend>(
        &self,
        backend: Arc<B>,
        invalidations: Option<&InvalidationSender>,
        storage: Storage,
        plans: PlanRegistry,
        plan: &'static PlanConfig,
        source: String,
    ) -> Result<()> {
        let refresh_interval = Duration::from_millis(self.config.display.refresh_interval_ms);
        let controller = SyncController::spawn(backend, refresh_interval);
        if let Some(invalidations) = invalidations {
            controller.subscribe(invalidations.subscribe());
        }

        tracing::info!("Launching interactive TUI (requires an attached terminal)");
        let result = tui::run(TuiContext {
            config: self.config.clone(),
            sync: controller.handle(),
            plans,
            plan,
            preferences: storage,
            source,
        })
        .await;

        controller.shutdown().await?;
        result
    }
}
