use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{watch, Mutex};

use crate::device::{query_accelerator, round_to};
use crate::status::{HealthReport, LorasReport, ModelStatus, ModelsReport};
use crate::{
    generation, ActivityClock, CacheStatus, Error, GenerationRequest, GenerationResult,
    IdlePolicy, Loader, ModelCache, ModelLayout, Registry, Result,
};

/// Service context shared by every handler. Generation and model switches
/// are serialized through the cache lock and run on a blocking thread;
/// status reads never wait on them.
pub struct Service<L: Loader> {
    cache: Arc<Mutex<ModelCache<L>>>,
    status: watch::Receiver<CacheStatus>,
    registry: Arc<Registry>,
    layout: Arc<ModelLayout>,
    clock: Arc<ActivityClock>,
    idle: IdlePolicy,
}

impl<L: Loader + 'static> Service<L> {
    pub fn new(loader: L, layout: ModelLayout, idle: IdlePolicy) -> Self {
        Self::with_registry(loader, Registry::builtin(), layout, idle)
    }

    pub fn with_registry(
        loader: L,
        registry: Registry,
        layout: ModelLayout,
        idle: IdlePolicy,
    ) -> Self {
        let registry = Arc::new(registry);
        let layout = Arc::new(layout);
        let cache = ModelCache::new(loader, registry.clone(), layout.clone());
        let status = cache.subscribe();
        Self {
            cache: Arc::new(Mutex::new(cache)),
            status,
            registry,
            layout,
            clock: Arc::new(ActivityClock::new()),
            idle,
        }
    }

    pub fn clock(&self) -> &Arc<ActivityClock> {
        &self.clock
    }

    pub fn idle_policy(&self) -> IdlePolicy {
        self.idle
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.status.borrow().clone()
    }

    /// Loads `id` at startup if its checkpoint is on disk; otherwise leaves
    /// the cache empty until the first request.
    pub async fn preload(&self, id: &str) -> Result<()> {
        let model = self.registry.describe(id)?;
        if !self.layout.checkpoint(model).is_complete() {
            tracing::info!(
                model = id,
                "default model not found, models will load on first request"
            );
            return Ok(());
        }
        self.switch_model(id).await
    }

    pub async fn switch_model(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_cache(move |cache| cache.load(&id).map(|_| ()))
            .await
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        generation::validate(&request)?;
        self.with_cache(move |cache| generation::generate(cache, &request))
            .await
    }

    async fn with_cache<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ModelCache<L>) -> Result<T> + Send + 'static,
    {
        let mut cache = self.cache.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || work(&mut cache))
            .await
            .map_err(|e| Error::Inference(anyhow!("generation worker failed: {e}")))?
    }

    pub async fn health(&self) -> HealthReport {
        let idle = self.clock.idle();
        let accelerator = tokio::task::spawn_blocking(query_accelerator)
            .await
            .unwrap_or_default();
        let status = self.cache_status();
        HealthReport {
            status: if status.resident.is_some() {
                "healthy"
            } else {
                "no_model_loaded"
            }
            .to_string(),
            current_model: status.resident,
            available_models: self.registry.ids(),
            ip_adapter_loaded: status.adapter_attached,
            cuda_available: accelerator.available,
            gpu_name: accelerator.name,
            vram_allocated_gb: accelerator.memory_allocated_gb,
            idle_seconds: round_to(idle.as_secs_f64(), 1),
            idle_timeout_minutes: self.idle.timeout_minutes(),
            watchdog_enabled: self.idle.enabled(),
        }
    }

    pub fn models(&self) -> ModelsReport {
        let status = self.cache_status();
        let models = self
            .registry
            .list()
            .iter()
            .map(|model| {
                let entry = ModelStatus {
                    description: model.description.to_string(),
                    downloaded: self.layout.checkpoint(model).is_complete(),
                    loaded: status.resident.as_deref() == Some(model.id),
                    default_cfg: model.default_cfg,
                    default_steps: model.default_steps,
                };
                (model.id.to_string(), entry)
            })
            .collect();
        ModelsReport {
            models,
            current: status.resident,
        }
    }

    pub fn loras(&self) -> Result<LorasReport> {
        let loras = self
            .layout
            .list_loras()
            .map_err(|e| Error::Inference(anyhow!(e).context("failed to list LoRA directory")))?;
        Ok(LorasReport { loras })
    }
}
