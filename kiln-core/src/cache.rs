use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::watch;

use crate::{Error, LoadOptions, Loader, ModelLayout, Pipeline, Registry, Result};

/// What status endpoints see of the cache without taking the worker lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatus {
    pub resident: Option<String>,
    pub adapter_attached: bool,
}

struct Resident<P> {
    id: String,
    pipeline: P,
}

/// Holds at most one loaded pipeline. Loading a different model evicts the
/// resident one before the replacement is constructed.
pub struct ModelCache<L: Loader> {
    loader: L,
    registry: Arc<Registry>,
    layout: Arc<ModelLayout>,
    resident: Option<Resident<L::Pipeline>>,
    adapter_attached: bool,
    loads: usize,
    status: watch::Sender<CacheStatus>,
}

impl<L: Loader> ModelCache<L> {
    pub fn new(loader: L, registry: Arc<Registry>, layout: Arc<ModelLayout>) -> Self {
        let (status, _) = watch::channel(CacheStatus::default());
        Self {
            loader,
            registry,
            layout,
            resident: None,
            adapter_attached: false,
            loads: 0,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CacheStatus> {
        self.status.subscribe()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn layout(&self) -> &Arc<ModelLayout> {
        &self.layout
    }

    pub fn resident_id(&self) -> Option<&str> {
        self.resident.as_ref().map(|resident| resident.id.as_str())
    }

    /// Whether the resident pipeline has the conditioning adapter attached.
    pub fn adapter_attached(&self) -> bool {
        self.adapter_attached
    }

    /// Number of pipelines constructed since startup.
    pub fn loads(&self) -> usize {
        self.loads
    }

    /// Returns the pipeline for `id`, loading it if it is not resident.
    pub fn load(&mut self, id: &str) -> Result<&mut L::Pipeline> {
        if self.resident_id() == Some(id) {
            tracing::debug!(model = id, "model already resident");
        } else {
            self.replace(id)?;
        }
        self.resident
            .as_mut()
            .map(|resident| &mut resident.pipeline)
            .ok_or_else(|| Error::Inference(anyhow!("no resident pipeline after loading {id}")))
    }

    fn replace(&mut self, id: &str) -> Result<()> {
        let model = self.registry.describe(id)?;
        let checkpoint = self.layout.checkpoint(model);
        if let Some(missing) = checkpoint.first_missing() {
            return Err(Error::CheckpointMissing {
                model: id.to_string(),
                path: missing.to_path_buf(),
            });
        }

        if let Some(previous) = self.resident.take() {
            tracing::info!(model = %previous.id, "unloading previous model to free accelerator memory");
            drop(previous);
            self.adapter_attached = false;
            self.publish();
        }

        let adapter = self.layout.adapter_weights();
        let try_adapter = adapter.is_file() && self.loader.supports_adapter();
        if adapter.is_file() && !try_adapter {
            tracing::debug!(model = id, "backend cannot host the IP-Adapter, skipping it");
        }
        // Attention slicing replaces the attention processors the adapter hooks into.
        let options = LoadOptions {
            attention_slicing: !try_adapter,
        };

        tracing::info!(model = id, path = %checkpoint.dir.display(), "loading model");
        let mut pipeline = self
            .loader
            .load(&checkpoint, options)
            .map_err(|e| Error::Inference(e.context(format!("failed to load model {id}"))))?;

        let mut adapter_attached = false;
        if try_adapter {
            match pipeline.attach_adapter(&adapter) {
                Ok(()) => {
                    tracing::info!(model = id, "IP-Adapter attached");
                    adapter_attached = true;
                }
                Err(e) => tracing::warn!(model = id, error = %e, "could not attach IP-Adapter"),
            }
            if !adapter_attached {
                pipeline.enable_attention_slicing().map_err(Error::Inference)?;
            }
        }

        self.resident = Some(Resident {
            id: id.to_string(),
            pipeline,
        });
        self.adapter_attached = adapter_attached;
        self.loads += 1;
        self.publish();
        tracing::info!(model = id, "model loaded");
        Ok(())
    }

    fn publish(&self) {
        self.status.send_replace(CacheStatus {
            resident: self.resident_id().map(str::to_string),
            adapter_attached: self.adapter_attached,
        });
    }
}
