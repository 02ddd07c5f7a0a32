//! Deterministic in-memory pipeline for exercising the service without
//! model weights. Output pixels are a pure function of the prompt, seed,
//! fused LoRA and conditioning, so reproducibility and leakage can be
//! asserted on encoded bytes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use image::{DynamicImage, Rgb, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    CheckpointPaths, GenerationParams, LoadOptions, Loader, ModelLayout, Pipeline, Registry,
};

#[derive(Debug, Clone, PartialEq)]
pub enum StubEvent {
    Loaded(String),
    Dropped(String),
    AdapterAttached,
    /// Attention slicing enabled on an already built pipeline.
    SlicingEnabled,
    /// Pipeline constructed with sliced attention.
    SlicedAtLoad,
    Fused { lora: String, scale: f64 },
    Unfused,
    Generated {
        seed: u64,
        lora: Option<String>,
        conditioned: bool,
        adapter_scale: f64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<StubEvent>>>);

impl EventLog {
    fn push(&self, event: StubEvent) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    pub fn snapshot(&self) -> Vec<StubEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, predicate: impl Fn(&StubEvent) -> bool) -> usize {
        self.snapshot().iter().filter(|event| predicate(event)).count()
    }

    /// Pipelines constructed and not yet dropped.
    pub fn live_pipelines(&self) -> usize {
        let loaded = self.count(|event| matches!(event, StubEvent::Loaded(_)));
        let dropped = self.count(|event| matches!(event, StubEvent::Dropped(_)));
        loaded - dropped
    }

    pub fn last_generation(&self) -> Option<StubEvent> {
        self.snapshot()
            .into_iter()
            .rev()
            .find(|event| matches!(event, StubEvent::Generated { .. }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StubLoader {
    events: EventLog,
    adapter_fails: bool,
    adapter_unsupported: bool,
    failing_checkpoint: Option<String>,
    generation_fails: Arc<AtomicBool>,
}

impl StubLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    /// Reports that pipelines cannot host the adapter at all.
    pub fn without_adapter_support(mut self) -> Self {
        self.adapter_unsupported = true;
        self
    }

    pub fn with_adapter_failure(mut self) -> Self {
        self.adapter_fails = true;
        self
    }

    /// Makes loading the named built-in model fail.
    pub fn with_load_failure(mut self, model: &str) -> Self {
        self.failing_checkpoint = Registry::builtin()
            .describe(model)
            .ok()
            .map(|model| model.checkpoint.to_string());
        self
    }

    /// Handle that toggles inference failures on every pipeline this loader
    /// builds.
    pub fn generation_failures(&self) -> Arc<AtomicBool> {
        self.generation_fails.clone()
    }
}

impl Loader for StubLoader {
    type Pipeline = StubPipeline;

    fn supports_adapter(&self) -> bool {
        !self.adapter_unsupported
    }

    fn load(&self, checkpoint: &CheckpointPaths, options: LoadOptions) -> Result<StubPipeline> {
        let name = checkpoint
            .dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.failing_checkpoint.as_deref() == Some(name.as_str()) {
            bail!("stub checkpoint {name} is corrupt");
        }
        self.events.push(StubEvent::Loaded(name.clone()));
        if options.attention_slicing {
            self.events.push(StubEvent::SlicedAtLoad);
        }
        Ok(StubPipeline {
            name,
            events: self.events.clone(),
            adapter_fails: self.adapter_fails,
            adapter_attached: false,
            adapter_scale: 1.0,
            lora: None,
            generation_fails: self.generation_fails.clone(),
        })
    }
}

#[derive(Debug)]
pub struct StubPipeline {
    name: String,
    events: EventLog,
    adapter_fails: bool,
    adapter_attached: bool,
    adapter_scale: f64,
    lora: Option<(String, f64)>,
    generation_fails: Arc<AtomicBool>,
}

impl Pipeline for StubPipeline {
    fn generate(
        &mut self,
        params: &GenerationParams,
        conditioning: Option<&DynamicImage>,
    ) -> Result<DynamicImage> {
        if conditioning.is_some() && !self.adapter_attached {
            bail!("conditioning image passed without an attached adapter");
        }
        self.events.push(StubEvent::Generated {
            seed: params.seed,
            lora: self.lora.as_ref().map(|(name, _)| name.clone()),
            conditioned: conditioning.is_some(),
            adapter_scale: self.adapter_scale,
        });
        if self.generation_fails.load(Ordering::SeqCst) {
            bail!("stub inference failure");
        }

        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        params.prompt.hash(&mut hasher);
        params.negative_prompt.hash(&mut hasher);
        (params.width, params.height, params.steps, params.seed).hash(&mut hasher);
        params.cfg_scale.to_bits().hash(&mut hasher);
        if let Some((name, scale)) = &self.lora {
            name.hash(&mut hasher);
            scale.to_bits().hash(&mut hasher);
        }
        if let Some(image) = conditioning {
            if self.adapter_scale > 0.0 {
                self.adapter_scale.to_bits().hash(&mut hasher);
                image.as_bytes().hash(&mut hasher);
            }
        }

        let mut rng = StdRng::seed_from_u64(hasher.finish());
        let pixels = RgbImage::from_fn(params.width / 64, params.height / 64, |_, _| {
            Rgb(rng.gen::<[u8; 3]>())
        });
        Ok(DynamicImage::ImageRgb8(pixels))
    }

    fn attach_adapter(&mut self, _weights: &Path) -> Result<()> {
        if self.adapter_fails {
            bail!("adapter weights incompatible with stub pipeline");
        }
        self.adapter_attached = true;
        self.events.push(StubEvent::AdapterAttached);
        Ok(())
    }

    fn set_adapter_scale(&mut self, scale: f64) {
        self.adapter_scale = scale;
    }

    fn enable_attention_slicing(&mut self) -> Result<()> {
        self.events.push(StubEvent::SlicingEnabled);
        Ok(())
    }

    fn fuse_lora(&mut self, weights: &Path, scale: f64) -> Result<()> {
        let lora = weights
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.events.push(StubEvent::Fused {
            lora: lora.clone(),
            scale,
        });
        self.lora = Some((lora, scale));
        Ok(())
    }

    fn unfuse_lora(&mut self) -> Result<()> {
        self.events.push(StubEvent::Unfused);
        self.lora = None;
        Ok(())
    }
}

impl Drop for StubPipeline {
    fn drop(&mut self) {
        self.events.push(StubEvent::Dropped(self.name.clone()));
    }
}

fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create fixture directory");
    }
    std::fs::write(path, b"").expect("write fixture file");
}

/// Creates empty component files for a built-in model under `root`.
pub fn provision_checkpoint(root: &Path, model: &str) -> CheckpointPaths {
    let registry = Registry::builtin();
    let model = registry.describe(model).expect("built-in model");
    let checkpoint = ModelLayout::new(root).checkpoint(model);
    for component in checkpoint.components() {
        touch(component);
    }
    checkpoint
}

pub fn provision_adapter(root: &Path) -> PathBuf {
    let path = ModelLayout::new(root).adapter_weights();
    touch(&path);
    path
}

pub fn provision_lora(root: &Path, name: &str) -> PathBuf {
    let path = ModelLayout::new(root)
        .lora_dir()
        .join(format!("{name}.safetensors"));
    touch(&path);
    path
}
