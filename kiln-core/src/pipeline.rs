use std::path::Path;

use anyhow::Result;
use image::DynamicImage;

use crate::CheckpointPaths;

/// Fully resolved sampling parameters for a single inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub seed: u64,
}

/// A loaded text-to-image pipeline resident on the accelerator.
///
/// Instances are long-lived and shared by every request while resident, so
/// anything a request changes (adapter scale, fused LoRA) must be restored by
/// the caller before the next request runs.
pub trait Pipeline: Send {
    /// Runs one full sampling pass. `conditioning` is only passed when an
    /// image-conditioning adapter is attached.
    fn generate(
        &mut self,
        params: &GenerationParams,
        conditioning: Option<&DynamicImage>,
    ) -> Result<DynamicImage>;

    /// Attaches the image-conditioning adapter from `weights`.
    fn attach_adapter(&mut self, weights: &Path) -> Result<()>;

    fn set_adapter_scale(&mut self, scale: f64);

    /// Trades speed for lower peak attention memory. Not compatible with an
    /// attached conditioning adapter.
    fn enable_attention_slicing(&mut self) -> Result<()>;

    /// Merges the LoRA at `weights` into the pipeline at `scale`.
    fn fuse_lora(&mut self, weights: &Path, scale: f64) -> Result<()>;

    /// Restores the base weights and releases any loaded LoRA tensors.
    fn unfuse_lora(&mut self) -> Result<()>;
}

/// Decisions taken before a pipeline is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Build the attention layers sliced instead of enabling slicing later.
    pub attention_slicing: bool,
}

/// Builds pipelines from checkpoints on disk.
pub trait Loader: Send + Sync {
    type Pipeline: Pipeline;

    /// Whether pipelines from this loader can host the image-conditioning
    /// adapter at all.
    fn supports_adapter(&self) -> bool {
        true
    }

    /// Constructs the pipeline with its fixed sampling scheduler and moves it
    /// onto the accelerator.
    fn load(&self, checkpoint: &CheckpointPaths, options: LoadOptions)
        -> Result<Self::Pipeline>;
}
