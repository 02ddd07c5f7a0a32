use std::ops::{Deref, DerefMut};
use std::path::Path;

use image::{DynamicImage, RgbImage};
use rand::Rng;
use validator::Validate;

use crate::util::{decode_base64_image, image_to_base64_png};
use crate::{
    Error, GenerationParams, GenerationRequest, GenerationResult, Loader, ModelCache,
    ModelDescriptor, Pipeline, ResolvedParameters, Result,
};

/// Side length of the neutral image fed to an attached adapter when the
/// request carries no reference.
const NEUTRAL_CONDITIONING_SIZE: u32 = 224;

pub fn validate(request: &GenerationRequest) -> Result<()> {
    request
        .validate()
        .map_err(|e| Error::InvalidRequest(e.to_string()))
}

/// Runs one generation against the cache: load, resolve, condition, fuse,
/// infer, revert, encode.
pub fn generate<L: Loader>(
    cache: &mut ModelCache<L>,
    request: &GenerationRequest,
) -> Result<GenerationResult> {
    validate(request)?;

    let registry = cache.registry().clone();
    let layout = cache.layout().clone();
    let model = registry.describe(&request.model)?;
    cache.load(&request.model)?;
    let adapter_attached = cache.adapter_attached();
    let lora = request
        .lora_name
        .as_deref()
        .map(|name| layout.resolve_lora(name).map(|path| (name, path)))
        .transpose()?;
    let pipeline = cache.load(&request.model)?;

    let seed = request
        .seed
        .unwrap_or_else(|| u64::from(rand::thread_rng().gen_range(0..u32::MAX)));
    let params = resolve_params(request, model, seed);
    let (conditioning, conditioning_scale) = conditioning(pipeline, request, adapter_attached);

    tracing::info!(
        model = %request.model,
        seed,
        steps = params.steps,
        cfg_scale = params.cfg_scale,
        width = params.width,
        height = params.height,
        lora = request.lora_name.as_deref(),
        "generating image"
    );

    let image = match &lora {
        Some((name, path)) => {
            let mut fused = FusedLora::fuse(pipeline, path, request.lora_scale)?;
            tracing::info!(lora = name, scale = request.lora_scale, "LoRA fused");
            fused.generate(&params, conditioning.as_ref())
        }
        None => pipeline.generate(&params, conditioning.as_ref()),
    }
    .map_err(|e| Error::Inference(e.context("inference failed")))?;

    let image = image_to_base64_png(&image)?;
    Ok(GenerationResult {
        image,
        seed,
        parameters: ResolvedParameters {
            prompt: params.prompt,
            negative_prompt: params.negative_prompt,
            width: params.width,
            height: params.height,
            steps: params.steps,
            cfg_scale: params.cfg_scale,
            model: request.model.clone(),
            lora_name: lora.as_ref().map(|(name, _)| name.to_string()),
            lora_scale: lora.as_ref().map(|_| request.lora_scale),
            ip_adapter_scale: conditioning_scale,
        },
    })
}

/// Explicit request values win over the model's registered defaults.
pub fn resolve_params(
    request: &GenerationRequest,
    model: &ModelDescriptor,
    seed: u64,
) -> GenerationParams {
    GenerationParams {
        prompt: request.prompt.clone(),
        negative_prompt: request
            .negative_prompt
            .clone()
            .filter(|negative| !negative.is_empty())
            .unwrap_or_else(|| model.default_negative.to_string()),
        width: request.width,
        height: request.height,
        steps: request.steps.unwrap_or(model.default_steps),
        cfg_scale: request.cfg_scale.unwrap_or(model.default_cfg),
        seed,
    }
}

/// Picks the conditioning image and sets the adapter scale. Returns the
/// image to pass to the pipeline and, when a real reference is used, the
/// scale it was applied at.
fn conditioning<P: Pipeline>(
    pipeline: &mut P,
    request: &GenerationRequest,
    adapter_attached: bool,
) -> (Option<DynamicImage>, Option<f64>) {
    if !adapter_attached {
        if request.reference_image.is_some() {
            tracing::warn!("reference image provided but IP-Adapter not loaded, ignoring it");
        }
        return (None, None);
    }

    if let Some(encoded) = &request.reference_image {
        match decode_base64_image(encoded) {
            Ok(reference) => {
                pipeline.set_adapter_scale(request.ip_adapter_scale);
                tracing::info!(scale = request.ip_adapter_scale, "using reference image");
                return (Some(reference), Some(request.ip_adapter_scale));
            }
            Err(e) => tracing::warn!(error = %e, "could not process reference image"),
        }
    }

    // The adapter expects an image input; a black one at zero scale leaves the output unchanged.
    pipeline.set_adapter_scale(0.0);
    let neutral = RgbImage::new(NEUTRAL_CONDITIONING_SIZE, NEUTRAL_CONDITIONING_SIZE);
    (Some(DynamicImage::ImageRgb8(neutral)), None)
}

/// A pipeline with a LoRA fused in. Dropping it unfuses, whether or not
/// inference succeeded.
struct FusedLora<'a, P: Pipeline> {
    pipeline: &'a mut P,
}

impl<'a, P: Pipeline> FusedLora<'a, P> {
    fn fuse(pipeline: &'a mut P, weights: &Path, scale: f64) -> Result<Self> {
        if let Err(e) = pipeline.fuse_lora(weights, scale) {
            if let Err(revert) = pipeline.unfuse_lora() {
                tracing::error!(error = %revert, "failed to revert partially fused LoRA");
            }
            return Err(Error::Inference(e.context("failed to fuse LoRA")));
        }
        Ok(Self { pipeline })
    }
}

impl<P: Pipeline> Deref for FusedLora<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.pipeline
    }
}

impl<P: Pipeline> DerefMut for FusedLora<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        self.pipeline
    }
}

impl<P: Pipeline> Drop for FusedLora<'_, P> {
    fn drop(&mut self) {
        match self.pipeline.unfuse_lora() {
            Ok(()) => tracing::debug!("LoRA unfused"),
            Err(e) => tracing::error!(error = %e, "failed to unfuse LoRA"),
        }
    }
}
