use std::path::Path;

use anyhow::{bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    self,
    clip::{ClipTextTransformer, Config as ClipConfig},
    unet_2d::{BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig},
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;

mod lora;
mod sampler;

use crate::{
    select_best_device, util::tensor_to_image, CheckpointPaths, DeviceMap, GenerationParams,
    LoadOptions, Loader, Pipeline,
};
use sampler::{EulerAncestral, Noise};

/// Latent scaling factor of the SDXL VAE.
const VAE_SCALE: f64 = 0.13025;
const LATENT_CHANNELS: usize = 4;
const ATTENTION_SLICE_SIZE: usize = 2;

/// SDXL base UNet layout, optionally with sliced attention.
fn unet_config(sliced_attention_size: Option<usize>) -> UNet2DConditionModelConfig {
    let block = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    };
    UNet2DConditionModelConfig {
        blocks: vec![
            block(320, None, 5),
            block(640, Some(2), 10),
            block(1280, Some(10), 20),
        ],
        center_input_sample: false,
        cross_attention_dim: 2048,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size,
        use_linear_projection: true,
    }
}

pub struct SdxlPipeline {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    checkpoint: CheckpointPaths,
    use_flash_attn: bool,
    /// Whether `unet` was built with sliced attention.
    attention_slicing: bool,
    tokenizer: Tokenizer,
    tokenizer_2: Tokenizer,
    text_encoder: ClipTextTransformer,
    text_encoder_2: ClipTextTransformer,
    unet: UNet2DConditionModel,
    /// UNet with a LoRA merged in; used instead of `unet` while present.
    fused_unet: Option<UNet2DConditionModel>,
    vae: AutoEncoderKL,
}

impl SdxlPipeline {
    fn encode_prompt(
        &self,
        tokenizer: &Tokenizer,
        encoder: &ClipTextTransformer,
        config: &ClipConfig,
        prompt: &str,
    ) -> Result<Tensor> {
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;
        let mut tokens = tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > config.max_position_embeddings {
            tracing::warn!(
                tokens = tokens.len(),
                limit = config.max_position_embeddings,
                "prompt truncated"
            );
            tokens.truncate(config.max_position_embeddings);
        }
        tokens.resize(config.max_position_embeddings, pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(encoder.forward(&tokens)?)
    }

    /// Hidden states of both text encoders, concatenated on the feature
    /// axis. With guidance the negative prompt is stacked first.
    fn text_embeddings(&self, prompt: &str, negative: &str, use_guidance: bool) -> Result<Tensor> {
        let clip2 = self
            .config
            .clip2
            .as_ref()
            .context("SDXL config has no second text encoder")?;
        let encoders = [
            (&self.tokenizer, &self.text_encoder, &self.config.clip),
            (&self.tokenizer_2, &self.text_encoder_2, clip2),
        ];
        let mut embeddings = Vec::with_capacity(encoders.len());
        for (tokenizer, encoder, config) in encoders {
            let cond = self.encode_prompt(tokenizer, encoder, config, prompt)?;
            let emb = if use_guidance {
                let uncond = self.encode_prompt(tokenizer, encoder, config, negative)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            embeddings.push(emb.to_dtype(self.dtype)?);
        }
        Ok(Tensor::cat(&embeddings, D::Minus1)?)
    }

    fn unet_config(&self) -> UNet2DConditionModelConfig {
        unet_config(self.attention_slicing.then_some(ATTENTION_SLICE_SIZE))
    }
}

fn build_unet(
    vb: VarBuilder,
    use_flash_attn: bool,
    config: UNet2DConditionModelConfig,
) -> Result<UNet2DConditionModel> {
    Ok(UNet2DConditionModel::new(
        vb,
        LATENT_CHANNELS,
        LATENT_CHANNELS,
        use_flash_attn,
        config,
    )?)
}

impl Pipeline for SdxlPipeline {
    fn generate(
        &mut self,
        params: &GenerationParams,
        conditioning: Option<&DynamicImage>,
    ) -> Result<DynamicImage> {
        if conditioning.is_some() {
            bail!("SDXL pipeline has no image-conditioning adapter attached");
        }
        let width = params.width as usize;
        let height = params.height as usize;
        if width % 8 != 0 || height % 8 != 0 {
            bail!("width and height must be multiples of 8, got {width}x{height}");
        }

        let use_guidance = params.cfg_scale > 1.0;
        let text_embeddings =
            self.text_embeddings(&params.prompt, &params.negative_prompt, use_guidance)?;

        // All noise comes from the seeded host RNG so the seed alone fixes
        // the image.
        let mut noise = Noise::new(params.seed);
        let sampler = EulerAncestral::new(params.steps as usize)?;
        let mut latents = (noise
            .randn((1, LATENT_CHANNELS, height / 8, width / 8), &Device::Cpu)?
            .to_device(&self.device)?
            * sampler.init_noise_sigma())?
        .to_dtype(self.dtype)?;

        let unet = self.fused_unet.as_ref().unwrap_or(&self.unet);
        let timesteps = sampler.timesteps();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = sampler.scale_model_input(&input, index)?;
            let noise_pred = unet.forward(&input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * params.cfg_scale)?)?
            } else {
                noise_pred
            };
            latents = sampler.step(&noise_pred, index, &latents, &mut noise)?;
            tracing::debug!(step = index + 1, total = timesteps.len(), "denoising step");
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let img = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&img)
    }

    fn attach_adapter(&mut self, weights: &Path) -> Result<()> {
        bail!(
            "IP-Adapter attention processors are not available for the candle SDXL UNet ({})",
            weights.display()
        )
    }

    fn set_adapter_scale(&mut self, scale: f64) {
        tracing::debug!(scale, "adapter scale ignored, no adapter attached");
    }

    fn enable_attention_slicing(&mut self) -> Result<()> {
        if !self.attention_slicing {
            // Slicing is fixed when the UNet is built.
            tracing::debug!("UNet was built without sliced attention, keeping it");
        }
        Ok(())
    }

    fn fuse_lora(&mut self, weights: &Path, scale: f64) -> Result<()> {
        let (tensors, report) = lora::merge_files(&self.checkpoint.unet, weights, scale)?;
        tracing::debug!(merged = report.merged, skipped = report.skipped, "LoRA merged");
        let vb = VarBuilder::from_tensors(tensors, self.dtype, &self.device);
        self.fused_unet = Some(
            build_unet(vb, self.use_flash_attn, self.unet_config())
                .context("failed to build fused UNet")?,
        );
        Ok(())
    }

    fn unfuse_lora(&mut self) -> Result<()> {
        self.fused_unet = None;
        Ok(())
    }
}

/// Loads diffusers-layout SDXL checkpoints with candle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdxlLoader {
    device_map: DeviceMap,
}

impl SdxlLoader {
    pub fn new(device_map: DeviceMap) -> Self {
        Self { device_map }
    }
}

impl Loader for SdxlLoader {
    type Pipeline = SdxlPipeline;

    fn supports_adapter(&self) -> bool {
        false
    }

    fn load(&self, checkpoint: &CheckpointPaths, options: LoadOptions) -> Result<SdxlPipeline> {
        // Configure device.
        let device = select_best_device(self.device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        let config = StableDiffusionConfig::sdxl(None, None, None);

        // --- Tokenizers and text encoders ---
        let tokenizer = Tokenizer::from_file(&checkpoint.tokenizer)
            .map_err(Error::msg)
            .context("failed to load tokenizer")?;
        let tokenizer_2 = Tokenizer::from_file(&checkpoint.tokenizer_2)
            .map_err(Error::msg)
            .context("failed to load second tokenizer")?;
        let text_encoder = stable_diffusion::build_clip_transformer(
            &config.clip,
            &checkpoint.text_encoder,
            &device,
            DType::F32,
        )
        .context("failed to load text encoder")?;
        let clip2 = config
            .clip2
            .as_ref()
            .context("SDXL config has no second text encoder")?;
        let text_encoder_2 = stable_diffusion::build_clip_transformer(
            clip2,
            &checkpoint.text_encoder_2,
            &device,
            DType::F32,
        )
        .context("failed to load second text encoder")?;

        // --- VAE and UNet ---
        let vae = config
            .build_vae(&checkpoint.vae, &device, dtype)
            .context("failed to load VAE")?;
        let use_flash_attn = cfg!(feature = "flash-attn");
        let attention_slicing = options.attention_slicing;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&checkpoint.unet], dtype, &device)
                .context("failed to map UNet weights")?
        };
        let unet = build_unet(
            vb,
            use_flash_attn,
            unet_config(attention_slicing.then_some(ATTENTION_SLICE_SIZE)),
        )
        .context("failed to load UNet")?;

        tracing::info!(
            ?device,
            ?dtype,
            attention_slicing,
            "SDXL pipeline ready with Euler ancestral sampler"
        );
        Ok(SdxlPipeline {
            device,
            dtype,
            config,
            checkpoint: checkpoint.clone(),
            use_flash_attn,
            attention_slicing,
            tokenizer,
            tokenizer_2,
            text_encoder,
            text_encoder_2,
            unet,
            fused_unet: None,
            vae,
        })
    }
}
