//! Fixed on-disk layout of checkpoints, adapter weights and LoRA files.
//!
//! Everything lives under a single root:
//!
//! ```text
//! <root>/<checkpoint>/unet/diffusion_pytorch_model.safetensors
//! <root>/<checkpoint>/vae/diffusion_pytorch_model.safetensors
//! <root>/<checkpoint>/text_encoder/model.safetensors
//! <root>/<checkpoint>/text_encoder_2/model.safetensors
//! <root>/<checkpoint>/tokenizer/tokenizer.json
//! <root>/<checkpoint>/tokenizer_2/tokenizer.json
//! <root>/ip-adapter/sdxl_models/ip-adapter-plus_sdxl_vit-h.safetensors
//! <root>/loras/<name>.safetensors
//! ```

use std::path::{Path, PathBuf};

use crate::{Error, ModelDescriptor, Result};

pub const DEFAULT_MODEL_ROOT: &str = "/workspace/models";

const ADAPTER_DIR: &str = "ip-adapter";
const ADAPTER_SUBFOLDER: &str = "sdxl_models";
const ADAPTER_WEIGHTS: &str = "ip-adapter-plus_sdxl_vit-h.safetensors";
const LORA_DIR: &str = "loras";
const WEIGHTS_EXTENSION: &str = "safetensors";

#[derive(Debug, Clone)]
pub struct ModelLayout {
    root: PathBuf,
}

/// Component files of a diffusers-layout SDXL checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub dir: PathBuf,
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub text_encoder: PathBuf,
    pub text_encoder_2: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_2: PathBuf,
}

impl CheckpointPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            unet: dir.join("unet").join("diffusion_pytorch_model.safetensors"),
            vae: dir.join("vae").join("diffusion_pytorch_model.safetensors"),
            text_encoder: dir.join("text_encoder").join("model.safetensors"),
            text_encoder_2: dir.join("text_encoder_2").join("model.safetensors"),
            tokenizer: dir.join("tokenizer").join("tokenizer.json"),
            tokenizer_2: dir.join("tokenizer_2").join("tokenizer.json"),
            dir,
        }
    }

    pub fn components(&self) -> [&Path; 6] {
        [
            &self.unet,
            &self.vae,
            &self.text_encoder,
            &self.text_encoder_2,
            &self.tokenizer,
            &self.tokenizer_2,
        ]
    }

    /// First component that is not present on disk, if any.
    pub fn first_missing(&self) -> Option<&Path> {
        self.components().into_iter().find(|path| !path.is_file())
    }

    pub fn is_complete(&self) -> bool {
        self.first_missing().is_none()
    }
}

impl ModelLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint(&self, model: &ModelDescriptor) -> CheckpointPaths {
        CheckpointPaths::new(self.root.join(model.checkpoint))
    }

    pub fn adapter_weights(&self) -> PathBuf {
        self.root
            .join(ADAPTER_DIR)
            .join(ADAPTER_SUBFOLDER)
            .join(ADAPTER_WEIGHTS)
    }

    pub fn lora_dir(&self) -> PathBuf {
        self.root.join(LORA_DIR)
    }

    /// Sorted base names of the `.safetensors` files in the LoRA directory.
    /// A missing directory yields an empty list.
    pub fn list_loras(&self) -> std::io::Result<Vec<String>> {
        let dir = self.lora_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some(WEIGHTS_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn resolve_lora(&self, name: &str) -> Result<PathBuf> {
        let path = self
            .lora_dir()
            .join(format!("{name}.{WEIGHTS_EXTENSION}"));
        let plain_name = !name.is_empty()
            && !name.contains(['/', '\\'])
            && name != "."
            && name != "..";
        if plain_name && path.is_file() {
            return Ok(path);
        }
        Err(Error::UnknownLora {
            name: name.to_string(),
            available: self.list_loras().unwrap_or_default(),
        })
    }
}

impl Default for ModelLayout {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_ROOT)
    }
}
