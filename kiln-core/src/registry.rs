use serde::Serialize;

use crate::{Error, Result};

/// Model used when a request does not name one.
pub const DEFAULT_MODEL: &str = "animagine";

/// Static description of a servable model and its tuned sampling defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub id: &'static str,
    /// Directory name of the checkpoint under the model root.
    pub checkpoint: &'static str,
    pub default_cfg: f64,
    pub default_steps: u32,
    pub default_negative: &'static str,
    pub description: &'static str,
}

const BUILTIN_MODELS: &[ModelDescriptor] = &[
    ModelDescriptor {
        id: "animagine",
        checkpoint: "animagine-xl-4.0",
        default_cfg: 5.0,
        default_steps: 28,
        default_negative: "lowres, bad anatomy, bad hands, text, error, missing fingers, extra digit, fewer digits, cropped, worst quality, low quality, normal quality, jpeg artifacts, signature, watermark, username, blurry",
        description: "Anime-focused, clean aesthetic",
    },
    ModelDescriptor {
        id: "pony",
        checkpoint: "ponyDiffusionV6XL_v6StartWithThisOne",
        default_cfg: 7.0,
        default_steps: 25,
        default_negative: "score_4, score_3, score_2, score_1, source_pony, source_furry, ugly, low quality, worst quality, blurry, bad anatomy, bad hands, deformed, mutated",
        description: "Flexible, score-tag system, broader training",
    },
    ModelDescriptor {
        id: "noobai",
        checkpoint: "noobaiXLNAIXL_epsilonPred10",
        default_cfg: 5.5,
        default_steps: 28,
        default_negative: "lowres, bad anatomy, bad hands, text, error, missing fingers, extra digit, fewer digits, cropped, worst quality, low quality, jpeg artifacts, signature, watermark, blurry",
        description: "Illustrious fork, permissive, good anatomy",
    },
];

/// Lookup table of servable models, fixed at startup.
#[derive(Debug, Clone)]
pub struct Registry {
    models: Vec<ModelDescriptor>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    pub fn builtin() -> Self {
        Self::new(BUILTIN_MODELS.to_vec())
    }

    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self { models }
    }

    pub fn describe(&self, id: &str) -> Result<&ModelDescriptor> {
        self.models
            .iter()
            .find(|model| model.id == id)
            .ok_or_else(|| Error::UnknownModel {
                name: id.to_string(),
                available: self.ids(),
            })
    }

    pub fn list(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn ids(&self) -> Vec<String> {
        self.models.iter().map(|model| model.id.to_string()).collect()
    }
}
