use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// `"healthy"` with a resident model, `"no_model_loaded"` otherwise.
    pub status: String,
    pub current_model: Option<String>,
    pub available_models: Vec<String>,
    pub ip_adapter_loaded: bool,
    pub cuda_available: bool,
    pub gpu_name: Option<String>,
    pub vram_allocated_gb: Option<f64>,
    pub idle_seconds: f64,
    pub idle_timeout_minutes: u64,
    pub watchdog_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub description: String,
    pub downloaded: bool,
    pub loaded: bool,
    pub default_cfg: f64,
    pub default_steps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsReport {
    pub models: BTreeMap<String, ModelStatus>,
    pub current: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LorasReport {
    pub loras: Vec<String>,
}
