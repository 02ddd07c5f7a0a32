use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::DEFAULT_MODEL;

pub const DEFAULT_DIMENSION: u32 = 1024;
pub const DEFAULT_IP_ADAPTER_SCALE: f64 = 0.7;
pub const DEFAULT_LORA_SCALE: f64 = 0.8;

fn default_dimension() -> u32 {
    DEFAULT_DIMENSION
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_ip_adapter_scale() -> f64 {
    DEFAULT_IP_ADAPTER_SCALE
}

fn default_lora_scale() -> f64 {
    DEFAULT_LORA_SCALE
}

/// Body of `POST /generate`. Optional sampling fields fall back to the
/// model's registered defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    #[validate(range(min = 512, max = 1536, message = "width must be between 512 and 1536"))]
    pub width: u32,
    #[serde(default = "default_dimension")]
    #[validate(range(min = 512, max = 1536, message = "height must be between 512 and 1536"))]
    pub height: u32,
    #[serde(default)]
    #[validate(range(min = 1, max = 50, message = "steps must be between 1 and 50"))]
    pub steps: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 1.0, max = 20.0, message = "cfg_scale must be between 1.0 and 20.0"))]
    pub cfg_scale: Option<f64>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Base64-encoded reference image for the conditioning adapter.
    #[serde(default)]
    pub reference_image: Option<String>,
    #[serde(default = "default_ip_adapter_scale")]
    #[validate(range(min = 0.0, max = 1.0, message = "ip_adapter_scale must be between 0.0 and 1.0"))]
    pub ip_adapter_scale: f64,
    #[serde(default)]
    pub lora_name: Option<String>,
    #[serde(default = "default_lora_scale")]
    #[validate(range(min = 0.0, max = 1.5, message = "lora_scale must be between 0.0 and 1.5"))]
    pub lora_scale: f64,
}

impl GenerationRequest {
    /// A request for `prompt` with every other field at its default.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            steps: None,
            cfg_scale: None,
            seed: None,
            model: default_model(),
            reference_image: None,
            ip_adapter_scale: DEFAULT_IP_ADAPTER_SCALE,
            lora_name: None,
            lora_scale: DEFAULT_LORA_SCALE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchModelRequest {
    pub model: String,
}

/// Parameters actually used for a generation, echoed back for reproducibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParameters {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_scale: Option<f64>,
    /// Present only when a reference image conditioned the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_adapter_scale: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Base64-encoded PNG.
    pub image: String,
    pub seed: u64,
    pub parameters: ResolvedParameters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_fields_take_defaults() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "a lighthouse at dusk"}"#).unwrap();
        assert_eq!(request, GenerationRequest::new("a lighthouse at dusk"));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let cases = [
            r#"{"prompt": "x", "width": 511}"#,
            r#"{"prompt": "x", "height": 1537}"#,
            r#"{"prompt": "x", "steps": 0}"#,
            r#"{"prompt": "x", "steps": 51}"#,
            r#"{"prompt": "x", "cfg_scale": 0.5}"#,
            r#"{"prompt": "x", "cfg_scale": 20.5}"#,
            r#"{"prompt": "x", "ip_adapter_scale": 1.1}"#,
            r#"{"prompt": "x", "lora_scale": -0.1}"#,
            r#"{"prompt": "x", "lora_scale": 1.6}"#,
        ];
        for body in cases {
            let request: GenerationRequest = serde_json::from_str(body).unwrap();
            assert!(request.validate().is_err(), "{body} should be rejected");
        }
    }

    #[test]
    fn bounds_are_inclusive() {
        let request: GenerationRequest = serde_json::from_str(
            r#"{"prompt": "x", "width": 512, "height": 1536, "steps": 50,
                "cfg_scale": 1.0, "ip_adapter_scale": 0.0, "lora_scale": 1.5}"#,
        )
        .unwrap();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn optional_echo_fields_are_omitted() {
        let parameters = ResolvedParameters {
            prompt: "x".into(),
            negative_prompt: String::new(),
            width: 1024,
            height: 1024,
            steps: 28,
            cfg_scale: 5.0,
            model: "animagine".into(),
            lora_name: None,
            lora_scale: None,
            ip_adapter_scale: None,
        };
        let json = serde_json::to_value(&parameters).unwrap();
        assert!(json.get("lora_name").is_none());
        assert!(json.get("ip_adapter_scale").is_none());
        assert_eq!(json["steps"], 28);
    }
}
