//! Merging LoRA deltas into SDXL UNet weights.
//!
//! Both kohya (`lora_unet_<module>.lora_down.weight`) and diffusers/PEFT
//! (`unet.<module>.lora_A.weight`) key layouts are understood. Kohya files
//! trained against the original SGM UNet (`input_blocks_4_1_...`) are
//! renamed onto diffusers modules. Text encoder tensors are skipped.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

const SUFFIXES: &[(&str, Part)] = &[
    (".lora_down.weight", Part::Down),
    (".lora_up.weight", Part::Up),
    (".lora_A.weight", Part::Down),
    (".lora_B.weight", Part::Up),
    (".lora.down.weight", Part::Down),
    (".lora.up.weight", Part::Up),
    (".alpha", Part::Alpha),
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// UNet weights that received a delta.
    pub merged: usize,
    /// LoRA tensors or pairs that matched nothing in the UNet.
    pub skipped: usize,
}

#[derive(Default)]
struct Pair {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

/// Splits a LoRA tensor name into the underscore-flattened UNet module path
/// it targets and which factor it is.
fn parse_key(key: &str) -> Option<(String, Part)> {
    let (module, part) = SUFFIXES
        .iter()
        .find_map(|(suffix, part)| key.strip_suffix(suffix).map(|module| (module, *part)))?;
    let module = if let Some(module) = module.strip_prefix("lora_unet_") {
        sgm_to_diffusers(module).unwrap_or_else(|| module.to_string())
    } else {
        module.strip_prefix("unet.")?.replace('.', "_")
    };
    Some((module, part))
}

/// Resnet sublayers as named by SGM and diffusers.
const RESNET_LAYERS: &[(&str, &str)] = &[
    ("in_layers_0", "norm1"),
    ("in_layers_2", "conv1"),
    ("emb_layers_1", "time_emb_proj"),
    ("out_layers_0", "norm2"),
    ("out_layers_3", "conv2"),
    ("skip_connection", "conv_shortcut"),
];

const TOP_LEVEL: &[(&str, &str)] = &[
    ("input_blocks_0_0", "conv_in"),
    ("time_embed_0", "time_embedding_linear_1"),
    ("time_embed_2", "time_embedding_linear_2"),
    ("label_emb_0_0", "add_embedding_linear_1"),
    ("label_emb_0_2", "add_embedding_linear_2"),
    ("out_0", "conv_norm_out"),
    ("out_2", "conv_out"),
];

fn rename<'a>(table: &[(&str, &'a str)], name: &str) -> Option<&'a str> {
    table
        .iter()
        .find_map(|(sgm, diffusers)| (*sgm == name).then_some(*diffusers))
}

fn resnet_layer(rest: &str) -> &str {
    rename(RESNET_LAYERS, rest).unwrap_or(rest)
}

/// `<index>_<layer>_<rest>` to its numbers and the remaining path.
fn split_indices(path: &str) -> Option<(usize, usize, &str)> {
    let mut parts = path.splitn(3, '_');
    let index = parts.next()?.parse().ok()?;
    let layer = parts.next()?.parse().ok()?;
    Some((index, layer, parts.next().unwrap_or("")))
}

fn join(prefix: String, rest: &str) -> String {
    if rest.is_empty() {
        prefix
    } else {
        format!("{prefix}_{rest}")
    }
}

/// Renames an underscore-flattened SGM UNet module path onto the diffusers
/// layout. SDXL has three down and three up blocks of which the outer ones
/// carry no attention. Returns `None` for paths already in diffusers form.
fn sgm_to_diffusers(module: &str) -> Option<String> {
    if let Some(diffusers) = rename(TOP_LEVEL, module) {
        return Some(diffusers.to_string());
    }

    if let Some(path) = module.strip_prefix("input_blocks_") {
        let (index, layer, rest) = split_indices(path)?;
        if index == 0 {
            return None;
        }
        let (block, position) = ((index - 1) / 3, (index - 1) % 3);
        let prefix = format!("down_blocks_{block}");
        return Some(match (position, layer) {
            (2, 0) => format!("{prefix}_downsamplers_0_conv"),
            (_, 0) => join(format!("{prefix}_resnets_{position}"), resnet_layer(rest)),
            _ => join(format!("{prefix}_attentions_{position}"), rest),
        });
    }

    if let Some(path) = module.strip_prefix("middle_block_") {
        let (layer, rest) = path.split_once('_').unwrap_or((path, ""));
        return Some(match layer.parse::<usize>().ok()? {
            1 => join("mid_block_attentions_0".to_string(), rest),
            resnet => join(format!("mid_block_resnets_{}", resnet / 2), resnet_layer(rest)),
        });
    }

    if let Some(path) = module.strip_prefix("output_blocks_") {
        let (index, layer, rest) = split_indices(path)?;
        let (block, position) = (index / 3, index % 3);
        let prefix = format!("up_blocks_{block}");
        return Some(match layer {
            0 => join(format!("{prefix}_resnets_{position}"), resnet_layer(rest)),
            1 if rest.starts_with("conv") => join(format!("{prefix}_upsamplers_0"), rest),
            1 => join(format!("{prefix}_attentions_{position}"), rest),
            _ => join(format!("{prefix}_upsamplers_0"), rest),
        });
    }

    None
}

fn scalar(tensor: &Tensor) -> Result<f64> {
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let value = values.first().context("empty LoRA alpha tensor")?;
    Ok(f64::from(*value))
}

/// `up @ down`, scaled by `alpha / rank`, reshaped onto the target weight.
fn delta(down: &Tensor, up: &Tensor, alpha: Option<f64>, shape: &[usize]) -> Result<Tensor> {
    let rank = down.dim(0)?;
    let down = down.to_dtype(DType::F32)?.flatten_from(1)?;
    let up = up.to_dtype(DType::F32)?.flatten_from(1)?;
    let delta = up.matmul(&down)?;
    let delta = match alpha {
        Some(alpha) => (delta * (alpha / rank as f64))?,
        None => delta,
    };
    delta
        .reshape(shape)
        .with_context(|| format!("LoRA delta does not fit weight of shape {shape:?}"))
}

/// Adds `scale * delta` to every UNet weight the LoRA targets.
pub fn merge(
    base: &mut HashMap<String, Tensor>,
    lora: HashMap<String, Tensor>,
    scale: f64,
) -> Result<MergeReport> {
    let targets: HashMap<String, String> = base
        .keys()
        .filter_map(|key| {
            key.strip_suffix(".weight")
                .map(|module| (module.replace('.', "_"), key.clone()))
        })
        .collect();

    let mut report = MergeReport::default();
    let mut pairs: HashMap<String, Pair> = HashMap::new();
    for (key, tensor) in lora {
        let Some((module, part)) = parse_key(&key) else {
            report.skipped += 1;
            continue;
        };
        let pair = pairs.entry(module).or_default();
        match part {
            Part::Down => pair.down = Some(tensor),
            Part::Up => pair.up = Some(tensor),
            Part::Alpha => pair.alpha = Some(scalar(&tensor)?),
        }
    }

    for (module, pair) in pairs {
        let (Some(down), Some(up), Some(target)) = (pair.down, pair.up, targets.get(&module)) else {
            tracing::debug!(module = %module, "LoRA module has no matching UNet weight");
            report.skipped += 1;
            continue;
        };
        let weight = &base[target];
        let delta = delta(&down, &up, pair.alpha, weight.dims())
            .with_context(|| format!("failed to merge LoRA into {target}"))?;
        let fused = (weight.to_dtype(DType::F32)? + (delta * scale)?)?.to_dtype(weight.dtype())?;
        base.insert(target.clone(), fused);
        report.merged += 1;
    }
    Ok(report)
}

/// Loads the UNet weights and the LoRA onto the CPU and returns the merged
/// UNet tensors.
pub fn merge_files(
    unet_weights: &Path,
    lora_weights: &Path,
    scale: f64,
) -> Result<(HashMap<String, Tensor>, MergeReport)> {
    let mut base = candle_core::safetensors::load(unet_weights, &Device::Cpu)
        .with_context(|| format!("failed to read UNet weights {}", unet_weights.display()))?;
    let lora = candle_core::safetensors::load(lora_weights, &Device::Cpu)
        .with_context(|| format!("failed to read LoRA {}", lora_weights.display()))?;
    let report = merge(&mut base, lora, scale)?;
    if report.merged == 0 {
        bail!(
            "LoRA {} has no tensors matching the SDXL UNet",
            lora_weights.display()
        );
    }
    Ok((base, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kohya_and_peft_keys() {
        assert_eq!(
            parse_key("lora_unet_down_blocks_1_attentions_0_proj_in.lora_down.weight"),
            Some(("down_blocks_1_attentions_0_proj_in".to_string(), Part::Down))
        );
        assert_eq!(
            parse_key("unet.mid_block.attentions.0.transformer_blocks.0.attn1.to_k.lora_B.weight"),
            Some((
                "mid_block_attentions_0_transformer_blocks_0_attn1_to_k".to_string(),
                Part::Up
            ))
        );
        assert_eq!(
            parse_key("lora_unet_up_blocks_0_attentions_1_proj_out.alpha"),
            Some(("up_blocks_0_attentions_1_proj_out".to_string(), Part::Alpha))
        );
        assert_eq!(parse_key("lora_te1_text_model_encoder_layers_0_mlp_fc1.lora_down.weight"), None);
        assert_eq!(parse_key("unet.conv_in.weight"), None);
    }

    #[test]
    fn sgm_block_names_map_to_diffusers() {
        let cases = [
            ("input_blocks_0_0", "conv_in"),
            ("input_blocks_4_1_proj_in", "down_blocks_1_attentions_0_proj_in"),
            ("input_blocks_1_0_in_layers_2", "down_blocks_0_resnets_0_conv1"),
            ("input_blocks_5_0_skip_connection", "down_blocks_1_resnets_1_conv_shortcut"),
            ("input_blocks_6_0_op", "down_blocks_1_downsamplers_0_conv"),
            (
                "middle_block_1_transformer_blocks_0_attn1_to_q",
                "mid_block_attentions_0_transformer_blocks_0_attn1_to_q",
            ),
            ("middle_block_2_emb_layers_1", "mid_block_resnets_1_time_emb_proj"),
            ("output_blocks_3_0_out_layers_3", "up_blocks_1_resnets_0_conv2"),
            ("output_blocks_2_1_proj_out", "up_blocks_0_attentions_2_proj_out"),
            ("output_blocks_5_2_conv", "up_blocks_1_upsamplers_0_conv"),
            ("time_embed_2", "time_embedding_linear_2"),
        ];
        for (sgm, diffusers) in cases {
            assert_eq!(sgm_to_diffusers(sgm).as_deref(), Some(diffusers), "{sgm}");
        }
        assert_eq!(sgm_to_diffusers("down_blocks_1_attentions_0_proj_in"), None);
    }

    #[test]
    fn merges_sgm_named_kohya_lora() {
        let cpu = Device::Cpu;
        let target = "down_blocks.1.attentions.0.proj_in.weight";
        let mut base = HashMap::from([(
            target.to_string(),
            Tensor::zeros((2, 2), DType::F32, &cpu).unwrap(),
        )]);
        let module = "lora_unet_input_blocks_4_1_proj_in";
        let lora = HashMap::from([
            (
                format!("{module}.lora_down.weight"),
                Tensor::new(&[[1f32, 1.]], &cpu).unwrap(),
            ),
            (
                format!("{module}.lora_up.weight"),
                Tensor::new(&[[1f32], [2.]], &cpu).unwrap(),
            ),
        ]);

        let report = merge(&mut base, lora, 1.0).unwrap();

        assert_eq!(report, MergeReport { merged: 1, skipped: 0 });
        let merged = base[target].to_vec2::<f32>().unwrap();
        assert_eq!(merged, vec![vec![1., 1.], vec![2., 2.]]);
    }

    #[test]
    fn merges_scaled_linear_delta() {
        let cpu = Device::Cpu;
        let mut base = HashMap::from([
            (
                "down_blocks.0.attentions.0.proj_in.weight".to_string(),
                Tensor::zeros((2, 2), DType::F32, &cpu).unwrap(),
            ),
            (
                "conv_in.weight".to_string(),
                Tensor::ones((2, 2), DType::F32, &cpu).unwrap(),
            ),
        ]);
        let module = "lora_unet_down_blocks_0_attentions_0_proj_in";
        let lora = HashMap::from([
            (
                format!("{module}.lora_down.weight"),
                Tensor::new(&[[1f32, 2.]], &cpu).unwrap(),
            ),
            (
                format!("{module}.lora_up.weight"),
                Tensor::new(&[[1f32], [3.]], &cpu).unwrap(),
            ),
            (format!("{module}.alpha"), Tensor::new(2f32, &cpu).unwrap()),
            (
                "lora_te2_text_model_encoder_layers_0_mlp_fc1.lora_down.weight".to_string(),
                Tensor::zeros((1, 2), DType::F32, &cpu).unwrap(),
            ),
        ]);

        let report = merge(&mut base, lora, 0.5).unwrap();

        assert_eq!(report, MergeReport { merged: 1, skipped: 1 });
        let merged = base["down_blocks.0.attentions.0.proj_in.weight"]
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(merged, vec![vec![1., 2.], vec![3., 6.]]);
        let untouched = base["conv_in.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(untouched, vec![vec![1., 1.], vec![1., 1.]]);
    }

    #[test]
    fn conv_delta_takes_kernel_shape() {
        let cpu = Device::Cpu;
        let down = Tensor::ones((1, 1, 3, 3), DType::F32, &cpu).unwrap();
        let up = Tensor::new(&[1f32, 2.], &cpu).unwrap().reshape((2, 1, 1, 1)).unwrap();

        let delta = delta(&down, &up, None, &[2, 1, 3, 3]).unwrap();

        assert_eq!(delta.dims(), &[2, 1, 3, 3]);
        let values = delta.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values[..9].iter().all(|v| *v == 1.));
        assert!(values[9..].iter().all(|v| *v == 2.));
    }

    #[test]
    fn mismatched_shapes_are_reported() {
        let cpu = Device::Cpu;
        let down = Tensor::ones((1, 3), DType::F32, &cpu).unwrap();
        let up = Tensor::ones((2, 1), DType::F32, &cpu).unwrap();
        assert!(delta(&down, &up, None, &[2, 2]).is_err());
    }
}
