//! Loading checkpoints in the layout of the OpenAI CLIP release.
//!
//! Those checkpoints carry no config. The architecture is recovered from
//! tensor shapes and key names alone, then the weights are loaded strictly.

use crate::clip::config::{ImageSize, TextConfig, VisionConfig, VisionLayers};
use crate::clip::model::{Clip, ClipOptions};
use crate::clip::precision::convert_weights_to_lp;
use crate::dtype::DType;
use crate::error::{ClipError, Result, exact_div};
use crate::io::StateDict;
use crate::io::mapping::StateDictMapper;
use crate::nn::Module;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Scalar metadata stored alongside the weights
const METADATA_KEYS: [&str; 3] = ["input_resolution", "context_length", "vocab_size"];

/// Top-level text keys of the flattened layout
const FLAT_TEXT_PREFIXES: [&str; 5] = [
    "text_projection",
    "positional_embedding",
    "token_embedding",
    "transformer",
    "ln_final",
];

/// Anything that can report tensor shapes by key
pub trait ShapeSource {
    fn shape_of(&self, key: &str) -> Option<&[usize]>;
    fn key_names(&self) -> Box<dyn Iterator<Item = &str> + '_>;
}

impl ShapeSource for StateDict {
    fn shape_of(&self, key: &str) -> Option<&[usize]> {
        self.get(key).map(|t| t.shape.as_slice())
    }

    fn key_names(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(self.keys().map(String::as_str))
    }
}

/// Shape-only fixture: key → shape
impl ShapeSource for BTreeMap<String, Vec<usize>> {
    fn shape_of(&self, key: &str) -> Option<&[usize]> {
        self.get(key).map(Vec::as_slice)
    }

    fn key_names(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(self.keys().map(String::as_str))
    }
}

/// Architecture recovered from a legacy checkpoint
#[derive(Clone, Debug, PartialEq)]
pub struct LegacyConfig {
    pub embed_dim: usize,
    pub vision: VisionConfig,
    pub text: TextConfig,
}

fn require<'a, S: ShapeSource + ?Sized>(src: &'a S, key: &str, rank: usize) -> Result<&'a [usize]> {
    let shape = src
        .shape_of(key)
        .ok_or_else(|| ClipError::MissingKey(key.to_string()))?;
    if shape.len() < rank {
        return Err(ClipError::Config(format!(
            "'{key}' has shape {shape:?}, expected at least {rank} dims"
        )));
    }
    Ok(shape)
}

/// Distinct values of the third dotted component among keys with `prefix`
fn count_blocks<S: ShapeSource + ?Sized>(src: &S, prefix: &str) -> usize {
    src.key_names()
        .filter(|k| k.starts_with(prefix))
        .filter_map(|k| k.split('.').nth(2))
        .collect::<BTreeSet<_>>()
        .len()
}

/// Side of the square grid behind `rows` position rows plus one class row
fn square_side(rows: usize, key: &str) -> Result<usize> {
    let cells = rows.saturating_sub(1);
    let side = (cells as f64).sqrt().round() as usize;
    if side * side != cells || side == 0 {
        return Err(ClipError::Config(format!(
            "'{key}' has {rows} rows, not a square grid plus one class token"
        )));
    }
    Ok(side)
}

fn infer_vision<S: ShapeSource + ?Sized>(src: &S) -> Result<VisionConfig> {
    if src.shape_of("visual.proj").is_some() {
        let conv = require(src, "visual.conv1.weight", 4)?;
        let (width, patch_size) = (conv[0], conv[3]);
        let layers = src
            .key_names()
            .filter(|k| k.starts_with("visual.") && k.ends_with(".attn.in_proj_weight"))
            .count();
        let rows = require(src, "visual.positional_embedding", 2)?[0];
        let grid = square_side(rows, "visual.positional_embedding")?;
        info!(width, layers, patch_size, grid, "inferred transformer vision tower");
        Ok(VisionConfig {
            layers: VisionLayers::Uniform(layers),
            width,
            patch_size,
            image_size: ImageSize::Square(patch_size * grid),
            ..VisionConfig::default()
        })
    } else {
        let mut counts = [0; 4];
        for (b, count) in counts.iter_mut().enumerate() {
            *count = count_blocks(src, &format!("visual.layer{}.", b + 1));
        }
        let width = require(src, "visual.layer1.0.conv1.weight", 1)?[0];
        let rows = require(src, "visual.attnpool.positional_embedding", 2)?[0];
        let side = square_side(rows, "visual.attnpool.positional_embedding")?;
        info!(?counts, width, image_size = side * 32, "inferred residual vision tower");
        Ok(VisionConfig {
            layers: VisionLayers::Stages(counts),
            width,
            image_size: ImageSize::Square(side * 32),
            ..VisionConfig::default()
        })
    }
}

/// Recover the architecture of a legacy checkpoint from its shapes.
///
/// The presence of `visual.proj` selects a transformer vision tower;
/// otherwise the residual layout is assumed. Text heads are `width / 64`.
pub fn infer_legacy_config<S: ShapeSource + ?Sized>(src: &S) -> Result<LegacyConfig> {
    let vision = infer_vision(src)?;

    let embed_dim = require(src, "text_projection", 2)?[1];
    let context_length = require(src, "positional_embedding", 1)?[0];
    let vocab_size = require(src, "token_embedding.weight", 1)?[0];
    let width = require(src, "ln_final.weight", 1)?[0];
    let heads = exact_div("text width / 64", width, 64)?;
    let layers = count_blocks(src, "transformer.resblocks");
    info!(embed_dim, context_length, vocab_size, width, heads, layers, "inferred text tower");

    Ok(LegacyConfig {
        embed_dim,
        vision,
        text: TextConfig {
            context_length,
            vocab_size,
            width,
            heads,
            layers,
            ..TextConfig::default()
        },
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LegacyOptions {
    pub quick_gelu: bool,
    /// Compute dtype the model is built for
    pub cast_dtype: DType,
}

impl Default for LegacyOptions {
    fn default() -> Self {
        LegacyOptions {
            quick_gelu: true,
            cast_dtype: DType::F16,
        }
    }
}

/// Build an eval-mode [`Clip`] from a legacy checkpoint.
///
/// The metadata keys are dropped, recognised weights are converted to f16
/// as in those exports, and every remaining key must match the model
/// exactly.
pub fn build_from_legacy_dict(state: StateDict, opts: LegacyOptions) -> Result<Clip> {
    let cfg = infer_legacy_config(&state)?;
    let clip_opts = ClipOptions {
        quick_gelu: opts.quick_gelu,
        cast_dtype: Some(opts.cast_dtype),
        ..ClipOptions::default()
    };
    let mut model = Clip::new(cfg.embed_dim, &cfg.vision, &cfg.text, &clip_opts)?;

    let state = StateDictMapper::new().exclude_keys(METADATA_KEYS).map(state);
    convert_weights_to_lp(&model, DType::F16)?;
    model.load_state_dict(&state, true)?;
    model.eval();
    Ok(model)
}

/// Move the flattened text keys under `text.` for the separate text layout.
///
/// Dicts without `text_projection` are returned unchanged.
pub fn convert_to_custom_text_state_dict(state: StateDict) -> StateDict {
    if !state.contains_key("text_projection") {
        return state;
    }
    StateDictMapper::new()
        .add_prefix_where("text.", |k| {
            FLAT_TEXT_PREFIXES.iter().any(|p| k.starts_with(p))
        })
        .map(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::TensorData;

    fn vit_shapes() -> BTreeMap<String, Vec<usize>> {
        let mut shapes = BTreeMap::new();
        let mut put = |k: &str, s: &[usize]| {
            shapes.insert(k.to_string(), s.to_vec());
        };
        put("visual.proj", &[768, 512]);
        put("visual.conv1.weight", &[768, 3, 16, 16]);
        put("visual.positional_embedding", &[197, 768]);
        for i in 0..12 {
            put(&format!("visual.transformer.resblocks.{i}.attn.in_proj_weight"), &[2304, 768]);
        }
        put("text_projection", &[512, 512]);
        put("positional_embedding", &[77, 512]);
        put("token_embedding.weight", &[49408, 512]);
        put("ln_final.weight", &[512]);
        for i in 0..12 {
            put(&format!("transformer.resblocks.{i}.ln_1.weight"), &[512]);
            put(&format!("transformer.resblocks.{i}.ln_2.weight"), &[512]);
        }
        shapes
    }

    #[test]
    fn test_infer_vit_export() {
        let cfg = infer_legacy_config(&vit_shapes()).unwrap();
        assert_eq!(cfg.vision.width, 768);
        assert_eq!(cfg.vision.layers, VisionLayers::Uniform(12));
        assert_eq!(cfg.vision.patch_size, 16);
        assert_eq!(cfg.vision.image_size.hw(), (224, 224));
        assert_eq!(cfg.embed_dim, 512);
        assert_eq!((cfg.text.width, cfg.text.heads, cfg.text.layers), (512, 8, 12));
        assert_eq!((cfg.text.context_length, cfg.text.vocab_size), (77, 49408));
    }

    #[test]
    fn test_infer_resnet_export() {
        let mut shapes = vit_shapes();
        shapes.retain(|k, _| !k.starts_with("visual."));
        for (stage, blocks) in [(1, 3), (2, 4), (3, 6), (4, 3)] {
            for i in 0..blocks {
                shapes.insert(format!("visual.layer{stage}.{i}.conv1.weight"), vec![64, 64, 1, 1]);
                shapes.insert(format!("visual.layer{stage}.{i}.bn1.weight"), vec![64]);
            }
        }
        shapes.insert("visual.attnpool.positional_embedding".into(), vec![50, 2048]);
        let cfg = infer_legacy_config(&shapes).unwrap();
        assert_eq!(cfg.vision.layers, VisionLayers::Stages([3, 4, 6, 3]));
        assert_eq!(cfg.vision.width, 64);
        assert_eq!(cfg.vision.image_size.hw(), (224, 224));
    }

    #[test]
    fn test_missing_key_reported() {
        let mut shapes = vit_shapes();
        shapes.remove("ln_final.weight");
        assert!(matches!(
            infer_legacy_config(&shapes),
            Err(ClipError::MissingKey(k)) if k == "ln_final.weight"
        ));
    }

    #[test]
    fn test_custom_text_remap() {
        let mut state = StateDict::new();
        for key in ["text_projection", "transformer.resblocks.0.ln_1.weight", "visual.proj", "logit_scale"] {
            state.insert(key.to_string(), TensorData::new(vec![0.0], &[1], DType::F32));
        }
        let state = convert_to_custom_text_state_dict(state);
        let keys: Vec<_> = state.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "logit_scale",
                "text.text_projection",
                "text.transformer.resblocks.0.ln_1.weight",
                "visual.proj",
            ]
        );

        let mut nested = StateDict::new();
        nested.insert("text.token_embedding.weight".into(), TensorData::new(vec![0.0], &[1], DType::F32));
        assert_eq!(convert_to_custom_text_state_dict(nested.clone()), nested);
    }
}
