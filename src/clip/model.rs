//! The dual-encoder composite with the flattened text namespace.
//!
//! The text tower is always owned by [`Clip`], but its members persist at the
//! top level of the state dict (`transformer.*`, `token_embedding.*`,
//! `ln_final.*`, ...) while the image tower lives under `visual.*`. A small
//! name table maps the few members whose flat names differ.

use crate::clip::backbone::BackboneRegistry;
use crate::clip::codebook::FdtQueryModel;
use crate::clip::config::{CodebookConfig, ModelConfig, SparoConfig, TextConfig, VisionConfig};
use crate::clip::sparo::{SlotSpec, SparoHeadConfig, project_slots};
use crate::clip::text::TextTransformer;
use crate::clip::tower::{
    TextTower, TowerMode, TowerOptions, TowerOutput, VisionTower, build_text_tower,
    build_vision_tower,
};
use crate::dtype::DType;
use crate::error::{ClipError, Result};
use crate::nn::{Linear, Module, TensorKind};
use crate::tensor::{RawTensor, Tensor, TensorOps};

/// Text member names whose persisted flat name differs
const TEXT_NAMESPACE: [(&str, &str); 3] = [
    ("attn_pool", "text_attn_pool"),
    ("sparo", "text_sparo"),
    ("cls_emb", "text_cls_emb"),
];

/// Text members the codebook query model replaces
const CODEBOOK_HIDDEN: [&str; 3] = ["ln_final", "text_projection", "attn_pool"];

fn text_namespace(name: &str, codebook: bool) -> Option<&str> {
    if codebook && CODEBOOK_HIDDEN.contains(&name) {
        return None;
    }
    let renamed = TEXT_NAMESPACE
        .iter()
        .find(|(from, _)| *from == name)
        .map_or(name, |(_, to)| *to);
    Some(renamed)
}

/// Construction options beyond the two tower configs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClipOptions {
    pub quick_gelu: bool,
    /// Reduced compute dtype; switches normalization to f32
    pub cast_dtype: Option<DType>,
    pub output_dict: bool,
    pub reduce_depth: usize,
    /// Towers emit this width and learned maps expand it to `embed_dim`
    pub bottleneck_dim: Option<usize>,
    pub sparo: Option<SparoConfig>,
    pub codebook: Option<CodebookConfig>,
}

impl ClipOptions {
    pub fn from_config(cfg: &ModelConfig, cast_dtype: Option<DType>) -> Self {
        ClipOptions {
            quick_gelu: cfg.quick_gelu,
            cast_dtype,
            output_dict: cfg.output_dict,
            reduce_depth: cfg.reduce_depth,
            bottleneck_dim: cfg.bottleneck_dim,
            sparo: cfg.sparo.clone(),
            codebook: cfg.codebook,
        }
    }

    pub(crate) fn tower_options(&self, mode: TowerMode) -> TowerOptions {
        TowerOptions {
            quick_gelu: self.quick_gelu,
            cast_dtype: self.cast_dtype,
            reduce_depth: self.reduce_depth,
            mode,
        }
    }
}

/// How encoders post-process tower output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// L2-normalize along the feature axis; required in structured mode
    pub normalize: bool,
    /// Return slots `[B, L, V]` instead of the flat `[B, L·V]` vector
    pub structured: bool,
    /// Also return the slot attention weights
    pub return_attn: bool,
}

impl EncodeOptions {
    pub fn normalized() -> Self {
        EncodeOptions {
            normalize: true,
            ..EncodeOptions::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct Encoding {
    pub features: Tensor,
    pub attn: Option<Tensor>,
}

/// Result of a joint forward pass
#[derive(Clone, Debug)]
pub enum ClipOutput {
    /// `(image_features, text_features, logit_scale.exp())`
    Tuple(Option<Tensor>, Option<Tensor>, Tensor),
    Dict {
        image_features: Option<Tensor>,
        text_features: Option<Tensor>,
        logit_scale: Tensor,
    },
}

impl ClipOutput {
    pub(crate) fn new(
        output_dict: bool,
        image_features: Option<Tensor>,
        text_features: Option<Tensor>,
        logit_scale: Tensor,
    ) -> Self {
        if output_dict {
            ClipOutput::Dict {
                image_features,
                text_features,
                logit_scale,
            }
        } else {
            ClipOutput::Tuple(image_features, text_features, logit_scale)
        }
    }

    pub fn image_features(&self) -> Option<&Tensor> {
        match self {
            ClipOutput::Tuple(image, _, _) => image.as_ref(),
            ClipOutput::Dict { image_features, .. } => image_features.as_ref(),
        }
    }

    pub fn text_features(&self) -> Option<&Tensor> {
        match self {
            ClipOutput::Tuple(_, text, _) => text.as_ref(),
            ClipOutput::Dict { text_features, .. } => text_features.as_ref(),
        }
    }

    pub fn logit_scale(&self) -> &Tensor {
        match self {
            ClipOutput::Tuple(_, _, scale) => scale,
            ClipOutput::Dict { logit_scale, .. } => logit_scale,
        }
    }
}

/// Slot layout of the flat structured vector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SlotLayout {
    spec: SlotSpec,
    num_slots: usize,
    /// Stored channels per slot, logit included
    stored: usize,
}

/// Shared codebook and its per-modality query models
pub struct Codebook {
    /// `[num_codes, width]`
    pub space_dict: Tensor,
    pub img_query_model: FdtQueryModel,
    pub txt_query_model: FdtQueryModel,
}

/// Initial log-temperature, ln(1/0.07)
pub(crate) fn init_logit_scale() -> Tensor {
    RawTensor::parameter(RawTensor::scalar((1.0f32 / 0.07).ln()))
}

pub(crate) fn finish(x: Tensor, bottleproj: Option<&Linear>, normalize: bool) -> Tensor {
    let x = match bottleproj {
        Some(proj) => proj.forward(&x),
        None => x,
    };
    if normalize {
        let last = x.rank() - 1;
        x.l2_normalize(last)
    } else {
        x
    }
}

pub struct Clip {
    pub embed_dim: usize,
    pub visual: VisionTower,
    pub text: TextTower,
    pub logit_scale: Tensor,
    pub vision_bottleproj: Option<Linear>,
    pub text_bottleproj: Option<Linear>,
    pub codebook: Option<Codebook>,
    pub output_dict: bool,
    slots: Option<SlotLayout>,
}

impl Clip {
    pub fn new(
        embed_dim: usize,
        vision_cfg: &VisionConfig,
        text_cfg: &TextConfig,
        opts: &ClipOptions,
    ) -> Result<Self> {
        Self::with_registry(embed_dim, vision_cfg, text_cfg, opts, &BackboneRegistry::default())
    }

    pub fn with_registry(
        embed_dim: usize,
        vision_cfg: &VisionConfig,
        text_cfg: &TextConfig,
        opts: &ClipOptions,
        registry: &BackboneRegistry,
    ) -> Result<Self> {
        if opts.sparo.is_some() && opts.codebook.is_some() {
            return Err(ClipError::Config(
                "structured (SPARO) and codebook modes cannot be used together".into(),
            ));
        }
        if let Some(name) = &text_cfg.hf_model_name {
            return Err(ClipError::Config(format!(
                "named text backbone '{name}' needs the separate text layout (custom_text)"
            )));
        }
        let tower_dim = opts.bottleneck_dim.unwrap_or(embed_dim);

        let (mode, slots) = match &opts.sparo {
            Some(sparo) => {
                let spec: SlotSpec = sparo.sparo_type.parse()?;
                let stored = spec.stored_width(sparo.slot_dim);
                let head = SparoHeadConfig {
                    num_slots: sparo.num_slots,
                    slot_dim: stored,
                    attn_dim: sparo.attn_dim,
                    value_dim: sparo.value_dim,
                    heads: sparo.heads,
                    share_kv: sparo.share_kv,
                };
                let layout = SlotLayout {
                    spec,
                    num_slots: sparo.num_slots,
                    stored,
                };
                (TowerMode::Sparo(head), Some(layout))
            }
            None if opts.codebook.is_some() => (TowerMode::Codebook, None),
            None => (TowerMode::Standard, None),
        };
        let tower_opts = opts.tower_options(mode);

        let visual = build_vision_tower(tower_dim, vision_cfg, &tower_opts, registry)?;
        let mut text = build_text_tower(tower_dim, text_cfg, &tower_opts, registry)?;

        if opts.sparo.as_ref().is_some_and(|s| s.share_queries) {
            if let (VisionTower::Sparo(v), TextTower::Sparo(t)) = (&visual, &mut text) {
                t.sparo.q_emb = v.sparo.q_emb.clone();
            }
        }

        let codebook = match opts.codebook {
            Some(cb) => {
                let (Some(vision_width), Some(text_width)) = (visual.width(), text.width()) else {
                    return Err(ClipError::Config(
                        "codebook query models need tower widths, but a tower exposes none".into(),
                    ));
                };
                let norm = tower_opts.norm_precision();
                Some(Codebook {
                    space_dict: RawTensor::parameter(RawTensor::randn(&[cb.num_codes, tower_dim])),
                    img_query_model: FdtQueryModel::new(vision_width, tower_dim, norm),
                    txt_query_model: FdtQueryModel::new(text_width, tower_dim, norm),
                })
            }
            None => None,
        };

        let (vision_bottleproj, text_bottleproj) = match opts.bottleneck_dim {
            Some(dim) => (
                Some(Linear::new(dim, embed_dim, true)),
                Some(Linear::new(dim, embed_dim, true)),
            ),
            None => (None, None),
        };

        Ok(Clip {
            embed_dim,
            visual,
            text,
            logit_scale: init_logit_scale(),
            vision_bottleproj,
            text_bottleproj,
            codebook,
            output_dict: opts.output_dict,
            slots,
        })
    }

    /// The `"representation:weighting"` slot tag in structured mode
    pub fn slot_spec(&self) -> Option<SlotSpec> {
        self.slots.map(|s| s.spec)
    }

    fn text_transformer(&self) -> Option<&TextTransformer> {
        match &self.text {
            TextTower::Transformer(m) => Some(m),
            TextTower::Sparo(m) => Some(&m.trunk),
            TextTower::Named(_) => None,
        }
    }

    pub fn context_length(&self) -> usize {
        self.text_transformer().map_or(0, |t| t.context_length)
    }

    pub fn vocab_size(&self) -> usize {
        self.text_transformer().map_or(0, |t| t.vocab_size)
    }

    /// The text tower's causal mask; never part of the state dict
    pub fn attn_mask(&self) -> Option<&Tensor> {
        self.text_transformer().map(|t| &t.attn_mask)
    }

    fn structure(&self, out: TowerOutput, layout: SlotLayout, opts: EncodeOptions) -> Result<Encoding> {
        if !opts.normalize {
            return Err(ClipError::Precondition(
                "structured features are only defined for normalize = true".into(),
            ));
        }
        let b = out.features.shape()[0];
        let raw = out
            .features
            .reshape(&[b, layout.num_slots, layout.stored]);
        let slots = project_slots(&raw, &layout.spec);
        let features = if opts.structured {
            slots
        } else {
            let v = slots.shape()[2];
            slots.reshape(&[b, layout.num_slots * v])
        };
        Ok(Encoding {
            features,
            attn: if opts.return_attn { out.attn } else { None },
        })
    }

    pub fn encode_image(&self, image: &Tensor, opts: EncodeOptions) -> Result<Encoding> {
        let out = self.visual.forward(image);
        if let Some(layout) = self.slots {
            return self.structure(out, layout, opts);
        }
        let mut x = out.features;
        if let Some(cb) = &self.codebook {
            x = cb.img_query_model.forward(&x, &cb.space_dict, None);
        }
        Ok(Encoding {
            features: finish(x, self.vision_bottleproj.as_ref(), opts.normalize),
            attn: None,
        })
    }

    pub fn encode_text(&self, text: &Tensor, opts: EncodeOptions) -> Result<Encoding> {
        let tower = match &self.text {
            TextTower::Sparo(m) => {
                let layout = self.slots.ok_or_else(|| {
                    ClipError::Config("slot text tower without a slot layout".into())
                })?;
                let (features, attn) = m.forward(text);
                return self.structure(
                    TowerOutput {
                        features,
                        attn: Some(attn),
                    },
                    layout,
                    opts,
                );
            }
            TextTower::Transformer(m) => m,
            TextTower::Named(n) => {
                return Err(ClipError::Config(format!(
                    "named text backbone '{}' is not part of the flattened layout",
                    n.name
                )));
            }
        };

        let x = match &self.codebook {
            Some(cb) => {
                let eos = RawTensor::argmax_last(text);
                let tokens = tower.encode_tokens(text);
                cb.txt_query_model.forward(&tokens, &cb.space_dict, Some(&eos))
            }
            None => {
                if tower.global_average_pool && tower.attn_pool.is_none() {
                    return Err(ClipError::Unsupported(
                        "mean pooling of text features without an attentional pooler".into(),
                    ));
                }
                tower.forward(text)
            }
        };
        Ok(Encoding {
            features: finish(x, self.text_bottleproj.as_ref(), opts.normalize),
            attn: None,
        })
    }

    /// Normalized features for whichever inputs are given
    pub fn forward(&self, image: Option<&Tensor>, text: Option<&Tensor>) -> Result<ClipOutput> {
        let opts = EncodeOptions::normalized();
        let image_features = image
            .map(|x| self.encode_image(x, opts).map(|e| e.features))
            .transpose()?;
        let text_features = text
            .map(|x| self.encode_text(x, opts).map(|e| e.features))
            .transpose()?;
        Ok(ClipOutput::new(
            self.output_dict,
            image_features,
            text_features,
            self.logit_scale.exp(),
        ))
    }

    pub fn lock_image_tower(&mut self, unlocked_groups: usize, freeze_bn_stats: bool) -> Result<()> {
        self.visual.lock(unlocked_groups, freeze_bn_stats)
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.visual.set_grad_checkpointing(enable);
        self.text.set_grad_checkpointing(enable);
    }
}

impl Module for Clip {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        let codebook = self.codebook.is_some();
        self.text.own_tensors(&mut |name, t, kind| {
            if let Some(name) = text_namespace(name, codebook) {
                f(name, t, kind);
            }
        });
        f("logit_scale", &self.logit_scale, TensorKind::Parameter);
        if let Some(cb) = &self.codebook {
            f("space_dict", &cb.space_dict, TensorKind::Parameter);
        }
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("visual", &self.visual);
        let codebook = self.codebook.is_some();
        self.text.for_each_child(&mut |name, child| {
            if let Some(name) = text_namespace(name, codebook) {
                f(name, child);
            }
        });
        if let Some(proj) = &self.vision_bottleproj {
            f("vision_bottleproj", proj);
        }
        if let Some(proj) = &self.text_bottleproj {
            f("text_bottleproj", proj);
        }
        if let Some(cb) = &self.codebook {
            f("img_query_model", &cb.img_query_model);
            f("txt_query_model", &cb.txt_query_model);
        }
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("visual", &mut self.visual);
        let codebook = self.codebook.is_some();
        self.text.for_each_child_mut(&mut |name, child| {
            if let Some(name) = text_namespace(name, codebook) {
                f(name, child);
            }
        });
        if let Some(proj) = &mut self.vision_bottleproj {
            f("vision_bottleproj", proj);
        }
        if let Some(proj) = &mut self.text_bottleproj {
            f("text_bottleproj", proj);
        }
        if let Some(cb) = &mut self.codebook {
            f("img_query_model", &mut cb.img_query_model);
            f("txt_query_model", &mut cb.txt_query_model);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::config::{ImageSize, VisionLayers};
    use crate::tensor::manual_seed;

    fn vision() -> VisionConfig {
        VisionConfig {
            layers: VisionLayers::Uniform(1),
            width: 16,
            head_width: 8,
            patch_size: 4,
            image_size: ImageSize::Square(8),
            ..VisionConfig::default()
        }
    }

    fn text() -> TextConfig {
        TextConfig {
            context_length: 5,
            vocab_size: 12,
            width: 8,
            heads: 2,
            layers: 1,
            ..TextConfig::default()
        }
    }

    fn ids() -> Tensor {
        RawTensor::new(
            vec![1.0, 4.0, 11.0, 0.0, 0.0, 1.0, 2.0, 3.0, 11.0, 0.0],
            &[2, 5],
            false,
        )
    }

    fn sparo(tag: &str) -> ClipOptions {
        ClipOptions {
            sparo: Some(SparoConfig {
                num_slots: 2,
                slot_dim: 3,
                attn_dim: 4,
                value_dim: 4,
                heads: 2,
                sparo_type: tag.to_string(),
                ..SparoConfig::default()
            }),
            ..ClipOptions::default()
        }
    }

    #[test]
    fn test_flat_text_namespace() {
        let model = Clip::new(6, &vision(), &text(), &ClipOptions::default()).unwrap();
        let sd = model.state_dict();
        assert!(sd.contains_key("visual.conv1.weight"));
        assert!(sd.contains_key("token_embedding.weight"));
        assert!(sd.contains_key("transformer.resblocks.0.attn.in_proj_weight"));
        assert!(sd.contains_key("ln_final.weight"));
        assert_eq!(sd["text_projection"].shape, vec![8, 6]);
        assert_eq!(sd["logit_scale"].shape, Vec::<usize>::new());
        assert!(!sd.keys().any(|k| k.starts_with("text.") || k.contains("attn_mask")));
        assert!((model.logit_scale.to_vec()[0] - (1.0f32 / 0.07).ln()).abs() < 1e-6);
        assert_eq!(model.context_length(), 5);
        assert_eq!(model.attn_mask().unwrap().shape(), vec![5, 5]);
    }

    #[test]
    fn test_forward_tuple_and_dict() {
        manual_seed(3);
        let model = Clip::new(6, &vision(), &text(), &ClipOptions::default()).unwrap();
        let image = RawTensor::randn(&[2, 3, 8, 8]);
        let out = model.forward(Some(&image), Some(&ids())).unwrap();
        assert!(matches!(out, ClipOutput::Tuple(..)));
        let img = out.image_features().unwrap();
        assert_eq!(img.shape(), vec![2, 6]);
        for row in img.to_vec().chunks(6) {
            let n: f32 = row.iter().map(|v| v * v).sum();
            assert!((n - 1.0).abs() < 1e-4);
        }
        assert!((out.logit_scale().to_vec()[0] - 1.0 / 0.07).abs() < 1e-3);

        let opts = ClipOptions {
            output_dict: true,
            ..ClipOptions::default()
        };
        let model = Clip::new(6, &vision(), &text(), &opts).unwrap();
        let out = model.forward(None, Some(&ids())).unwrap();
        assert!(matches!(out, ClipOutput::Dict { .. }));
        assert!(out.image_features().is_none());
        assert_eq!(out.text_features().unwrap().shape(), vec![2, 6]);
    }

    #[test]
    fn test_bottleneck_expands_to_embed_dim() {
        let opts = ClipOptions {
            bottleneck_dim: Some(3),
            ..ClipOptions::default()
        };
        let model = Clip::new(6, &vision(), &text(), &opts).unwrap();
        assert_eq!(model.state_dict()["text_projection"].shape, vec![8, 3]);
        let enc = model.encode_text(&ids(), EncodeOptions::default()).unwrap();
        assert_eq!(enc.features.shape(), vec![2, 6]);
    }

    #[test]
    fn test_both_modes_rejected() {
        let opts = ClipOptions {
            codebook: Some(CodebookConfig { num_codes: 4 }),
            ..sparo("cont:const")
        };
        let err = Clip::new(6, &vision(), &text(), &opts);
        assert!(matches!(err, Err(ClipError::Config(_))));
    }

    #[test]
    fn test_structured_encoding() {
        manual_seed(5);
        let model = Clip::new(6, &vision(), &text(), &sparo("cont:softmax")).unwrap();
        let sd = model.state_dict();
        assert_eq!(sd["visual.sparo.out_bias"].shape, vec![2, 4]);
        assert!(sd.contains_key("text_sparo.q_emb"));
        assert!(!sd.contains_key("text_projection"));

        let image = RawTensor::randn(&[2, 3, 8, 8]);
        let err = model.encode_image(&image, EncodeOptions::default());
        assert!(matches!(err, Err(ClipError::Precondition(_))));

        let opts = EncodeOptions {
            normalize: true,
            structured: true,
            return_attn: true,
        };
        let enc = model.encode_image(&image, opts).unwrap();
        assert_eq!(enc.features.shape(), vec![2, 2, 3]);
        assert_eq!(enc.attn.unwrap().shape(), vec![2, 2, 2, 5]);

        let flat = model.encode_text(&ids(), EncodeOptions::normalized()).unwrap();
        assert_eq!(flat.features.shape(), vec![2, 6]);
        assert!(flat.attn.is_none());
        for row in flat.features.to_vec().chunks(6) {
            let n: f32 = row.iter().map(|v| v * v).sum();
            assert!((n - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_bad_slot_tag() {
        let err = Clip::new(6, &vision(), &text(), &sparo("cont:maxpool"));
        assert!(matches!(err, Err(ClipError::UnknownSlotTag(_))));
    }

    #[test]
    fn test_codebook_mode() {
        manual_seed(9);
        let opts = ClipOptions {
            codebook: Some(CodebookConfig { num_codes: 7 }),
            ..ClipOptions::default()
        };
        let model = Clip::new(6, &vision(), &text(), &opts).unwrap();
        let sd = model.state_dict();
        assert_eq!(sd["space_dict"].shape, vec![7, 6]);
        assert_eq!(sd["img_query_model.proj.weight"].shape, vec![6, 16]);
        assert_eq!(sd["txt_query_model.proj.weight"].shape, vec![6, 8]);
        assert!(!sd.contains_key("ln_final.weight"));
        assert!(!sd.contains_key("visual.proj"));

        let image = RawTensor::randn(&[2, 3, 8, 8]);
        let out = model.forward(Some(&image), Some(&ids())).unwrap();
        assert_eq!(out.image_features().unwrap().shape(), vec![2, 6]);
        assert_eq!(out.text_features().unwrap().shape(), vec![2, 6]);
    }

    #[test]
    fn test_codebook_rows_use_bottleneck_width() {
        manual_seed(10);
        let opts = ClipOptions {
            bottleneck_dim: Some(4),
            codebook: Some(CodebookConfig { num_codes: 7 }),
            ..ClipOptions::default()
        };
        let model = Clip::new(6, &vision(), &text(), &opts).unwrap();
        let sd = model.state_dict();
        assert_eq!(sd["space_dict"].shape, vec![7, 4]);
        assert_eq!(sd["img_query_model.proj.weight"].shape, vec![4, 16]);
        assert_eq!(sd["txt_query_model.proj.weight"].shape, vec![4, 8]);

        let image = RawTensor::randn(&[2, 3, 8, 8]);
        let out = model.forward(Some(&image), Some(&ids())).unwrap();
        assert_eq!(out.image_features().unwrap().shape(), vec![2, 6]);
        assert_eq!(out.text_features().unwrap().shape(), vec![2, 6]);
    }

    #[test]
    fn test_mean_pool_without_pooler_is_unsupported() {
        let cfg = TextConfig {
            global_average_pool: true,
            ..text()
        };
        let model = Clip::new(6, &vision(), &cfg, &ClipOptions::default()).unwrap();
        let err = model.encode_text(&ids(), EncodeOptions::normalized());
        assert!(matches!(err, Err(ClipError::Unsupported(_))));
    }

    #[test]
    fn test_grad_checkpointing_reaches_both_stacks() {
        let mut model = Clip::new(6, &vision(), &text(), &ClipOptions::default()).unwrap();
        model.set_grad_checkpointing(true);
        let (VisionTower::Transformer(v), TextTower::Transformer(t)) = (&model.visual, &model.text)
        else {
            panic!("expected transformer towers");
        };
        assert!(v.transformer.grad_checkpointing());
        assert!(t.transformer.grad_checkpointing());
    }

    #[test]
    fn test_named_text_backbone_rejected() {
        let cfg = TextConfig {
            hf_model_name: Some("encoder-small".into()),
            ..text()
        };
        let err = Clip::new(6, &vision(), &cfg, &ClipOptions::default());
        assert!(matches!(err, Err(ClipError::Config(_))));
    }
}
