//! Named trunks behind a registry, wrapped by pooling and projection heads.
//!
//! A trunk produces token features; the adapters here turn them into one
//! embedding of the requested width. Built-in trunks are randomly
//! initialized; no pretrained weights are bundled.

use crate::clip::config::{
    HeadProjection, ImageSize, TextConfig, TextPooler, TrunkPool, VisionConfig,
};
use crate::clip::resnet::AttentionPool2d;
use crate::clip::transformer::{BlockOptions, Transformer, freeze_module};
use crate::clip::vision::{VisionHead, VisionTransformer};
use crate::error::{ClipError, Result, exact_div};
use crate::nn::layers::attention::padding_to_additive;
use crate::nn::{Activation, Dropout, Embedding, LayerNorm, Linear, Module, NormPrecision, TensorKind};
use crate::tensor::{RawTensor, Tensor, TensorOps};
use std::collections::BTreeMap;

/// Options every vision trunk factory receives
#[derive(Clone, Debug, PartialEq)]
pub struct VisionTrunkOptions {
    pub image_size: (usize, usize),
    /// Stochastic depth rate
    pub drop_path: f32,
    pub patch_dropout: f32,
    pub norm: NormPrecision,
}

/// Options every text trunk factory receives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextTrunkOptions {
    pub norm: NormPrecision,
}

pub trait VisionTrunk: Module {
    /// Token features `[B, prefix + N, C]` after the trunk's final norm
    fn forward_tokens(&self, x: &Tensor) -> Tensor;
    fn num_features(&self) -> usize;
    /// Class/register tokens in front of the patch tokens
    fn num_prefix_tokens(&self) -> usize;
    fn grid_size(&self) -> (usize, usize);
    fn lock(&mut self, unlocked_groups: usize, freeze_bn_stats: bool) -> Result<()>;
    fn set_grad_checkpointing(&mut self, enable: bool);
    fn as_module(&self) -> &dyn Module;
    fn as_module_mut(&mut self) -> &mut dyn Module;
}

pub trait TextTrunk: Module {
    /// Hidden states `[B, L, C]`; `padding_mask [B, L]` is non-zero at padding
    fn forward_hidden(&self, ids: &Tensor, padding_mask: &Tensor) -> Tensor;
    fn hidden_size(&self) -> usize;
    fn lock(&mut self, unlocked_layers: usize, freeze_layer_norm: bool);
    fn set_grad_checkpointing(&mut self, enable: bool);
    fn as_module(&self) -> &dyn Module;
    fn as_module_mut(&mut self) -> &mut dyn Module;
}

pub type VisionTrunkFactory = fn(&VisionTrunkOptions) -> Result<Box<dyn VisionTrunk>>;
pub type TextTrunkFactory = fn(&TextTrunkOptions) -> Result<Box<dyn TextTrunk>>;

/// Trunk factories by name
#[derive(Clone)]
pub struct BackboneRegistry {
    vision: BTreeMap<String, VisionTrunkFactory>,
    text: BTreeMap<String, TextTrunkFactory>,
}

impl BackboneRegistry {
    /// A registry with no trunks at all
    pub fn empty() -> Self {
        BackboneRegistry {
            vision: BTreeMap::new(),
            text: BTreeMap::new(),
        }
    }

    pub fn register_vision(&mut self, name: impl Into<String>, factory: VisionTrunkFactory) {
        self.vision.insert(name.into(), factory);
    }

    pub fn register_text(&mut self, name: impl Into<String>, factory: TextTrunkFactory) {
        self.text.insert(name.into(), factory);
    }

    pub fn build_vision(&self, name: &str, opts: &VisionTrunkOptions) -> Result<Box<dyn VisionTrunk>> {
        let factory = self
            .vision
            .get(name)
            .ok_or_else(|| ClipError::UnknownBackbone(name.to_string()))?;
        factory(opts)
    }

    pub fn build_text(&self, name: &str, opts: &TextTrunkOptions) -> Result<Box<dyn TextTrunk>> {
        let factory = self
            .text
            .get(name)
            .ok_or_else(|| ClipError::UnknownBackbone(name.to_string()))?;
        factory(opts)
    }
}

impl Default for BackboneRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_vision("vit_tiny_patch16_224", vit_tiny);
        registry.register_vision("vit_small_patch16_224", vit_small);
        registry.register_vision("vit_base_patch16_224", vit_base);
        registry.register_text("encoder-small", encoder_small);
        registry.register_text("encoder-base", encoder_base);
        registry
    }
}

// ===== BUILT-IN TRUNKS =====

/// Plain ViT trunk returning every token
pub struct VitTrunk {
    inner: VisionTransformer,
}

impl VitTrunk {
    pub fn new(
        width: usize,
        depth: usize,
        heads: usize,
        patch_size: usize,
        opts: &VisionTrunkOptions,
    ) -> Result<Self> {
        let (h, w) = opts.image_size;
        let cfg = VisionConfig {
            width,
            patch_size,
            image_size: ImageSize::Rect([h, w]),
            patch_dropout: opts.patch_dropout,
            ..VisionConfig::default()
        };
        let block = BlockOptions {
            norm: opts.norm,
            drop_path: opts.drop_path,
            ..BlockOptions::default()
        };
        let inner = VisionTransformer::new(&cfg, depth, heads, width, &block, VisionHead::Tokens)?;
        Ok(VitTrunk { inner })
    }
}

fn vit_tiny(opts: &VisionTrunkOptions) -> Result<Box<dyn VisionTrunk>> {
    Ok(Box::new(VitTrunk::new(192, 12, 3, 16, opts)?))
}

fn vit_small(opts: &VisionTrunkOptions) -> Result<Box<dyn VisionTrunk>> {
    Ok(Box::new(VitTrunk::new(384, 12, 6, 16, opts)?))
}

fn vit_base(opts: &VisionTrunkOptions) -> Result<Box<dyn VisionTrunk>> {
    Ok(Box::new(VitTrunk::new(768, 12, 12, 16, opts)?))
}

impl Module for VitTrunk {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        self.inner.own_tensors(f);
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        self.inner.for_each_child(f);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        self.inner.for_each_child_mut(f);
    }
}

impl VisionTrunk for VitTrunk {
    fn forward_tokens(&self, x: &Tensor) -> Tensor {
        self.inner.forward_tokens(x)
    }

    fn num_features(&self) -> usize {
        self.inner.width
    }

    fn num_prefix_tokens(&self) -> usize {
        1
    }

    fn grid_size(&self) -> (usize, usize) {
        self.inner.grid_size
    }

    fn lock(&mut self, unlocked_groups: usize, _freeze_bn_stats: bool) -> Result<()> {
        self.inner.lock(unlocked_groups);
        Ok(())
    }

    fn set_grad_checkpointing(&mut self, enable: bool) {
        self.inner.set_grad_checkpointing(enable);
    }

    fn as_module(&self) -> &dyn Module {
        self
    }

    fn as_module_mut(&mut self) -> &mut dyn Module {
        self
    }
}

/// Bidirectional encoder: word + position embeddings, norm, transformer
pub struct EncoderTrunk {
    pub word_embeddings: Embedding,
    pub position_embeddings: Tensor,
    pub embeddings_norm: LayerNorm,
    pub encoder: Transformer,
}

impl EncoderTrunk {
    pub fn new(
        vocab_size: usize,
        max_positions: usize,
        hidden: usize,
        layers: usize,
        heads: usize,
        opts: &TextTrunkOptions,
    ) -> Self {
        let block = BlockOptions {
            norm: opts.norm,
            ..BlockOptions::default()
        };
        EncoderTrunk {
            word_embeddings: Embedding::new(vocab_size, hidden),
            position_embeddings: RawTensor::parameter(RawTensor::randn_scaled(
                &[max_positions, hidden],
                0.02,
            )),
            embeddings_norm: LayerNorm::new(hidden, opts.norm),
            encoder: Transformer::new(hidden, layers, heads, &block),
        }
    }
}

fn encoder_small(opts: &TextTrunkOptions) -> Result<Box<dyn TextTrunk>> {
    Ok(Box::new(EncoderTrunk::new(30522, 512, 256, 4, 4, opts)))
}

fn encoder_base(opts: &TextTrunkOptions) -> Result<Box<dyn TextTrunk>> {
    Ok(Box::new(EncoderTrunk::new(30522, 512, 768, 12, 12, opts)))
}

impl Module for EncoderTrunk {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f(
            "embeddings.position_embeddings",
            &self.position_embeddings,
            TensorKind::Parameter,
        );
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("embeddings.word_embeddings", &self.word_embeddings);
        f("embeddings.LayerNorm", &self.embeddings_norm);
        f("encoder", &self.encoder);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("embeddings.word_embeddings", &mut self.word_embeddings);
        f("embeddings.LayerNorm", &mut self.embeddings_norm);
        f("encoder", &mut self.encoder);
    }
}

impl TextTrunk for EncoderTrunk {
    fn forward_hidden(&self, ids: &Tensor, padding_mask: &Tensor) -> Tensor {
        let (batch, seq) = (ids.shape()[0], ids.shape()[1]);
        let x = self
            .word_embeddings
            .forward(ids)
            .add(&self.position_embeddings.narrow(0, 0, seq));
        let x = self.embeddings_norm.forward(&x);
        // [B, 1, L] broadcasts over every query row
        let mask = padding_to_additive(padding_mask).reshape(&[batch, 1, seq]);
        self.encoder.forward(&x, Some(&mask))
    }

    fn hidden_size(&self) -> usize {
        self.encoder.width
    }

    /// Groups are the embeddings then each encoder layer; the last
    /// `unlocked_layers` groups stay trainable.
    fn lock(&mut self, unlocked_layers: usize, freeze_layer_norm: bool) {
        let groups = 1 + self.encoder.layers();
        let frozen = if unlocked_layers == 0 {
            groups
        } else {
            groups.saturating_sub(unlocked_layers)
        };
        if frozen > 0 {
            freeze_module(&self.word_embeddings, freeze_layer_norm);
            freeze_module(&self.embeddings_norm, freeze_layer_norm);
            self.position_embeddings.borrow_mut().requires_grad = false;
        }
        for block in self.encoder.resblocks.iter().take(frozen.saturating_sub(1)) {
            freeze_module(block, freeze_layer_norm);
        }
    }

    fn set_grad_checkpointing(&mut self, enable: bool) {
        self.encoder.set_grad_checkpointing(enable);
    }

    fn as_module(&self) -> &dyn Module {
        self
    }

    fn as_module_mut(&mut self) -> &mut dyn Module {
        self
    }
}

// ===== ADAPTERS =====

/// Projection after a pooled vision trunk
pub enum TrunkHead {
    Linear { drop: Dropout, proj: Linear },
    Mlp { fc1: Linear, drop: Dropout, fc2: Linear },
    Identity,
}

impl TrunkHead {
    fn forward(&self, x: &Tensor) -> Tensor {
        match self {
            TrunkHead::Linear { drop, proj } => proj.forward(&drop.forward(x)),
            TrunkHead::Mlp { fc1, drop, fc2 } => {
                fc2.forward(&drop.forward(&Activation::Gelu.forward(&fc1.forward(x))))
            }
            TrunkHead::Identity => x.clone(),
        }
    }
}

/// A registered vision trunk with pooling and projection to `embed_dim`
pub struct NamedVisionTower {
    pub name: String,
    pub trunk: Box<dyn VisionTrunk>,
    pub pool: TrunkPool,
    pub attn_pool: Option<AttentionPool2d>,
    pub head: TrunkHead,
    pub image_size: (usize, usize),
}

impl NamedVisionTower {
    pub fn new(
        cfg: &VisionConfig,
        embed_dim: usize,
        registry: &BackboneRegistry,
        norm: NormPrecision,
    ) -> Result<Self> {
        let name = cfg
            .timm_model_name
            .clone()
            .ok_or_else(|| ClipError::Config("named vision tower without a name".into()))?;
        if cfg.timm_model_pretrained {
            return Err(ClipError::Unsupported(format!(
                "pretrained weights for '{name}' are not bundled"
            )));
        }
        let opts = VisionTrunkOptions {
            image_size: cfg.image_size.hw(),
            drop_path: cfg.timm_drop_path.unwrap_or(0.0),
            patch_dropout: cfg.patch_dropout,
            norm,
        };
        let trunk = registry.build_vision(&name, &opts)?;
        let features = trunk.num_features();

        let (attn_pool, prev) = match cfg.timm_pool {
            TrunkPool::RotAttn => {
                return Err(ClipError::Unsupported(
                    "rotary attention pooling of named trunks".into(),
                ));
            }
            TrunkPool::AbsAttn => {
                let (g0, g1) = trunk.grid_size();
                if g0 != g1 {
                    return Err(ClipError::Config(format!(
                        "attention pooling needs a square feature grid, got {g0}x{g1}"
                    )));
                }
                let heads = 4;
                exact_div("trunk features / pool heads", features, heads)?;
                (Some(AttentionPool2d::new(g0, features, heads, embed_dim)), embed_dim)
            }
            _ => {
                if cfg.timm_proj == HeadProjection::None {
                    return Err(ClipError::Config(
                        "a projection is required unless attention pooling is used".into(),
                    ));
                }
                (None, features)
            }
        };

        let head = match cfg.timm_proj {
            HeadProjection::Linear => TrunkHead::Linear {
                drop: Dropout::new(cfg.timm_drop),
                proj: Linear::new(prev, embed_dim, cfg.timm_proj_bias),
            },
            HeadProjection::Mlp => TrunkHead::Mlp {
                fc1: Linear::new(prev, 2 * embed_dim, true),
                drop: Dropout::new(cfg.timm_drop),
                fc2: Linear::new(2 * embed_dim, embed_dim, cfg.timm_proj_bias),
            },
            HeadProjection::None => TrunkHead::Identity,
        };

        Ok(NamedVisionTower {
            name,
            trunk,
            pool: cfg.timm_pool,
            attn_pool,
            head,
            image_size: cfg.image_size.hw(),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let tokens = self.trunk.forward_tokens(x);
        let prefix = self.trunk.num_prefix_tokens();
        let s = tokens.shape();
        let patches = tokens.narrow(1, prefix, s[1] - prefix);
        let pooled = match (&self.attn_pool, self.pool) {
            (Some(pool), _) => {
                let (g0, g1) = self.trunk.grid_size();
                let map = patches.permute(&[0, 2, 1]).reshape(&[s[0], s[2], g0, g1]);
                pool.forward(&map)
            }
            (None, TrunkPool::Max) => patches.max_dim(1, false),
            (None, TrunkPool::Token) => tokens.select(1, 0),
            (None, _) => patches.mean_dim(1, false),
        };
        self.head.forward(&pooled)
    }

    /// Only the trunk is locked; pooling and projection stay trainable.
    pub fn lock(&mut self, unlocked_groups: usize, freeze_bn_stats: bool) -> Result<()> {
        self.trunk.lock(unlocked_groups, freeze_bn_stats)
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.trunk.set_grad_checkpointing(enable);
    }
}

impl Module for NamedVisionTower {
    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("trunk", self.trunk.as_module());
        if let Some(pool) = &self.attn_pool {
            f("head.pool", pool);
        }
        match &self.head {
            TrunkHead::Linear { drop, proj } => {
                f("head.drop", drop);
                f("head.proj", proj);
            }
            TrunkHead::Mlp { fc1, drop, fc2 } => {
                f("head.mlp.fc1", fc1);
                f("head.mlp.drop", drop);
                f("head.mlp.fc2", fc2);
            }
            TrunkHead::Identity => {}
        }
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("trunk", self.trunk.as_module_mut());
        if let Some(pool) = &mut self.attn_pool {
            f("head.pool", pool);
        }
        match &mut self.head {
            TrunkHead::Linear { drop, proj } => {
                f("head.drop", drop);
                f("head.proj", proj);
            }
            TrunkHead::Mlp { fc1, drop, fc2 } => {
                f("head.mlp.fc1", fc1);
                f("head.mlp.drop", drop);
                f("head.mlp.fc2", fc2);
            }
            TrunkHead::Identity => {}
        }
    }
}

/// Projection after a pooled text trunk
pub enum TextHead {
    Linear(Linear),
    /// Registered as `proj.0` / `proj.2`
    Mlp(Linear, Linear),
    Identity,
}

/// A registered text trunk with masked pooling and projection
pub struct NamedTextTower {
    pub name: String,
    pub trunk: Box<dyn TextTrunk>,
    pub pooler: TextPooler,
    pub proj: TextHead,
    pub pad_id: usize,
    pub output_dim: usize,
}

impl NamedTextTower {
    pub fn new(
        cfg: &TextConfig,
        output_dim: usize,
        registry: &BackboneRegistry,
        norm: NormPrecision,
    ) -> Result<Self> {
        let name = cfg
            .hf_model_name
            .clone()
            .ok_or_else(|| ClipError::Config("named text tower without a name".into()))?;
        if cfg.hf_model_pretrained {
            return Err(ClipError::Unsupported(format!(
                "pretrained weights for '{name}' are not bundled"
            )));
        }
        let trunk = registry.build_text(&name, &TextTrunkOptions { norm })?;
        let d = trunk.hidden_size();
        let proj = match cfg.proj {
            HeadProjection::Linear => TextHead::Linear(Linear::new(d, output_dim, false)),
            HeadProjection::Mlp => {
                let hidden = (d + output_dim) / 2;
                TextHead::Mlp(
                    Linear::new(d, hidden, false),
                    Linear::new(hidden, output_dim, false),
                )
            }
            HeadProjection::None if d == output_dim => TextHead::Identity,
            HeadProjection::None => {
                return Err(ClipError::Config(format!(
                    "text trunk width {d} differs from output dim {output_dim} and no projection is set"
                )));
            }
        };
        Ok(NamedTextTower {
            name,
            trunk,
            pooler: cfg.pooler_type,
            proj,
            pad_id: cfg.pad_id,
            output_dim,
        })
    }

    pub fn forward(&self, ids: &Tensor) -> Tensor {
        let s = ids.shape();
        let pad = self.pad_id as f32;
        let padding = RawTensor::map_scalar(ids, |v| if v == pad { 1.0 } else { 0.0 });
        let hidden = self.trunk.forward_hidden(ids, &padding);
        let keep = RawTensor::map_scalar(&padding, |v| 1.0 - v).reshape(&[s[0], s[1], 1]);

        let pooled = match self.pooler {
            TextPooler::ClsPooler => hidden.select(1, 0),
            TextPooler::MeanPooler => {
                let count = RawTensor::map_scalar(&keep.sum_dim(1, false), |v| v.max(1.0));
                hidden.elem_mul(&keep).sum_dim(1, false).div(&count)
            }
            TextPooler::MaxPooler => {
                let bias = RawTensor::map_scalar(&keep, |v| if v > 0.0 { 0.0 } else { f32::NEG_INFINITY });
                hidden.add(&bias).max_dim(1, false)
            }
        };
        match &self.proj {
            TextHead::Linear(l) => l.forward(&pooled),
            TextHead::Mlp(a, b) => b.forward(&Activation::Gelu.forward(&a.forward(&pooled))),
            TextHead::Identity => pooled,
        }
    }

    /// Freeze the trunk; with `unlocked_layers > 0` its last layers stay
    /// trainable. The projection always stays trainable.
    pub fn lock(&mut self, unlocked_layers: usize, freeze_layer_norm: bool) {
        self.trunk.lock(unlocked_layers, freeze_layer_norm);
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.trunk.set_grad_checkpointing(enable);
    }
}

impl Module for NamedTextTower {
    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("transformer", self.trunk.as_module());
        match &self.proj {
            TextHead::Linear(l) => f("proj", l),
            TextHead::Mlp(a, b) => {
                f("proj.0", a);
                f("proj.2", b);
            }
            TextHead::Identity => {}
        }
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("transformer", self.trunk.as_module_mut());
        match &mut self.proj {
            TextHead::Linear(l) => f("proj", l),
            TextHead::Mlp(a, b) => {
                f("proj.0", a);
                f("proj.2", b);
            }
            TextHead::Identity => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_vit(opts: &VisionTrunkOptions) -> Result<Box<dyn VisionTrunk>> {
        Ok(Box::new(VitTrunk::new(8, 1, 2, 4, opts)?))
    }

    fn tiny_encoder(opts: &TextTrunkOptions) -> Result<Box<dyn TextTrunk>> {
        Ok(Box::new(EncoderTrunk::new(30, 16, 8, 2, 2, opts)))
    }

    fn registry() -> BackboneRegistry {
        let mut r = BackboneRegistry::empty();
        r.register_vision("tiny", tiny_vit);
        r.register_text("tiny-encoder", tiny_encoder);
        r
    }

    fn vision_cfg(pool: TrunkPool, proj: HeadProjection) -> VisionConfig {
        VisionConfig {
            timm_model_name: Some("tiny".into()),
            timm_pool: pool,
            timm_proj: proj,
            image_size: ImageSize::Square(8),
            ..VisionConfig::default()
        }
    }

    #[test]
    fn test_unregistered_name_is_rejected() {
        let r = BackboneRegistry::default();
        let err = r.build_vision("resnet50", &VisionTrunkOptions {
            image_size: (224, 224),
            drop_path: 0.0,
            patch_dropout: 0.0,
            norm: NormPrecision::Native,
        });
        assert!(matches!(err, Err(ClipError::UnknownBackbone(_))));
    }

    #[test]
    fn test_vision_pools() {
        let x = RawTensor::randn(&[2, 3, 8, 8]);
        for pool in [TrunkPool::Avg, TrunkPool::Max, TrunkPool::Token] {
            let tower = NamedVisionTower::new(
                &vision_cfg(pool, HeadProjection::Linear),
                6,
                &registry(),
                NormPrecision::Native,
            )
            .unwrap();
            assert_eq!(tower.forward(&x).shape(), vec![2, 6]);
        }
        let tower = NamedVisionTower::new(
            &vision_cfg(TrunkPool::AbsAttn, HeadProjection::None),
            6,
            &registry(),
            NormPrecision::Native,
        )
        .unwrap();
        assert!(tower.state_dict().contains_key("head.pool.c_proj.weight"));
        assert_eq!(tower.forward(&x).shape(), vec![2, 6]);
    }

    #[test]
    fn test_vision_rejections() {
        let rot = NamedVisionTower::new(
            &vision_cfg(TrunkPool::RotAttn, HeadProjection::None),
            6,
            &registry(),
            NormPrecision::Native,
        );
        assert!(matches!(rot, Err(ClipError::Unsupported(_))));

        let no_proj = NamedVisionTower::new(
            &vision_cfg(TrunkPool::Avg, HeadProjection::None),
            6,
            &registry(),
            NormPrecision::Native,
        );
        assert!(matches!(no_proj, Err(ClipError::Config(_))));

        let pretrained = VisionConfig {
            timm_model_pretrained: true,
            ..vision_cfg(TrunkPool::Avg, HeadProjection::Linear)
        };
        let err = NamedVisionTower::new(&pretrained, 6, &registry(), NormPrecision::Native);
        assert!(matches!(err, Err(ClipError::Unsupported(_))));
    }

    #[test]
    fn test_text_poolers_and_lock() {
        let ids = RawTensor::new(vec![3.0, 4.0, 5.0, 0.0, 7.0, 8.0, 0.0, 0.0], &[2, 4], false);
        for (pooler, proj) in [
            (TextPooler::MeanPooler, HeadProjection::Mlp),
            (TextPooler::MaxPooler, HeadProjection::Linear),
            (TextPooler::ClsPooler, HeadProjection::Linear),
        ] {
            let cfg = TextConfig {
                hf_model_name: Some("tiny-encoder".into()),
                pooler_type: pooler,
                proj,
                ..TextConfig::default()
            };
            let tower = NamedTextTower::new(&cfg, 5, &registry(), NormPrecision::Native).unwrap();
            assert_eq!(tower.forward(&ids).shape(), vec![2, 5]);
        }

        let cfg = TextConfig {
            hf_model_name: Some("tiny-encoder".into()),
            proj: HeadProjection::Mlp,
            ..TextConfig::default()
        };
        let mut tower = NamedTextTower::new(&cfg, 5, &registry(), NormPrecision::Native).unwrap();
        assert!(tower.state_dict().contains_key("proj.2.weight"));
        tower.lock(1, true);
        let params = tower.named_parameters();
        let trainable = |prefix: &str| {
            params
                .iter()
                .filter(|(n, _)| n.starts_with(prefix))
                .all(|(_, p)| p.borrow().requires_grad)
        };
        assert!(!trainable("transformer.encoder.resblocks.0."));
        assert!(trainable("transformer.encoder.resblocks.1."));
        assert!(trainable("proj."));
    }
}
