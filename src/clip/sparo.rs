//! Structured multi-slot representations.
//!
//! A SPARO head attends from `L` learned slot queries over a tower's tokens
//! and emits `V` values per slot. [`project_slots`] then turns the raw
//! `[.., L, V]` block into weighted, per-slot normalized slot vectors.

use crate::clip::config::{TextConfig, VisionConfig};
use crate::clip::text::TextTransformer;
use crate::clip::transformer::{BlockOptions, after_eos_mask, freeze_module};
use crate::clip::vision::{VisionHead, VisionTransformer};
use crate::error::{ClipError, Result, exact_div};
use crate::nn::layers::attention::{padding_to_additive, scaled_dot_product_attention};
use crate::nn::{Linear, Module, TensorKind};
use crate::tensor::{RawTensor, Tensor, TensorOps};
use std::fmt;
use std::str::FromStr;

const EPS: f32 = 1e-12;

/// How each slot's value vector is encoded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotRepresentation {
    /// L2-normalized continuous values
    Cont,
    /// Square root of a softmax: a probability amplitude
    SqrtSem,
    /// L2-normalized softmax
    Sem,
}

/// How the scalar weight of each slot is obtained
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotWeighting {
    /// √softmax over slots of a reserved leading logit channel
    SqrtSoftmax,
    /// softmax over slots of the logit channel, L2-renormalized
    Softmax,
    /// Slot norm relative to the norm of all slots together
    Norm,
    /// √(1/L) for every slot
    Const,
}

impl SlotWeighting {
    /// Whether each slot carries a leading importance logit
    pub fn uses_logit(self) -> bool {
        matches!(self, SlotWeighting::SqrtSoftmax | SlotWeighting::Softmax)
    }
}

/// A parsed `"representation:weighting"` tag such as `"cont:const"`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotSpec {
    pub representation: SlotRepresentation,
    pub weighting: SlotWeighting,
}

impl SlotSpec {
    /// Channels stored per slot for `values` output values
    pub fn stored_width(&self, values: usize) -> usize {
        values + usize::from(self.weighting.uses_logit())
    }
}

impl FromStr for SlotSpec {
    type Err = ClipError;

    fn from_str(tag: &str) -> Result<Self> {
        let (rep, weight) = tag
            .split_once(':')
            .ok_or_else(|| ClipError::UnknownSlotTag(tag.to_string()))?;
        let representation = match rep {
            "cont" => SlotRepresentation::Cont,
            "sqrtsem" => SlotRepresentation::SqrtSem,
            "sem" => SlotRepresentation::Sem,
            other => return Err(ClipError::UnknownSlotTag(other.to_string())),
        };
        let weighting = match weight {
            "sqrtsoftmax" => SlotWeighting::SqrtSoftmax,
            "softmax" => SlotWeighting::Softmax,
            "norm" => SlotWeighting::Norm,
            "const" => SlotWeighting::Const,
            other => return Err(ClipError::UnknownSlotTag(other.to_string())),
        };
        if weighting == SlotWeighting::Norm && representation == SlotRepresentation::Sem {
            return Err(ClipError::UnknownSlotTag(tag.to_string()));
        }
        Ok(SlotSpec {
            representation,
            weighting,
        })
    }
}

impl fmt::Display for SlotSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rep = match self.representation {
            SlotRepresentation::Cont => "cont",
            SlotRepresentation::SqrtSem => "sqrtsem",
            SlotRepresentation::Sem => "sem",
        };
        let weight = match self.weighting {
            SlotWeighting::SqrtSoftmax => "sqrtsoftmax",
            SlotWeighting::Softmax => "softmax",
            SlotWeighting::Norm => "norm",
            SlotWeighting::Const => "const",
        };
        write!(f, "{rep}:{weight}")
    }
}

/// Split `x [.., L, W]` into slot weights `[.., L, 1]` and values
fn split_slots(x: &Tensor, spec: &SlotSpec) -> (Tensor, Tensor) {
    let shape = x.shape();
    let rank = shape.len();
    assert!(rank >= 2, "slot block must be at least [L, V], got {shape:?}");
    let (slot_axis, value_axis) = (rank - 2, rank - 1);
    let (l, w) = (shape[slot_axis], shape[value_axis]);

    match spec.weighting {
        SlotWeighting::SqrtSoftmax | SlotWeighting::Softmax => {
            let logits = x.narrow(value_axis, 0, 1).softmax(slot_axis);
            let weights = if spec.weighting == SlotWeighting::SqrtSoftmax {
                logits.sqrt()
            } else {
                logits.l2_normalize(slot_axis)
            };
            (weights, x.narrow(value_axis, 1, w - 1))
        }
        SlotWeighting::Norm => {
            let base = match spec.representation {
                SlotRepresentation::SqrtSem => x.mul_scalar(0.5).exp(),
                _ => x.clone(),
            };
            let slot_norm = base.norm_dim(value_axis, true);
            let total = slot_norm.elem_mul(&slot_norm).sum_dim(slot_axis, true).sqrt();
            let total = RawTensor::map_scalar(&total, |v| v.max(EPS));
            (slot_norm.div(&total), x.clone())
        }
        SlotWeighting::Const => {
            let mut wshape = shape.clone();
            wshape[value_axis] = 1;
            let weights = RawTensor::full((1.0 / l as f32).sqrt(), &wshape);
            (weights, x.clone())
        }
    }
}

/// Per-slot scalar weights `[.., L, 1]` of a raw slot block
pub fn slot_weights(x: &Tensor, spec: &SlotSpec) -> Tensor {
    split_slots(x, spec).0
}

/// Weighted slot vectors `[.., L, V]` from a raw block `[.., L, V(+1)]`
pub fn project_slots(x: &Tensor, spec: &SlotSpec) -> Tensor {
    let (weights, values) = split_slots(x, spec);
    let axis = values.rank() - 1;
    let values = match spec.representation {
        SlotRepresentation::Cont => values.l2_normalize(axis),
        SlotRepresentation::SqrtSem => values.softmax(axis).sqrt(),
        SlotRepresentation::Sem => values.softmax(axis).l2_normalize(axis),
    };
    values.elem_mul(&weights)
}

/// Dimensions of a slot-attention head
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparoHeadConfig {
    pub num_slots: usize,
    /// Channels emitted per slot, including any importance logit
    pub slot_dim: usize,
    pub attn_dim: usize,
    pub value_dim: usize,
    pub heads: usize,
    /// One key/value projection for all slots instead of one per slot
    pub share_kv: bool,
}

/// Learned slot queries attending over a token sequence
pub struct SparoHead {
    pub q_emb: Tensor,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_weight: Tensor,
    pub out_bias: Tensor,
    pub cfg: SparoHeadConfig,
}

impl SparoHead {
    pub fn new(width: usize, cfg: SparoHeadConfig) -> Result<Self> {
        exact_div("slot attention dim / heads", cfg.attn_dim, cfg.heads)?;
        exact_div("slot value dim / heads", cfg.value_dim, cfg.heads)?;
        let groups = if cfg.share_kv { 1 } else { cfg.num_slots };
        let (l, v) = (cfg.num_slots, cfg.slot_dim);
        Ok(SparoHead {
            q_emb: RawTensor::parameter(RawTensor::randn_scaled(
                &[l, cfg.attn_dim],
                (cfg.attn_dim as f32).powf(-0.5),
            )),
            k_proj: Linear::new(width, cfg.attn_dim * groups, true),
            v_proj: Linear::new(width, cfg.value_dim * groups, true),
            out_weight: RawTensor::parameter(RawTensor::randn_scaled(
                &[l, cfg.value_dim, v],
                (cfg.value_dim as f32).powf(-0.5),
            )),
            out_bias: RawTensor::parameter(RawTensor::zeros(&[l, v])),
            cfg,
        })
    }

    /// `x [B, N, width]` → (`[B, L·V]`, attention `[B, L, heads, N]`).
    ///
    /// `key_padding_mask [B, N]` marks tokens the slots may not read.
    pub fn forward(&self, x: &Tensor, key_padding_mask: Option<&Tensor>) -> (Tensor, Tensor) {
        let s = x.shape();
        let (b, n) = (s[0], s[1]);
        let c = &self.cfg;
        let (l, h) = (c.num_slots, c.heads);
        let (dh, dv) = (c.attn_dim / h, c.value_dim / h);
        let groups = if c.share_kv { 1 } else { l };

        let k = self
            .k_proj
            .forward(x)
            .reshape(&[b, n, groups, h, dh])
            .permute(&[0, 2, 3, 1, 4]);
        let v = self
            .v_proj
            .forward(x)
            .reshape(&[b, n, groups, h, dv])
            .permute(&[0, 2, 3, 1, 4]);
        let q = self.q_emb.reshape(&[1, l, h, 1, dh]);
        let mask = key_padding_mask.map(|m| padding_to_additive(m).reshape(&[b, 1, 1, 1, n]));

        // [B, L, H, 1, dv] and [B, L, H, 1, N]
        let (out, attn) = scaled_dot_product_attention(&q, &k, &v, mask.as_ref());
        let out = out.reshape(&[b, l, 1, c.value_dim]);
        let slots = out
            .matmul(&self.out_weight)
            .reshape(&[b, l, c.slot_dim])
            .add(&self.out_bias);
        (slots.reshape(&[b, l * c.slot_dim]), attn.reshape(&[b, l, h, n]))
    }
}

impl Module for SparoHead {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("q_emb", &self.q_emb, TensorKind::Parameter);
        f("out_weight", &self.out_weight, TensorKind::Parameter);
        f("out_bias", &self.out_bias, TensorKind::Parameter);
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("k_proj", &self.k_proj);
        f("v_proj", &self.v_proj);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("k_proj", &mut self.k_proj);
        f("v_proj", &mut self.v_proj);
    }
}

/// Vision transformer in token mode followed by a slot head
pub struct SparoVisionTransformer {
    pub trunk: VisionTransformer,
    pub sparo: SparoHead,
}

impl SparoVisionTransformer {
    pub fn new(
        cfg: &VisionConfig,
        layers: usize,
        heads: usize,
        block: &BlockOptions,
        head: SparoHeadConfig,
    ) -> Result<Self> {
        let trunk = VisionTransformer::new(cfg, layers, heads, cfg.width, block, VisionHead::Tokens)?;
        Ok(SparoVisionTransformer {
            sparo: SparoHead::new(trunk.width, head)?,
            trunk,
        })
    }

    /// (`[B, L·V]`, attention `[B, L, heads, 1 + N]`)
    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor) {
        self.sparo.forward(&self.trunk.forward_tokens(x), None)
    }

    /// The slot head counts as the last group
    pub fn lock(&mut self, unlocked_groups: usize) {
        self.trunk.lock(unlocked_groups.saturating_sub(1));
        self.sparo.set_requires_grad(unlocked_groups > 0);
    }
}

impl Module for SparoVisionTransformer {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        self.trunk.own_tensors(f);
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        self.trunk.for_each_child(f);
        f("sparo", &self.sparo);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        self.trunk.for_each_child_mut(f);
        f("sparo", &mut self.sparo);
    }
}

/// Causal text transformer followed by a slot head reading up to each
/// sequence's end token
pub struct SparoTextTransformer {
    pub trunk: TextTransformer,
    pub sparo: SparoHead,
}

impl SparoTextTransformer {
    pub fn new(
        cfg: &TextConfig,
        layers: usize,
        block: &BlockOptions,
        head: SparoHeadConfig,
    ) -> Result<Self> {
        if cfg.embed_cls || cfg.attentional_pool {
            return Err(ClipError::Unsupported(
                "slot text towers read every token up to the end marker; \
                 class token and attentional pooling cannot be combined with them"
                    .into(),
            ));
        }
        let trunk = TextTransformer::new(cfg, layers, None, block);
        Ok(SparoTextTransformer {
            sparo: SparoHead::new(trunk.width, head)?,
            trunk,
        })
    }

    /// Slot head over `ln_final`-normalized tokens; `x` is `[B, L, width]`
    pub fn head(&self, x: &Tensor, text: &Tensor) -> (Tensor, Tensor) {
        let eos = RawTensor::argmax_last(text);
        let mask = after_eos_mask(&eos, x.shape()[1]);
        self.sparo.forward(&self.trunk.ln_final.forward(x), Some(&mask))
    }

    pub fn forward(&self, text: &Tensor) -> (Tensor, Tensor) {
        self.head(&self.trunk.encode_tokens(text), text)
    }

    pub fn lock(&mut self, unlocked_layers: usize, freeze_layer_norm: bool) {
        self.trunk.lock(unlocked_layers, freeze_layer_norm);
        if unlocked_layers == 0 {
            freeze_module(&self.sparo, freeze_layer_norm);
        }
    }
}

impl Module for SparoTextTransformer {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        self.trunk.own_tensors(f);
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        self.trunk.for_each_child(f);
        f("sparo", &self.sparo);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        self.trunk.for_each_child_mut(f);
        f("sparo", &mut self.sparo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::manual_seed;

    fn head_cfg(share_kv: bool) -> SparoHeadConfig {
        SparoHeadConfig {
            num_slots: 3,
            slot_dim: 5,
            attn_dim: 4,
            value_dim: 6,
            heads: 2,
            share_kv,
        }
    }

    #[test]
    fn test_parse_tags() {
        let spec: SlotSpec = "sqrtsem:softmax".parse().unwrap();
        assert_eq!(spec.representation, SlotRepresentation::SqrtSem);
        assert!(spec.weighting.uses_logit());
        assert_eq!(spec.stored_width(8), 9);
        assert_eq!(spec.to_string(), "sqrtsem:softmax");
        assert!(matches!("cont:max".parse::<SlotSpec>(), Err(ClipError::UnknownSlotTag(_))));
        assert!(matches!("cont".parse::<SlotSpec>(), Err(ClipError::UnknownSlotTag(_))));
        assert!("sem:norm".parse::<SlotSpec>().is_err());
    }

    #[test]
    fn test_const_cont_slots_are_scaled_unit_vectors() {
        let spec: SlotSpec = "cont:const".parse().unwrap();
        let x = RawTensor::randn(&[2, 4, 3]);
        let out = project_slots(&x, &spec);
        assert_eq!(out.shape(), vec![2, 4, 3]);
        let norms = out.norm_dim(2, false).to_vec();
        assert!(norms.iter().all(|n| (n - 0.5).abs() < 1e-5));
    }

    #[test]
    fn test_norm_weights_partition_unit_norm() {
        let spec: SlotSpec = "cont:norm".parse().unwrap();
        let x = RawTensor::randn(&[3, 4]);
        let w = slot_weights(&x, &spec).to_vec();
        let total: f32 = w.iter().map(|v| v * v).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_sqrtsoftmax_weights_square_to_one() {
        let spec: SlotSpec = "sem:sqrtsoftmax".parse().unwrap();
        let x = RawTensor::randn(&[5, 3]);
        let w = slot_weights(&x, &spec).to_vec();
        let total: f32 = w.iter().map(|v| v * v).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(project_slots(&x, &spec).shape(), vec![5, 2]);
    }

    #[test]
    fn test_head_shapes_shared_and_per_slot() {
        manual_seed(4);
        let x = RawTensor::randn(&[2, 7, 8]);
        for share in [true, false] {
            let head = SparoHead::new(8, head_cfg(share)).unwrap();
            let (out, attn) = head.forward(&x, None);
            assert_eq!(out.shape(), vec![2, 15]);
            assert_eq!(attn.shape(), vec![2, 3, 2, 7]);
        }
        let per_slot = SparoHead::new(8, head_cfg(false)).unwrap();
        assert_eq!(per_slot.k_proj.out_features(), 12);
    }

    #[test]
    fn test_head_respects_padding() {
        let head = SparoHead::new(8, head_cfg(true)).unwrap();
        let x = RawTensor::randn(&[1, 4, 8]);
        let mask = after_eos_mask(&[1], 4);
        let (_, attn) = head.forward(&x, Some(&mask));
        for row in attn.to_vec().chunks(4) {
            assert_eq!(row[2], 0.0);
            assert_eq!(row[3], 0.0);
        }
    }

    #[test]
    fn test_head_rejects_uneven_heads() {
        let cfg = SparoHeadConfig {
            heads: 3,
            ..head_cfg(true)
        };
        assert!(matches!(
            SparoHead::new(8, cfg),
            Err(ClipError::NonExactRatio { .. })
        ));
    }

    #[test]
    fn test_text_tower_rejects_cls_and_attn_pool() {
        let base = TextConfig {
            context_length: 6,
            vocab_size: 20,
            width: 8,
            heads: 2,
            layers: 1,
            ..TextConfig::default()
        };
        let block = BlockOptions::default();
        assert!(SparoTextTransformer::new(&base, 1, &block, head_cfg(true)).is_ok());

        for cfg in [
            TextConfig { embed_cls: true, ..base.clone() },
            TextConfig { attentional_pool: true, ..base.clone() },
        ] {
            assert!(matches!(
                SparoTextTransformer::new(&cfg, 1, &block, head_cfg(true)),
                Err(ClipError::Unsupported(_))
            ));
        }
    }
}
