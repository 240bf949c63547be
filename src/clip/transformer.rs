//! Pre-norm transformer stack shared by the vision and text towers.

use crate::dtype::DType;
use crate::nn::{
    Activation, DropPath, LayerKind, LayerNorm, Linear, Module, MultiheadAttention,
    NormPrecision, TensorKind, walk_modules,
};
use crate::ops::cat;
use crate::tensor::{RawTensor, Tensor, TensorOps};

/// Per-channel residual branch scaling
pub struct LayerScale {
    pub gamma: Tensor,
}

impl LayerScale {
    pub fn new(dim: usize, init_value: f32) -> Self {
        LayerScale {
            gamma: RawTensor::parameter(RawTensor::full(init_value, &[dim])),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        x.elem_mul(&self.gamma)
    }
}

impl Module for LayerScale {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("gamma", &self.gamma, TensorKind::Parameter);
    }
}

pub struct Mlp {
    pub c_fc: Linear,
    pub c_proj: Linear,
    pub act: Activation,
}

impl Mlp {
    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.c_proj.forward(&self.act.forward(&self.c_fc.forward(x)))
    }
}

impl Module for Mlp {
    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("c_fc", &self.c_fc);
        f("c_proj", &self.c_proj);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("c_fc", &mut self.c_fc);
        f("c_proj", &mut self.c_proj);
    }
}

/// Block hyperparameters shared by every layer of a stack
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockOptions {
    pub mlp_ratio: f32,
    pub ls_init_value: Option<f32>,
    pub act: Activation,
    pub norm: NormPrecision,
    /// Stochastic depth rate applied to both residual branches
    pub drop_path: f32,
}

impl Default for BlockOptions {
    fn default() -> Self {
        BlockOptions {
            mlp_ratio: 4.0,
            ls_init_value: None,
            act: Activation::Gelu,
            norm: NormPrecision::Native,
            drop_path: 0.0,
        }
    }
}

pub struct ResidualAttentionBlock {
    pub ln_1: LayerNorm,
    pub attn: MultiheadAttention,
    pub ls_1: Option<LayerScale>,
    pub ln_2: LayerNorm,
    pub mlp: Mlp,
    pub ls_2: Option<LayerScale>,
    drop_path: DropPath,
}

impl ResidualAttentionBlock {
    pub fn new(d_model: usize, n_head: usize, opts: &BlockOptions) -> Self {
        let hidden = (d_model as f32 * opts.mlp_ratio) as usize;
        ResidualAttentionBlock {
            ln_1: LayerNorm::new(d_model, opts.norm),
            attn: MultiheadAttention::new(d_model, n_head),
            ls_1: opts.ls_init_value.map(|v| LayerScale::new(d_model, v)),
            ln_2: LayerNorm::new(d_model, opts.norm),
            mlp: Mlp {
                c_fc: Linear::new(d_model, hidden, true),
                c_proj: Linear::new(hidden, d_model, true),
                act: opts.act,
            },
            ls_2: opts.ls_init_value.map(|v| LayerScale::new(d_model, v)),
            drop_path: DropPath::new(opts.drop_path),
        }
    }

    pub fn forward(&self, x: &Tensor, attn_mask: Option<&Tensor>) -> Tensor {
        let h = self.ln_1.forward(x);
        let (mut a, _) = self.attn.forward(&h, &h, &h, attn_mask, None);
        if let Some(ls) = &self.ls_1 {
            a = ls.forward(&a);
        }
        let x = x.add(&self.drop_path.forward(&a));

        let mut m = self.mlp.forward(&self.ln_2.forward(&x));
        if let Some(ls) = &self.ls_2 {
            m = ls.forward(&m);
        }
        x.add(&self.drop_path.forward(&m))
    }
}

impl Module for ResidualAttentionBlock {
    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("ln_1", &self.ln_1);
        f("attn", &self.attn);
        if let Some(ls) = &self.ls_1 {
            f("ls_1", ls);
        }
        f("ln_2", &self.ln_2);
        f("mlp", &self.mlp);
        if let Some(ls) = &self.ls_2 {
            f("ls_2", ls);
        }
        f("drop_path", &self.drop_path);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("ln_1", &mut self.ln_1);
        f("attn", &mut self.attn);
        if let Some(ls) = &mut self.ls_1 {
            f("ls_1", ls);
        }
        f("ln_2", &mut self.ln_2);
        f("mlp", &mut self.mlp);
        if let Some(ls) = &mut self.ls_2 {
            f("ls_2", ls);
        }
        f("drop_path", &mut self.drop_path);
    }
}

pub struct Transformer {
    pub width: usize,
    pub resblocks: Vec<ResidualAttentionBlock>,
    grad_checkpointing: bool,
}

impl Transformer {
    pub fn new(width: usize, layers: usize, heads: usize, opts: &BlockOptions) -> Self {
        Transformer {
            width,
            resblocks: (0..layers)
                .map(|_| ResidualAttentionBlock::new(width, heads, opts))
                .collect(),
            grad_checkpointing: false,
        }
    }

    pub fn layers(&self) -> usize {
        self.resblocks.len()
    }

    /// Storage dtype of the first MLP input projection
    pub fn cast_dtype(&self) -> DType {
        self.resblocks
            .first()
            .map(|b| b.mlp.c_fc.weight.dtype())
            .unwrap_or_default()
    }

    /// Recorded only; activations are never kept for a backward pass here.
    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.grad_checkpointing = enable;
    }

    pub fn grad_checkpointing(&self) -> bool {
        self.grad_checkpointing
    }

    pub fn forward(&self, x: &Tensor, attn_mask: Option<&Tensor>) -> Tensor {
        self.resblocks
            .iter()
            .fold(x.clone(), |x, block| block.forward(&x, attn_mask))
    }

    /// std-scaled normal init of every block
    pub fn init_weights(&self, attn_std: f32, proj_std: f32, fc_std: f32) {
        for block in &self.resblocks {
            if let Some(w) = &block.attn.in_proj_weight {
                fill_normal(w, attn_std);
            }
            fill_normal(&block.attn.out_proj.weight, proj_std);
            fill_normal(&block.mlp.c_fc.weight, fc_std);
            fill_normal(&block.mlp.c_proj.weight, proj_std);
        }
    }
}

impl Module for Transformer {
    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        for (i, block) in self.resblocks.iter().enumerate() {
            f(&format!("resblocks.{i}"), block);
        }
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        for (i, block) in self.resblocks.iter_mut().enumerate() {
            f(&format!("resblocks.{i}"), block);
        }
    }
}

/// Cross-attention from learned queries onto a token sequence
pub struct AttentionalPooler {
    pub query: Tensor,
    pub attn: MultiheadAttention,
    pub ln_q: LayerNorm,
    pub ln_k: LayerNorm,
}

impl AttentionalPooler {
    pub fn new(
        d_model: usize,
        context_dim: usize,
        n_head: usize,
        n_queries: usize,
        norm: NormPrecision,
    ) -> Self {
        AttentionalPooler {
            query: RawTensor::parameter(RawTensor::randn(&[n_queries, d_model])),
            attn: MultiheadAttention::with_options(d_model, n_head, context_dim, context_dim, false),
            ln_q: LayerNorm::new(d_model, norm),
            ln_k: LayerNorm::new(context_dim, norm),
        }
    }

    pub fn n_queries(&self) -> usize {
        self.query.shape()[0]
    }

    /// `x [B, N, context_dim]` → `[B, n_queries, d_model]`.
    /// `key_padding_mask [B, N]` marks tokens the queries may not read.
    pub fn forward(&self, x: &Tensor, key_padding_mask: Option<&Tensor>) -> Tensor {
        let batch = x.shape()[0];
        let x = self.ln_k.forward(x);
        let q = self.ln_q.forward(&self.query);
        let qs = q.shape();
        let q = q.unsqueeze(0).expand(&[batch, qs[0], qs[1]]);
        self.attn.forward(&q, &x, &x, None, key_padding_mask).0
    }
}

impl Module for AttentionalPooler {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("query", &self.query, TensorKind::Parameter);
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("attn", &self.attn);
        f("ln_q", &self.ln_q);
        f("ln_k", &self.ln_k);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("attn", &mut self.attn);
        f("ln_q", &mut self.ln_q);
        f("ln_k", &mut self.ln_k);
    }
}

/// Additive causal mask `[n, n]`: -inf strictly above the diagonal
pub fn causal_mask(n: usize) -> Tensor {
    let mut data = vec![0.0; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            data[i * n + j] = f32::NEG_INFINITY;
        }
    }
    RawTensor::new(data, &[n, n], false)
}

/// Padding mask `[B, n]` hiding every position after each sequence's end token
pub fn after_eos_mask(eos: &[usize], n: usize) -> Tensor {
    let mut data = Vec::with_capacity(eos.len() * n);
    for &e in eos {
        data.extend((0..n).map(|j| if j > e { 1.0 } else { 0.0 }));
    }
    RawTensor::new(data, &[eos.len(), n], false)
}

/// Pick token `index[b]` from each sequence of `x [B, N, D]` → `[B, D]`
pub fn gather_tokens(x: &Tensor, index: &[usize]) -> Tensor {
    let rows: Vec<Tensor> = index
        .iter()
        .enumerate()
        .map(|(b, &i)| x.select(0, b).narrow(0, i, 1))
        .collect();
    cat(&rows, 0)
}

/// Overwrite `t` in place with N(0, std²) draws, keeping its dtype
pub(crate) fn fill_normal(t: &Tensor, std: f32) {
    let shape = t.shape();
    let fresh = RawTensor::randn_scaled(&shape, std).to_vec();
    let mut dst = t.borrow_mut();
    dst.data = fresh;
    let dtype = dst.dtype;
    dtype.round_slice(&mut dst.data);
}

/// Stop every parameter of `module` from training.
///
/// With `freeze_layer_norm` false, normalization parameters stay trainable.
pub fn freeze_module(module: &dyn Module, freeze_layer_norm: bool) {
    module.set_requires_grad(false);
    if !freeze_layer_norm {
        walk_modules(module, &mut |m| {
            if m.layer_kind() == LayerKind::Norm {
                m.set_requires_grad(true);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_keys_with_layer_scale() {
        let opts = BlockOptions {
            ls_init_value: Some(0.1),
            ..BlockOptions::default()
        };
        let block = ResidualAttentionBlock::new(8, 2, &opts);
        let keys: Vec<String> = block.state_dict().into_keys().collect();
        assert!(keys.contains(&"ls_1.gamma".to_string()));
        assert!(keys.contains(&"mlp.c_fc.weight".to_string()));
        assert!(keys.contains(&"attn.in_proj_weight".to_string()));
        assert_eq!(block.mlp.c_fc.out_features(), 32);
    }

    #[test]
    fn test_transformer_forward_and_cast_dtype() {
        let t = Transformer::new(8, 2, 2, &BlockOptions::default());
        let x = RawTensor::randn(&[2, 5, 8]);
        let y = t.forward(&x, Some(&causal_mask(5)));
        assert_eq!(y.shape(), vec![2, 5, 8]);
        assert_eq!(t.cast_dtype(), DType::F32);
        t.resblocks[0].mlp.c_fc.weight.borrow_mut().cast_(DType::BF16);
        assert_eq!(t.cast_dtype(), DType::BF16);
        let keys: Vec<String> = t.state_dict().into_keys().collect();
        assert!(keys.iter().any(|k| k.starts_with("resblocks.1.")));
    }

    #[test]
    fn test_attentional_pooler_shapes() {
        let pool = AttentionalPooler::new(8, 6, 2, 3, NormPrecision::Native);
        let x = RawTensor::randn(&[2, 5, 6]);
        let mask = after_eos_mask(&[1, 4], 5);
        assert_eq!(pool.forward(&x, Some(&mask)).shape(), vec![2, 3, 8]);
        assert!(pool.state_dict().contains_key("attn.q_proj_weight"));
    }

    #[test]
    fn test_gather_tokens() {
        let x = RawTensor::new((0..12).map(|v| v as f32).collect(), &[2, 3, 2], false);
        let g = gather_tokens(&x, &[2, 0]);
        assert_eq!(g.shape(), vec![2, 2]);
        assert_eq!(g.to_vec(), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_freeze_keeps_norms_when_asked() {
        let block = ResidualAttentionBlock::new(4, 1, &BlockOptions::default());
        freeze_module(&block, false);
        assert!(block.ln_1.weight.borrow().requires_grad);
        assert!(!block.mlp.c_fc.weight.borrow().requires_grad);
        freeze_module(&block, true);
        assert!(!block.ln_2.bias.borrow().requires_grad);
    }
}
