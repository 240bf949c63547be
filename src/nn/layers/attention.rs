use crate::nn::layers::linear::{Linear, linear};
use crate::nn::{LayerKind, Module, TensorKind};
use crate::ops::cat;
use crate::tensor::{RawTensor, Tensor, TensorOps};

/// softmax(q·kᵀ/√d + mask)·v over `[..., L, d]` operands
///
/// Returns the attended values and the attention weights `[..., Lq, Lk]`.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> (Tensor, Tensor) {
    let d = q.shape().last().copied().unwrap_or(1);
    let mut scores = q.matmul(&k.transpose()).mul_scalar(1.0 / (d as f32).sqrt());
    if let Some(m) = mask {
        scores = scores.add(m);
    }
    let last = scores.rank() - 1;
    let weights = scores.softmax(last);
    (weights.matmul(v), weights)
}

/// Additive mask `[B, 1, 1, Lk]` from a `[B, Lk]` padding mask (non-zero = ignore)
pub fn padding_to_additive(key_padding_mask: &Tensor) -> Tensor {
    let shape = key_padding_mask.shape();
    let data = key_padding_mask
        .to_vec()
        .into_iter()
        .map(|m| if m != 0.0 { f32::NEG_INFINITY } else { 0.0 })
        .collect();
    RawTensor::new(data, &[shape[0], 1, 1, shape[1]], false)
}

/// Multi-head attention, batch-first (`[B, L, E]`)
///
/// Projections are packed into `in_proj_weight` when key and value widths
/// equal the embedding width, otherwise split into `q/k/v_proj_weight`.
pub struct MultiheadAttention {
    pub embed_dim: usize,
    pub num_heads: usize,
    pub in_proj_weight: Option<Tensor>,
    pub q_proj_weight: Option<Tensor>,
    pub k_proj_weight: Option<Tensor>,
    pub v_proj_weight: Option<Tensor>,
    pub in_proj_bias: Option<Tensor>,
    pub bias_k: Option<Tensor>,
    pub bias_v: Option<Tensor>,
    pub out_proj: Linear,
}

impl MultiheadAttention {
    pub fn new(embed_dim: usize, num_heads: usize) -> Self {
        Self::with_options(embed_dim, num_heads, embed_dim, embed_dim, false)
    }

    /// # Panics
    /// `embed_dim` not divisible by `num_heads`
    pub fn with_options(
        embed_dim: usize,
        num_heads: usize,
        kdim: usize,
        vdim: usize,
        add_bias_kv: bool,
    ) -> Self {
        assert!(
            num_heads > 0 && embed_dim % num_heads == 0,
            "embed_dim {embed_dim} must be divisible by num_heads {num_heads}"
        );
        let packed = kdim == embed_dim && vdim == embed_dim;
        let param = |t: Tensor| Some(RawTensor::parameter(t));

        let (in_proj_weight, q_proj_weight, k_proj_weight, v_proj_weight) = if packed {
            (
                param(RawTensor::xavier_uniform(&[3 * embed_dim, embed_dim])),
                None,
                None,
                None,
            )
        } else {
            (
                None,
                param(RawTensor::xavier_uniform(&[embed_dim, embed_dim])),
                param(RawTensor::xavier_uniform(&[embed_dim, kdim])),
                param(RawTensor::xavier_uniform(&[embed_dim, vdim])),
            )
        };
        let (bias_k, bias_v) = if add_bias_kv {
            let std = (2.0 / (1 + embed_dim) as f32).sqrt();
            (
                param(RawTensor::randn_scaled(&[1, 1, embed_dim], std)),
                param(RawTensor::randn_scaled(&[1, 1, embed_dim], std)),
            )
        } else {
            (None, None)
        };

        let out_proj = Linear::new(embed_dim, embed_dim, true);
        if let Some(b) = &out_proj.bias {
            b.borrow_mut().data.fill(0.0);
        }

        MultiheadAttention {
            embed_dim,
            num_heads,
            in_proj_weight,
            q_proj_weight,
            k_proj_weight,
            v_proj_weight,
            in_proj_bias: param(RawTensor::zeros(&[3 * embed_dim])),
            bias_k,
            bias_v,
            out_proj,
        }
    }

    fn project(&self, x: &Tensor, index: usize) -> Tensor {
        let e = self.embed_dim;
        let weight = match (&self.in_proj_weight, index) {
            (Some(w), i) => w.narrow(0, i * e, e),
            (None, 0) => self.split_weight(&self.q_proj_weight),
            (None, 1) => self.split_weight(&self.k_proj_weight),
            (None, _) => self.split_weight(&self.v_proj_weight),
        };
        let bias = self.in_proj_bias.as_ref().map(|b| b.narrow(0, index * e, e));
        linear(x, &weight, bias.as_ref())
    }

    fn split_weight(&self, w: &Option<Tensor>) -> Tensor {
        match w {
            Some(w) => w.clone(),
            None => unreachable!("split projections exist whenever in_proj_weight is absent"),
        }
    }

    fn split_heads(&self, x: &Tensor) -> Tensor {
        let s = x.shape();
        let head_dim = self.embed_dim / self.num_heads;
        x.reshape(&[s[0], s[1], self.num_heads, head_dim])
            .permute(&[0, 2, 1, 3])
    }

    /// Attend from `query [B, Lq, E]` over `key [B, Lk, kdim]` / `value [B, Lk, vdim]`.
    ///
    /// `attn_mask` is additive, `[Lq, Lk]` or `[B, Lq, Lk]`. `key_padding_mask`
    /// is `[B, Lk]` with non-zero entries marking keys to ignore.
    /// Returns the output `[B, Lq, E]` and per-head weights `[B, H, Lq, Lk]`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
    ) -> (Tensor, Tensor) {
        let batch = query.shape()[0];
        let q = self.project(query, 0);
        let mut k = self.project(key, 1);
        let mut v = self.project(value, 2);

        let mut attn_mask = attn_mask.cloned();
        let mut key_padding_mask = key_padding_mask.cloned();
        if let (Some(bk), Some(bv)) = (&self.bias_k, &self.bias_v) {
            k = cat(&[k, bk.expand(&[batch, 1, self.embed_dim])], 1);
            v = cat(&[v, bv.expand(&[batch, 1, self.embed_dim])], 1);
            attn_mask = attn_mask.map(|m| {
                let mut shape = m.shape();
                let last = shape.len() - 1;
                shape[last] = 1;
                cat(&[m.clone(), RawTensor::zeros(&shape)], last)
            });
            key_padding_mask =
                key_padding_mask.map(|m| cat(&[m.clone(), RawTensor::zeros(&[batch, 1])], 1));
        }

        let mut mask = attn_mask.map(|m| if m.rank() == 3 { m.unsqueeze(1) } else { m });
        if let Some(kpm) = &key_padding_mask {
            let pad = padding_to_additive(kpm);
            mask = Some(match mask {
                Some(m) => m.add(&pad),
                None => pad,
            });
        }

        let (q, k, v) = (self.split_heads(&q), self.split_heads(&k), self.split_heads(&v));
        let (out, weights) = scaled_dot_product_attention(&q, &k, &v, mask.as_ref());
        let lq = out.shape()[2];
        let out = out
            .permute(&[0, 2, 1, 3])
            .reshape(&[batch, lq, self.embed_dim]);
        (self.out_proj.forward(&out), weights)
    }
}

impl Module for MultiheadAttention {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        let named = [
            ("in_proj_weight", &self.in_proj_weight),
            ("q_proj_weight", &self.q_proj_weight),
            ("k_proj_weight", &self.k_proj_weight),
            ("v_proj_weight", &self.v_proj_weight),
            ("in_proj_bias", &self.in_proj_bias),
            ("bias_k", &self.bias_k),
            ("bias_v", &self.bias_v),
        ];
        for (name, t) in named {
            if let Some(t) = t {
                f(name, t, TensorKind::Parameter);
            }
        }
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("out_proj", &self.out_proj);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("out_proj", &mut self.out_proj);
    }

    fn layer_kind(&self) -> LayerKind {
        LayerKind::Attention
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_attention_shapes() {
        let mha = MultiheadAttention::new(8, 2);
        let x = RawTensor::randn(&[3, 5, 8]);
        let (out, w) = mha.forward(&x, &x, &x, None, None);
        assert_eq!(out.shape(), vec![3, 5, 8]);
        assert_eq!(w.shape(), vec![3, 2, 5, 5]);
        for row in w.to_vec().chunks(5) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_split_projection_keys() {
        let mha = MultiheadAttention::with_options(8, 2, 4, 4, true);
        let keys: Vec<String> = mha.state_dict().into_keys().collect();
        assert_eq!(
            keys,
            vec![
                "bias_k",
                "bias_v",
                "in_proj_bias",
                "k_proj_weight",
                "out_proj.bias",
                "out_proj.weight",
                "q_proj_weight",
                "v_proj_weight"
            ]
        );
        let q = RawTensor::randn(&[2, 3, 8]);
        let kv = RawTensor::randn(&[2, 6, 4]);
        let (out, w) = mha.forward(&q, &kv, &kv, None, None);
        assert_eq!(out.shape(), vec![2, 3, 8]);
        assert_eq!(w.shape(), vec![2, 2, 3, 7]);
    }

    #[test]
    fn test_causal_mask_blocks_future() {
        let mha = MultiheadAttention::new(4, 1);
        let x = RawTensor::randn(&[1, 3, 4]);
        let mut mask = vec![0.0; 9];
        for i in 0..3 {
            for j in (i + 1)..3 {
                mask[i * 3 + j] = f32::NEG_INFINITY;
            }
        }
        let mask = RawTensor::new(mask, &[3, 3], false);
        let (_, w) = mha.forward(&x, &x, &x, Some(&mask), None);
        let w = w.to_vec();
        assert_eq!(w[1], 0.0);
        assert_eq!(w[2], 0.0);
        assert_eq!(w[5], 0.0);
        assert!((w[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_key_padding_mask() {
        let mha = MultiheadAttention::new(4, 2);
        let x = RawTensor::randn(&[2, 4, 4]);
        let pad = RawTensor::new(vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0], &[2, 4], false);
        let (_, w) = mha.forward(&x, &x, &x, None, Some(&pad));
        let w = w.to_vec();
        // sample 0: keys 2 and 3 receive no weight
        for row in w[..2 * 4 * 4].chunks(4) {
            assert_eq!(row[2], 0.0);
            assert_eq!(row[3], 0.0);
        }
    }
}
