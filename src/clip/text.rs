use crate::clip::config::TextConfig;
use crate::clip::transformer::{
    AttentionalPooler, BlockOptions, Transformer, after_eos_mask, causal_mask, fill_normal,
    freeze_module, gather_tokens,
};
use crate::nn::{Embedding, LayerNorm, Module, TensorKind};
use crate::ops::cat;
use crate::tensor::{RawTensor, Tensor, TensorOps};

/// Causal text transformer over token ids `[B, context_length]`
pub struct TextTransformer {
    pub context_length: usize,
    pub vocab_size: usize,
    pub width: usize,
    pub heads: usize,
    pub output_dim: usize,
    pub pad_id: usize,
    pub token_embedding: Embedding,
    pub positional_embedding: Tensor,
    /// Learned class token appended after the sequence
    pub cls_emb: Option<Tensor>,
    pub transformer: Transformer,
    pub attn_pool: Option<AttentionalPooler>,
    pub ln_final: LayerNorm,
    pub text_projection: Option<Tensor>,
    /// Non-persistent additive causal mask
    pub attn_mask: Tensor,
    pub global_average_pool: bool,
    pub output_tokens: bool,
}

impl TextTransformer {
    /// `output_dim` of `None` leaves the pooled features unprojected.
    pub fn new(
        cfg: &TextConfig,
        layers: usize,
        output_dim: Option<usize>,
        block: &BlockOptions,
    ) -> Self {
        let width = cfg.width;
        let num_pos = cfg.context_length + usize::from(cfg.embed_cls);
        let attn_pool = cfg.attentional_pool.then(|| {
            AttentionalPooler::new(
                width,
                width,
                cfg.attn_pooler_heads,
                cfg.n_queries,
                block.norm,
            )
        });

        let model = TextTransformer {
            context_length: cfg.context_length,
            vocab_size: cfg.vocab_size,
            width,
            heads: cfg.heads,
            output_dim: output_dim.unwrap_or(width),
            pad_id: cfg.pad_id,
            token_embedding: Embedding::new(cfg.vocab_size, width),
            positional_embedding: RawTensor::parameter(RawTensor::zeros(&[num_pos, width])),
            cls_emb: cfg
                .embed_cls
                .then(|| RawTensor::parameter(RawTensor::zeros(&[width]))),
            transformer: Transformer::new(width, layers, cfg.heads, block),
            attn_pool,
            ln_final: LayerNorm::new(width, block.norm),
            text_projection: output_dim
                .map(|d| RawTensor::parameter(RawTensor::zeros(&[width, d]))),
            attn_mask: causal_mask(num_pos),
            global_average_pool: cfg.global_average_pool,
            output_tokens: cfg.output_tokens,
        };
        model.init_parameters();
        model
    }

    fn init_parameters(&self) {
        fill_normal(&self.token_embedding.weight, 0.02);
        fill_normal(&self.positional_embedding, 0.01);
        if let Some(cls) = &self.cls_emb {
            fill_normal(cls, 0.01);
        }
        let width = self.width as f32;
        let layers = self.transformer.layers().max(1) as f32;
        let proj_std = width.powf(-0.5) * (2.0 * layers).powf(-0.5);
        let attn_std = width.powf(-0.5);
        let fc_std = (2.0 * width).powf(-0.5);
        self.transformer.init_weights(attn_std, proj_std, fc_std);
        if let Some(p) = &self.text_projection {
            fill_normal(p, width.powf(-0.5));
        }
    }

    /// Causal mask, with the trailing class row barred from padding tokens
    fn build_attention_mask(&self, text: &Tensor) -> Tensor {
        if self.cls_emb.is_none() {
            return self.attn_mask.clone();
        }
        let ids = text.to_vec();
        let shape = text.shape();
        let (batch, seq) = (shape[0], shape[1]);
        let n = seq + 1;
        let causal = self.attn_mask.to_vec();
        let stride = self.attn_mask.shape()[1];
        let mut data = Vec::with_capacity(batch * n * n);
        for b in 0..batch {
            for i in 0..n {
                for j in 0..n {
                    let mut v = causal[i * stride + j];
                    if i == seq && j < seq && ids[b * seq + j] as usize == self.pad_id {
                        v = f32::NEG_INFINITY;
                    }
                    data.push(v);
                }
            }
        }
        RawTensor::new(data, &[batch, n, n], false)
    }

    /// Token embedding, position embedding and the causal transformer.
    ///
    /// Returns `[B, L, width]`, or `[B, L + 1, width]` with the class token.
    pub fn encode_tokens(&self, text: &Tensor) -> Tensor {
        let shape = text.shape();
        let (batch, seq) = (shape[0], shape[1]);
        let mut x = self.token_embedding.forward(text);
        let mut n = seq;
        if let Some(cls) = &self.cls_emb {
            let cls = cls.reshape(&[1, 1, self.width]).expand(&[batch, 1, self.width]);
            x = cat(&[x, cls], 1);
            n += 1;
        }
        let x = x.add(&self.positional_embedding.narrow(0, 0, n));
        let mask = if self.cls_emb.is_some() {
            self.build_attention_mask(text)
        } else {
            self.attn_mask.narrow(0, 0, n).narrow(1, 0, n)
        };
        self.transformer.forward(&x, Some(&mask))
    }

    /// Pooled text embedding and the per-token features
    pub fn forward_with_tokens(&self, text: &Tensor) -> (Tensor, Tensor) {
        let x = self.encode_tokens(text);
        let seq = text.shape()[1];
        let (pooled, tokens) = if self.cls_emb.is_some() {
            let pooled = self.ln_final.forward(&x.select(1, seq));
            (pooled, x.narrow(1, 0, seq))
        } else {
            let eos = RawTensor::argmax_last(text);
            let x = match &self.attn_pool {
                Some(pool) => pool.forward(&x, Some(&after_eos_mask(&eos, seq))),
                None => x,
            };
            let x = self.ln_final.forward(&x);
            let pooled = match (&self.attn_pool, self.global_average_pool) {
                (_, true) => x.mean_dim(1, false),
                (Some(_), false) => x.select(1, 0),
                (None, false) => gather_tokens(&x, &eos),
            };
            (pooled, x)
        };
        let pooled = match &self.text_projection {
            Some(p) => pooled.matmul(p),
            None => pooled,
        };
        (pooled, tokens)
    }

    pub fn forward(&self, text: &Tensor) -> Tensor {
        self.forward_with_tokens(text).0
    }

    /// Freeze the tower; the last `unlocked_layers` blocks, `ln_final`,
    /// pooling and projection stay trainable when `unlocked_layers > 0`.
    pub fn lock(&mut self, unlocked_layers: usize, freeze_layer_norm: bool) {
        if unlocked_layers == 0 {
            freeze_module(self, freeze_layer_norm);
            return;
        }
        let frozen = (1 + self.transformer.layers()).saturating_sub(unlocked_layers);
        if frozen > 0 {
            freeze_module(&self.token_embedding, freeze_layer_norm);
            self.positional_embedding.borrow_mut().requires_grad = false;
            if let Some(cls) = &self.cls_emb {
                cls.borrow_mut().requires_grad = false;
            }
        }
        for block in self.transformer.resblocks.iter().take(frozen.saturating_sub(1)) {
            freeze_module(block, freeze_layer_norm);
        }
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.transformer.set_grad_checkpointing(enable);
    }
}

impl Module for TextTransformer {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f(
            "positional_embedding",
            &self.positional_embedding,
            TensorKind::Parameter,
        );
        if let Some(cls) = &self.cls_emb {
            f("cls_emb", cls, TensorKind::Parameter);
        }
        if let Some(p) = &self.text_projection {
            f("text_projection", p, TensorKind::Parameter);
        }
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("token_embedding", &self.token_embedding);
        f("transformer", &self.transformer);
        if let Some(pool) = &self.attn_pool {
            f("attn_pool", pool);
        }
        f("ln_final", &self.ln_final);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("token_embedding", &mut self.token_embedding);
        f("transformer", &mut self.transformer);
        if let Some(pool) = &mut self.attn_pool {
            f("attn_pool", pool);
        }
        f("ln_final", &mut self.ln_final);
    }
}
