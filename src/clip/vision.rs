use crate::clip::config::VisionConfig;
use crate::clip::transformer::{AttentionalPooler, BlockOptions, Transformer};
use crate::error::{ClipError, Result, exact_div};
use crate::nn::{Conv2d, LayerNorm, Linear, Module, TensorKind};
use crate::ops::cat;
use crate::tensor::{RawTensor, Tensor, TensorOps, with_rng};

/// Randomly drops patch tokens while training; the class token always survives.
pub struct PatchDropout {
    prob: f32,
    training: bool,
}

impl PatchDropout {
    /// # Panics
    /// `prob` outside `[0, 1)`
    pub fn new(prob: f32) -> Self {
        assert!((0.0..1.0).contains(&prob), "patch dropout must be in [0, 1)");
        PatchDropout {
            prob,
            training: true,
        }
    }

    /// `x [B, 1 + N, D]` → `[B, 1 + max(1, ⌊N·(1-p)⌋), D]`
    pub fn forward(&self, x: &Tensor) -> Tensor {
        if !self.training || self.prob == 0.0 {
            return x.clone();
        }
        let shape = x.shape();
        let (batch, n) = (shape[0], shape[1] - 1);
        let keep = ((n as f32 * (1.0 - self.prob)) as usize).max(1);

        let rows: Vec<Tensor> = (0..batch)
            .map(|b| {
                let sample = x.select(0, b);
                let mut picked = with_rng(|rng| rand::seq::index::sample(rng, n, keep).into_vec());
                picked.sort_unstable();
                let mut parts = vec![sample.narrow(0, 0, 1)];
                parts.extend(picked.into_iter().map(|i| sample.narrow(0, i + 1, 1)));
                cat(&parts, 0).unsqueeze(0)
            })
            .collect();
        cat(&rows, 0)
    }
}

impl Module for PatchDropout {
    fn train(&mut self, mode: bool) {
        self.training = mode;
    }
}

/// Patch embedding: a strided convolution, or a linear map over
/// pre-normalized flattened patches
pub enum PatchEmbed {
    Conv(Conv2d),
    Linear(Linear),
}

/// What the tower returns from `forward`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisionHead {
    /// Pooled, projected embedding `[B, output_dim]`
    Pooled,
    /// Every token after `ln_post`, `[B, 1 + N, width]`
    Tokens,
}

pub struct VisionTransformer {
    pub image_size: (usize, usize),
    pub patch_size: usize,
    pub grid_size: (usize, usize),
    pub width: usize,
    pub output_dim: usize,
    pub patchnorm_pre_ln: Option<LayerNorm>,
    pub conv1: PatchEmbed,
    pub class_embedding: Tensor,
    pub positional_embedding: Tensor,
    pub patch_dropout: PatchDropout,
    pub ln_pre: LayerNorm,
    pub transformer: Transformer,
    pub attn_pool: Option<AttentionalPooler>,
    pub ln_post: LayerNorm,
    pub proj: Option<Tensor>,
    pub global_average_pool: bool,
    pub output_tokens: bool,
    head: VisionHead,
}

impl VisionTransformer {
    pub fn new(
        cfg: &VisionConfig,
        layers: usize,
        heads: usize,
        output_dim: usize,
        block: &BlockOptions,
        head: VisionHead,
    ) -> Result<Self> {
        if !(0.0..1.0).contains(&cfg.patch_dropout) {
            return Err(ClipError::InvalidParameter(format!(
                "patch_dropout {} must be in [0, 1)",
                cfg.patch_dropout
            )));
        }
        let (h, w) = cfg.image_size.hw();
        let p = cfg.patch_size;
        let grid_size = (
            exact_div("image height / patch size", h, p)?,
            exact_div("image width / patch size", w, p)?,
        );
        let width = cfg.width;
        let scale = (width as f32).powf(-0.5);

        let (patchnorm_pre_ln, conv1) = if cfg.input_patchnorm {
            let patch_dim = 3 * p * p;
            (
                Some(LayerNorm::new(patch_dim, block.norm)),
                PatchEmbed::Linear(Linear::new(patch_dim, width, true)),
            )
        } else {
            (None, PatchEmbed::Conv(Conv2d::new(3, width, p, p, 0, false)))
        };

        let pooled = head == VisionHead::Pooled;
        let (attn_pool, ln_post, proj) = if pooled && cfg.attentional_pool {
            (
                Some(AttentionalPooler::new(
                    output_dim,
                    width,
                    cfg.attn_pooler_heads,
                    cfg.n_queries,
                    block.norm,
                )),
                LayerNorm::new(output_dim, block.norm),
                Some(RawTensor::randn_scaled(&[output_dim, output_dim], scale)),
            )
        } else if pooled {
            (
                None,
                LayerNorm::new(width, block.norm),
                Some(RawTensor::randn_scaled(&[width, output_dim], scale)),
            )
        } else {
            (None, LayerNorm::new(width, block.norm), None)
        };

        Ok(VisionTransformer {
            image_size: (h, w),
            patch_size: p,
            grid_size,
            width,
            output_dim,
            patchnorm_pre_ln,
            conv1,
            class_embedding: RawTensor::parameter(RawTensor::randn_scaled(&[width], scale)),
            positional_embedding: RawTensor::parameter(RawTensor::randn_scaled(
                &[grid_size.0 * grid_size.1 + 1, width],
                scale,
            )),
            patch_dropout: PatchDropout::new(cfg.patch_dropout),
            ln_pre: LayerNorm::new(width, block.norm),
            transformer: Transformer::new(width, layers, heads, block),
            attn_pool,
            ln_post,
            proj: proj.map(RawTensor::parameter),
            global_average_pool: cfg.global_average_pool,
            output_tokens: cfg.output_tokens,
            head,
        })
    }

    fn patchify(&self, x: &Tensor) -> Tensor {
        let s = x.shape();
        let (b, c) = (s[0], s[1]);
        let (g0, g1) = self.grid_size;
        let p = self.patch_size;
        match &self.conv1 {
            PatchEmbed::Linear(proj) => {
                let patches = x
                    .reshape(&[b, c, g0, p, g1, p])
                    .permute(&[0, 2, 4, 1, 3, 5])
                    .reshape(&[b, g0 * g1, c * p * p]);
                match &self.patchnorm_pre_ln {
                    Some(ln) => proj.forward(&ln.forward(&patches)),
                    None => proj.forward(&patches),
                }
            }
            PatchEmbed::Conv(conv) => conv
                .forward(x)
                .reshape(&[b, self.width, g0 * g1])
                .permute(&[0, 2, 1]),
        }
    }

    /// Embedded, position-encoded and transformed tokens `[B, 1 + N, width]`
    fn encode(&self, x: &Tensor) -> Tensor {
        let x = self.patchify(x);
        let b = x.shape()[0];
        let cls = self
            .class_embedding
            .reshape(&[1, 1, self.width])
            .expand(&[b, 1, self.width]);
        let x = cat(&[cls, x], 1).add(&self.positional_embedding);
        let x = self.ln_pre.forward(&self.patch_dropout.forward(&x));
        self.transformer.forward(&x, None)
    }

    /// All tokens after `ln_post`, `[B, 1 + N, width]`
    pub fn forward_tokens(&self, x: &Tensor) -> Tensor {
        self.ln_post.forward(&self.encode(x))
    }

    fn global_pool(&self, x: &Tensor) -> (Tensor, Tensor) {
        let n = x.shape()[1];
        if self.global_average_pool {
            (x.mean_dim(1, false), x.clone())
        } else {
            (x.select(1, 0), x.narrow(1, 1, n - 1))
        }
    }

    /// Pooled embedding and the remaining tokens
    pub fn forward_with_tokens(&self, x: &Tensor) -> (Tensor, Tensor) {
        if self.head == VisionHead::Tokens {
            let tokens = self.forward_tokens(x);
            return (tokens.clone(), tokens);
        }
        let x = self.encode(x);
        let (mut pooled, tokens) = match &self.attn_pool {
            Some(pool) => self.global_pool(&self.ln_post.forward(&pool.forward(&x, None))),
            None => {
                let (pooled, tokens) = self.global_pool(&x);
                (self.ln_post.forward(&pooled), tokens)
            }
        };
        if let Some(proj) = &self.proj {
            pooled = pooled.matmul(proj);
        }
        (pooled, tokens)
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.forward_with_tokens(x).0
    }

    /// Parameter groups, earliest first: embeddings and `ln_pre`, each
    /// block but the last, the last block with the output norm, `proj`
    fn lock_groups(&self) -> Vec<Vec<Tensor>> {
        let mut groups = Vec::new();
        let mut embed = vec![self.class_embedding.clone(), self.positional_embedding.clone()];
        if let Some(ln) = &self.patchnorm_pre_ln {
            embed.extend(ln.parameters());
        }
        match &self.conv1 {
            PatchEmbed::Conv(c) => embed.extend(c.parameters()),
            PatchEmbed::Linear(l) => embed.extend(l.parameters()),
        }
        embed.extend(self.ln_pre.parameters());
        groups.push(embed);

        if let Some((last, rest)) = self.transformer.resblocks.split_last() {
            groups.extend(rest.iter().map(|b| b.parameters()));
            let mut tail = last.parameters();
            if let Some(pool) = &self.attn_pool {
                tail.extend(pool.parameters());
            }
            tail.extend(self.ln_post.parameters());
            groups.push(tail);
        }
        if let Some(proj) = &self.proj {
            groups.push(vec![proj.clone()]);
        }
        groups
    }

    /// Freeze the tower, then unfreeze the last `unlocked_groups` groups
    pub fn lock(&mut self, unlocked_groups: usize) {
        self.set_requires_grad(false);
        let groups = self.lock_groups();
        let start = groups.len().saturating_sub(unlocked_groups);
        for t in groups[start..].iter().flatten() {
            t.borrow_mut().requires_grad = true;
        }
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.transformer.set_grad_checkpointing(enable);
    }
}

impl Module for VisionTransformer {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("class_embedding", &self.class_embedding, TensorKind::Parameter);
        f(
            "positional_embedding",
            &self.positional_embedding,
            TensorKind::Parameter,
        );
        if let Some(proj) = &self.proj {
            f("proj", proj, TensorKind::Parameter);
        }
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        if let Some(ln) = &self.patchnorm_pre_ln {
            f("patchnorm_pre_ln", ln);
        }
        match &self.conv1 {
            PatchEmbed::Conv(c) => f("conv1", c),
            PatchEmbed::Linear(l) => f("conv1", l),
        }
        f("patch_dropout", &self.patch_dropout);
        f("ln_pre", &self.ln_pre);
        f("transformer", &self.transformer);
        if let Some(pool) = &self.attn_pool {
            f("attn_pool", pool);
        }
        f("ln_post", &self.ln_post);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        if let Some(ln) = &mut self.patchnorm_pre_ln {
            f("patchnorm_pre_ln", ln);
        }
        match &mut self.conv1 {
            PatchEmbed::Conv(c) => f("conv1", c),
            PatchEmbed::Linear(l) => f("conv1", l),
        }
        f("patch_dropout", &mut self.patch_dropout);
        f("ln_pre", &mut self.ln_pre);
        f("transformer", &mut self.transformer);
        if let Some(pool) = &mut self.attn_pool {
            f("attn_pool", pool);
        }
        f("ln_post", &mut self.ln_post);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::config::ImageSize;
    use crate::tensor::manual_seed;

    fn tiny_cfg() -> VisionConfig {
        VisionConfig {
            width: 8,
            head_width: 4,
            patch_size: 4,
            image_size: ImageSize::Square(8),
            ..VisionConfig::default()
        }
    }

    fn tiny(cfg: &VisionConfig, head: VisionHead) -> VisionTransformer {
        VisionTransformer::new(cfg, 2, 2, 6, &BlockOptions::default(), head).unwrap()
    }

    #[test]
    fn test_pooled_forward_shape() {
        manual_seed(0);
        let vit = tiny(&tiny_cfg(), VisionHead::Pooled);
        assert_eq!(vit.grid_size, (2, 2));
        let image = RawTensor::randn(&[2, 3, 8, 8]);
        let (pooled, tokens) = vit.forward_with_tokens(&image);
        assert_eq!(pooled.shape(), vec![2, 6]);
        assert_eq!(tokens.shape(), vec![2, 4, 8]);
    }

    #[test]
    fn test_token_head_has_no_projection() {
        let vit = tiny(&tiny_cfg(), VisionHead::Tokens);
        assert!(!vit.state_dict().contains_key("proj"));
        let out = vit.forward(&RawTensor::randn(&[1, 3, 8, 8]));
        assert_eq!(out.shape(), vec![1, 5, 8]);
    }

    #[test]
    fn test_patchnorm_and_attentional_pool() {
        let cfg = VisionConfig {
            input_patchnorm: true,
            attentional_pool: true,
            n_queries: 3,
            attn_pooler_heads: 2,
            global_average_pool: true,
            ..tiny_cfg()
        };
        let vit = tiny(&cfg, VisionHead::Pooled);
        let sd = vit.state_dict();
        assert_eq!(sd["conv1.weight"].shape, vec![8, 48]);
        assert_eq!(sd["proj"].shape, vec![6, 6]);
        assert_eq!(sd["attn_pool.query"].shape, vec![3, 6]);
        let out = vit.forward(&RawTensor::randn(&[2, 3, 8, 8]));
        assert_eq!(out.shape(), vec![2, 6]);
    }

    #[test]
    fn test_rejects_partial_patches() {
        let cfg = VisionConfig {
            image_size: ImageSize::Square(10),
            ..tiny_cfg()
        };
        let built =
            VisionTransformer::new(&cfg, 1, 2, 6, &BlockOptions::default(), VisionHead::Pooled);
        assert!(built.is_err());
    }

    #[test]
    fn test_patch_dropout_keeps_class_token() {
        manual_seed(3);
        let drop = PatchDropout::new(0.5);
        let x = RawTensor::new((0..10).map(|v| v as f32).collect(), &[1, 5, 2], false);
        let y = drop.forward(&x);
        assert_eq!(y.shape(), vec![1, 3, 2]);
        assert_eq!(&y.to_vec()[..2], &[0.0, 1.0]);
    }

    #[test]
    fn test_lock_groups() {
        let mut vit = tiny(&tiny_cfg(), VisionHead::Pooled);
        vit.lock(0);
        assert!(vit.parameters().iter().all(|p| !p.borrow().requires_grad));

        vit.lock(2);
        assert!(vit.proj.as_ref().unwrap().borrow().requires_grad);
        assert!(vit.ln_post.weight.borrow().requires_grad);
        assert!(vit.transformer.resblocks[1].ln_1.weight.borrow().requires_grad);
        assert!(!vit.transformer.resblocks[0].ln_1.weight.borrow().requires_grad);
        assert!(!vit.class_embedding.borrow().requires_grad);

        vit.lock(10);
        assert!(vit.parameters().iter().all(|p| p.borrow().requires_grad));
    }
}
