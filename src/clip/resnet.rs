//! Modified ResNet: three-conv stem, anti-aliased strided bottlenecks and an
//! attention-pooling head.

use crate::clip::transformer::fill_normal;
use crate::error::{ClipError, Result};
use crate::nn::layers::attention::scaled_dot_product_attention;
use crate::nn::{AvgPool2d, BatchNorm2d, Conv2d, Linear, Module, TensorKind};
use crate::ops::cat;
use crate::tensor::{RawTensor, Tensor, TensorOps};

pub struct Bottleneck {
    pub conv1: Conv2d,
    pub bn1: BatchNorm2d,
    pub conv2: Conv2d,
    pub bn2: BatchNorm2d,
    pub avgpool: Option<AvgPool2d>,
    pub conv3: Conv2d,
    pub bn3: BatchNorm2d,
    /// `(pool, conv, bn)` registered as `downsample.{-1,0,1}`
    pub downsample: Option<(Option<AvgPool2d>, Conv2d, BatchNorm2d)>,
}

impl Bottleneck {
    pub const EXPANSION: usize = 4;

    pub fn new(inplanes: usize, planes: usize, stride: usize) -> Self {
        let out = planes * Self::EXPANSION;
        let pool = |s: usize| (s > 1).then(|| AvgPool2d::new(s));
        let downsample = (stride > 1 || inplanes != out).then(|| {
            (
                pool(stride),
                Conv2d::new(inplanes, out, 1, 1, 0, false),
                BatchNorm2d::new(out),
            )
        });
        Bottleneck {
            conv1: Conv2d::new(inplanes, planes, 1, 1, 0, false),
            bn1: BatchNorm2d::new(planes),
            conv2: Conv2d::new(planes, planes, 3, 1, 1, false),
            bn2: BatchNorm2d::new(planes),
            avgpool: pool(stride),
            conv3: Conv2d::new(planes, out, 1, 1, 0, false),
            bn3: BatchNorm2d::new(out),
            downsample,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let out = self.bn1.forward(&self.conv1.forward(x)).relu();
        let mut out = self.bn2.forward(&self.conv2.forward(&out)).relu();
        if let Some(pool) = &self.avgpool {
            out = pool.forward(&out);
        }
        let out = self.bn3.forward(&self.conv3.forward(&out));

        let identity = match &self.downsample {
            Some((pool, conv, bn)) => {
                let x = match pool {
                    Some(p) => p.forward(x),
                    None => x.clone(),
                };
                bn.forward(&conv.forward(&x))
            }
            None => x.clone(),
        };
        out.add(&identity).relu()
    }

    fn batch_norms(&mut self) -> Vec<&mut BatchNorm2d> {
        let mut bns = vec![&mut self.bn1, &mut self.bn2, &mut self.bn3];
        if let Some((_, _, bn)) = &mut self.downsample {
            bns.push(bn);
        }
        bns
    }
}

impl Module for Bottleneck {
    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("conv1", &self.conv1);
        f("bn1", &self.bn1);
        f("conv2", &self.conv2);
        f("bn2", &self.bn2);
        f("conv3", &self.conv3);
        f("bn3", &self.bn3);
        if let Some((_, conv, bn)) = &self.downsample {
            f("downsample.0", conv);
            f("downsample.1", bn);
        }
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("conv1", &mut self.conv1);
        f("bn1", &mut self.bn1);
        f("conv2", &mut self.conv2);
        f("bn2", &mut self.bn2);
        f("conv3", &mut self.conv3);
        f("bn3", &mut self.bn3);
        if let Some((_, conv, bn)) = &mut self.downsample {
            f("downsample.0", conv);
            f("downsample.1", bn);
        }
    }
}

/// Single-query attention pooling over a `[B, C, H, W]` feature map.
///
/// The query is the spatial mean token, prepended to the flattened map.
pub struct AttentionPool2d {
    pub positional_embedding: Tensor,
    pub k_proj: Linear,
    pub q_proj: Linear,
    pub v_proj: Linear,
    pub c_proj: Linear,
    pub num_heads: usize,
}

impl AttentionPool2d {
    pub fn new(spacial_dim: usize, embed_dim: usize, num_heads: usize, output_dim: usize) -> Self {
        let pos = RawTensor::randn_scaled(
            &[spacial_dim * spacial_dim + 1, embed_dim],
            1.0 / (embed_dim as f32).sqrt(),
        );
        AttentionPool2d {
            positional_embedding: RawTensor::parameter(pos),
            k_proj: Linear::new(embed_dim, embed_dim, true),
            q_proj: Linear::new(embed_dim, embed_dim, true),
            v_proj: Linear::new(embed_dim, embed_dim, true),
            c_proj: Linear::new(embed_dim, output_dim, true),
            num_heads,
        }
    }

    pub fn embed_dim(&self) -> usize {
        self.q_proj.in_features()
    }

    /// `[B, C, H, W]` → `[B, output_dim]`
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let s = x.shape();
        let (b, c, hw) = (s[0], s[1], s[2] * s[3]);
        let x = x.reshape(&[b, c, hw]).permute(&[0, 2, 1]);
        let x = cat(&[x.mean_dim(1, true), x], 1).add(&self.positional_embedding);

        let h = self.num_heads;
        let dh = c / h;
        let split = |t: Tensor, n: usize| t.reshape(&[b, n, h, dh]).permute(&[0, 2, 1, 3]);
        let q = split(self.q_proj.forward(&x.narrow(1, 0, 1)), 1);
        let k = split(self.k_proj.forward(&x), hw + 1);
        let v = split(self.v_proj.forward(&x), hw + 1);
        let (out, _) = scaled_dot_product_attention(&q, &k, &v, None);
        let out = out.permute(&[0, 2, 1, 3]).reshape(&[b, c]);
        self.c_proj.forward(&out)
    }

    fn init_weights(&self) {
        let std = (self.c_proj.in_features() as f32).powf(-0.5);
        for proj in [&self.q_proj, &self.k_proj, &self.v_proj, &self.c_proj] {
            fill_normal(&proj.weight, std);
        }
    }
}

impl Module for AttentionPool2d {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f(
            "positional_embedding",
            &self.positional_embedding,
            TensorKind::Parameter,
        );
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("k_proj", &self.k_proj);
        f("q_proj", &self.q_proj);
        f("v_proj", &self.v_proj);
        f("c_proj", &self.c_proj);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("k_proj", &mut self.k_proj);
        f("q_proj", &mut self.q_proj);
        f("v_proj", &mut self.v_proj);
        f("c_proj", &mut self.c_proj);
    }
}

pub struct ModifiedResNet {
    pub image_size: usize,
    pub output_dim: usize,
    pub conv1: Conv2d,
    pub bn1: BatchNorm2d,
    pub conv2: Conv2d,
    pub bn2: BatchNorm2d,
    pub conv3: Conv2d,
    pub bn3: BatchNorm2d,
    pub avgpool: AvgPool2d,
    /// `layer1..layer4`
    pub stages: [Vec<Bottleneck>; 4],
    pub attnpool: AttentionPool2d,
    grad_checkpointing: bool,
}

impl ModifiedResNet {
    pub fn new(
        layers: [usize; 4],
        output_dim: usize,
        heads: usize,
        image_size: usize,
        width: usize,
    ) -> Self {
        let half = width / 2;
        let mut inplanes = width;
        let mut stage = |planes: usize, blocks: usize, stride: usize| {
            let mut out = vec![Bottleneck::new(inplanes, planes, stride)];
            inplanes = planes * Bottleneck::EXPANSION;
            out.extend((1..blocks).map(|_| Bottleneck::new(inplanes, planes, 1)));
            out
        };
        let stages = [
            stage(width, layers[0], 1),
            stage(width * 2, layers[1], 2),
            stage(width * 4, layers[2], 2),
            stage(width * 8, layers[3], 2),
        ];
        let embed_dim = width * 32;

        let model = ModifiedResNet {
            image_size,
            output_dim,
            conv1: Conv2d::new(3, half, 3, 2, 1, false),
            bn1: BatchNorm2d::new(half),
            conv2: Conv2d::new(half, half, 3, 1, 1, false),
            bn2: BatchNorm2d::new(half),
            conv3: Conv2d::new(half, width, 3, 1, 1, false),
            bn3: BatchNorm2d::new(width),
            avgpool: AvgPool2d::new(2),
            stages,
            attnpool: AttentionPool2d::new(image_size / 32, embed_dim, heads, output_dim),
            grad_checkpointing: false,
        };
        model.attnpool.init_weights();
        for block in model.stages.iter().flatten() {
            block.bn3.weight.borrow_mut().data.fill(0.0);
        }
        model
    }

    fn stem(&self, x: &Tensor) -> Tensor {
        let x = self.bn1.forward(&self.conv1.forward(x)).relu();
        let x = self.bn2.forward(&self.conv2.forward(&x)).relu();
        let x = self.bn3.forward(&self.conv3.forward(&x)).relu();
        self.avgpool.forward(&x)
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let x = self
            .stages
            .iter()
            .flatten()
            .fold(self.stem(x), |x, block| block.forward(&x));
        self.attnpool.forward(&x)
    }

    /// Freeze the whole tower. Partial unlocking is not supported.
    pub fn lock(&mut self, unlocked_groups: usize, freeze_bn_stats: bool) -> Result<()> {
        if unlocked_groups != 0 {
            return Err(ClipError::Unsupported(
                "partial locking of the residual tower".into(),
            ));
        }
        self.set_requires_grad(false);
        if freeze_bn_stats {
            for bn in [&mut self.bn1, &mut self.bn2, &mut self.bn3] {
                bn.freeze();
            }
            for block in self.stages.iter_mut().flatten() {
                for bn in block.batch_norms() {
                    bn.freeze();
                }
            }
        }
        Ok(())
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.grad_checkpointing = enable;
    }

    pub fn grad_checkpointing(&self) -> bool {
        self.grad_checkpointing
    }
}

impl Module for ModifiedResNet {
    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("conv1", &self.conv1);
        f("bn1", &self.bn1);
        f("conv2", &self.conv2);
        f("bn2", &self.bn2);
        f("conv3", &self.conv3);
        f("bn3", &self.bn3);
        for (s, stage) in self.stages.iter().enumerate() {
            for (i, block) in stage.iter().enumerate() {
                f(&format!("layer{}.{i}", s + 1), block);
            }
        }
        f("attnpool", &self.attnpool);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("conv1", &mut self.conv1);
        f("bn1", &mut self.bn1);
        f("conv2", &mut self.conv2);
        f("bn2", &mut self.bn2);
        f("conv3", &mut self.conv3);
        f("bn3", &mut self.bn3);
        for (s, stage) in self.stages.iter_mut().enumerate() {
            for (i, block) in stage.iter_mut().enumerate() {
                f(&format!("layer{}.{i}", s + 1), block);
            }
        }
        f("attnpool", &mut self.attnpool);
    }
}
