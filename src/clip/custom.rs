//! The composite with separately namespaced towers, and model building
//! from a [`ModelConfig`].

use crate::clip::backbone::BackboneRegistry;
use crate::clip::config::{ModelConfig, TextConfig, VisionConfig};
use crate::clip::model::{Clip, ClipOptions, ClipOutput, EncodeOptions, finish, init_logit_scale};
use crate::clip::precision::Precision;
use crate::clip::tower::{TextTower, TowerMode, VisionTower, build_text_tower, build_vision_tower};
use crate::error::{ClipError, Result};
use crate::nn::{Module, TensorKind};
use crate::tensor::{Tensor, TensorOps};

/// Image tower under `visual.*` and text tower under `text.*`
pub struct CustomTextClip {
    pub visual: VisionTower,
    pub text: TextTower,
    pub logit_scale: Tensor,
    pub output_dict: bool,
}

impl CustomTextClip {
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
        if opts.sparo.is_some() || opts.codebook.is_some() || opts.bottleneck_dim.is_some() {
            return Err(ClipError::Config(
                "structured, codebook and bottleneck options need the flattened text layout".into(),
            ));
        }
        let tower_opts = opts.tower_options(TowerMode::Standard);
        Ok(CustomTextClip {
            visual: build_vision_tower(embed_dim, vision_cfg, &tower_opts, registry)?,
            text: build_text_tower(embed_dim, text_cfg, &tower_opts, registry)?,
            logit_scale: init_logit_scale(),
            output_dict: opts.output_dict,
        })
    }

    pub fn encode_image(&self, image: &Tensor, normalize: bool) -> Tensor {
        finish(self.visual.forward(image).features, None, normalize)
    }

    pub fn encode_text(&self, text: &Tensor, normalize: bool) -> Tensor {
        finish(self.text.forward(text).features, None, normalize)
    }

    pub fn forward(&self, image: Option<&Tensor>, text: Option<&Tensor>) -> ClipOutput {
        ClipOutput::new(
            self.output_dict,
            image.map(|x| self.encode_image(x, true)),
            text.map(|x| self.encode_text(x, true)),
            self.logit_scale.exp(),
        )
    }

    pub fn lock_image_tower(&mut self, unlocked_groups: usize, freeze_bn_stats: bool) -> Result<()> {
        self.visual.lock(unlocked_groups, freeze_bn_stats)
    }

    pub fn lock_text_tower(&mut self, unlocked_layers: usize, freeze_layer_norm: bool) {
        self.text.lock(unlocked_layers, freeze_layer_norm);
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        self.visual.set_grad_checkpointing(enable);
        self.text.set_grad_checkpointing(enable);
    }
}

impl Module for CustomTextClip {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        f("logit_scale", &self.logit_scale, TensorKind::Parameter);
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        f("visual", &self.visual);
        f("text", &self.text);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        f("visual", &mut self.visual);
        f("text", &mut self.text);
    }
}

/// Either composite layout
pub enum ClipModel {
    Clip(Clip),
    Custom(CustomTextClip),
}

impl ClipModel {
    fn module(&self) -> &dyn Module {
        match self {
            ClipModel::Clip(m) => m,
            ClipModel::Custom(m) => m,
        }
    }

    fn module_mut(&mut self) -> &mut dyn Module {
        match self {
            ClipModel::Clip(m) => m,
            ClipModel::Custom(m) => m,
        }
    }

    pub fn encode_image(&self, image: &Tensor, normalize: bool) -> Result<Tensor> {
        match self {
            ClipModel::Clip(m) => {
                let opts = EncodeOptions {
                    normalize,
                    ..EncodeOptions::default()
                };
                Ok(m.encode_image(image, opts)?.features)
            }
            ClipModel::Custom(m) => Ok(m.encode_image(image, normalize)),
        }
    }

    pub fn encode_text(&self, text: &Tensor, normalize: bool) -> Result<Tensor> {
        match self {
            ClipModel::Clip(m) => {
                let opts = EncodeOptions {
                    normalize,
                    ..EncodeOptions::default()
                };
                Ok(m.encode_text(text, opts)?.features)
            }
            ClipModel::Custom(m) => Ok(m.encode_text(text, normalize)),
        }
    }

    pub fn forward(&self, image: Option<&Tensor>, text: Option<&Tensor>) -> Result<ClipOutput> {
        match self {
            ClipModel::Clip(m) => m.forward(image, text),
            ClipModel::Custom(m) => Ok(m.forward(image, text)),
        }
    }

    pub fn lock_image_tower(&mut self, unlocked_groups: usize, freeze_bn_stats: bool) -> Result<()> {
        match self {
            ClipModel::Clip(m) => m.lock_image_tower(unlocked_groups, freeze_bn_stats),
            ClipModel::Custom(m) => m.lock_image_tower(unlocked_groups, freeze_bn_stats),
        }
    }

    pub fn set_grad_checkpointing(&mut self, enable: bool) {
        match self {
            ClipModel::Clip(m) => m.set_grad_checkpointing(enable),
            ClipModel::Custom(m) => m.set_grad_checkpointing(enable),
        }
    }
}

impl Module for ClipModel {
    fn own_tensors(&self, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        self.module().own_tensors(f);
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&str, &dyn Module)) {
        self.module().for_each_child(f);
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&str, &mut dyn Module)) {
        self.module_mut().for_each_child_mut(f);
    }

    fn train(&mut self, mode: bool) {
        self.module_mut().train(mode);
    }
}

impl ModelConfig {
    /// Build the model this config describes and convert it to `precision`
    pub fn build(&self, precision: Precision) -> Result<ClipModel> {
        self.build_with_registry(precision, &BackboneRegistry::default())
    }

    /// A named text backbone always uses the separate text layout.
    pub fn build_with_registry(
        &self,
        precision: Precision,
        registry: &BackboneRegistry,
    ) -> Result<ClipModel> {
        self.validate()?;
        let opts = ClipOptions::from_config(self, precision.cast_dtype());
        let custom = self.custom_text || self.text_cfg.hf_model_name.is_some();
        let model = if custom {
            ClipModel::Custom(CustomTextClip::with_registry(
                self.embed_dim,
                &self.vision_cfg,
                &self.text_cfg,
                &opts,
                registry,
            )?)
        } else {
            ClipModel::Clip(Clip::with_registry(
                self.embed_dim,
                &self.vision_cfg,
                &self.text_cfg,
                &opts,
                registry,
            )?)
        };
        precision.apply(&model)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::config::{ImageSize, SparoConfig, VisionLayers};
    use crate::dtype::DType;
    use crate::tensor::RawTensor;

    fn config(custom_text: bool) -> ModelConfig {
        ModelConfig {
            embed_dim: 6,
            vision_cfg: VisionConfig {
                layers: VisionLayers::Uniform(2),
                width: 16,
                head_width: 8,
                patch_size: 4,
                image_size: ImageSize::Square(8),
                ..VisionConfig::default()
            },
            text_cfg: TextConfig {
                context_length: 5,
                vocab_size: 12,
                width: 8,
                heads: 2,
                layers: 3,
                ..TextConfig::default()
            },
            custom_text,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_custom_text_namespace() {
        let model = config(true).build(Precision::Fp32).unwrap();
        assert!(matches!(model, ClipModel::Custom(_)));
        let sd = model.state_dict();
        assert!(sd.contains_key("text.token_embedding.weight"));
        assert!(sd.contains_key("text.text_projection"));
        assert!(sd.contains_key("visual.proj"));
        assert!(!sd.contains_key("token_embedding.weight"));

        let ids = RawTensor::new(vec![1.0, 2.0, 11.0, 0.0, 0.0], &[1, 5], false);
        let out = model.forward(None, Some(&ids)).unwrap();
        assert_eq!(out.text_features().unwrap().shape(), vec![1, 6]);
    }

    #[test]
    fn test_lock_text_tower_keeps_tail_trainable() {
        let ClipModel::Custom(mut model) = config(true).build(Precision::Fp32).unwrap() else {
            panic!("expected the custom text layout");
        };
        model.lock_text_tower(2, false);
        let params = model.named_parameters();
        let trainable = |key: &str| {
            params
                .iter()
                .find(|(n, _)| n == key)
                .map(|(_, p)| p.borrow().requires_grad)
        };
        assert_eq!(trainable("text.token_embedding.weight"), Some(false));
        assert_eq!(trainable("text.transformer.resblocks.0.mlp.c_fc.weight"), Some(false));
        assert_eq!(trainable("text.transformer.resblocks.0.ln_1.weight"), Some(true));
        assert_eq!(trainable("text.transformer.resblocks.1.mlp.c_fc.weight"), Some(true));
        assert_eq!(trainable("visual.proj"), Some(true));
    }

    #[test]
    fn test_fp16_build_converts_projections_only() {
        let model = config(false).build(Precision::Fp16).unwrap();
        let sd = model.state_dict();
        assert_eq!(sd["text_projection"].dtype, DType::F16);
        assert_eq!(sd["visual.proj"].dtype, DType::F16);
        assert_eq!(sd["visual.conv1.weight"].dtype, DType::F16);
        assert_eq!(sd["ln_final.weight"].dtype, DType::F32);
        assert_eq!(sd["logit_scale"].dtype, DType::F32);
        assert_eq!(sd["positional_embedding"].dtype, DType::F32);
    }

    #[test]
    fn test_custom_text_rejects_sparo() {
        let cfg = ModelConfig {
            sparo: Some(SparoConfig::default()),
            ..config(true)
        };
        assert!(matches!(cfg.build(Precision::Fp32), Err(ClipError::Config(_))));
    }
}
