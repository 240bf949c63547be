//! Dual-encoder model assembly: configs, towers, composites and checkpoint
//! adaptation.

pub mod backbone;
pub mod codebook;
pub mod config;
pub mod custom;
pub mod legacy;
pub mod model;
pub mod pos_embed;
pub mod precision;
pub mod resnet;
pub mod sparo;
pub mod text;
pub mod tower;
pub mod transformer;
pub mod vision;

pub use backbone::{BackboneRegistry, NamedTextTower, NamedVisionTower, TextTrunk, VisionTrunk};
pub use config::{
    CodebookConfig, HeadProjection, ImageSize, ModelConfig, SparoConfig, TextConfig, TextPooler,
    TrunkPool, VisionConfig, VisionLayers,
};
pub use custom::{ClipModel, CustomTextClip};
pub use legacy::{
    LegacyConfig, LegacyOptions, ShapeSource, build_from_legacy_dict,
    convert_to_custom_text_state_dict, infer_legacy_config,
};
pub use model::{Clip, ClipOptions, ClipOutput, EncodeOptions, Encoding};
pub use pos_embed::resize_pos_embed;
pub use precision::{Precision, cast_all, convert_weights_to_lp};
pub use sparo::{SlotRepresentation, SlotSpec, SlotWeighting, project_slots, slot_weights};
pub use tower::{
    TextTower, TowerMode, TowerOptions, TowerOutput, VisionTower, build_text_tower,
    build_vision_tower,
};
