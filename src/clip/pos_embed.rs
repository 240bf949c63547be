use crate::clip::tower::VisionTower;
use crate::error::{ClipError, Result};
use crate::io::{StateDict, TensorData};
use crate::ops::InterpolationMode;
use crate::tensor::{RawTensor, TensorOps};
use tracing::info;

const POS_EMBED_KEY: &str = "visual.positional_embedding";

/// Leading rows that are not part of the patch grid
const PREFIX_TOKENS: usize = 1;

/// Resample `visual.positional_embedding` in `state` to the grid of `visual`.
///
/// The class-token row is kept as is; the square patch grid behind it is
/// interpolated to the target grid. Does nothing when the key is absent, the
/// tower has no patch grid, or the row count already matches.
pub fn resize_pos_embed(
    state: &mut StateDict,
    visual: &VisionTower,
    interpolation: InterpolationMode,
    antialias: bool,
) -> Result<()> {
    let Some(old) = state.get(POS_EMBED_KEY) else {
        return Ok(());
    };
    let Some(grid) = visual.grid_size() else {
        return Ok(());
    };
    let new_len = grid.0 * grid.1 + PREFIX_TOKENS;
    let (rows, width) = match old.shape.as_slice() {
        [rows, width] => (*rows, *width),
        other => {
            return Err(ClipError::Config(format!(
                "{POS_EMBED_KEY} must be 2-D, got shape {other:?}"
            )));
        }
    };
    if rows == new_len {
        return Ok(());
    }
    old.check_len(POS_EMBED_KEY)?;

    let cells = rows.saturating_sub(PREFIX_TOKENS);
    let side = (cells as f64).sqrt() as usize;
    if side * side != cells || side == 0 {
        return Err(ClipError::Config(format!(
            "{POS_EMBED_KEY} has {cells} grid rows, which is not a square grid"
        )));
    }
    info!(from = ?(side, side), to = ?grid, "resizing position embedding grid");

    let split = PREFIX_TOKENS * width;
    let img = RawTensor::from_raw(old.data[split..].to_vec(), &[1, side, side, width], old.dtype)
        .permute(&[0, 3, 1, 2]);
    let img = RawTensor::interpolate2d(&img, grid, interpolation, antialias).permute(&[0, 2, 3, 1]);

    let mut data = old.data[..split].to_vec();
    data.extend(img.to_vec());
    let resized = TensorData::new(data, &[new_len, width], old.dtype);
    state.insert(POS_EMBED_KEY.to_string(), resized);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::backbone::BackboneRegistry;
    use crate::clip::config::{ImageSize, VisionConfig, VisionLayers};
    use crate::clip::tower::{TowerOptions, build_vision_tower};
    use crate::dtype::DType;

    fn tower(image: usize) -> VisionTower {
        let cfg = VisionConfig {
            layers: VisionLayers::Uniform(1),
            width: 4,
            head_width: 2,
            patch_size: 2,
            image_size: ImageSize::Square(image),
            ..VisionConfig::default()
        };
        build_vision_tower(3, &cfg, &TowerOptions::default(), &BackboneRegistry::default()).unwrap()
    }

    fn pos_embed(rows: usize) -> StateDict {
        let data = (0..rows * 4).map(|v| v as f32 * 0.25).collect();
        let mut state = StateDict::new();
        state.insert(POS_EMBED_KEY.into(), TensorData::new(data, &[rows, 4], DType::F32));
        state
    }

    #[test]
    fn test_same_grid_is_untouched() {
        let mut state = pos_embed(5);
        let before = state.clone();
        resize_pos_embed(&mut state, &tower(4), InterpolationMode::Bicubic, true).unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn test_upsample_keeps_class_row() {
        let mut state = pos_embed(5);
        let class_row = state[POS_EMBED_KEY].data[..4].to_vec();
        resize_pos_embed(&mut state, &tower(8), InterpolationMode::Bilinear, false).unwrap();
        let resized = &state[POS_EMBED_KEY];
        assert_eq!(resized.shape, vec![17, 4]);
        assert_eq!(resized.data[..4], class_row[..]);
    }

    #[test]
    fn test_missing_key_is_noop() {
        let mut state = StateDict::new();
        resize_pos_embed(&mut state, &tower(8), InterpolationMode::Bicubic, true).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_truncated_table_is_an_error() {
        let mut state = pos_embed(5);
        state.get_mut(POS_EMBED_KEY).unwrap().data.truncate(12);
        let err = resize_pos_embed(&mut state, &tower(8), InterpolationMode::Bicubic, true);
        assert!(matches!(err, Err(ClipError::InvalidParameter(_))));
    }
}
