//! 2-D spatial resampling over `[N, C, H, W]` tensors.
//!
//! Sampling follows the half-pixel (`align_corners = false`) convention.
//! Antialiased bilinear/bicubic widen the filter support when downsampling,
//! so every input pixel contributes to some output pixel.

use crate::{RawTensor, Tensor};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMode {
    Nearest,
    Bilinear,
    #[default]
    Bicubic,
}

impl std::str::FromStr for InterpolationMode {
    type Err = crate::ClipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nearest" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            "bicubic" => Ok(Self::Bicubic),
            other => Err(crate::ClipError::Config(format!(
                "unknown interpolation mode '{other}'"
            ))),
        }
    }
}

/// One output position: the input indices it reads and their weights.
struct Tap {
    indices: Vec<usize>,
    weights: Vec<f32>,
}

fn cubic_conv1(x: f64, a: f64) -> f64 {
    ((a + 2.0) * x - (a + 3.0)) * x * x + 1.0
}

fn cubic_conv2(x: f64, a: f64) -> f64 {
    ((a * x - 5.0 * a) * x + 8.0 * a) * x - 4.0 * a
}

/// Keys cubic kernel evaluated at distance `x`
fn cubic_filter(x: f64, a: f64) -> f64 {
    let x = x.abs();
    if x < 1.0 {
        cubic_conv1(x, a)
    } else if x < 2.0 {
        cubic_conv2(x, a)
    } else {
        0.0
    }
}

fn triangle_filter(x: f64) -> f64 {
    let x = x.abs();
    if x < 1.0 { 1.0 - x } else { 0.0 }
}

fn nearest_taps(in_size: usize, out_size: usize) -> Vec<Tap> {
    let scale = in_size as f64 / out_size as f64;
    (0..out_size)
        .map(|o| {
            let src = ((o as f64 * scale).floor() as usize).min(in_size - 1);
            Tap {
                indices: vec![src],
                weights: vec![1.0],
            }
        })
        .collect()
}

fn linear_taps(in_size: usize, out_size: usize) -> Vec<Tap> {
    let scale = in_size as f64 / out_size as f64;
    (0..out_size)
        .map(|o| {
            let src = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (src.floor() as usize).min(in_size - 1);
            let i1 = (i0 + 1).min(in_size - 1);
            let lambda = (src - i0 as f64) as f32;
            Tap {
                indices: vec![i0, i1],
                weights: vec![1.0 - lambda, lambda],
            }
        })
        .collect()
}

fn cubic_taps(in_size: usize, out_size: usize) -> Vec<Tap> {
    const A: f64 = -0.75;
    let scale = in_size as f64 / out_size as f64;
    let last = in_size as i64 - 1;
    (0..out_size)
        .map(|o| {
            let src = (o as f64 + 0.5) * scale - 0.5;
            let base = src.floor();
            let t = src - base;
            let base = base as i64;
            let indices = (-1..=2)
                .map(|d| (base + d).clamp(0, last) as usize)
                .collect();
            let weights = vec![
                cubic_conv2(t + 1.0, A) as f32,
                cubic_conv1(t, A) as f32,
                cubic_conv1(1.0 - t, A) as f32,
                cubic_conv2(2.0 - t, A) as f32,
            ];
            Tap { indices, weights }
        })
        .collect()
}

/// Antialiased taps with a filter whose support scales with the downsampling ratio
fn antialias_taps(in_size: usize, out_size: usize, mode: InterpolationMode) -> Vec<Tap> {
    let (half_support, filter): (f64, fn(f64) -> f64) = match mode {
        InterpolationMode::Bicubic => (2.0, |x| cubic_filter(x, -0.5)),
        _ => (1.0, triangle_filter),
    };
    let scale = in_size as f64 / out_size as f64;
    let (support, invscale) = if scale >= 1.0 {
        (half_support * scale, 1.0 / scale)
    } else {
        (half_support, 1.0)
    };

    (0..out_size)
        .map(|o| {
            let center = scale * (o as f64 + 0.5);
            let xmin = ((center - support + 0.5).floor().max(0.0)) as usize;
            let xmax = ((center + support + 0.5).floor() as usize).min(in_size);
            let mut indices = Vec::with_capacity(xmax.saturating_sub(xmin));
            let mut raw = Vec::with_capacity(indices.capacity());
            for j in xmin..xmax {
                indices.push(j);
                raw.push(filter((j as f64 - center + 0.5) * invscale));
            }
            let total: f64 = raw.iter().sum();
            let weights = raw
                .iter()
                .map(|w| if total != 0.0 { (w / total) as f32 } else { 0.0 })
                .collect();
            Tap { indices, weights }
        })
        .collect()
}

fn taps(in_size: usize, out_size: usize, mode: InterpolationMode, antialias: bool) -> Vec<Tap> {
    match (mode, antialias) {
        (InterpolationMode::Nearest, _) => nearest_taps(in_size, out_size),
        (_, true) => antialias_taps(in_size, out_size, mode),
        (InterpolationMode::Bilinear, false) => linear_taps(in_size, out_size),
        (InterpolationMode::Bicubic, false) => cubic_taps(in_size, out_size),
    }
}

impl RawTensor {
    /// Resize the two trailing spatial axes of an `[N, C, H, W]` tensor.
    ///
    /// The filter is applied separably: first along H, then along W.
    pub fn interpolate2d(
        self_t: &Tensor,
        size: (usize, usize),
        mode: InterpolationMode,
        antialias: bool,
    ) -> Tensor {
        let s = self_t.borrow();
        assert_eq!(s.shape.len(), 4, "interpolate2d expects [N, C, H, W]");
        let (planes, in_h, in_w) = (s.shape[0] * s.shape[1], s.shape[2], s.shape[3]);
        let (out_h, out_w) = size;
        assert!(out_h > 0 && out_w > 0, "interpolate2d target must be non-empty");

        let rows = taps(in_h, out_h, mode, antialias);
        let cols = taps(in_w, out_w, mode, antialias);

        let mut out = vec![0.0; planes * out_h * out_w];
        let mut tmp = vec![0.0; out_h * in_w];
        for p in 0..planes {
            let plane = &s.data[p * in_h * in_w..(p + 1) * in_h * in_w];
            for (oy, tap) in rows.iter().enumerate() {
                let dst = &mut tmp[oy * in_w..(oy + 1) * in_w];
                dst.fill(0.0);
                for (&iy, &w) in tap.indices.iter().zip(&tap.weights) {
                    for (d, &v) in dst.iter_mut().zip(&plane[iy * in_w..(iy + 1) * in_w]) {
                        *d += w * v;
                    }
                }
            }
            let dst_plane = &mut out[p * out_h * out_w..(p + 1) * out_h * out_w];
            for oy in 0..out_h {
                let row = &tmp[oy * in_w..(oy + 1) * in_w];
                for (ox, tap) in cols.iter().enumerate() {
                    dst_plane[oy * out_w + ox] = tap
                        .indices
                        .iter()
                        .zip(&tap.weights)
                        .map(|(&ix, &w)| w * row[ix])
                        .sum();
                }
            }
        }

        Self::from_raw(out, &[s.shape[0], s.shape[1], out_h, out_w], s.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorOps;

    fn grid(h: usize, w: usize) -> Tensor {
        RawTensor::new((0..h * w).map(|i| i as f32).collect(), &[1, 1, h, w], false)
    }

    #[test]
    fn test_identity_size_preserves_values() {
        let g = grid(4, 4);
        for mode in [InterpolationMode::Nearest, InterpolationMode::Bilinear] {
            for aa in [false, true] {
                let out = RawTensor::interpolate2d(&g, (4, 4), mode, aa);
                for (a, b) in out.to_vec().iter().zip(g.to_vec()) {
                    assert!((a - b).abs() < 1e-5, "{mode:?} aa={aa}");
                }
            }
        }
    }

    #[test]
    fn test_nearest_upsample_repeats() {
        let g = grid(2, 2);
        let out = RawTensor::interpolate2d(&g, (4, 4), InterpolationMode::Nearest, false);
        assert_eq!(&out.to_vec()[..4], &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_bilinear_downsample_averages_with_antialias() {
        let g = grid(2, 2);
        let out = RawTensor::interpolate2d(&g, (1, 1), InterpolationMode::Bilinear, true);
        assert!((out.to_vec()[0] - 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_constant_field_stays_constant() {
        let g = RawTensor::full(3.0, &[1, 2, 5, 5]);
        for aa in [false, true] {
            let out = RawTensor::interpolate2d(&g, (7, 3), InterpolationMode::Bicubic, aa);
            assert_eq!(out.shape(), vec![1, 2, 7, 3]);
            assert!(out.to_vec().iter().all(|v| (v - 3.0).abs() < 1e-4));
        }
    }
}
