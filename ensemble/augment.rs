//! # Test-Time Augmentation Sampler
//!
//! Randomized geometric transforms applied to every nodule volume before it reaches a
//! predictor. Each volume in a batch draws its own transform: a reflection along each
//! spatial axis with probability one half, a uniformly random permutation of the three
//! spatial axes, and optionally two small rotations about the (1, 0) and (2, 1) planes.
//!
//! Flips and permutations only rearrange voxels. Rotations resample with linear
//! interpolation; samples that fall outside the volume take the configured fill value,
//! which defaults to the density of air (-1000) so it blends with the surrounding scan.

use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Intensity used for rotated samples that land outside the source volume.
pub const OUTSIDE_VOLUME_DENSITY: f32 = -1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub flip: bool,
    pub permute: bool,
    pub rotate: bool,
    /// Rotation angles are drawn uniformly from `[-max, max]` degrees.
    pub max_rotation_degrees: f64,
    pub fill_value: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            flip: true,
            permute: true,
            rotate: false,
            max_rotation_degrees: 10.0,
            fill_value: OUTSIDE_VOLUME_DENSITY,
        }
    }
}

impl AugmentationConfig {
    /// A configuration that leaves every volume untouched.
    pub fn identity() -> Self {
        Self {
            flip: false,
            permute: false,
            rotate: false,
            ..Self::default()
        }
    }

    fn is_identity(&self) -> bool {
        !self.flip && !self.permute && !self.rotate
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AugmentError {
    #[error(
        "Axis permutation requires cubic nodule volumes, but a volume has spatial shape {0:?}."
    )]
    NonCubicVolume([usize; 3]),
}

/// A single sampled transform. Applied as: flips, then axis permutation, then rotations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeTransform {
    pub flips: [bool; 3],
    /// Output axis `i` reads input axis `axes[i]`.
    pub axes: [usize; 3],
    /// Angles in degrees for the (1, 0) and (2, 1) plane rotations.
    pub rotations: Option<[f64; 2]>,
}

impl VolumeTransform {
    pub fn identity() -> Self {
        Self {
            flips: [false; 3],
            axes: [0, 1, 2],
            rotations: None,
        }
    }

    pub fn sample<R: Rng + ?Sized>(config: &AugmentationConfig, rng: &mut R) -> Self {
        let mut flips = [false; 3];
        if config.flip {
            for flip in flips.iter_mut() {
                *flip = rng.gen_bool(0.5);
            }
        }

        let mut axes = [0, 1, 2];
        if config.permute {
            axes.shuffle(rng);
        }

        let rotations = if config.rotate {
            let limit = config.max_rotation_degrees.abs();
            Some([
                rng.gen_range(-limit..=limit),
                rng.gen_range(-limit..=limit),
            ])
        } else {
            None
        };

        Self {
            flips,
            axes,
            rotations,
        }
    }

    /// Returns a freshly allocated, transformed copy of `volume`.
    pub fn apply(&self, volume: ArrayView3<'_, f32>, fill_value: f32) -> Array3<f32> {
        let mut view = volume;
        for (axis, &flip) in self.flips.iter().enumerate() {
            if flip {
                view.invert_axis(Axis(axis));
            }
        }
        let mut out = view.permuted_axes(self.axes).to_owned();

        if let Some([first, second]) = self.rotations {
            out = rotate_plane(out.view(), first, (1, 0), fill_value);
            out = rotate_plane(out.view(), second, (2, 1), fill_value);
        }
        out
    }
}

/// Draws an independent [`VolumeTransform`] for every volume of a batch.
#[derive(Debug, Clone, Default)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    /// Perturbs a `[n, d, d, d]` batch. The input is never modified.
    pub fn perturb_batch<R: Rng + ?Sized>(
        &self,
        batch: ArrayView4<'_, f32>,
        rng: &mut R,
    ) -> Result<Array4<f32>, AugmentError> {
        if self.config.is_identity() {
            return Ok(batch.to_owned());
        }

        let (_, d0, d1, d2) = batch.dim();
        if self.config.permute && !(d0 == d1 && d1 == d2) {
            return Err(AugmentError::NonCubicVolume([d0, d1, d2]));
        }

        let mut out = Array4::zeros(batch.raw_dim());
        for (volume, mut target) in batch.outer_iter().zip(out.outer_iter_mut()) {
            let transform = VolumeTransform::sample(&self.config, rng);
            target.assign(&transform.apply(volume, self.config.fill_value));
        }
        Ok(out)
    }
}

/// Rotates `volume` by `degrees` within the plane spanned by `axes`, about the plane's
/// centre, keeping the output shape. Linear interpolation; samples further than half a
/// voxel outside the volume take `fill_value`, samples inside that band clamp to the edge.
fn rotate_plane(
    volume: ArrayView3<'_, f32>,
    degrees: f64,
    axes: (usize, usize),
    fill_value: f32,
) -> Array3<f32> {
    let shape = volume.dim();
    let dims = [shape.0, shape.1, shape.2];
    let (pa, qa) = axes;
    let (sin, cos) = degrees.to_radians().sin_cos();
    let centre_p = (dims[pa] as f64 - 1.0) / 2.0;
    let centre_q = (dims[qa] as f64 - 1.0) / 2.0;

    Array3::from_shape_fn(shape, |(i, j, k)| {
        let index = [i, j, k];
        let dp = index[pa] as f64 - centre_p;
        let dq = index[qa] as f64 - centre_q;
        let source_p = cos * dp + sin * dq + centre_p;
        let source_q = -sin * dp + cos * dq + centre_q;

        match (
            interpolation_support(source_p, dims[pa]),
            interpolation_support(source_q, dims[qa]),
        ) {
            (Some((p0, p1, tp)), Some((q0, q1, tq))) => {
                let sample = |p: usize, q: usize| {
                    let mut at = index;
                    at[pa] = p;
                    at[qa] = q;
                    f64::from(volume[at])
                };
                let value = (1.0 - tp) * (1.0 - tq) * sample(p0, q0)
                    + (1.0 - tp) * tq * sample(p0, q1)
                    + tp * (1.0 - tq) * sample(p1, q0)
                    + tp * tq * sample(p1, q1);
                value as f32
            }
            _ => fill_value,
        }
    })
}

/// Lower index, upper index and fractional weight for a linear sample at `coord`, or
/// `None` when the coordinate lies outside the volume's half-voxel support.
fn interpolation_support(coord: f64, len: usize) -> Option<(usize, usize, f64)> {
    if len == 0 || !(coord >= -0.5 && coord <= len as f64 - 0.5) {
        return None;
    }
    let clamped = coord.clamp(0.0, (len - 1) as f64);
    let base = clamped.floor();
    let lower = base as usize;
    let upper = (lower + 1).min(len - 1);
    Some((lower, upper, clamped - base))
}
