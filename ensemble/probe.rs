use crate::adapter::{Predictor, PredictorError};
use ndarray::{Array1, ArrayView3, ArrayView4, Axis, s};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable format of a linear probe when serialized to a
// TOML file.

/// Maps the linear predictor of one output head to its reported value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFunction {
    /// The head reports `eta` directly.
    #[default]
    Identity,
    /// The head reports `1 / (1 + exp(-eta))`.
    Logit,
}

/// Density window mapped onto `[0, 1]` before pooling. Values outside are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityWindow {
    pub lower: f64,
    pub upper: f64,
}

impl Default for IntensityWindow {
    fn default() -> Self {
        Self {
            lower: -1000.0,
            upper: 400.0,
        }
    }
}

impl IntensityWindow {
    #[inline]
    fn normalize(&self, value: f64) -> f64 {
        ((value - self.lower) / (self.upper - self.lower)).clamp(0.0, 1.0)
    }
}

/// One output group: `link(intercept + weights . pooled)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputHead {
    pub name: String,
    #[serde(default)]
    pub link: LinkFunction,
    pub intercept: f64,
    /// One weight per pooling block, in `(z, y, x)` row-major block order.
    pub weights: Vec<f64>,
}

/// A serialized volumetric predictor: windowed intensities, average-pooled over a
/// `grid x grid x grid` block layout, feeding one linear head per output group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearProbeModel {
    /// Edge length of the cubic volumes this probe accepts.
    pub volume_size: usize,
    pub grid: usize,
    #[serde(default)]
    pub window: IntensityWindow,
    pub heads: Vec<OutputHead>,
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to read or write probe file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML probe file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize probe to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid probe definition: {0}")]
    Invalid(String),
}

impl LinearProbeModel {
    pub fn n_blocks(&self) -> usize {
        self.grid * self.grid * self.grid
    }

    /// Checks the structural invariants a loaded file must satisfy.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.grid == 0 || self.volume_size < self.grid {
            return Err(ProbeError::Invalid(format!(
                "grid {} does not fit volumes of size {}",
                self.grid, self.volume_size
            )));
        }
        if !(self.window.upper > self.window.lower) {
            return Err(ProbeError::Invalid(format!(
                "intensity window [{}, {}] is empty",
                self.window.lower, self.window.upper
            )));
        }
        if self.heads.is_empty() {
            return Err(ProbeError::Invalid("probe has no output heads".to_string()));
        }
        let expected = self.n_blocks();
        for head in &self.heads {
            if head.weights.len() != expected {
                return Err(ProbeError::Invalid(format!(
                    "head '{}' has {} weights, expected {} ({}^3 blocks)",
                    head.name,
                    head.weights.len(),
                    expected,
                    self.grid
                )));
            }
        }
        Ok(())
    }

    /// Average of the windowed intensities in each block, `(z, y, x)` row-major.
    pub fn pooled_features(&self, volume: ArrayView3<'_, f32>) -> Array1<f64> {
        let d = self.volume_size;
        let g = self.grid;
        let bounds: Vec<(usize, usize)> = (0..g).map(|b| (b * d / g, (b + 1) * d / g)).collect();

        let mut pooled = Array1::zeros(self.n_blocks());
        let mut ix = 0;
        for &(z0, z1) in &bounds {
            for &(y0, y1) in &bounds {
                for &(x0, x1) in &bounds {
                    let block = volume.slice(s![z0..z1, y0..y1, x0..x1]);
                    let total: f64 = block
                        .iter()
                        .map(|&v| self.window.normalize(v as f64))
                        .sum();
                    pooled[ix] = total / block.len() as f64;
                    ix += 1;
                }
            }
        }
        pooled
    }

    /// Saves the probe in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ProbeError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads and validates a probe from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ProbeError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        model.validate()?;
        Ok(model)
    }
}

impl Predictor for LinearProbeModel {
    fn predict(&self, volumes: ArrayView4<'_, f32>) -> Result<Vec<Array1<f64>>, PredictorError> {
        let shape = volumes.shape();
        let found = [shape[1], shape[2], shape[3]];
        let expected = [self.volume_size; 3];
        if found != expected {
            return Err(PredictorError::VolumeShape { expected, found });
        }

        let n = volumes.len_of(Axis(0));
        let mut outputs: Vec<Array1<f64>> =
            self.heads.iter().map(|_| Array1::zeros(n)).collect();
        for (nodule, volume) in volumes.axis_iter(Axis(0)).enumerate() {
            let pooled = self.pooled_features(volume);
            for (head, out) in self.heads.iter().zip(outputs.iter_mut()) {
                let eta = head.intercept
                    + head
                        .weights
                        .iter()
                        .zip(pooled.iter())
                        .map(|(w, x)| w * x)
                        .sum::<f64>();
                out[nodule] = match head.link {
                    LinkFunction::Identity => eta,
                    LinkFunction::Logit => 1.0 / (1.0 + (-eta).exp()),
                };
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;

    fn probe(grid: usize, heads: Vec<OutputHead>) -> LinearProbeModel {
        LinearProbeModel {
            volume_size: 4,
            grid,
            window: IntensityWindow::default(),
            heads,
        }
    }

    fn mean_head(name: &str, link: LinkFunction, n_blocks: usize) -> OutputHead {
        OutputHead {
            name: name.to_string(),
            link,
            intercept: 0.0,
            weights: vec![1.0 / n_blocks as f64; n_blocks],
        }
    }

    #[test]
    fn window_maps_air_to_zero_and_dense_tissue_to_one() {
        let model = probe(1, vec![mean_head("m", LinkFunction::Identity, 1)]);
        let mut volumes = Array4::from_elem((3, 4, 4, 4), -1000.0f32);
        volumes.index_axis_mut(Axis(0), 1).fill(400.0);
        volumes.index_axis_mut(Axis(0), 2).fill(-300.0);

        let out = model.predict(volumes.view()).unwrap();
        assert_eq!(out.len(), 1);
        assert_abs_diff_eq!(out[0][0], 0.0);
        assert_abs_diff_eq!(out[0][1], 1.0);
        assert_abs_diff_eq!(out[0][2], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn pooling_follows_block_order() {
        let model = probe(2, vec![mean_head("m", LinkFunction::Identity, 8)]);
        let mut volume = ndarray::Array3::from_elem((4, 4, 4), -1000.0f32);
        // Upper-z, upper-y, upper-x block is the last one.
        volume.slice_mut(s![2..4, 2..4, 2..4]).fill(400.0);
        let pooled = model.pooled_features(volume.view());
        assert_eq!(pooled.len(), 8);
        assert_abs_diff_eq!(pooled[7], 1.0);
        assert_abs_diff_eq!(pooled.sum(), 1.0);
    }

    #[test]
    fn logit_heads_report_probabilities() {
        let mut head = mean_head("p", LinkFunction::Logit, 1);
        head.weights = vec![0.0];
        head.intercept = 0.0;
        let model = probe(1, vec![head]);
        let out = model
            .predict(Array4::<f32>::zeros((2, 4, 4, 4)).view())
            .unwrap();
        assert_abs_diff_eq!(out[0][0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn wrong_volume_size_is_rejected() {
        let model = probe(1, vec![mean_head("m", LinkFunction::Identity, 1)]);
        let err = model
            .predict(Array4::<f32>::zeros((1, 5, 5, 5)).view())
            .unwrap_err();
        assert!(matches!(
            err,
            PredictorError::VolumeShape {
                expected: [4, 4, 4],
                found: [5, 5, 5]
            }
        ));
    }

    #[test]
    fn save_and_load_preserve_the_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.toml");
        let model = probe(
            2,
            vec![
                mean_head("diameter", LinkFunction::Identity, 8),
                mean_head("malignancy", LinkFunction::Logit, 8),
            ],
        );
        model.save(&path).unwrap();
        let loaded = LinearProbeModel::load(&path).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn load_rejects_mismatched_weight_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        let model = probe(2, vec![mean_head("m", LinkFunction::Identity, 3)]);
        model.save(&path).unwrap();
        assert!(matches!(
            LinearProbeModel::load(&path),
            Err(ProbeError::Invalid(_))
        ));
    }
}
