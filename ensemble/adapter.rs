//! # Model Ensemble Adapter
//!
//! The pretrained volumetric models are black boxes to this crate: anything that can turn a
//! batch of nodule volumes into per-output prediction arrays implements [`Predictor`].
//! The adapter owns a registry of named slots, each carrying the metadata the blend needs
//! (single or multi-output, native output scale), and turns one batch into a uniform set of
//! per-slot, per-task prediction columns on a common `[0, 1]`-ish scale.
//!
//! Slot order is significant: it is the column order the blend coefficients were
//! calibrated against.

use crate::augment::{AugmentError, Augmenter};
use crate::types::Task;
use ndarray::{Array1, ArrayView4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Default number of volumes handed to a predictor per call.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Divisor for predictors trained on 0-5 radiologist ratings.
pub const FIVE_POINT_DIVISOR: f64 = 5.0;

/// Number of output groups a multi-output predictor must produce.
pub const MULTI_OUTPUT_GROUPS: usize = 4;

/// Failure reported by a predictor implementation.
#[derive(Error, Debug)]
pub enum PredictorError {
    #[error(
        "Predictor expects volumes with spatial shape {expected:?}, but received {found:?}."
    )]
    VolumeShape {
        expected: [usize; 3],
        found: [usize; 3],
    },
    #[error("Predictor failed: {0}")]
    Inference(String),
}

/// A loaded, read-only volumetric model.
///
/// `predict` receives `[n, d, d, d]` volumes and returns one array per output group, each
/// of length `n`. Multi-output models return `[diameter, lobulation, spiculation,
/// malignancy, ...]`; single-output models return `[malignancy, ...]`.
pub trait Predictor: Send + Sync {
    fn predict(&self, volumes: ArrayView4<'_, f32>) -> Result<Vec<Array1<f64>>, PredictorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    /// Predicts diameter, lobulation, spiculation and malignancy.
    MultiOutput,
    /// Predicts malignancy only.
    SingleOutput,
}

impl SlotKind {
    fn required_groups(self) -> usize {
        match self {
            SlotKind::MultiOutput => MULTI_OUTPUT_GROUPS,
            SlotKind::SingleOutput => 1,
        }
    }
}

/// The native scale of a predictor's rating outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputScale {
    #[default]
    Unit,
    /// Lobulation, spiculation and malignancy were trained on a 0-5 scale. Diameter is
    /// never rescaled.
    FivePoint,
}

impl OutputScale {
    fn divisor(self) -> f64 {
        match self {
            OutputScale::Unit => 1.0,
            OutputScale::FivePoint => FIVE_POINT_DIVISOR,
        }
    }
}

/// A named position in the ensemble.
#[derive(Clone)]
pub struct ModelSlot {
    pub name: String,
    pub kind: SlotKind,
    pub scale: OutputScale,
    predictor: Arc<dyn Predictor>,
}

impl ModelSlot {
    pub fn new(
        name: impl Into<String>,
        kind: SlotKind,
        scale: OutputScale,
        predictor: Arc<dyn Predictor>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            scale,
            predictor,
        }
    }
}

impl fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSlot")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("scale", &self.scale)
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error(
        "Model '{slot}' returned {found} output groups, but at least {expected} are required. This usually indicates a model/version mismatch."
    )]
    ShapeMismatch {
        slot: String,
        expected: usize,
        found: usize,
    },
    #[error(
        "Output group {group} of model '{slot}' has {found} predictions for a batch of {expected} volumes."
    )]
    LengthMismatch {
        slot: String,
        group: usize,
        expected: usize,
        found: usize,
    },
    #[error("Model '{slot}' failed: {source}")]
    Predictor {
        slot: String,
        #[source]
        source: PredictorError,
    },
    #[error("Augmentation failed: {0}")]
    Augment(#[from] AugmentError),
    #[error("Ensemble batch size must be at least 1.")]
    InvalidBatchSize,
    #[error("The ensemble has no multi-output model slots.")]
    NoSlots,
}

/// Normalized outputs of one multi-output slot, one entry per nodule.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiOutputPrediction {
    pub diameter: Array1<f64>,
    pub lobulation: Array1<f64>,
    pub spiculation: Array1<f64>,
    pub malignancy: Array1<f64>,
}

impl MultiOutputPrediction {
    pub fn task(&self, task: Task) -> &Array1<f64> {
        match task {
            Task::Diameter => &self.diameter,
            Task::Lobulation => &self.lobulation,
            Task::Spiculation => &self.spiculation,
            Task::Malignancy => &self.malignancy,
        }
    }
}

/// Normalized outputs of every slot for one batch, in registry order.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsemblePredictions {
    pub multi: Vec<MultiOutputPrediction>,
    pub single: Vec<Array1<f64>>,
}

impl EnsemblePredictions {
    pub fn n_nodules(&self) -> usize {
        self.multi.first().map_or(0, |p| p.diameter.len())
    }
}

/// The registry of predictor slots plus the augmentation each slot's input receives.
#[derive(Debug, Clone)]
pub struct ModelEnsemble {
    multi: Vec<ModelSlot>,
    single: Vec<ModelSlot>,
    augmenter: Augmenter,
    batch_size: usize,
}

impl ModelEnsemble {
    /// Splits `slots` by kind, keeping their relative order.
    pub fn new(
        slots: Vec<ModelSlot>,
        augmenter: Augmenter,
        batch_size: usize,
    ) -> Result<Self, EnsembleError> {
        if batch_size == 0 {
            return Err(EnsembleError::InvalidBatchSize);
        }
        let (multi, single): (Vec<_>, Vec<_>) = slots
            .into_iter()
            .partition(|slot| slot.kind == SlotKind::MultiOutput);
        if multi.is_empty() {
            return Err(EnsembleError::NoSlots);
        }
        Ok(Self {
            multi,
            single,
            augmenter,
            batch_size,
        })
    }

    pub fn multi_output_slots(&self) -> &[ModelSlot] {
        &self.multi
    }

    pub fn single_output_slots(&self) -> &[ModelSlot] {
        &self.single
    }

    /// Runs every slot once on its own augmented copy of `volumes`.
    pub fn predict<R: Rng + ?Sized>(
        &self,
        volumes: ArrayView4<'_, f32>,
        rng: &mut R,
    ) -> Result<EnsemblePredictions, EnsembleError> {
        let mut multi = Vec::with_capacity(self.multi.len());
        for slot in &self.multi {
            let mut groups = self.run_slot(slot, volumes, rng)?;
            groups.truncate(MULTI_OUTPUT_GROUPS);
            let [diameter, lobulation, spiculation, malignancy]: [Array1<f64>; 4] = groups
                .try_into()
                .map_err(|rest: Vec<Array1<f64>>| EnsembleError::ShapeMismatch {
                    slot: slot.name.clone(),
                    expected: MULTI_OUTPUT_GROUPS,
                    found: rest.len(),
                })?;

            let mut prediction = MultiOutputPrediction {
                diameter,
                lobulation,
                spiculation,
                malignancy,
            };
            let divisor = slot.scale.divisor();
            for column in [
                &mut prediction.lobulation,
                &mut prediction.spiculation,
                &mut prediction.malignancy,
            ] {
                column.mapv_inplace(|v| v / divisor);
            }
            multi.push(prediction);
        }

        let mut single = Vec::with_capacity(self.single.len());
        for slot in &self.single {
            let mut groups = self.run_slot(slot, volumes, rng)?;
            let mut malignancy = groups.swap_remove(0);
            let divisor = slot.scale.divisor();
            malignancy.mapv_inplace(|v| v / divisor);
            single.push(malignancy);
        }

        Ok(EnsemblePredictions { multi, single })
    }

    /// Augments, runs the predictor in chunks of `batch_size`, and concatenates the output
    /// groups back into full-length columns. Guarantees at least `kind.required_groups()`
    /// groups, each with one entry per volume.
    fn run_slot<R: Rng + ?Sized>(
        &self,
        slot: &ModelSlot,
        volumes: ArrayView4<'_, f32>,
        rng: &mut R,
    ) -> Result<Vec<Array1<f64>>, EnsembleError> {
        let perturbed = self.augmenter.perturb_batch(volumes, rng)?;
        let n = perturbed.len_of(Axis(0));
        let required = slot.kind.required_groups();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        for chunk in perturbed.axis_chunks_iter(Axis(0), self.batch_size) {
            let chunk_len = chunk.len_of(Axis(0));
            let groups =
                slot.predictor
                    .predict(chunk)
                    .map_err(|source| EnsembleError::Predictor {
                        slot: slot.name.clone(),
                        source,
                    })?;

            if groups.len() < required {
                return Err(EnsembleError::ShapeMismatch {
                    slot: slot.name.clone(),
                    expected: required,
                    found: groups.len(),
                });
            }
            if columns.is_empty() {
                columns = vec![Vec::with_capacity(n); groups.len()];
            }
            // Chunks of one model must agree on the group count; keep the common prefix.
            columns.truncate(groups.len());

            for (group_ix, (column, group)) in columns.iter_mut().zip(&groups).enumerate() {
                if group.len() != chunk_len {
                    return Err(EnsembleError::LengthMismatch {
                        slot: slot.name.clone(),
                        group: group_ix,
                        expected: chunk_len,
                        found: group.len(),
                    });
                }
                column.extend(group.iter().copied());
            }
        }

        log::trace!(
            "Model '{}' produced {} output groups for {} volumes",
            slot.name,
            columns.len(),
            n
        );
        Ok(columns.into_iter().map(Array1::from_vec).collect())
    }
}
