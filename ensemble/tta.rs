//! # TTA Aggregator
//!
//! Repeats augmentation, ensemble inference and blending a fixed number of times, averages
//! the blended predictions element-wise, and reduces a patient's nodules into per-task
//! maximum and population standard deviation.

use crate::adapter::{EnsembleError, ModelEnsemble};
use crate::blend::{BlendError, LinearBlender};
use crate::types::{Task, TaskPredictions};
use ndarray::{ArrayView4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TTA_REPETITIONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtaConfig {
    pub repetitions: usize,
}

impl Default for TtaConfig {
    fn default() -> Self {
        Self {
            repetitions: DEFAULT_TTA_REPETITIONS,
        }
    }
}

#[derive(Error, Debug)]
pub enum TtaError {
    #[error("Test-time augmentation needs at least one repetition.")]
    ZeroRepetitions,
    #[error("Cannot aggregate predictions for a patient with no nodules.")]
    EmptyNoduleSet,
    #[error("Blended {task} prediction for nodule {nodule} is not finite ({value}).")]
    NonFinitePrediction { task: Task, nodule: usize, value: f64 },
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
    #[error(transparent)]
    Blend(#[from] BlendError),
}

#[derive(Debug, Clone)]
pub struct TtaAggregator {
    repetitions: usize,
}

impl TtaAggregator {
    pub fn new(config: &TtaConfig) -> Result<Self, TtaError> {
        if config.repetitions == 0 {
            return Err(TtaError::ZeroRepetitions);
        }
        Ok(Self {
            repetitions: config.repetitions,
        })
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    /// Blended predictions averaged over all repetitions, one row per nodule.
    pub fn average_predictions<R: Rng + ?Sized>(
        &self,
        ensemble: &ModelEnsemble,
        blender: &LinearBlender,
        volumes: ArrayView4<'_, f32>,
        rng: &mut R,
    ) -> Result<TaskPredictions, TtaError> {
        let n_nodules = volumes.len_of(Axis(0));
        if n_nodules == 0 {
            return Err(TtaError::EmptyNoduleSet);
        }

        let mut total = TaskPredictions::zeros(n_nodules);
        for repetition in 0..self.repetitions {
            let predictions = ensemble.predict(volumes, rng)?;
            let blended = blender.blend(&predictions)?;
            log::trace!(
                "TTA repetition {}/{}: max blended malignancy {:.4}",
                repetition + 1,
                self.repetitions,
                blended
                    .task(Task::Malignancy)
                    .fold(f64::NEG_INFINITY, |a, &b| a.max(b))
            );
            total.accumulate(&blended);
        }
        total.scale(1.0 / self.repetitions as f64);
        Ok(total)
    }
}

/// Per-task reductions over a patient's nodules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskSummary {
    pub max: [f64; 4],
    /// Population standard deviation (no Bessel correction).
    pub std: [f64; 4],
}

impl TaskSummary {
    pub fn from_predictions(predictions: &TaskPredictions) -> Result<Self, TtaError> {
        if predictions.n_nodules() == 0 {
            return Err(TtaError::EmptyNoduleSet);
        }
        let mut max = [0.0; 4];
        let mut std = [0.0; 4];
        for task in Task::ALL {
            let column = predictions.task(task);
            if let Some((nodule, &value)) = column.indexed_iter().find(|(_, v)| !v.is_finite()) {
                return Err(TtaError::NonFinitePrediction {
                    task,
                    nodule,
                    value,
                });
            }
            max[task.index()] = column.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            std[task.index()] = column.std(0.0);
        }
        Ok(Self { max, std })
    }

    /// `max[4]` followed by `std[4]`.
    pub fn values(&self) -> [f64; 8] {
        let mut out = [0.0; 8];
        out[..4].copy_from_slice(&self.max);
        out[4..].copy_from_slice(&self.std);
        out
    }
}
