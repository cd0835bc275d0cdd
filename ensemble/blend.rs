//! # Linear Blender
//!
//! Combines the per-slot prediction columns of an [`EnsemblePredictions`] into a single
//! value per nodule and task. The coefficients are externally calibrated constants; the
//! blender never fits anything. Column order follows the ensemble registry: every
//! multi-output slot for each task, then every single-output slot for malignancy.

use crate::adapter::{EnsemblePredictions, ModelEnsemble};
use crate::types::{Task, TaskPredictions};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One fixed coefficient vector per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendCoefficients {
    pub diameter: Vec<f64>,
    pub lobulation: Vec<f64>,
    pub spiculation: Vec<f64>,
    pub malignancy: Vec<f64>,
}

impl Default for BlendCoefficients {
    /// The calibrated weights for the default eight-slot ensemble.
    fn default() -> Self {
        Self {
            diameter: vec![
                0.49502715, 0.04357547, 0.13213973, 0.0, 0.13237931, 0.23392186,
            ],
            lobulation: vec![
                0.0, 0.74029565, 0.01063934, 0.18729332, 0.02203343, 0.13645789,
            ],
            spiculation: vec![
                0.33892995, 0.27719817, 0.01419351, 0.21342018, 0.16956094, 0.05932272,
            ],
            malignancy: vec![0.214, 0.0968, 0.02, 0.16, 0.0715, 0.0023, 0.359, 0.130],
        }
    }
}

impl BlendCoefficients {
    pub fn task(&self, task: Task) -> &[f64] {
        match task {
            Task::Diameter => &self.diameter,
            Task::Lobulation => &self.lobulation,
            Task::Spiculation => &self.spiculation,
            Task::Malignancy => &self.malignancy,
        }
    }

    /// Checks each vector's length against the number of columns feeding its task.
    pub fn validate(&self, n_multi: usize, n_single: usize) -> Result<(), BlendError> {
        for task in Task::ALL {
            let expected = columns_for(task, n_multi, n_single);
            let found = self.task(task).len();
            if found != expected {
                return Err(BlendError::CoefficientLength {
                    task,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }
}

fn columns_for(task: Task, n_multi: usize, n_single: usize) -> usize {
    match task {
        Task::Malignancy => n_multi + n_single,
        _ => n_multi,
    }
}

#[derive(Error, Debug)]
pub enum BlendError {
    #[error(
        "The {task} blend has {found} coefficients, but the ensemble feeds it {expected} columns."
    )]
    CoefficientLength {
        task: Task,
        expected: usize,
        found: usize,
    },
    #[error(
        "The {task} blend expected {expected} prediction columns, but the ensemble produced {found}."
    )]
    MissingColumns {
        task: Task,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone)]
pub struct LinearBlender {
    coefficients: BlendCoefficients,
}

impl LinearBlender {
    /// Validates the coefficients against an explicit column layout.
    pub fn new(
        coefficients: BlendCoefficients,
        n_multi: usize,
        n_single: usize,
    ) -> Result<Self, BlendError> {
        coefficients.validate(n_multi, n_single)?;
        Ok(Self { coefficients })
    }

    /// Validates the coefficients against the slots registered in `ensemble`.
    pub fn for_ensemble(
        coefficients: BlendCoefficients,
        ensemble: &ModelEnsemble,
    ) -> Result<Self, BlendError> {
        Self::new(
            coefficients,
            ensemble.multi_output_slots().len(),
            ensemble.single_output_slots().len(),
        )
    }

    pub fn coefficients(&self) -> &BlendCoefficients {
        &self.coefficients
    }

    /// Stacks the columns feeding `task` into a `[n_nodules, n_columns]` matrix.
    pub fn design_matrix(&self, task: Task, predictions: &EnsemblePredictions) -> Array2<f64> {
        let n = predictions.n_nodules();
        let mut columns: Vec<&Array1<f64>> =
            predictions.multi.iter().map(|p| p.task(task)).collect();
        if task == Task::Malignancy {
            columns.extend(predictions.single.iter());
        }

        let mut x = Array2::zeros((n, columns.len()));
        for (col_ix, column) in columns.into_iter().enumerate() {
            x.column_mut(col_ix).assign(column);
        }
        x
    }

    /// One blended value per nodule and task.
    pub fn blend(&self, predictions: &EnsemblePredictions) -> Result<TaskPredictions, BlendError> {
        let n_multi = predictions.multi.len();
        let n_single = predictions.single.len();

        let blended = Task::ALL.map(|task| {
            let coefs = self.coefficients.task(task);
            let found = columns_for(task, n_multi, n_single);
            if found != coefs.len() {
                return Err(BlendError::MissingColumns {
                    task,
                    expected: coefs.len(),
                    found,
                });
            }
            let x = self.design_matrix(task, predictions);
            Ok(x.dot(&Array1::from(coefs.to_vec())))
        });

        let [diameter, lobulation, spiculation, malignancy] = blended;
        Ok(TaskPredictions::from_columns([
            diameter?,
            lobulation?,
            spiculation?,
            malignancy?,
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MultiOutputPrediction;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn constant_multi(n: usize, value: f64) -> MultiOutputPrediction {
        MultiOutputPrediction {
            diameter: Array1::from_elem(n, value),
            lobulation: Array1::from_elem(n, value),
            spiculation: Array1::from_elem(n, value),
            malignancy: Array1::from_elem(n, value),
        }
    }

    fn unit_sum_coefficients() -> BlendCoefficients {
        BlendCoefficients {
            diameter: vec![0.5, 0.25, 0.25],
            lobulation: vec![1.0, 0.0, 0.0],
            spiculation: vec![0.125, 0.375, 0.5],
            malignancy: vec![0.25, 0.25, 0.25, 0.25],
        }
    }

    #[test]
    fn default_coefficients_fit_six_multi_and_two_single_slots() {
        let coefs = BlendCoefficients::default();
        assert!(coefs.validate(6, 2).is_ok());
        assert!(coefs.validate(7, 2).is_err());
        let total: f64 = coefs.malignancy.iter().sum();
        assert_abs_diff_eq!(total, 1.0536, epsilon = 1e-9);
    }

    #[test]
    fn unit_sum_blend_of_constants_returns_the_constant() {
        let blender = LinearBlender::new(unit_sum_coefficients(), 3, 1).unwrap();
        for c in [0.0, 0.3, 1.0, 4.75, -2.5] {
            let predictions = EnsemblePredictions {
                multi: vec![constant_multi(2, c), constant_multi(2, c), constant_multi(2, c)],
                single: vec![Array1::from_elem(2, c)],
            };
            let blended = blender.blend(&predictions).unwrap();
            for task in Task::ALL {
                for &v in blended.task(task) {
                    assert_abs_diff_eq!(v, c, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn malignancy_columns_follow_registry_order() {
        let blender = LinearBlender::new(
            BlendCoefficients {
                diameter: vec![1.0, 0.0],
                lobulation: vec![0.0, 1.0],
                spiculation: vec![0.5, 0.5],
                malignancy: vec![1.0, 10.0, 100.0],
            },
            2,
            1,
        )
        .unwrap();
        let predictions = EnsemblePredictions {
            multi: vec![
                MultiOutputPrediction {
                    diameter: array![1.0, 2.0],
                    lobulation: array![3.0, 4.0],
                    spiculation: array![5.0, 6.0],
                    malignancy: array![0.1, 0.2],
                },
                MultiOutputPrediction {
                    diameter: array![7.0, 8.0],
                    lobulation: array![9.0, 10.0],
                    spiculation: array![11.0, 12.0],
                    malignancy: array![0.3, 0.4],
                },
            ],
            single: vec![array![0.5, 0.6]],
        };

        let x = blender.design_matrix(Task::Malignancy, &predictions);
        assert_eq!(x, array![[0.1, 0.3, 0.5], [0.2, 0.4, 0.6]]);

        let blended = blender.blend(&predictions).unwrap();
        assert_eq!(blended.task(Task::Diameter), array![1.0, 2.0]);
        assert_eq!(blended.task(Task::Lobulation), array![9.0, 10.0]);
        assert_eq!(blended.task(Task::Spiculation), array![8.0, 9.0]);
        assert_abs_diff_eq!(blended.task(Task::Malignancy)[0], 53.1, epsilon = 1e-9);
        assert_abs_diff_eq!(blended.task(Task::Malignancy)[1], 64.2, epsilon = 1e-9);
    }

    #[test]
    fn wrong_coefficient_length_is_rejected_up_front() {
        let err = LinearBlender::new(unit_sum_coefficients(), 3, 2).unwrap_err();
        assert!(matches!(
            err,
            BlendError::CoefficientLength {
                task: Task::Malignancy,
                expected: 5,
                found: 4
            }
        ));
    }

    #[test]
    fn predictions_with_missing_slots_are_rejected() {
        let blender = LinearBlender::new(unit_sum_coefficients(), 3, 1).unwrap();
        let predictions = EnsemblePredictions {
            multi: vec![constant_multi(1, 0.5), constant_multi(1, 0.5)],
            single: vec![Array1::from_elem(1, 0.5)],
        };
        assert!(matches!(
            blender.blend(&predictions),
            Err(BlendError::MissingColumns { .. })
        ));
    }
}
