// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView2, Axis};
use std::fmt;

/// The four per-nodule quantities every multi-output model describes.
///
/// The declaration order is the canonical column order of every per-task table in the
/// crate and of the summary block of the final feature row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    Diameter,
    Lobulation,
    Spiculation,
    Malignancy,
}

impl Task {
    pub const ALL: [Task; 4] = [
        Task::Diameter,
        Task::Lobulation,
        Task::Spiculation,
        Task::Malignancy,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Task::Diameter => 0,
            Task::Lobulation => 1,
            Task::Spiculation => 2,
            Task::Malignancy => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Task::Diameter => "diameter",
            Task::Lobulation => "lobulation",
            Task::Spiculation => "spiculation",
            Task::Malignancy => "malignancy",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Blended per-nodule predictions, one column per [`Task`].
///
/// Shape: `[n_nodules, 4]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPredictions {
    values: Array2<f64>,
}

impl TaskPredictions {
    /// Builds the table from one column per task, in [`Task::ALL`] order.
    pub fn from_columns(columns: [Array1<f64>; 4]) -> Self {
        let n = columns[0].len();
        let mut values = Array2::zeros((n, 4));
        for (task_ix, column) in columns.iter().enumerate() {
            values.column_mut(task_ix).assign(column);
        }
        Self { values }
    }

    pub fn zeros(n_nodules: usize) -> Self {
        Self {
            values: Array2::zeros((n_nodules, 4)),
        }
    }

    #[inline]
    pub fn n_nodules(&self) -> usize {
        self.values.nrows()
    }

    pub fn task(&self, task: Task) -> ArrayView1<'_, f64> {
        self.values.column(task.index())
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// Element-wise accumulation used by the TTA loop.
    pub fn accumulate(&mut self, other: &TaskPredictions) {
        self.values += &other.values;
    }

    pub fn scale(&mut self, factor: f64) {
        self.values.mapv_inplace(|v| v * factor);
    }
}

/// Everything the pipeline knows about one patient: the nodule volumes produced by the
/// upstream segmentation, their centroids, and the size of the scan each centroid lives in.
#[derive(Debug, Clone)]
pub struct PatientRecord {
    pub patient_id: String,
    /// Shape: `[n_nodules, d, d, d]`.
    pub voxels: Array4<f32>,
    /// Shape: `[n_nodules, 3]`, in original-scan voxel units.
    pub centroids: Array2<f64>,
    /// Shape: `[n_nodules, 3]`.
    pub scan_sizes: Array2<f64>,
}

impl PatientRecord {
    #[inline]
    pub fn n_nodules(&self) -> usize {
        self.voxels.len_of(Axis(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn columns_land_in_task_order() {
        let preds = TaskPredictions::from_columns([
            array![1.0, 2.0],
            array![3.0, 4.0],
            array![5.0, 6.0],
            array![7.0, 8.0],
        ]);
        assert_eq!(preds.n_nodules(), 2);
        assert_eq!(preds.task(Task::Spiculation), array![5.0, 6.0]);
        assert_eq!(preds.task(Task::Malignancy), array![7.0, 8.0]);
    }

    #[test]
    fn accumulate_then_scale_is_a_mean() {
        let mut total = TaskPredictions::zeros(1);
        total.accumulate(&TaskPredictions::from_columns([
            array![1.0],
            array![1.0],
            array![1.0],
            array![1.0],
        ]));
        total.accumulate(&TaskPredictions::from_columns([
            array![3.0],
            array![5.0],
            array![7.0],
            array![9.0],
        ]));
        total.scale(0.5);
        assert_eq!(total.view().row(0), array![2.0, 3.0, 4.0, 5.0]);
    }
}
