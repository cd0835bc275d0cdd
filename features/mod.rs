//! Patient-level features derived from blended nodule predictions: spatial clustering of
//! nodule centroids and assembly of the fixed-width feature row.

pub mod assemble;
pub mod cluster;
pub mod location;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Cannot derive location features for a patient with no nodules.")]
    EmptyNoduleSet,
    #[error("Array '{name}' has shape {found:?}, expected {expected:?}.")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error(
        "Scan size for nodule {nodule} contains a non-positive or non-finite component: {size:?}."
    )]
    InvalidScanSize { nodule: usize, size: [f64; 3] },
    #[error("Malignancy score for nodule {nodule} is not finite ({value}).")]
    NonFiniteMalignancy { nodule: usize, value: f64 },
    #[error("Clustering radius must be positive and finite, got {0}.")]
    InvalidRadius(f64),
}
