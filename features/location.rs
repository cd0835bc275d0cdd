//! Location and cluster features for one patient.
//!
//! Produces ten values: the normalized centroid of the most malignant nodule, the per-axis
//! spread of all normalized centroids, and four cluster statistics derived from DBSCAN
//! over the raw centroids.

use super::FeatureError;
use super::cluster::{ClusteringParams, dbscan_precomputed, mean_absolute_distances};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

pub const LOCATION_FEATURE_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFeatures {
    /// Normalized centroid of the highest-malignancy nodule (first one on ties).
    pub most_malignant_location: [f64; 3],
    /// Population standard deviation of the normalized centroids, per axis.
    pub location_spread: [f64; 3],
    /// Number of clusters divided by the number of nodules.
    pub cluster_ratio: f64,
    /// Number of noise nodules divided by the number of nodules.
    pub noise_ratio: f64,
    /// Mean over clusters of the in-cluster mean malignancy, with every noise nodule
    /// counted as its own singleton cluster.
    pub weighted_malignancy: f64,
    /// Size of the largest cluster with id >= 1 divided by the number of nodules.
    pub largest_cluster_ratio: f64,
}

impl LocationFeatures {
    /// `centroids` and `scan_sizes` are `[n, 3]` in original-scan voxel units;
    /// `malignancy` holds one blended score per nodule.
    pub fn compute(
        centroids: ArrayView2<'_, f64>,
        scan_sizes: ArrayView2<'_, f64>,
        malignancy: ArrayView1<'_, f64>,
        params: &ClusteringParams,
    ) -> Result<Self, FeatureError> {
        let n = centroids.nrows();
        if n == 0 {
            return Err(FeatureError::EmptyNoduleSet);
        }
        check_shape("centroids", centroids.shape(), &[n, 3])?;
        check_shape("scan_sizes", scan_sizes.shape(), &[n, 3])?;
        check_shape("malignancy", malignancy.shape(), &[n])?;
        for (nodule, size) in scan_sizes.axis_iter(Axis(0)).enumerate() {
            if size.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
                return Err(FeatureError::InvalidScanSize {
                    nodule,
                    size: [size[0], size[1], size[2]],
                });
            }
        }

        if let Some((nodule, &value)) = malignancy.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(FeatureError::NonFiniteMalignancy { nodule, value });
        }

        let normalized: Array2<f64> = &centroids / &scan_sizes;

        let mut most_malignant = 0;
        for (ix, &score) in malignancy.iter().enumerate() {
            if score > malignancy[most_malignant] {
                most_malignant = ix;
            }
        }
        let location_row = normalized.row(most_malignant);
        let spread = normalized.std_axis(Axis(0), 0.0);

        let distances = mean_absolute_distances(centroids);
        let clustering = dbscan_precomputed(distances.view(), params)?;

        let mut cluster_scores: Vec<f64> = (0..clustering.n_clusters())
            .map(|cluster| {
                let (sum, count) = clustering
                    .members(cluster)
                    .fold((0.0, 0usize), |(s, c), ix| (s + malignancy[ix], c + 1));
                sum / count as f64
            })
            .collect();
        cluster_scores.extend(clustering.noise_points().map(|ix| malignancy[ix]));
        let weighted_malignancy =
            cluster_scores.iter().sum::<f64>() / cluster_scores.len() as f64;

        // Cluster 0 is left out of the largest-cluster search.
        let largest_cluster = clustering
            .cluster_sizes()
            .into_iter()
            .skip(1)
            .max()
            .unwrap_or(1);

        let n_nodules = n as f64;
        log::debug!(
            "{} nodules: {} clusters, {} noise, largest secondary cluster {}",
            n,
            clustering.n_clusters(),
            clustering.noise_count(),
            largest_cluster
        );

        Ok(Self {
            most_malignant_location: [location_row[0], location_row[1], location_row[2]],
            location_spread: [spread[0], spread[1], spread[2]],
            cluster_ratio: clustering.n_clusters() as f64 / n_nodules,
            noise_ratio: clustering.noise_count() as f64 / n_nodules,
            weighted_malignancy,
            largest_cluster_ratio: largest_cluster as f64 / n_nodules,
        })
    }

    pub fn values(&self) -> [f64; LOCATION_FEATURE_COUNT] {
        let [lz, ly, lx] = self.most_malignant_location;
        let [sz, sy, sx] = self.location_spread;
        [
            lz,
            ly,
            lx,
            sz,
            sy,
            sx,
            self.cluster_ratio,
            self.noise_ratio,
            self.weighted_malignancy,
            self.largest_cluster_ratio,
        ]
    }
}

fn check_shape(name: &'static str, found: &[usize], expected: &[usize]) -> Result<(), FeatureError> {
    if found != expected {
        return Err(FeatureError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}
