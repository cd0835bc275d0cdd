//! Density-based clustering (DBSCAN) over a precomputed distance matrix.
//!
//! Neighbourhoods are inclusive (`d <= eps`) and a point counts towards its own
//! neighbourhood. Clusters are numbered in the order their first core point is met when
//! scanning points by index; a border point joins the first cluster that reaches it.

use super::FeatureError;
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Neighbourhood radius, in original-scan voxel units under the mean-absolute metric.
pub const DEFAULT_EPS: f64 = 60.0;
pub const DEFAULT_MIN_SAMPLES: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringParams {
    pub eps: f64,
    pub min_samples: usize,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            eps: DEFAULT_EPS,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterLabel {
    Noise,
    Cluster(usize),
}

impl ClusterLabel {
    /// Conventional integer label: `-1` for noise.
    pub fn id(self) -> i64 {
        match self {
            ClusterLabel::Noise => -1,
            ClusterLabel::Cluster(c) => c as i64,
        }
    }
}

/// Pairwise distance: the mean over axes of the absolute coordinate difference.
///
/// `points` has shape `[n, dims]`; the result is `[n, n]`, symmetric with a zero diagonal.
pub fn mean_absolute_distances(points: ArrayView2<'_, f64>) -> Array2<f64> {
    let n = points.nrows();
    let dims = points.ncols().max(1) as f64;
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let total: f64 = points
                .row(i)
                .iter()
                .zip(points.row(j).iter())
                .map(|(a, b)| (a - b).abs())
                .sum();
            let d = total / dims;
            out[[i, j]] = d;
            out[[j, i]] = d;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    labels: Vec<ClusterLabel>,
    n_clusters: usize,
}

impl Clustering {
    pub fn labels(&self) -> &[ClusterLabel] {
        &self.labels
    }

    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    pub fn noise_count(&self) -> usize {
        self.labels
            .iter()
            .filter(|&&l| l == ClusterLabel::Noise)
            .count()
    }

    /// Member count of each cluster, indexed by cluster id.
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for label in &self.labels {
            if let ClusterLabel::Cluster(c) = *label {
                sizes[c] += 1;
            }
        }
        sizes
    }

    pub fn members(&self, cluster: usize) -> impl Iterator<Item = usize> + '_ {
        self.labels
            .iter()
            .enumerate()
            .filter(move |(_, l)| **l == ClusterLabel::Cluster(cluster))
            .map(|(ix, _)| ix)
    }

    pub fn noise_points(&self) -> impl Iterator<Item = usize> + '_ {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == ClusterLabel::Noise)
            .map(|(ix, _)| ix)
    }
}

/// Runs DBSCAN on a square distance matrix.
pub fn dbscan_precomputed(
    distances: ArrayView2<'_, f64>,
    params: &ClusteringParams,
) -> Result<Clustering, FeatureError> {
    let n = distances.nrows();
    if distances.ncols() != n {
        return Err(FeatureError::ShapeMismatch {
            name: "distances",
            expected: vec![n, n],
            found: distances.shape().to_vec(),
        });
    }
    if !(params.eps.is_finite() && params.eps > 0.0) {
        return Err(FeatureError::InvalidRadius(params.eps));
    }

    let neighbourhoods: Vec<Vec<usize>> = distances
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .filter(|&(_, &d)| d <= params.eps)
                .map(|(j, _)| j)
                .collect()
        })
        .collect();
    let is_core: Vec<bool> = neighbourhoods
        .iter()
        .map(|nb| nb.len() >= params.min_samples)
        .collect();

    let mut labels = vec![ClusterLabel::Noise; n];
    let mut n_clusters = 0usize;
    let mut stack: Vec<usize> = Vec::new();

    for seed in 0..n {
        if labels[seed] != ClusterLabel::Noise || !is_core[seed] {
            continue;
        }
        let label = ClusterLabel::Cluster(n_clusters);
        let mut current = seed;
        loop {
            if labels[current] == ClusterLabel::Noise {
                labels[current] = label;
                if is_core[current] {
                    stack.extend(
                        neighbourhoods[current]
                            .iter()
                            .copied()
                            .filter(|&j| labels[j] == ClusterLabel::Noise),
                    );
                }
            }
            match stack.pop() {
                Some(next) => current = next,
                None => break,
            }
        }
        n_clusters += 1;
    }

    log::trace!(
        "DBSCAN over {} points found {} clusters (eps={}, min_samples={})",
        n,
        n_clusters,
        params.eps,
        params.min_samples
    );
    Ok(Clustering { labels, n_clusters })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn distance_is_mean_absolute_difference() {
        let points = array![[0.0, 0.0, 0.0], [3.0, -6.0, 9.0]];
        let d = mean_absolute_distances(points.view());
        assert_abs_diff_eq!(d[[0, 1]], 6.0, epsilon = 1e-12);
        assert_eq!(d[[1, 0]], d[[0, 1]]);
        assert_eq!(d[[0, 0]], 0.0);
    }

    #[test]
    fn coincident_pair_forms_one_cluster() {
        let clustering =
            dbscan_precomputed(array![[0.0, 0.0], [0.0, 0.0]].view(), &ClusteringParams::default())
                .unwrap();
        assert_eq!(clustering.n_clusters(), 1);
        assert_eq!(clustering.noise_count(), 0);
        assert_eq!(clustering.cluster_sizes(), vec![2]);
    }

    #[test]
    fn distant_pair_is_all_noise() {
        let clustering = dbscan_precomputed(
            array![[0.0, 60.5], [60.5, 0.0]].view(),
            &ClusteringParams::default(),
        )
        .unwrap();
        assert_eq!(clustering.n_clusters(), 0);
        assert_eq!(clustering.noise_count(), 2);
        assert_eq!(clustering.noise_points().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn radius_is_inclusive() {
        let clustering = dbscan_precomputed(
            array![[0.0, 60.0], [60.0, 0.0]].view(),
            &ClusteringParams::default(),
        )
        .unwrap();
        assert_eq!(clustering.n_clusters(), 1);
    }

    #[test]
    fn single_point_is_noise() {
        let clustering =
            dbscan_precomputed(array![[0.0]].view(), &ClusteringParams::default()).unwrap();
        assert_eq!(clustering.labels(), &[ClusterLabel::Noise]);
        assert_eq!(clustering.cluster_sizes(), Vec::<usize>::new());
    }

    #[test]
    fn clusters_are_numbered_by_first_core_point() {
        let points = array![
            [500.0, 500.0, 500.0],
            [10.0, 10.0, 10.0],
            [505.0, 505.0, 505.0],
            [20.0, 20.0, 20.0],
            [30.0, 30.0, 30.0],
            [900.0, 0.0, 0.0],
        ];
        let d = mean_absolute_distances(points.view());
        let clustering = dbscan_precomputed(d.view(), &ClusteringParams::default()).unwrap();
        let ids: Vec<i64> = clustering.labels().iter().map(|l| l.id()).collect();
        assert_eq!(ids, vec![0, 1, 0, 1, 1, -1]);
        assert_eq!(clustering.cluster_sizes(), vec![2, 3]);
        assert_eq!(clustering.members(1).collect::<Vec<_>>(), vec![1, 3, 4]);
    }

    #[test]
    fn chains_link_through_core_points() {
        // 0-1 and 1-2 are within the radius, 0-2 is not.
        let points = array![[0.0, 0.0, 0.0], [50.0, 50.0, 50.0], [100.0, 100.0, 100.0]];
        let d = mean_absolute_distances(points.view());
        let clustering = dbscan_precomputed(d.view(), &ClusteringParams::default()).unwrap();
        assert_eq!(clustering.n_clusters(), 1);
        assert_eq!(clustering.cluster_sizes(), vec![3]);
    }

    #[test]
    fn border_points_do_not_expand_the_cluster() {
        let params = ClusteringParams {
            eps: 1.0,
            min_samples: 4,
        };
        // Point 1 is the only core point. Point 2 is a border point whose neighbour 3 is
        // out of reach of every core point, so 3 stays noise.
        let d = array![
            [0.0, 1.0, 2.0, 3.0, 2.0],
            [1.0, 0.0, 1.0, 2.0, 1.0],
            [2.0, 1.0, 0.0, 1.0, 2.0],
            [3.0, 2.0, 1.0, 0.0, 3.0],
            [2.0, 1.0, 2.0, 3.0, 0.0],
        ];
        let clustering = dbscan_precomputed(d.view(), &params).unwrap();
        let ids: Vec<i64> = clustering.labels().iter().map(|l| l.id()).collect();
        assert_eq!(ids, vec![0, 0, 0, -1, 0]);
    }

    #[test]
    fn rejects_non_square_matrices_and_bad_radius() {
        let rect = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            dbscan_precomputed(rect.view(), &ClusteringParams::default()),
            Err(FeatureError::ShapeMismatch { .. })
        ));
        let params = ClusteringParams {
            eps: 0.0,
            min_samples: 2,
        };
        assert!(matches!(
            dbscan_precomputed(array![[0.0]].view(), &params),
            Err(FeatureError::InvalidRadius(_))
        ));
    }
}
