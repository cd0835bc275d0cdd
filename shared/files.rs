// ========================================================================================
//                     Patient discovery & segmentation array loading
// ========================================================================================

use crate::types::PatientRecord;
use log::{debug, warn};
use memmap2::Mmap;
use natord::compare;
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use ndarray_npy::{ReadNpyError, ReadNpyExt, ReadableElement};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const VOXELS_PREFIX: &str = "vox_";
pub const CENTROIDS_PREFIX: &str = "cents_";
pub const SCAN_SIZES_PREFIX: &str = "shapes_";
const NPY_EXTENSION: &str = ".npy";

#[derive(Error, Debug)]
pub enum FileError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed .npy file {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("Unsupported .npy element type in {}: {reason}", path.display())]
    UnsupportedDtype { path: PathBuf, reason: String },
    #[error("Patient '{patient}' is missing its companion array {}", path.display())]
    MissingArray { patient: String, path: PathBuf },
    #[error(
        "Patient '{patient}' has {voxels} voxel blocks, {centroids} centroids and {scan_sizes} scan sizes; the counts must agree."
    )]
    InconsistentCounts {
        patient: String,
        voxels: usize,
        centroids: usize,
        scan_sizes: usize,
    },
}

impl FileError {
    fn io(path: &Path, source: io::Error) -> Self {
        FileError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        FileError::Malformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

// ========================================================================================
//                                  .npy decoding
// ========================================================================================

type Widen = fn(&[u8]) -> Result<ArrayD<f64>, ReadNpyError>;

fn widen<S: ReadableElement + Copy>(
    bytes: &[u8],
    to_f64: fn(S) -> f64,
) -> Result<ArrayD<f64>, ReadNpyError> {
    Ok(ArrayD::<S>::read_npy(bytes)?.mapv(to_f64))
}

/// Element types accepted on read besides the requested one, tried in order.
const WIDENINGS: [Widen; 7] = [
    |b| widen::<f32>(b, f64::from),
    |b| widen::<f64>(b, |v| v),
    |b| widen::<i16>(b, f64::from),
    |b| widen::<i32>(b, f64::from),
    |b| widen::<i64>(b, |v| v as f64),
    |b| widen::<u8>(b, f64::from),
    |b| widen::<u16>(b, f64::from),
];

/// Reads a memory-mapped `.npy` file as `T`, converting from any other accepted element
/// type through `convert`.
fn read_npy_as<T>(path: &Path, convert: fn(f64) -> T) -> Result<ArrayD<T>, FileError>
where
    T: ReadableElement + Copy,
{
    let file = File::open(path).map_err(|e| FileError::io(path, e))?;
    let mmap = unsafe { Mmap::map(&file).map_err(|e| FileError::io(path, e))? };
    let bytes: &[u8] = &mmap;

    let mismatch = match ArrayD::<T>::read_npy(bytes) {
        Ok(array) => {
            debug!("Read {} (shape {:?})", path.display(), array.shape());
            return Ok(array);
        }
        Err(e @ ReadNpyError::WrongDescriptor(_)) => e,
        Err(e) => return Err(FileError::malformed(path, e.to_string())),
    };

    for attempt in WIDENINGS {
        match attempt(bytes) {
            Ok(array) => {
                debug!(
                    "Read {} (shape {:?}, converted)",
                    path.display(),
                    array.shape()
                );
                return Ok(array.mapv(convert));
            }
            Err(ReadNpyError::WrongDescriptor(_)) => continue,
            Err(e) => return Err(FileError::malformed(path, e.to_string())),
        }
    }
    Err(FileError::UnsupportedDtype {
        path: path.to_path_buf(),
        reason: mismatch.to_string(),
    })
}

pub fn read_npy_f64(path: &Path) -> Result<ArrayD<f64>, FileError> {
    read_npy_as(path, |v| v)
}

pub fn read_npy_f32(path: &Path) -> Result<ArrayD<f32>, FileError> {
    read_npy_as(path, |v| v as f32)
}

// ========================================================================================
//                               Patient discovery
// ========================================================================================

/// Patient ids found in `dir`, taken from `vox_<id>.npy` file names, in natural order.
pub fn discover_patients(dir: &Path) -> Result<Vec<String>, FileError> {
    let read_dir = fs::read_dir(dir).map_err(|e| FileError::io(dir, e))?;

    let mut ids = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| FileError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            warn!("Skipping non UTF-8 file name in {}", dir.display());
            continue;
        };
        if let Some(id) = name
            .strip_prefix(VOXELS_PREFIX)
            .and_then(|rest| rest.strip_suffix(NPY_EXTENSION))
        {
            if !id.is_empty() && entry.path().is_file() {
                ids.push(id.to_string());
            }
        }
    }
    ids.sort_by(|a, b| compare(a, b));
    debug!("Discovered {} patients in {}", ids.len(), dir.display());
    Ok(ids)
}

pub fn patient_array_path(dir: &Path, prefix: &str, patient_id: &str) -> PathBuf {
    dir.join(format!("{prefix}{patient_id}{NPY_EXTENSION}"))
}

fn require(dir: &Path, prefix: &str, patient_id: &str) -> Result<PathBuf, FileError> {
    let path = patient_array_path(dir, prefix, patient_id);
    if path.is_file() {
        Ok(path)
    } else {
        Err(FileError::MissingArray {
            patient: patient_id.to_string(),
            path,
        })
    }
}

/// Loads the three arrays of one patient.
///
/// Voxels may be stored as `(n, 1, d, d, d)` or `(n, d, d, d)`. Scan sizes may be stored per
/// nodule as `(n, 3)` or once per patient as `(3,)`.
pub fn load_patient(dir: &Path, patient_id: &str) -> Result<PatientRecord, FileError> {
    let voxel_path = require(dir, VOXELS_PREFIX, patient_id)?;
    let centroid_path = require(dir, CENTROIDS_PREFIX, patient_id)?;
    let size_path = require(dir, SCAN_SIZES_PREFIX, patient_id)?;

    let raw_voxels = read_npy_f32(&voxel_path)?;
    let voxels = match raw_voxels.ndim() {
        5 if raw_voxels.len_of(Axis(1)) == 1 => raw_voxels.index_axis_move(Axis(1), 0),
        4 => raw_voxels,
        _ => {
            return Err(FileError::malformed(
                &voxel_path,
                format!(
                    "voxel array must be (n, 1, d, d, d) or (n, d, d, d), found {:?}",
                    raw_voxels.shape()
                ),
            ));
        }
    }
    .into_dimensionality::<ndarray::Ix4>()
    .map_err(|e| FileError::malformed(&voxel_path, e.to_string()))?;
    let n = voxels.len_of(Axis(0));

    let centroids = read_npy_f64(&centroid_path)?
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| FileError::malformed(&centroid_path, e.to_string()))?;
    if centroids.ncols() != 3 {
        return Err(FileError::malformed(
            &centroid_path,
            format!("centroids must have 3 columns, found {}", centroids.ncols()),
        ));
    }

    let raw_sizes = read_npy_f64(&size_path)?;
    let size_shape = raw_sizes.shape().to_vec();
    let scan_sizes: Array2<f64> = match size_shape.as_slice() {
        [3] => raw_sizes
            .broadcast(IxDyn(&[n, 3]))
            .ok_or_else(|| FileError::malformed(&size_path, "cannot broadcast scan size"))?
            .to_owned()
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| FileError::malformed(&size_path, e.to_string()))?,
        [_, 3] => raw_sizes
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| FileError::malformed(&size_path, e.to_string()))?,
        other => {
            return Err(FileError::malformed(
                &size_path,
                format!("scan sizes must be (n, 3) or (3,), found {other:?}"),
            ));
        }
    };

    if centroids.nrows() != n || scan_sizes.nrows() != n {
        return Err(FileError::InconsistentCounts {
            patient: patient_id.to_string(),
            voxels: n,
            centroids: centroids.nrows(),
            scan_sizes: scan_sizes.nrows(),
        });
    }

    Ok(PatientRecord {
        patient_id: patient_id.to_string(),
        voxels,
        centroids,
        scan_sizes,
    })
}

/// Lazily loads patients one at a time, in discovery order.
#[derive(Debug)]
pub struct PatientSource {
    dir: PathBuf,
    ids: std::vec::IntoIter<String>,
}

impl PatientSource {
    pub fn open(dir: &Path) -> Result<Self, FileError> {
        let ids = discover_patients(dir)?;
        Ok(Self::with_ids(dir, ids))
    }

    pub fn with_ids(dir: &Path, ids: Vec<String>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            ids: ids.into_iter(),
        }
    }
}

impl Iterator for PatientSource {
    type Item = Result<PatientRecord, FileError>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        Some(load_patient(&self.dir, &id))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

impl ExactSizeIterator for PatientSource {}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array4, Array5, array};
    use ndarray_npy::write_npy;
    use tempfile::tempdir;

    /// A version 1.0 file with a hand-written header, padded to 64 bytes.
    fn raw_npy(descr: &str, shape: &str, payload: &[u8]) -> Vec<u8> {
        let mut header = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape}, }}");
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x93NUMPY");
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn reads_integer_arrays_as_floats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ints.npy");
        write_npy(&path, &Array1::from(vec![-3i16, 7, 1000])).unwrap();

        let array = read_npy_f64(&path).unwrap();
        assert_eq!(array.shape(), &[3]);
        assert_eq!(array.iter().copied().collect::<Vec<_>>(), vec![-3.0, 7.0, 1000.0]);

        let narrowed = read_npy_f32(&path).unwrap();
        assert_eq!(narrowed.iter().copied().collect::<Vec<_>>(), vec![-3.0f32, 7.0, 1000.0]);
    }

    #[test]
    fn honours_fortran_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fortran.npy");
        let grid = array![[1.0f64, 2.0, 3.0], [4.0, 5.0, 6.0]];
        write_npy(&path, &grid.t()).unwrap();

        let array = read_npy_f64(&path).unwrap();
        assert_eq!(
            array.into_dimensionality::<ndarray::Ix2>().unwrap(),
            grid.t()
        );
    }

    #[test]
    fn reads_voxels_stored_as_double_precision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grid.npy");
        let grid = Array2::from_shape_fn((2, 3), |(i, j)| (i * 3 + j) as f64 * 0.5);
        write_npy(&path, &grid).unwrap();

        let back = read_npy_f32(&path).unwrap();
        assert_eq!(
            back.into_dimensionality::<ndarray::Ix2>().unwrap(),
            grid.mapv(|v| v as f32)
        );
    }

    #[test]
    fn rejects_unsupported_dtypes_and_bad_magic() {
        let dir = tempdir().unwrap();
        let text = dir.path().join("text.npy");
        fs::write(&text, raw_npy("<U4", "(1,)", &[0; 16])).unwrap();
        assert!(matches!(
            read_npy_f64(&text),
            Err(FileError::UnsupportedDtype { .. })
        ));

        let garbage = dir.path().join("garbage.npy");
        fs::write(&garbage, b"not an array at all").unwrap();
        assert!(matches!(
            read_npy_f64(&garbage),
            Err(FileError::Malformed { .. })
        ));

        let truncated = dir.path().join("short.npy");
        fs::write(&truncated, raw_npy("<f4", "(4,)", &[0; 8])).unwrap();
        assert!(matches!(
            read_npy_f32(&truncated),
            Err(FileError::Malformed { .. })
        ));
    }

    #[test]
    fn an_overflowing_header_shape_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.npy");
        fs::write(&path, raw_npy("<f8", "(4611686018427387904, 4)", &[0; 64])).unwrap();

        assert!(matches!(
            read_npy_f64(&path),
            Err(FileError::Malformed { .. })
        ));
        assert!(matches!(
            read_npy_f32(&path),
            Err(FileError::Malformed { .. })
        ));
    }

    #[test]
    fn discovers_patients_in_natural_order() {
        let dir = tempdir().unwrap();
        for name in [
            "vox_p10.npy",
            "vox_p2.npy",
            "vox_p1.npy",
            "cents_p1.npy",
            "notes.txt",
            "vox_.npy",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let ids = discover_patients(dir.path()).unwrap();
        assert_eq!(ids, vec!["p1", "p2", "p10"]);
    }

    #[test]
    fn loads_a_patient_with_channel_axis_and_shared_scan_size() {
        let dir = tempdir().unwrap();
        let voxels = Array5::<f32>::from_shape_fn((2, 1, 4, 4, 4), |(n, _, z, _, _)| {
            (n * 10 + z) as f32
        });
        write_npy(&patient_array_path(dir.path(), VOXELS_PREFIX, "a"), &voxels).unwrap();
        write_npy(
            &patient_array_path(dir.path(), CENTROIDS_PREFIX, "a"),
            &array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
        )
        .unwrap();
        write_npy(
            &patient_array_path(dir.path(), SCAN_SIZES_PREFIX, "a"),
            &Array1::from(vec![300.0, 250.0, 250.0]),
        )
        .unwrap();

        let record = load_patient(dir.path(), "a").unwrap();
        assert_eq!(record.voxels.shape(), &[2, 4, 4, 4]);
        assert_eq!(record.voxels[[1, 3, 0, 0]], 13.0);
        assert_eq!(record.scan_sizes, array![[300.0, 250.0, 250.0], [300.0, 250.0, 250.0]]);

        let mut source = PatientSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 1);
        assert_eq!(source.next().unwrap().unwrap().patient_id, "a");
        assert!(source.next().is_none());
    }

    #[test]
    fn mismatched_counts_and_missing_arrays_are_reported() {
        let dir = tempdir().unwrap();
        write_npy(
            &patient_array_path(dir.path(), VOXELS_PREFIX, "b"),
            &Array4::<f32>::zeros((2, 2, 2, 2)),
        )
        .unwrap();
        assert!(matches!(
            load_patient(dir.path(), "b"),
            Err(FileError::MissingArray { .. })
        ));

        write_npy(
            &patient_array_path(dir.path(), CENTROIDS_PREFIX, "b"),
            &array![[1.0, 2.0, 3.0]],
        )
        .unwrap();
        write_npy(
            &patient_array_path(dir.path(), SCAN_SIZES_PREFIX, "b"),
            &array![[9.0, 9.0, 9.0], [9.0, 9.0, 9.0]],
        )
        .unwrap();
        assert!(matches!(
            load_patient(dir.path(), "b"),
            Err(FileError::InconsistentCounts {
                voxels: 2,
                centroids: 1,
                scan_sizes: 2,
                ..
            })
        ));
    }
}
