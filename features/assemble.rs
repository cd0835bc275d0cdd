//! Fixed-width patient feature rows and the table they are written to.

use super::location::LocationFeatures;
use crate::tta::TaskSummary;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const FEATURE_COUNT: usize = 18;
pub const PATIENT_COLUMN: &str = "patient";

/// Column names in output order.
pub const FEATURE_COLUMNS: [&str; FEATURE_COUNT] = [
    "diameter_max",
    "lobulation_max",
    "spiculation_max",
    "malignancy_max",
    "diameter_std",
    "lobulation_std",
    "spiculation_std",
    "malignancy_std",
    "malignant_loc_z",
    "malignant_loc_y",
    "malignant_loc_x",
    "loc_spread_z",
    "loc_spread_y",
    "loc_spread_x",
    "cluster_ratio",
    "noise_ratio",
    "cluster_weighted_malignancy",
    "largest_cluster_ratio",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PatientFeatureVector {
    pub patient_id: String,
    pub values: [f64; FEATURE_COUNT],
}

impl PatientFeatureVector {
    /// Task summary (max then std) followed by the location features.
    pub fn assemble(
        patient_id: impl Into<String>,
        summary: &TaskSummary,
        location: &LocationFeatures,
    ) -> Self {
        let mut values = [0.0; FEATURE_COUNT];
        values[..8].copy_from_slice(&summary.values());
        values[8..].copy_from_slice(&location.values());
        Self {
            patient_id: patient_id.into(),
            values,
        }
    }

    pub fn get(&self, column: &str) -> Option<f64> {
        FEATURE_COLUMNS
            .iter()
            .position(|&c| c == column)
            .map(|ix| self.values[ix])
    }
}

#[derive(Error, Debug)]
pub enum TableError {
    #[error("I/O error while writing the feature table: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error while writing the feature table: {0}")]
    Csv(#[from] csv::Error),
}

/// Feature rows in the order patients were scored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    rows: Vec<PatientFeatureVector>,
}

impl FeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: PatientFeatureVector) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[PatientFeatureVector] {
        &self.rows
    }

    /// Writes the header and one record per patient. Floats use Rust's shortest
    /// round-trip formatting.
    pub fn write_csv<W: Write>(&self, sink: W) -> Result<(), TableError> {
        let mut writer = csv::Writer::from_writer(sink);
        let mut header = Vec::with_capacity(FEATURE_COUNT + 1);
        header.push(PATIENT_COLUMN);
        header.extend(FEATURE_COLUMNS);
        writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = Vec::with_capacity(FEATURE_COUNT + 1);
            record.push(row.patient_id.clone());
            record.extend(row.values.iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), TableError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        self.write_csv(BufWriter::new(file))?;
        log::info!(
            "Wrote {} patient feature rows to {}",
            self.rows.len(),
            path.display()
        );
        Ok(())
    }
}
