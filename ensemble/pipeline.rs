// ========================================================================================
//                       Per-patient scoring, run loop & errors
// ========================================================================================

use crate::adapter::ModelEnsemble;
use crate::blend::LinearBlender;
use crate::config::{ConfigError, RunConfig};
use crate::features::FeatureError;
use crate::features::assemble::{FeatureTable, PatientFeatureVector, TableError};
use crate::features::cluster::ClusteringParams;
use crate::features::location::LocationFeatures;
use crate::files::FileError;
use crate::tta::{TaskSummary, TtaAggregator, TtaError};
use crate::types::{PatientRecord, Task};
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Tta(#[from] TtaError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Patient '{patient}': {source}")]
    Patient {
        patient: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    fn for_patient(patient: &str, source: PipelineError) -> Self {
        PipelineError::Patient {
            patient: patient.to_string(),
            source: Box::new(source),
        }
    }
}

/// Observer for per-patient progress while scoring a run.
pub trait ScoringProgressObserver {
    fn on_start(&mut self, total_patients: usize) {
        let _ = total_patients;
    }
    fn on_patient_scored(&mut self, patient_id: &str, n_nodules: usize) {
        let _ = (patient_id, n_nodules);
    }
    fn on_patient_skipped(&mut self, error: &PipelineError) {
        let _ = error;
    }
    fn on_finish(&mut self) {}
}

#[derive(Default)]
pub struct NoopScoringProgress;

impl ScoringProgressObserver for NoopScoringProgress {}

/// Ensemble, blender, TTA loop and clustering parameters for one run.
#[derive(Debug, Clone)]
pub struct FeaturePipeline {
    ensemble: ModelEnsemble,
    blender: LinearBlender,
    tta: TtaAggregator,
    clustering: ClusteringParams,
}

impl FeaturePipeline {
    pub fn new(
        ensemble: ModelEnsemble,
        blender: LinearBlender,
        tta: TtaAggregator,
        clustering: ClusteringParams,
    ) -> Self {
        Self {
            ensemble,
            blender,
            tta,
            clustering,
        }
    }

    /// Validates `config`, loads every slot's model and wires the stages together.
    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let ensemble = config.load_ensemble()?;
        let blender = LinearBlender::for_ensemble(config.blend.clone(), &ensemble)?;
        let tta = TtaAggregator::new(&config.tta)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(Self::new(ensemble, blender, tta, config.clustering.clone()))
    }

    /// The 18-value feature row of one patient.
    pub fn process_patient<R: Rng + ?Sized>(
        &self,
        record: &PatientRecord,
        rng: &mut R,
    ) -> Result<PatientFeatureVector, PipelineError> {
        let averaged = self.tta.average_predictions(
            &self.ensemble,
            &self.blender,
            record.voxels.view(),
            rng,
        )?;
        let summary = TaskSummary::from_predictions(&averaged)?;
        let location = LocationFeatures::compute(
            record.centroids.view(),
            record.scan_sizes.view(),
            averaged.task(Task::Malignancy),
            &self.clustering,
        )?;
        Ok(PatientFeatureVector::assemble(
            record.patient_id.clone(),
            &summary,
            &location,
        ))
    }

    /// Scores patients in order. With `continue_on_error`, a patient that fails to load or
    /// score is logged, reported to the observer and left out of the table.
    pub fn run<I, R, O>(
        &self,
        records: I,
        rng: &mut R,
        observer: &mut O,
        continue_on_error: bool,
    ) -> Result<FeatureTable, PipelineError>
    where
        I: IntoIterator<Item = Result<PatientRecord, FileError>>,
        R: Rng + ?Sized,
        O: ScoringProgressObserver + ?Sized,
    {
        let records = records.into_iter();
        log::debug!(
            "Ensemble of {} multi-output and {} single-output slots, {} TTA repetitions",
            self.ensemble.multi_output_slots().len(),
            self.ensemble.single_output_slots().len(),
            self.tta.repetitions()
        );
        observer.on_start(records.size_hint().0);

        let mut table = FeatureTable::new();
        let mut skipped = 0usize;
        for record in records {
            let outcome = record.map_err(PipelineError::from).and_then(|record| {
                log::debug!(
                    "Scoring patient '{}' ({} nodules)",
                    record.patient_id,
                    record.n_nodules()
                );
                self.process_patient(&record, rng)
                    .map(|row| (row, record.n_nodules()))
                    .map_err(|e| PipelineError::for_patient(&record.patient_id, e))
            });

            match outcome {
                Ok((row, n_nodules)) => {
                    observer.on_patient_scored(&row.patient_id, n_nodules);
                    table.push(row);
                }
                Err(e) if continue_on_error => {
                    log::warn!("Skipping patient: {e}");
                    observer.on_patient_skipped(&e);
                    skipped += 1;
                }
                Err(e) => {
                    observer.on_finish();
                    return Err(e);
                }
            }
        }

        observer.on_finish();
        log::info!("Scored {} patients ({} skipped)", table.len(), skipped);
        Ok(table)
    }
}
