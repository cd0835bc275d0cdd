//! # Run Configuration
//!
//! The TOML document that describes one scoring run: augmentation settings, the slot
//! registry with the model file behind each slot, blend coefficients, the number of TTA
//! repetitions and the clustering parameters. Every section has defaults, so an empty file
//! reproduces the calibrated setup.

use crate::adapter::{
    DEFAULT_BATCH_SIZE, EnsembleError, ModelEnsemble, ModelSlot, OutputScale, SlotKind,
};
use crate::augment::{AugmentationConfig, Augmenter};
use crate::blend::{BlendCoefficients, BlendError};
use crate::features::cluster::ClusteringParams;
use crate::probe::{LinearProbeModel, ProbeError};
use crate::tta::TtaConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Blend coefficients do not match the slot registry: {0}")]
    Blend(#[from] BlendError),
    #[error("Failed to assemble the ensemble: {0}")]
    Ensemble(#[from] EnsembleError),
    #[error("Failed to load model for slot '{slot}' from {}: {source}", path.display())]
    Model {
        slot: String,
        path: PathBuf,
        #[source]
        source: ProbeError,
    },
}

/// One named entry of the slot registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub name: String,
    pub kind: SlotKind,
    #[serde(default)]
    pub scale: OutputScale,
    /// Serialized predictor for this slot. Relative paths resolve against the
    /// configuration file's directory.
    pub model: PathBuf,
}

impl SlotConfig {
    fn new(name: &str, kind: SlotKind, scale: OutputScale) -> Self {
        Self {
            name: name.to_string(),
            kind,
            scale,
            model: PathBuf::from("models").join(format!("{name}.toml")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub batch_size: usize,
    pub slots: Vec<SlotConfig>,
}

impl Default for EnsembleConfig {
    /// Six multi-output slots followed by two single-output slots, in the column order
    /// the default blend coefficients were calibrated against.
    fn default() -> Self {
        use OutputScale::{FivePoint, Unit};
        use SlotKind::{MultiOutput, SingleOutput};
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            slots: vec![
                SlotConfig::new("v34_describer", MultiOutput, Unit),
                SlotConfig::new("v35_multi", MultiOutput, FivePoint),
                SlotConfig::new("v34_replicate", MultiOutput, Unit),
                SlotConfig::new("v35_relu_multiout", MultiOutput, FivePoint),
                SlotConfig::new("v36_mse_finetune", MultiOutput, FivePoint),
                SlotConfig::new("v29", MultiOutput, Unit),
                SlotConfig::new("v35_sigmoid", SingleOutput, Unit),
                SlotConfig::new("v35_relu_s2", SingleOutput, FivePoint),
            ],
        }
    }
}

impl EnsembleConfig {
    pub fn count(&self, kind: SlotKind) -> usize {
        self.slots.iter().filter(|s| s.kind == kind).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Seeds the augmentation RNG; a fresh entropy seed is used when absent.
    pub seed: Option<u64>,
    /// Skip a failing patient with a warning instead of aborting the run.
    pub continue_on_error: bool,
    pub augmentation: AugmentationConfig,
    pub ensemble: EnsembleConfig,
    pub blend: BlendCoefficients,
    pub tta: TtaConfig,
    pub clustering: ClusteringParams,
}

impl RunConfig {
    /// Loads a configuration, resolving relative model paths against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&toml_string)?;
        if let Some(base) = path.parent() {
            config.resolve_model_paths(base);
        }
        config.validate()?;
        log::debug!(
            "Loaded configuration from {} ({} slots)",
            path.display(),
            config.ensemble.slots.len()
        );
        Ok(config)
    }

    /// Saves the configuration in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn resolve_model_paths(&mut self, base: &Path) {
        for slot in &mut self.ensemble.slots {
            if slot.model.is_relative() {
                slot.model = base.join(&slot.model);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tta.repetitions == 0 {
            return Err(ConfigError::Invalid(
                "tta.repetitions must be at least 1".to_string(),
            ));
        }
        if self.ensemble.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "ensemble.batch_size must be at least 1".to_string(),
            ));
        }
        if !(self.clustering.eps.is_finite() && self.clustering.eps > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "clustering.eps must be positive, got {}",
                self.clustering.eps
            )));
        }
        if self.clustering.min_samples == 0 {
            return Err(ConfigError::Invalid(
                "clustering.min_samples must be at least 1".to_string(),
            ));
        }
        let max_angle = self.augmentation.max_rotation_degrees;
        if !(max_angle.is_finite() && max_angle >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "augmentation.max_rotation_degrees must be a non-negative number, got {max_angle}"
            )));
        }
        if self.ensemble.count(SlotKind::MultiOutput) == 0 {
            return Err(ConfigError::Invalid(
                "the ensemble needs at least one multi_output slot".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for slot in &self.ensemble.slots {
            if !seen.insert(slot.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "slot name '{}' is used more than once",
                    slot.name
                )));
            }
        }
        self.blend.validate(
            self.ensemble.count(SlotKind::MultiOutput),
            self.ensemble.count(SlotKind::SingleOutput),
        )?;
        Ok(())
    }

    pub fn augmenter(&self) -> Augmenter {
        Augmenter::new(self.augmentation.clone())
    }

    /// Loads every slot's probe file and assembles the ensemble.
    pub fn load_ensemble(&self) -> Result<ModelEnsemble, ConfigError> {
        let mut slots = Vec::with_capacity(self.ensemble.slots.len());
        for slot in &self.ensemble.slots {
            let model =
                LinearProbeModel::load(&slot.model).map_err(|source| ConfigError::Model {
                    slot: slot.name.clone(),
                    path: slot.model.clone(),
                    source,
                })?;
            log::info!(
                "Loaded {:?} slot '{}' from {}",
                slot.kind,
                slot.name,
                slot.model.display()
            );
            slots.push(ModelSlot::new(
                slot.name.clone(),
                slot.kind,
                slot.scale,
                Arc::new(model),
            ));
        }
        Ok(ModelEnsemble::new(
            slots,
            self.augmenter(),
            self.ensemble.batch_size,
        )?)
    }
}
