//! Reconstruction algorithm registry and parameter models.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod direct;
pub mod kspace;
pub mod sense;

use direct::DirectReconstruction;
use sense::SenseReconstruction;

/// Logical dataset name recorded for every stored result array.
pub const RESULT_DATASET: &str = "image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmId {
    DirectReconstruction,
    Sense,
}

impl AlgorithmId {
    pub fn as_str(self) -> &'static str {
        match self {
            AlgorithmId::DirectReconstruction => "direct_reconstruction",
            AlgorithmId::Sense => "sense",
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmId {
    type Err = UnknownAlgorithmError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "direct_reconstruction" => Ok(AlgorithmId::DirectReconstruction),
            "sense" => Ok(AlgorithmId::Sense),
            _ => Err(UnknownAlgorithmError(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAlgorithmError(pub String);

impl fmt::Display for UnknownAlgorithmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown algorithm: {}", self.0)
    }
}

impl std::error::Error for UnknownAlgorithmError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadFormat {
    Npy,
    Raw,
}

impl DownloadFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadFormat::Npy => "npy",
            DownloadFormat::Raw => "raw",
        }
    }
}

impl FromStr for DownloadFormat {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "npy" => Ok(DownloadFormat::Npy),
            "raw" => Ok(DownloadFormat::Raw),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryMode {
    Ismrmrd,
    Cartesian,
    Pulseq,
}

impl TrajectoryMode {
    /// Resolve the trajectory side input for a task. Only `pulseq` needs one:
    /// the trajectory file uploaded next to the k-space input under
    /// `{job_id}_{filename}`.
    pub fn resolve(
        self,
        task: &ReconstructionTask,
        pulseq_filename: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        match self {
            TrajectoryMode::Ismrmrd | TrajectoryMode::Cartesian => Ok(None),
            TrajectoryMode::Pulseq => {
                let filename = pulseq_filename.filter(|name| !name.is_empty()).ok_or_else(
                    || anyhow::anyhow!("pulseq_filename must be provided for pulseq trajectory"),
                )?;
                let path = task.side_input_path(filename);
                anyhow::ensure!(
                    path.exists(),
                    "pulseq trajectory file missing: {}",
                    path.display()
                );
                Ok(Some(path))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsmAlgorithm {
    Walsh,
    Inati,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectReconstructionParams {
    pub trajectory_calculator: TrajectoryMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulseq_filename: Option<String>,
    pub csm_algorithm: CsmAlgorithm,
}

impl Default for DirectReconstructionParams {
    fn default() -> Self {
        Self {
            trajectory_calculator: TrajectoryMode::Ismrmrd,
            pulseq_filename: None,
            csm_algorithm: CsmAlgorithm::Walsh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SenseParams {
    pub trajectory_calculator: TrajectoryMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulseq_filename: Option<String>,
    pub csm_algorithm: CsmAlgorithm,
    pub regularization: f64,
    pub iterations: u32,
}

impl Default for SenseParams {
    fn default() -> Self {
        Self {
            trajectory_calculator: TrajectoryMode::Ismrmrd,
            pulseq_filename: None,
            csm_algorithm: CsmAlgorithm::Walsh,
            regularization: 0.01,
            iterations: 10,
        }
    }
}

/// Validated parameter set, discriminated by the `algorithm` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmParams {
    DirectReconstruction(DirectReconstructionParams),
    Sense(SenseParams),
}

impl AlgorithmParams {
    pub fn algorithm(&self) -> AlgorithmId {
        match self {
            AlgorithmParams::DirectReconstruction(_) => AlgorithmId::DirectReconstruction,
            AlgorithmParams::Sense(_) => AlgorithmId::Sense,
        }
    }

    pub fn trajectory_calculator(&self) -> TrajectoryMode {
        match self {
            AlgorithmParams::DirectReconstruction(p) => p.trajectory_calculator,
            AlgorithmParams::Sense(p) => p.trajectory_calculator,
        }
    }

    pub fn pulseq_filename(&self) -> Option<&str> {
        match self {
            AlgorithmParams::DirectReconstruction(p) => p.pulseq_filename.as_deref(),
            AlgorithmParams::Sense(p) => p.pulseq_filename.as_deref(),
        }
    }

    pub fn set_pulseq_filename(&mut self, filename: Option<String>) {
        match self {
            AlgorithmParams::DirectReconstruction(p) => p.pulseq_filename = filename,
            AlgorithmParams::Sense(p) => p.pulseq_filename = filename,
        }
    }

    /// Cross-field constraint: a trajectory file name is required iff the
    /// trajectory mode needs one.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let has_pulseq = self.pulseq_filename().is_some_and(|name| !name.is_empty());
        match self.trajectory_calculator() {
            TrajectoryMode::Pulseq if !has_pulseq => Err(ParamsError::PulseqFilenameRequired),
            TrajectoryMode::Ismrmrd | TrajectoryMode::Cartesian if has_pulseq => {
                Err(ParamsError::PulseqFilenameNotAllowed)
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamsError {
    PulseqFilenameRequired,
    PulseqFilenameNotAllowed,
}

impl fmt::Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamsError::PulseqFilenameRequired => {
                f.write_str("pulseq_filename is required when trajectory_calculator is pulseq")
            }
            ParamsError::PulseqFilenameNotAllowed => {
                f.write_str("pulseq_filename is only allowed when trajectory_calculator is pulseq")
            }
        }
    }
}

impl std::error::Error for ParamsError {}

/// Inputs handed to one reconstruction run.
#[derive(Debug, Clone)]
pub struct ReconstructionTask {
    pub job_id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

impl ReconstructionTask {
    /// Path of an auxiliary upload stored next to the k-space input.
    pub fn side_input_path(&self, filename: &str) -> PathBuf {
        let bare = Path::new(filename)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.to_string());
        match self.input_path.parent() {
            Some(parent) => parent.join(format!("{}_{bare}", self.job_id)),
            None => PathBuf::from(format!("{}_{bare}", self.job_id)),
        }
    }
}

/// Result metadata from a reconstruction run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionResult {
    pub result_shape: Vec<usize>,
    pub result_dataset: String,
    pub output_path: PathBuf,
}

pub trait ReconstructionAlgorithm: Send + Sync {
    fn id(&self) -> AlgorithmId;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn default_params(&self) -> AlgorithmParams;
    fn run(
        &self,
        task: &ReconstructionTask,
        params: &AlgorithmParams,
    ) -> Result<ReconstructionResult>;
}

/// Explicitly constructed algorithm lookup, injected wherever a handler or
/// the runner needs to resolve an id.
pub struct AlgorithmRegistry {
    algorithms: Vec<Box<dyn ReconstructionAlgorithm>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self {
            algorithms: Vec::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DirectReconstruction));
        registry.register(Box::new(SenseReconstruction));
        registry
    }

    /// Registering an id twice replaces the earlier entry; tests use this to
    /// swap a builtin for a stub.
    pub fn register(&mut self, algorithm: Box<dyn ReconstructionAlgorithm>) {
        self.algorithms.retain(|entry| entry.id() != algorithm.id());
        self.algorithms.push(algorithm);
    }

    pub fn get(&self, id: AlgorithmId) -> Option<&dyn ReconstructionAlgorithm> {
        self.algorithms
            .iter()
            .find(|entry| entry.id() == id)
            .map(Box::as_ref)
    }

    pub fn list(&self) -> impl Iterator<Item = &dyn ReconstructionAlgorithm> {
        self.algorithms.iter().map(Box::as_ref)
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
