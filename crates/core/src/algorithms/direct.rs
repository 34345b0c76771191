use anyhow::Result;
use tracing::info;

use super::kspace;
use super::{
    AlgorithmId, AlgorithmParams, ReconstructionAlgorithm, ReconstructionResult,
    ReconstructionTask, RESULT_DATASET,
};

/// Direct Fourier reconstruction: centered inverse FFT over the spatial axes
/// followed by root-sum-of-squares coil combination.
pub struct DirectReconstruction;

impl ReconstructionAlgorithm for DirectReconstruction {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::DirectReconstruction
    }

    fn name(&self) -> &'static str {
        "Direct Reconstruction"
    }

    fn description(&self) -> &'static str {
        "Direct Fourier reconstruction with RSS coil combination"
    }

    fn default_params(&self) -> AlgorithmParams {
        AlgorithmParams::DirectReconstruction(Default::default())
    }

    fn run(
        &self,
        task: &ReconstructionTask,
        params: &AlgorithmParams,
    ) -> Result<ReconstructionResult> {
        let AlgorithmParams::DirectReconstruction(params) = params else {
            anyhow::bail!("invalid params type for direct_reconstruction");
        };

        let trajectory = params
            .trajectory_calculator
            .resolve(task, params.pulseq_filename.as_deref())?;
        if let Some(path) = &trajectory {
            info!(trajectory = %path.display(), "using uploaded trajectory file");
        }

        let mut kdata = kspace::load_kspace(&task.input_path)?;
        info!(
            job_id = %task.job_id,
            shape = ?kdata.shape(),
            "running direct reconstruction"
        );

        kspace::centered_ifft3(&mut kdata);
        let image = kspace::rss_combine(&kdata)?;
        kspace::write_image(&task.output_path, &image)?;

        Ok(ReconstructionResult {
            result_shape: image.shape().to_vec(),
            result_dataset: RESULT_DATASET.to_string(),
            output_path: task.output_path.clone(),
        })
    }
}
