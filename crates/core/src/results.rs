//! Read-side access to stored result arrays: full volumes, 2D slices by
//! orientation, and display-windowing statistics.
//!
//! Result files are memory-mapped and viewed through ndarray, so only the
//! requested sub-selection is ever copied out. A result array is shaped
//! `(..., z, y, x)`: everything before the trailing three spatial axes is a
//! batch dimension addressed by explicit index.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use memmap2::Mmap;
use ndarray::{ArrayViewD, Axis};
use ndarray_npy::ViewNpyExt;

use crate::job::{JobRecord, JobUpdate};
use crate::store::JobStore;

/// A finished job's result array, memory-mapped read-only.
pub struct ResultArray {
    mmap: Mmap,
}

impl ResultArray {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open result file: {}", path.display()))?;
        // Safety: result files are written once by the worker and never
        // modified afterwards; deletion unlinks, it does not truncate.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map result file: {}", path.display()))?;
        Ok(Self { mmap })
    }

    pub fn view(&self) -> Result<ArrayViewD<'_, f32>> {
        let view = ArrayViewD::<f32>::view_npy(&self.mmap)
            .map_err(|err| anyhow::anyhow!("failed to view result npy: {err}"))?;
        anyhow::ensure!(
            view.ndim() >= 3,
            "result array must have at least 3 dimensions, got {}",
            view.ndim()
        );
        Ok(view)
    }
}

/// Record the actual on-disk shape onto the job record when it is missing or
/// stale (records predating shape capture, or rewritten by a differently
/// shaped rerun).
pub fn ensure_result_shape(
    store: &JobStore,
    mut job: JobRecord,
    array: &ResultArray,
) -> Result<JobRecord> {
    let shape = array.view()?.shape().to_vec();
    if job.result_shape.as_deref() != Some(shape.as_slice()) {
        store.update(
            &job.id,
            JobUpdate {
                result_shape: Some(shape.clone()),
                ..Default::default()
            },
        )?;
        job.result_shape = Some(shape);
    }
    Ok(job)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchIndexError {
    InvalidLength { expected: usize, got: usize },
    InvalidIndices,
    OutOfRange { index: i64, dim: usize },
}

impl fmt::Display for BatchIndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchIndexError::InvalidLength { expected, got } => {
                write!(f, "invalid batch length: expected {expected}, got {got}")
            }
            BatchIndexError::InvalidIndices => f.write_str("invalid batch indices"),
            BatchIndexError::OutOfRange { index, dim } => {
                write!(f, "batch index out of range: {index} not in 0..{dim}")
            }
        }
    }
}

impl std::error::Error for BatchIndexError {}

/// Parse and validate batch indices against the available batch dimensions.
///
/// No batch dimensions means an empty selection; an absent parameter selects
/// the first element along every leading dimension.
pub fn resolve_batch_indices(
    batch: Option<&str>,
    batch_dims: &[usize],
) -> Result<Vec<usize>, BatchIndexError> {
    if batch_dims.is_empty() {
        return Ok(Vec::new());
    }

    let Some(batch) = batch else {
        return Ok(vec![0; batch_dims.len()]);
    };

    let parts: Vec<&str> = batch
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.len() != batch_dims.len() {
        return Err(BatchIndexError::InvalidLength {
            expected: batch_dims.len(),
            got: parts.len(),
        });
    }

    let mut indices = Vec::with_capacity(parts.len());
    for (part, &dim) in parts.iter().zip(batch_dims) {
        let value: i64 = part.parse().map_err(|_| BatchIndexError::InvalidIndices)?;
        if value < 0 || value as usize >= dim {
            return Err(BatchIndexError::OutOfRange { index: value, dim });
        }
        indices.push(value as usize);
    }
    Ok(indices)
}

pub fn batch_dims(view: &ArrayViewD<'_, f32>) -> Vec<usize> {
    let nd = view.ndim();
    view.shape()[..nd - 3].to_vec()
}

fn apply_batch<'a>(view: ArrayViewD<'a, f32>, batch: &[usize]) -> ArrayViewD<'a, f32> {
    let mut selected = view;
    for &index in batch {
        selected = selected.index_axis_move(Axis(0), index);
    }
    selected
}

fn to_le_bytes(view: &ArrayViewD<'_, f32>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(view.len() * 4);
    for &value in view.iter() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// The trailing z/y/x volume for one batch selection, as row-major float32
/// bytes plus its shape.
pub fn extract_volume(view: ArrayViewD<'_, f32>, batch: &[usize]) -> (Vec<usize>, Vec<u8>) {
    let volume = apply_batch(view, batch);
    (volume.shape().to_vec(), to_le_bytes(&volume))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Yx,
    Zx,
    Zy,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Yx => "yx",
            Orientation::Zx => "zx",
            Orientation::Zy => "zy",
        }
    }

    /// The volume axis indexed by this orientation: "yx" slices along z,
    /// "zx" along y, "zy" along x.
    fn sliced_axis(self) -> usize {
        match self {
            Orientation::Yx => 0,
            Orientation::Zx => 1,
            Orientation::Zy => 2,
        }
    }
}

impl FromStr for Orientation {
    type Err = InvalidOrientationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "yx" => Ok(Orientation::Yx),
            "zx" => Ok(Orientation::Zx),
            "zy" => Ok(Orientation::Zy),
            _ => Err(InvalidOrientationError(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidOrientationError(pub String);

impl fmt::Display for InvalidOrientationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid orientation: {}", self.0)
    }
}

impl std::error::Error for InvalidOrientationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceIndexError {
    pub index: i64,
    pub extent: usize,
}

impl fmt::Display for SliceIndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slice index out of range: {} not in 0..{}",
            self.index, self.extent
        )
    }
}

impl std::error::Error for SliceIndexError {}

/// One 2D plane through the batch-selected volume, as row-major float32
/// bytes plus its shape.
pub fn extract_slice(
    view: ArrayViewD<'_, f32>,
    orientation: Orientation,
    index: i64,
    batch: &[usize],
) -> Result<(Vec<usize>, Vec<u8>), SliceIndexError> {
    let volume = apply_batch(view, batch);
    let axis = orientation.sliced_axis();
    let extent = volume.shape()[axis];
    if index < 0 || index as usize >= extent {
        return Err(SliceIndexError { index, extent });
    }

    let plane = volume.index_axis_move(Axis(axis), index as usize);
    Ok((plane.shape().to_vec(), to_le_bytes(&plane)))
}

/// 1st and 99th percentile of the batch-selected volume, for client-side
/// display windowing.
pub fn window_stats(view: ArrayViewD<'_, f32>, batch: &[usize]) -> (f64, f64) {
    let volume = apply_batch(view, batch);
    let mut values: Vec<f32> = volume.iter().copied().collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }
    values.sort_by(f32::total_cmp);
    (percentile(&values, 1.0), percentile(&values, 99.0))
}

/// Linear-interpolation percentile over an ascending-sorted slice.
fn percentile(sorted: &[f32], q: f64) -> f64 {
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    let lower_value = f64::from(sorted[lower]);
    let upper_value = f64::from(sorted[upper]);
    lower_value + fraction * (upper_value - lower_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use ndarray_npy::WriteNpyExt;
    use tempfile::TempDir;

    fn sequential_array(shape: &[usize]) -> ArrayD<f32> {
        let len: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|v| v as f32).collect())
            .expect("build array")
    }

    fn write_result(dir: &Path, shape: &[usize]) -> std::path::PathBuf {
        let path = dir.join("result.npy");
        sequential_array(shape)
            .write_npy(File::create(&path).expect("create"))
            .expect("write npy");
        path
    }

    #[test]
    fn valid_batch_indices_pass_through_unchanged() {
        let dims = [2, 3];
        for i in 0..2 {
            for j in 0..3 {
                let raw = format!("{i},{j}");
                assert_eq!(
                    resolve_batch_indices(Some(&raw), &dims),
                    Ok(vec![i, j]),
                    "batch {raw}"
                );
            }
        }
    }

    #[test]
    fn absent_batch_defaults_to_zeros() {
        assert_eq!(resolve_batch_indices(None, &[4, 2, 7]), Ok(vec![0, 0, 0]));
    }

    #[test]
    fn no_batch_dims_means_empty_selection() {
        assert_eq!(resolve_batch_indices(None, &[]), Ok(Vec::new()));
        assert_eq!(resolve_batch_indices(Some("3"), &[]), Ok(Vec::new()));
    }

    #[test]
    fn whitespace_around_indices_is_tolerated() {
        assert_eq!(
            resolve_batch_indices(Some(" 1 , 0 "), &[2, 3]),
            Ok(vec![1, 0])
        );
    }

    #[test]
    fn length_mismatch_is_rejected() {
        assert_eq!(
            resolve_batch_indices(Some("1"), &[2, 3]),
            Err(BatchIndexError::InvalidLength {
                expected: 2,
                got: 1
            })
        );
        assert_eq!(
            resolve_batch_indices(Some("1,0,0"), &[2, 3]),
            Err(BatchIndexError::InvalidLength {
                expected: 2,
                got: 3
            })
        );
    }

    #[test]
    fn non_integer_indices_are_rejected() {
        assert_eq!(
            resolve_batch_indices(Some("a,b"), &[2, 3]),
            Err(BatchIndexError::InvalidIndices)
        );
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        assert_eq!(
            resolve_batch_indices(Some("2,0"), &[2, 3]),
            Err(BatchIndexError::OutOfRange { index: 2, dim: 2 })
        );
        assert_eq!(
            resolve_batch_indices(Some("-1,0"), &[2, 3]),
            Err(BatchIndexError::OutOfRange { index: -1, dim: 2 })
        );
    }

    #[test]
    fn volume_extraction_selects_the_batch_prefix() {
        let temp = TempDir::new().expect("tempdir");
        let path = write_result(temp.path(), &[2, 2, 2, 2]);
        let array = ResultArray::open(&path).expect("open");
        let view = array.view().expect("view");

        assert_eq!(batch_dims(&view), vec![2]);

        let (shape, bytes) = extract_volume(view, &[1]);
        assert_eq!(shape, vec![2, 2, 2]);
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        assert_eq!(values, (8..16).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn slice_orientations_index_the_expected_axis() {
        let temp = TempDir::new().expect("tempdir");
        let path = write_result(temp.path(), &[2, 3, 4]);
        let array = ResultArray::open(&path).expect("open");

        let (shape, _) =
            extract_slice(array.view().unwrap(), Orientation::Yx, 1, &[]).expect("yx slice");
        assert_eq!(shape, vec![3, 4]);

        let (shape, _) =
            extract_slice(array.view().unwrap(), Orientation::Zx, 2, &[]).expect("zx slice");
        assert_eq!(shape, vec![2, 4]);

        let (shape, bytes) =
            extract_slice(array.view().unwrap(), Orientation::Zy, 3, &[]).expect("zy slice");
        assert_eq!(shape, vec![2, 3]);
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        // x fixed at 3 across the (2, 3) z/y grid of a 2x3x4 volume.
        assert_eq!(values, vec![3.0, 7.0, 11.0, 15.0, 19.0, 23.0]);
    }

    #[test]
    fn slice_index_at_the_extent_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let path = write_result(temp.path(), &[8, 4, 4]);
        let array = ResultArray::open(&path).expect("open");

        // Valid z indices for a yx slice of an 8-deep volume are 0..=7.
        assert!(extract_slice(array.view().unwrap(), Orientation::Yx, 7, &[]).is_ok());
        let error = extract_slice(array.view().unwrap(), Orientation::Yx, 8, &[]).unwrap_err();
        assert_eq!(error, SliceIndexError { index: 8, extent: 8 });
        assert!(extract_slice(array.view().unwrap(), Orientation::Yx, -1, &[]).is_err());
    }

    #[test]
    fn window_stats_of_a_constant_volume_collapse() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("constant.npy");
        ArrayD::from_elem(IxDyn(&[4, 4, 4]), 7.25f32)
            .write_npy(File::create(&path).expect("create"))
            .expect("write npy");

        let array = ResultArray::open(&path).expect("open");
        let (p01, p99) = window_stats(array.view().unwrap(), &[]);
        assert_eq!(p01, 7.25);
        assert_eq!(p99, 7.25);
    }

    #[test]
    fn percentiles_use_linear_interpolation() {
        let values: Vec<f32> = (0..=100).map(|v| v as f32).collect();
        assert!((percentile(&values, 1.0) - 1.0).abs() < 1e-9);
        assert!((percentile(&values, 99.0) - 99.0).abs() < 1e-9);

        // Midpoint interpolation between the two elements of [0, 10].
        let pair = vec![0.0f32, 10.0];
        assert!((percentile(&pair, 50.0) - 5.0).abs() < 1e-12);
        assert!((percentile(&pair, 99.0) - 9.9).abs() < 1e-9);
    }

    #[test]
    fn ensure_result_shape_repairs_a_missing_shape() {
        let temp = TempDir::new().expect("tempdir");
        let store = JobStore::new(temp.path().join("results"), temp.path().join("inputs"));
        store.ensure_io_directories().expect("io dirs");

        let job = crate::job::JobRecord {
            id: "job-1".to_string(),
            name: "scan".to_string(),
            status: crate::job::JobStatus::Finished,
            algorithm: crate::algorithms::AlgorithmId::DirectReconstruction,
            params: crate::algorithms::AlgorithmParams::DirectReconstruction(Default::default()),
            result_shape: None,
            result_dataset: crate::algorithms::RESULT_DATASET.to_string(),
            available_formats: vec![crate::algorithms::DownloadFormat::Npy],
            created_at: chrono::Utc::now(),
            input_filename: "scan.npy".to_string(),
            input_available: true,
            result_available: true,
            log_messages: Vec::new(),
            error: None,
            queue_task_id: None,
            cancel_requested: false,
        };
        store.save(&job).expect("save");

        let result_path = store.result_path("job-1");
        sequential_array(&[2, 4, 4])
            .write_npy(File::create(&result_path).expect("create"))
            .expect("write npy");

        let array = ResultArray::open(&result_path).expect("open");
        let repaired = ensure_result_shape(&store, job, &array).expect("repair");
        assert_eq!(repaired.result_shape, Some(vec![2, 4, 4]));
        assert_eq!(
            store.load("job-1").unwrap().result_shape,
            Some(vec![2, 4, 4])
        );
    }
}
