//! Shared k-space kernels: centered FFTs over the trailing spatial axes,
//! coil combination, and sensitivity estimation.
//!
//! Array convention throughout: complex k-space and coil-image arrays are
//! shaped `(..., coil, z, y, x)`; combined magnitude images drop the coil
//! axis and keep any leading batch dimensions.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{ArrayD, Axis, IxDyn, Zip};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use num_complex::Complex32;
use rustfft::FftPlanner;

const CSM_EPSILON: f32 = 1e-12;

pub fn load_kspace(path: &Path) -> Result<ArrayD<Complex32>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open k-space input: {}", path.display()))?;
    let array = ArrayD::<Complex32>::read_npy(BufReader::new(file))
        .with_context(|| format!("failed to parse k-space npy: {}", path.display()))?;
    anyhow::ensure!(
        array.ndim() >= 4,
        "k-space array must be shaped (..., coil, z, y, x), got {} dimensions",
        array.ndim()
    );
    Ok(array)
}

pub fn write_image(path: &Path, image: &ArrayD<f32>) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create result file: {}", path.display()))?;
    image
        .as_standard_layout()
        .write_npy(BufWriter::new(file))
        .with_context(|| format!("failed to write result npy: {}", path.display()))?;
    Ok(())
}

/// Centered inverse FFT over the three trailing spatial axes, normalized so
/// that a forward/inverse round trip is the identity.
pub fn centered_ifft3(data: &mut ArrayD<Complex32>) {
    let nd = data.ndim();
    for offset in 1..=3 {
        shifted_fft_axis(data, Axis(nd - offset), true);
    }
}

/// Centered forward FFT over the three trailing spatial axes.
pub fn centered_fft3(data: &mut ArrayD<Complex32>) {
    let nd = data.ndim();
    for offset in 1..=3 {
        shifted_fft_axis(data, Axis(nd - offset), false);
    }
}

fn shifted_fft_axis(data: &mut ArrayD<Complex32>, axis: Axis, inverse: bool) {
    let n = data.len_of(axis);
    if n < 2 {
        return;
    }

    let mut planner = FftPlanner::<f32>::new();
    let fft = if inverse {
        planner.plan_fft_inverse(n)
    } else {
        planner.plan_fft_forward(n)
    };
    let scale = if inverse { 1.0 / n as f32 } else { 1.0 };

    let mut scratch = vec![Complex32::default(); n];
    for mut lane in data.lanes_mut(axis) {
        for (dst, src) in scratch.iter_mut().zip(lane.iter()) {
            *dst = *src;
        }
        // ifftshift before the transform, fftshift after: keeps DC at the
        // array center on both sides of the transform.
        scratch.rotate_left(n / 2);
        fft.process(&mut scratch);
        scratch.rotate_left((n + 1) / 2);
        for (dst, src) in lane.iter_mut().zip(scratch.iter()) {
            *dst = *src * scale;
        }
    }
}

/// Root-sum-of-squares combination over the coil axis.
pub fn rss_combine(coil_images: &ArrayD<Complex32>) -> Result<ArrayD<f32>> {
    let nd = coil_images.ndim();
    anyhow::ensure!(
        nd >= 4,
        "coil image array must have at least 4 dimensions, got {nd}"
    );
    let power = coil_images.mapv(|value| value.norm_sqr());
    Ok(power.sum_axis(Axis(nd - 4)).mapv(f32::sqrt))
}

/// Coil sensitivities estimated as the coil images normalized by their RSS
/// magnitude. Unit-magnitude by construction wherever the signal is nonzero.
pub fn estimate_csm(coil_images: &ArrayD<Complex32>) -> Result<ArrayD<Complex32>> {
    let nd = coil_images.ndim();
    let rss = rss_combine(coil_images)?;
    let denom = rss.mapv(|value| value.max(CSM_EPSILON));

    let mut csm = coil_images.clone();
    for mut coil in csm.axis_iter_mut(Axis(nd - 4)) {
        Zip::from(&mut coil)
            .and(&denom)
            .for_each(|value, &scale| *value = *value / scale);
    }
    Ok(csm)
}

/// Uniform all-ones sensitivities, used when coil sensitivity estimation is
/// disabled.
pub fn uniform_csm(coil_images: &ArrayD<Complex32>) -> ArrayD<Complex32> {
    ArrayD::from_elem(coil_images.raw_dim(), Complex32::new(1.0, 0.0))
}

/// Sensitivity-weighted coil combination: `sum_c conj(csm_c) * image_c`.
pub fn weighted_combine(
    coil_images: &ArrayD<Complex32>,
    csm: &ArrayD<Complex32>,
) -> Result<ArrayD<Complex32>> {
    let nd = coil_images.ndim();
    anyhow::ensure!(
        nd >= 4,
        "coil image array must have at least 4 dimensions, got {nd}"
    );
    anyhow::ensure!(
        coil_images.shape() == csm.shape(),
        "coil images and sensitivities must have matching shapes"
    );

    let coil_axis = Axis(nd - 4);
    let mut shape: Vec<usize> = coil_images.shape().to_vec();
    shape.remove(nd - 4);
    let mut combined = ArrayD::<Complex32>::zeros(IxDyn(&shape));

    for (coil_csm, coil_image) in csm
        .axis_iter(coil_axis)
        .zip(coil_images.axis_iter(coil_axis))
    {
        Zip::from(&mut combined)
            .and(&coil_csm)
            .and(&coil_image)
            .for_each(|acc, &sens, &img| *acc += sens.conj() * img);
    }
    Ok(combined)
}
