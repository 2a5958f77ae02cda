//! Estimation of the region containing the numerically significant part of a kernel.

use crate::deconvolution::regularized::{SpectralDeconvolver, SpectralFilter};
use crate::error::PsfError;
use crate::fft::Fft2dWorkspace;
use crate::grains::{bounding_box, extract_component, threshold_mask, BoundingBox};
use ndarray::Array2;

/// Generous sigma used to estimate the support; overestimating the size is preferred.
const SUPPORT_SIGMA: f64 = 4.0;
/// Fraction of the peak absolute value kept by the support mask.
const SUPPORT_THRESHOLD: f64 = 0.05;

/// Kernel support region, symmetric about the kernel peak.
///
/// Positions are indices into a full-size kernel with zero lag at `(yres/2, xres/2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportRegion {
    pub peak_row: usize,
    pub peak_col: usize,
    pub half_width: usize,
    pub half_height: usize,
    xres: usize,
    yres: usize,
}

impl SupportRegion {
    /// Smallest region, centred at zero lag.
    fn minimal(xres: usize, yres: usize) -> Self {
        SupportRegion {
            peak_row: yres / 2,
            peak_col: xres / 2,
            half_width: 1,
            half_height: 1,
            xres,
            yres,
        }
    }

    pub fn width(&self) -> usize {
        2 * self.half_width + 1
    }

    pub fn height(&self) -> usize {
        2 * self.half_height + 1
    }

    /// The region clipped to the field.
    pub fn rect(&self) -> BoundingBox {
        BoundingBox {
            min_row: self.peak_row.saturating_sub(self.half_height),
            min_col: self.peak_col.saturating_sub(self.half_width),
            max_row: (self.peak_row + self.half_height).min(self.yres - 1),
            max_col: (self.peak_col + self.half_width).min(self.xres - 1),
        }
    }

    /// Odd kernel size `(width, height)` covering the region when cropped about zero lag.
    pub fn size_about_zero_lag(&self) -> (usize, usize) {
        let rect = self.rect();
        let half = |min: usize, max: usize, centre: usize| {
            centre.abs_diff(min).max(centre.abs_diff(max))
        };
        let hw = half(rect.min_col, rect.max_col, self.xres / 2);
        let hh = half(rect.min_row, rect.max_row, self.yres / 2);
        ((2 * hw + 1).min(self.xres | 1), (2 * hh + 1).min(self.yres | 1))
    }
}

/// Largest allowed half size so that the odd region fits in a quarter of `res`.
fn max_half_size(res: usize) -> usize {
    let cap = (res / 4).max(1);
    let cap = if cap % 2 == 0 { cap - 1 } else { cap };
    cap / 2
}

/// Bounding box of the thresholded 8-connected component containing `peak`.
///
/// The peak must survive the threshold.
fn peak_component(
    magnitude: &Array2<f64>,
    peak: (usize, usize),
    threshold: f64,
) -> Result<BoundingBox, PsfError> {
    let (row, col) = peak;
    let mask = threshold_mask(magnitude, threshold);
    if !mask[[row, col]] {
        return Err(PsfError::SupportInvariant { row, col });
    }
    bounding_box(&extract_component(&mask, row, col))
        .ok_or(PsfError::SupportInvariant { row, col })
}

/// Estimates the kernel support from a flat-filter solution with a generous sigma.
///
/// The kernel is thresholded at a fraction of its peak absolute value, the 8-connected component
/// containing the peak is kept and its bounding box is expanded by `round(0.5·ln(xres·yres)) + 1`
/// pixels, clipped to the field, symmetrized about the peak and limited to a quarter of the field.
pub fn estimate_support(
    deconv: &SpectralDeconvolver,
    fft: &mut Fft2dWorkspace,
) -> Result<SupportRegion, PsfError> {
    let (xres, yres) = fft.dims();
    let kernel = deconv.solve(SpectralFilter::Flat, SUPPORT_SIGMA, fft)?;
    let magnitude = kernel.data.mapv(f64::abs);

    let mut peak = (yres / 2, xres / 2);
    let mut peak_value = 0.0;
    for ((i, j), &v) in magnitude.indexed_iter() {
        if v > peak_value {
            peak_value = v;
            peak = (i, j);
        }
    }
    if peak_value == 0.0 {
        log::debug!("zero kernel, using the minimal support region");
        return Ok(SupportRegion::minimal(xres, yres));
    }

    let (peak_row, peak_col) = peak;
    let bbox = peak_component(&magnitude, peak, SUPPORT_THRESHOLD * peak_value)?;

    let ext = (0.5 * ((xres * yres) as f64).ln()).round() as usize + 1;
    let min_col = bbox.min_col.saturating_sub(ext);
    let min_row = bbox.min_row.saturating_sub(ext);
    let max_col = (bbox.max_col + ext).min(xres - 1);
    let max_row = (bbox.max_row + ext).min(yres - 1);

    let half_width = (peak_col - min_col)
        .max(max_col - peak_col)
        .min(max_half_size(xres));
    let half_height = (peak_row - min_row)
        .max(max_row - peak_row)
        .min(max_half_size(yres));
    log::debug!(
        "support region {}x{} centred at ({peak_col}, {peak_row})",
        2 * half_width + 1,
        2 * half_height + 1
    );

    Ok(SupportRegion {
        peak_row,
        peak_col,
        half_width,
        half_height,
        xres,
        yres,
    })
}
