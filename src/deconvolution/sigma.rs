//! Automatic choice of the regularization strength.
//!
//! The flat and least-squares estimators balance the regularization against the noise power
//! found in the windowed measured field. The pseudo-Wiener estimator has no closed form; it looks
//! for the sigma giving the most compact kernel inside the support region.

use crate::config::WienerSearch;
use crate::data_container::Field;
use crate::deconvolution::least_squares::FitRegion;
use crate::deconvolution::preprocess::centred_energy;
use crate::deconvolution::regularized::{SpectralDeconvolver, SpectralFilter};
use crate::deconvolution::support::SupportRegion;
use crate::error::PsfError;
use crate::fft::Fft2dWorkspace;
use crate::grains::weighted_dispersion;
use crate::math_tools::{estimate_noise, find_minimum_1d};
use ndarray::s;

pub const SIGMA_MIN: f64 = 1e-8;
pub const SIGMA_MAX: f64 = 1e3;

fn clamp_sigma(sigma: f64) -> f64 {
    if sigma.is_finite() {
        sigma.clamp(SIGMA_MIN, SIGMA_MAX)
    } else {
        SIGMA_MAX
    }
}

/// Closed-form sigma for the flat filter.
///
/// With `E_n = N·ν²` the noise energy, the regularization `λ = σ²·E_I·E_M` matches
/// `E_I·E_n/(E_M - E_n)`, the mean ideal power times the noise to signal ratio.
pub fn flat_sigma(wmeas: &Field) -> f64 {
    let e_m = centred_energy(wmeas);
    if e_m == 0.0 {
        return SIGMA_MIN;
    }
    let nu = estimate_noise(&wmeas.data);
    let e_n = (wmeas.data.len() as f64 * nu * nu).min(0.5 * e_m);
    clamp_sigma((e_n / (e_m * (e_m - e_n))).sqrt())
}

/// Closed-form sigma for the least-squares solver with a `width` x `height` kernel.
///
/// Ridge regression balances the kernel pixel count times the noise variance against the signal
/// energy left over the fitting region.
pub fn least_squares_sigma(wmeas: &Field, width: usize, height: usize, border: usize) -> f64 {
    let (yres, xres) = wmeas.data.dim();
    let Some(region) = FitRegion::new(xres, yres, width, height, border) else {
        return SIGMA_MIN;
    };
    let e_m = region.energy(&wmeas.data);
    if e_m == 0.0 {
        return SIGMA_MIN;
    }
    let nu = estimate_noise(&wmeas.data);
    let e_n = (region.pixel_count() as f64 * nu * nu).min(0.5 * e_m);
    let n_k = (width * height) as f64;
    clamp_sigma((n_k * nu * nu / (e_m * (e_m - e_n))).sqrt())
}

/// Sigma minimizing the dispersion radius of `|K|` inside `region`, scaled by the calibration
/// factor.
///
/// The search runs over `ln σ` between the bracket in `search`.
pub fn pseudo_wiener_sigma(
    deconv: &SpectralDeconvolver,
    region: &SupportRegion,
    search: &WienerSearch,
    fft: &mut Fft2dWorkspace,
) -> Result<f64, PsfError> {
    if deconv.is_degenerate() {
        return Ok(clamp_sigma(search.fudge * search.sigma_min));
    }
    let rect = region.rect();
    // The objective cannot return errors, the first failure is kept and reported afterwards
    let mut failure = None;
    let objective = |log_sigma: f64| {
        match deconv.solve(SpectralFilter::PseudoWiener, log_sigma.exp(), fft) {
            Ok(kernel) => {
                let area = kernel
                    .data
                    .slice(s![rect.min_row..=rect.max_row, rect.min_col..=rect.max_col])
                    .mapv(f64::abs);
                weighted_dispersion(&area, None, kernel.dx, kernel.dy).sqrt()
            }
            Err(err) => {
                failure.get_or_insert(err);
                f64::INFINITY
            }
        }
    };
    let log_sigma = find_minimum_1d(
        objective,
        search.sigma_min.ln(),
        search.sigma_max.ln(),
        search.coarse_steps,
        search.tolerance,
    );
    if let Some(err) = failure {
        return Err(err);
    }
    Ok(clamp_sigma(search.fudge * log_sigma.exp()))
}
