//! Configuration of a transfer function estimation run.

use crate::math_tools::Window;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Smallest kernel dimension that is ever solved for.
pub const MIN_KERNEL_SIZE: usize = 3;
/// Smallest accepted slice dimension.
pub const MIN_FIELD_SIZE: usize = 24;
pub const LOG_SIGMA_MIN: f64 = -8.0;
pub const LOG_SIGMA_MAX: f64 = 3.0;

/// Deconvolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Method {
    /// Full-size frequency domain solve with a flat Tikhonov term.
    #[default]
    Regularized,
    /// Explicit small kernel fitted in the spatial domain.
    LeastSquares,
    /// Full-size frequency domain solve with a frequency weighted term.
    PseudoWiener,
}

impl Method {
    /// Whether the method solves at slice resolution and crops afterwards.
    pub fn is_full_sized(&self) -> bool {
        matches!(self, Method::Regularized | Method::PseudoWiener)
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Regularized => write!(f, "Regularized filter"),
            Method::LeastSquares => write!(f, "Least squares"),
            Method::PseudoWiener => write!(f, "Wiener filter"),
        }
    }
}

/// Interpretation of sampled kernel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Normalization {
    /// Kernel approximates a continuous kernel, `M = Σ I·K·dx·dy`.
    #[default]
    Integral,
    /// Kernel values are plain discrete multipliers, `M = Σ I·K`.
    Discrete,
}

/// Which results an estimation run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSelection {
    /// Output volume with one kernel per z level.
    pub kernel: bool,
    pub width: bool,
    pub height: bool,
    pub norm: bool,
    /// Norm of the residual `M - I★K`. The only metric requiring an extra convolution.
    pub residual: bool,
    pub sigma: bool,
}

impl OutputSelection {
    pub fn none() -> Self {
        OutputSelection {
            kernel: false,
            width: false,
            height: false,
            norm: false,
            residual: false,
            sigma: false,
        }
    }

    pub fn all() -> Self {
        OutputSelection {
            kernel: true,
            width: true,
            height: true,
            norm: true,
            residual: true,
            sigma: true,
        }
    }

    pub fn any(&self) -> bool {
        self.kernel || self.any_metric()
    }

    pub fn any_metric(&self) -> bool {
        self.width || self.height || self.norm || self.residual || self.sigma
    }
}

impl Default for OutputSelection {
    fn default() -> Self {
        OutputSelection {
            kernel: true,
            width: true,
            ..OutputSelection::none()
        }
    }
}

/// Calibration constants of the pseudo-Wiener sigma search.
///
/// The factor was tuned on simulated data and is not a physical constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WienerSearch {
    /// Factor applied to the sigma minimizing the kernel dispersion.
    pub fudge: f64,
    pub sigma_min: f64,
    pub sigma_max: f64,
    /// Number of coarse samples of ln σ before the golden section refinement.
    pub coarse_steps: usize,
    /// Absolute tolerance in ln σ.
    pub tolerance: f64,
}

impl Default for WienerSearch {
    fn default() -> Self {
        WienerSearch {
            fudge: 0.375,
            sigma_min: 1e-8,
            sigma_max: 1e3,
            coarse_steps: 20,
            tolerance: 1e-4,
        }
    }
}

/// Holds all parameters of an estimation run.
///
/// # Fields
/// - `method`: Deconvolution strategy.
/// - `log_sigma`: Decimal logarithm of the regularization strength, used when `estimate_sigma`
///   is off.
/// - `window`: Apodization applied to both fields before solving.
/// - `estimate_size`: Estimate the kernel support per level (least squares only).
/// - `estimate_sigma`: Estimate the regularization strength per level.
/// - `kernel_width`, `kernel_height`: Requested kernel size.
/// - `border`: Pixels excluded from the least-squares fitting region.
/// - `normalization`: Convention of the reported kernels and metrics.
/// - `outputs`: Requested results.
/// - `wiener`: Pseudo-Wiener search constants.
/// - `threads`: Worker count, `None` for the global Rayon pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfConfig {
    pub method: Method,
    pub log_sigma: f64,
    pub window: Window,
    pub estimate_size: bool,
    pub estimate_sigma: bool,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub border: usize,
    pub normalization: Normalization,
    pub outputs: OutputSelection,
    pub wiener: WienerSearch,
    pub threads: Option<usize>,
}

impl Default for PsfConfig {
    fn default() -> Self {
        PsfConfig {
            method: Method::Regularized,
            log_sigma: 1.0,
            window: Window::Welch,
            estimate_size: false,
            estimate_sigma: false,
            kernel_width: 41,
            kernel_height: 41,
            border: 2,
            normalization: Normalization::Integral,
            outputs: OutputSelection::default(),
            wiener: WienerSearch::default(),
            threads: None,
        }
    }
}

impl PsfConfig {
    /// Regularization strength `10^log_sigma`.
    pub fn sigma(&self) -> f64 {
        10f64.powf(self.log_sigma)
    }

    /// Returns a copy with every value moved into its valid range for a field of
    /// `xres` x `yres` pixels.
    ///
    /// Out-of-range values are clamped silently. Kernels larger than the field are left alone
    /// so that validation can reject them.
    pub fn sanitize(&self, xres: usize, yres: usize) -> PsfConfig {
        let mut config = self.clone();
        config.log_sigma = if config.log_sigma.is_finite() {
            config.log_sigma.clamp(LOG_SIGMA_MIN, LOG_SIGMA_MAX)
        } else {
            PsfConfig::default().log_sigma
        };
        config.kernel_width = clamp_kernel_size(config.method, config.kernel_width, xres);
        config.kernel_height = clamp_kernel_size(config.method, config.kernel_height, yres);
        config.border = config.border.min(xres.min(yres) / 8);
        config.threads = config.threads.filter(|&n| n > 0);
        if config.method.is_full_sized() {
            config.estimate_size = false;
        }
        config
    }
}

/// Clamps a requested kernel dimension for a field dimension `res`.
///
/// Least-squares kernels are limited to `(res/3) | 1` and forced odd, since the solved system
/// has one unknown per kernel pixel.
pub fn clamp_kernel_size(method: Method, size: usize, res: usize) -> usize {
    let size = size.max(MIN_KERNEL_SIZE);
    match method {
        Method::LeastSquares => {
            let cap = ((res / 3) | 1).max(MIN_KERNEL_SIZE);
            (size | 1).min(cap)
        }
        Method::Regularized | Method::PseudoWiener => size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_squares_size_is_clamped_to_odd_third() {
        assert_eq!(clamp_kernel_size(Method::LeastSquares, 200, 128), 43);
        assert_eq!(clamp_kernel_size(Method::LeastSquares, 20, 128), 21);
        assert_eq!(clamp_kernel_size(Method::LeastSquares, 1, 128), 3);
        assert_eq!(clamp_kernel_size(Method::LeastSquares, 200, 96), 33);
        assert_eq!(clamp_kernel_size(Method::Regularized, 64, 128), 64);
        assert_eq!(clamp_kernel_size(Method::PseudoWiener, 0, 128), 3);
    }

    #[test]
    fn test_sanitize_clamps_sigma_and_border() {
        let config = PsfConfig {
            log_sigma: 12.0,
            border: 100,
            threads: Some(0),
            ..PsfConfig::default()
        };
        let sane = config.sanitize(64, 48);
        assert_eq!(sane.log_sigma, LOG_SIGMA_MAX);
        assert_eq!(sane.border, 6);
        assert_eq!(sane.threads, None);

        let config = PsfConfig {
            log_sigma: f64::NAN,
            ..PsfConfig::default()
        };
        assert_eq!(config.sanitize(64, 64).log_sigma, 1.0);
    }

    #[test]
    fn test_size_estimation_only_for_least_squares() {
        let config = PsfConfig {
            estimate_size: true,
            ..PsfConfig::default()
        };
        assert!(!config.sanitize(64, 64).estimate_size);
        let config = PsfConfig {
            method: Method::LeastSquares,
            estimate_size: true,
            ..PsfConfig::default()
        };
        assert!(config.sanitize(64, 64).estimate_size);
    }

    #[test]
    fn test_default_outputs() {
        let outputs = OutputSelection::default();
        assert!(outputs.kernel && outputs.width);
        assert!(!outputs.residual);
        assert!(!OutputSelection::none().any());
        assert!(OutputSelection::all().any_metric());
    }
}
