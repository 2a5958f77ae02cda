//! Kernel solvers.
//!
//! [`KernelSolver`] dispatches between the full-size frequency domain solvers and the explicit
//! least-squares solver. Every variant takes windowed fields, returns an integral-convention
//! kernel of its configured size and keeps its scratch in a per-worker [`SolverScratch`].

pub mod least_squares;
pub mod preprocess;
pub mod regularized;
pub mod sigma;
pub mod support;

use crate::config::{Method, PsfConfig, WienerSearch};
use crate::data_container::Field;
use crate::error::PsfError;
use crate::fft::Fft2dWorkspace;
use crate::field_ops::crop_about_zero_lag;
use least_squares::{deconvolve_least_squares, LeastSquaresScratch};
use regularized::{SpectralDeconvolver, SpectralFilter};
use support::{estimate_support, SupportRegion};

/// Plans and buffers owned by one worker.
#[derive(Default)]
pub struct SolverScratch {
    pub fft: Option<Fft2dWorkspace>,
    pub least_squares: LeastSquaresScratch,
}

impl SolverScratch {
    /// FFT workspace for fields of the given size.
    pub fn fft(&mut self, xres: usize, yres: usize) -> &mut Fft2dWorkspace {
        Fft2dWorkspace::ensure(&mut self.fft, xres, yres)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelSolver {
    /// Flat Tikhonov filter, cropped to `width` x `height`.
    Regularized { width: usize, height: usize },
    /// Pseudo-Wiener filter, cropped to `width` x `height`.
    PseudoWiener {
        width: usize,
        height: usize,
        search: WienerSearch,
    },
    /// Explicit odd-sized kernel fitted away from a `border`.
    LeastSquares {
        width: usize,
        height: usize,
        border: usize,
    },
}

impl KernelSolver {
    /// Solver for a sanitized configuration.
    pub fn from_config(config: &PsfConfig) -> Self {
        let (width, height) = (config.kernel_width, config.kernel_height);
        match config.method {
            Method::Regularized => KernelSolver::Regularized { width, height },
            Method::PseudoWiener => KernelSolver::PseudoWiener {
                width,
                height,
                search: config.wiener,
            },
            Method::LeastSquares => KernelSolver::LeastSquares {
                width,
                height,
                border: config.border,
            },
        }
    }

    pub fn size(&self) -> (usize, usize) {
        match *self {
            KernelSolver::Regularized { width, height }
            | KernelSolver::PseudoWiener { width, height, .. }
            | KernelSolver::LeastSquares { width, height, .. } => (width, height),
        }
    }

    /// Same solver producing a kernel of another size.
    pub fn with_size(self, width: usize, height: usize) -> Self {
        match self {
            KernelSolver::Regularized { .. } => KernelSolver::Regularized { width, height },
            KernelSolver::PseudoWiener { search, .. } => KernelSolver::PseudoWiener {
                width,
                height,
                search,
            },
            KernelSolver::LeastSquares { border, .. } => KernelSolver::LeastSquares {
                width,
                height,
                border,
            },
        }
    }

    /// Estimates the kernel for one windowed measured/ideal pair.
    pub fn estimate_kernel(
        &self,
        wmeas: &Field,
        wideal: &Field,
        sigma: f64,
        scratch: &mut SolverScratch,
    ) -> Result<Field, PsfError> {
        let (xres, yres) = (wmeas.xres(), wmeas.yres());
        let filter = match *self {
            KernelSolver::LeastSquares {
                width,
                height,
                border,
            } => {
                return Ok(deconvolve_least_squares(
                    wmeas,
                    wideal,
                    width,
                    height,
                    sigma,
                    border,
                    &mut scratch.least_squares,
                ));
            }
            KernelSolver::Regularized { .. } => SpectralFilter::Flat,
            KernelSolver::PseudoWiener { .. } => SpectralFilter::PseudoWiener,
        };
        let fft = scratch.fft(xres, yres);
        let deconv = SpectralDeconvolver::new(wmeas, wideal, fft)?;
        let kernel = deconv.solve(filter, sigma, fft)?;
        let (width, height) = self.size();
        if (width, height) == (xres, yres) {
            Ok(kernel)
        } else {
            Ok(crop_about_zero_lag(&kernel, width, height))
        }
    }

    /// Estimates the regularization strength (not its logarithm) for one level.
    pub fn estimate_sigma(
        &self,
        wmeas: &Field,
        wideal: &Field,
        scratch: &mut SolverScratch,
    ) -> Result<f64, PsfError> {
        match *self {
            KernelSolver::Regularized { .. } => Ok(sigma::flat_sigma(wmeas)),
            KernelSolver::LeastSquares {
                width,
                height,
                border,
            } => Ok(sigma::least_squares_sigma(wmeas, width, height, border)),
            KernelSolver::PseudoWiener { search, .. } => {
                let fft = scratch.fft(wmeas.xres(), wmeas.yres());
                let deconv = SpectralDeconvolver::new(wmeas, wideal, fft)?;
                let region = estimate_support(&deconv, fft)?;
                sigma::pseudo_wiener_sigma(&deconv, &region, &search, fft)
            }
        }
    }
}

/// Support region of the kernel relating one windowed measured/ideal pair.
pub fn support_region(
    wmeas: &Field,
    wideal: &Field,
    scratch: &mut SolverScratch,
) -> Result<SupportRegion, PsfError> {
    let fft = scratch.fft(wmeas.xres(), wmeas.yres());
    let deconv = SpectralDeconvolver::new(wmeas, wideal, fft)?;
    estimate_support(&deconv, fft)
}
