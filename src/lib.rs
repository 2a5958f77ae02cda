//! # volume-psf
//!
//! Estimation of the transfer function (point spread function) of an instrument from a volume of
//! measured slices and one known ideal pattern.
//!
//! For every z level the kernel `K` relating the ideal field `I` to the measured slice `M`,
//! `M ≈ I★K`, is recovered with one of three deconvolution methods (see [`Method`]). The
//! regularization strength and, for least squares, the kernel support can be estimated per level.
//!
//! ```no_run
//! use volume_psf::{estimate, Field, Metric, PsfConfig, Volume};
//! # fn load() -> (Volume, Field) { unimplemented!() }
//!
//! let (volume, ideal) = load();
//! let config = PsfConfig {
//!     estimate_sigma: true,
//!     ..PsfConfig::default()
//! };
//! let result = estimate(&volume, &ideal, &config)?;
//! if let Some(width) = result.series(Metric::Width) {
//!     log::info!("kernel width along z: {:?}", width.values);
//! }
//! # Ok::<(), volume_psf::PsfError>(())
//! ```

pub mod config;
pub mod data_container;
pub mod deconvolution;
pub mod error;
pub mod estimate;
pub mod fft;
pub mod field_ops;
pub mod grains;
pub mod math_tools;
pub mod normalization;
pub mod units;

#[cfg(test)]
mod test_patterns;

pub use cancellable_loops::CancelToken;
pub use config::{Method, Normalization, OutputSelection, PsfConfig, WienerSearch};
pub use data_container::{Field, Volume};
pub use error::PsfError;
pub use estimate::{
    estimate, estimate_with_progress, Estimator, KernelSizeGuess, LevelOutput, LevelPreview,
    LevelSummary, LevelWorkspace, Metric, MetricSeries, PsfEstimate,
};
pub use math_tools::Window;
pub use units::Unit;
