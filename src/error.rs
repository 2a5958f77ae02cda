//! Errors reported by the estimator.
//!
//! Only invalid static input aborts an estimation. Numerical degeneracy of single levels is
//! absorbed into a degraded result and cancellation is reported through
//! [`crate::PsfEstimate::cancelled`].

#[derive(thiserror::Error, Debug)]
pub enum PsfError {
    #[error("the volume contains no data")]
    EmptyVolume,
    #[error("fields of {xres}x{yres} pixels are too small, at least {min}x{min} are required")]
    FieldTooSmall { xres: usize, yres: usize, min: usize },
    #[error(
        "ideal field resolution {ideal_xres}x{ideal_yres} does not match volume planes {xres}x{yres}"
    )]
    ResolutionMismatch {
        ideal_xres: usize,
        ideal_yres: usize,
        xres: usize,
        yres: usize,
    },
    #[error("ideal field pixel size does not match the volume pixel size")]
    PixelSizeMismatch,
    #[error("ideal field lateral unit `{ideal}` does not match volume lateral unit `{volume}`")]
    UnitMismatch { ideal: String, volume: String },
    #[error("requested kernel {width}x{height} is larger than the {xres}x{yres} field")]
    KernelTooLarge {
        width: usize,
        height: usize,
        xres: usize,
        yres: usize,
    },
    #[error("no output was requested")]
    NothingRequested,
    #[error("z level {level} is out of range for a volume with {zres} levels")]
    LevelOutOfRange { level: usize, zres: usize },
    #[error("support mask lost the kernel peak at ({row}, {col})")]
    SupportInvariant { row: usize, col: usize },
    #[error("failed to build the worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("FFT failed")]
    Fft(#[from] realfft::FftError),
}
