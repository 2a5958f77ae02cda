//! Synthetic fields for tests.
//!
//! Kernels returned here are "wrapped": zero lag at index `(0, 0)`, negative lags at the end,
//! as expected by [`circular_convolve`].

use crate::data_container::Field;
use crate::fft::Fft2dWorkspace;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Gaussian smoothing width of [`smooth_ideal`], in pixels.
const SMOOTHING: f64 = 3.0;

/// Signed lag of wrapped index `i` in a dimension of `n` samples.
fn lag(i: usize, n: usize) -> f64 {
    if i <= n / 2 {
        i as f64
    } else {
        i as f64 - n as f64
    }
}

/// Uniform white noise in `[-amplitude, amplitude]` with pixel size `dx` in both directions.
pub fn random_ideal(xres: usize, yres: usize, dx: f64, amplitude: f64, seed: u64) -> Field {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = Array2::from_shape_fn((yres, xres), |_| rng.gen_range(-amplitude..amplitude));
    Field::new(data, dx, dx)
}

/// Smooth random pattern with the given RMS.
pub fn smooth_ideal(xres: usize, yres: usize, dx: f64, rms: f64, seed: u64) -> Field {
    let noise = random_ideal(xres, yres, dx, 1.0, seed);
    let mut field = Field::new(
        circular_convolve(&noise.data, &gaussian_kernel(xres, yres, SMOOTHING)),
        dx,
        dx,
    );
    let scale = rms / field.rms();
    field.data.mapv_inplace(|v| v * scale);
    field
}

/// Adds uniform noise in `[-amplitude, amplitude]`.
pub fn add_noise(field: &Field, amplitude: f64, seed: u64) -> Field {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut noisy = field.clone();
    if amplitude > 0.0 {
        noisy
            .data
            .mapv_inplace(|v| v + rng.gen_range(-amplitude..amplitude));
    }
    noisy
}

/// Wrapped Gaussian kernel of width `s` pixels, normalized to unit sum.
pub fn gaussian_kernel(xres: usize, yres: usize, s: f64) -> Array2<f64> {
    let mut kernel = Array2::from_shape_fn((yres, xres), |(i, j)| {
        let (y, x) = (lag(i, yres), lag(j, xres));
        (-(x * x + y * y) / (2.0 * s * s)).exp()
    });
    let sum = kernel.sum();
    kernel.mapv_inplace(|v| v / sum);
    kernel
}

/// Wrapped `width` x `height` box centred at zero lag, normalized to unit sum.
pub fn box_kernel(xres: usize, yres: usize, width: usize, height: usize) -> Array2<f64> {
    let (hw, hh) = ((width / 2) as f64, (height / 2) as f64);
    let value = 1.0 / (width * height) as f64;
    Array2::from_shape_fn((yres, xres), |(i, j)| {
        if lag(i, yres).abs() <= hh && lag(j, xres).abs() <= hw {
            value
        } else {
            0.0
        }
    })
}

/// Circular convolution `Σ data(y - a, x - b)·kernel(a, b)` of same-size arrays.
pub fn circular_convolve(data: &Array2<f64>, kernel: &Array2<f64>) -> Array2<f64> {
    let (yres, xres) = data.dim();
    let mut fft = Fft2dWorkspace::new(xres, yres);
    let mut dspec = fft.make_spectrum();
    let mut kspec = fft.make_spectrum();
    fft.forward(data, &mut dspec).unwrap();
    fft.forward(kernel, &mut kspec).unwrap();
    dspec.zip_mut_with(&kspec, |d, k| *d *= *k);
    let mut out = Array2::zeros((yres, xres));
    fft.inverse(&mut dspec, &mut out).unwrap();
    out
}
