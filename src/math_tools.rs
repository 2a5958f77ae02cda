//! This module provides the windowing functions used to apodize fields before Fourier
//! transforms, together with a few numerical helpers: a robust noise estimate and a bracketed
//! derivative-free 1-D minimizer.

use ndarray::{Array1, Array2, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{Display, Formatter};

/// Enum representing the different apodization windows supported.
///
/// Windows are applied separably along rows and columns to suppress the edge discontinuities a
/// periodic transform would otherwise see.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
pub enum Window {
    /// No windowing
    None,
    /// Rectangular window with half-weighted end samples
    Rect,
    /// Hann window
    Hann,
    /// Hamming window
    Hamming,
    /// Blackman window
    Blackman,
    /// Lanczos (sinc) window
    Lanczos,
    /// Welch (parabolic) window
    #[default]
    Welch,
    /// Nuttall window
    Nuttall,
    /// FlatTop
    FlatTop,
    /// Kaiser window with α = 2.5
    Kaiser,
}

impl Display for Window {
    /// Provides a user-friendly string representation of each window type.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Window::None => write!(f, "None"),
            Window::Rect => write!(f, "Rect"),
            Window::Hann => write!(f, "Hann"),
            Window::Hamming => write!(f, "Hamming"),
            Window::Blackman => write!(f, "Blackman"),
            Window::Lanczos => write!(f, "Lanczos"),
            Window::Welch => write!(f, "Welch"),
            Window::Nuttall => write!(f, "Nuttall"),
            Window::FlatTop => write!(f, "Flat Top"),
            Window::Kaiser => write!(f, "Kaiser 2.5"),
        }
    }
}

const KAISER_ALPHA: f64 = 2.5;

/// Modified Bessel function of the first kind, order zero, from its power series.
fn bessel_i0(x: f64) -> f64 {
    let q = 0.25 * x * x;
    let mut term = 1.0;
    let mut sum = 1.0;
    for k in 1..64 {
        term *= q / (k * k) as f64;
        sum += term;
        if term < 1e-17 * sum {
            break;
        }
    }
    sum
}

impl Window {
    /// Evaluates the window at normalized position `t` in [0, 1].
    fn value(&self, t: f64) -> f64 {
        match self {
            Window::None | Window::Rect => 1.0,
            Window::Hann => 0.5 * (1.0 - (2.0 * PI * t).cos()),
            Window::Hamming => 0.54 - 0.46 * (2.0 * PI * t).cos(),
            Window::Blackman => {
                0.42 - 0.5 * (2.0 * PI * t).cos() + 0.08 * (4.0 * PI * t).cos()
            }
            Window::Lanczos => {
                let z = PI * (2.0 * t - 1.0);
                if z.abs() < 1e-12 {
                    1.0
                } else {
                    z.sin() / z
                }
            }
            Window::Welch => {
                let u = 2.0 * t - 1.0;
                1.0 - u * u
            }
            Window::Nuttall => {
                0.355768 - 0.487396 * (2.0 * PI * t).cos() + 0.144232 * (4.0 * PI * t).cos()
                    - 0.012604 * (6.0 * PI * t).cos()
            }
            Window::FlatTop => {
                1.0 - 1.93 * (2.0 * PI * t).cos() + 1.29 * (4.0 * PI * t).cos()
                    - 0.388 * (6.0 * PI * t).cos()
                    + 0.028 * (8.0 * PI * t).cos()
            }
            Window::Kaiser => {
                let u = 2.0 * t - 1.0;
                let arg = PI * KAISER_ALPHA * (1.0 - u * u).max(0.0).sqrt();
                bessel_i0(arg) / bessel_i0(PI * KAISER_ALPHA)
            }
        }
    }

    /// Computes the `n` window coefficients.
    ///
    /// # Arguments
    /// - `n`: Number of samples.
    ///
    /// # Returns
    /// The coefficients, sampled at `t = i/(n-1)`. A single sample gets weight 1.
    pub fn coefficients(&self, n: usize) -> Array1<f64> {
        if n <= 1 {
            return Array1::ones(n);
        }
        let mut w = Array1::from_iter((0..n).map(|i| self.value(i as f64 / (n - 1) as f64)));
        if *self == Window::Rect {
            w[0] = 0.5;
            w[n - 1] = 0.5;
        }
        w
    }

    /// Applies the window to a 1D signal.
    pub fn apply(&self, signal: &mut ArrayViewMut1<f64>) {
        if *self == Window::None {
            return;
        }
        let w = self.coefficients(signal.len());
        Zip::from(signal).and(&w).for_each(|s, w| {
            *s *= w;
        });
    }

    /// Applies the window separably along both axes of a 2D field.
    pub fn apply_2d(&self, data: &mut Array2<f64>) {
        if *self == Window::None {
            return;
        }
        let wx = self.coefficients(data.ncols());
        let wy = self.coefficients(data.nrows());
        for (mut row, wy) in data.axis_iter_mut(Axis(0)).zip(wy.iter()) {
            Zip::from(&mut row).and(&wx).for_each(|s, wx| {
                *s *= wx * wy;
            });
        }
    }
}

/// Estimates the standard deviation of white noise in a field.
///
/// Uses the fast estimator of Immerkær: the field is filtered by a Laplacian-difference mask that
/// annihilates locally linear signal and the mean absolute response is scaled to a standard
/// deviation. Fields smaller than 3x3 give zero.
pub fn estimate_noise(data: &Array2<f64>) -> f64 {
    let (yres, xres) = data.dim();
    if xres < 3 || yres < 3 {
        return 0.0;
    }
    const MASK: [[f64; 3]; 3] = [[1.0, -2.0, 1.0], [-2.0, 4.0, -2.0], [1.0, -2.0, 1.0]];
    let mut sum = 0.0;
    for i in 1..yres - 1 {
        for j in 1..xres - 1 {
            let mut response = 0.0;
            for (a, mask_row) in MASK.iter().enumerate() {
                for (b, m) in mask_row.iter().enumerate() {
                    response += m * data[[i + a - 1, j + b - 1]];
                }
            }
            sum += response.abs();
        }
    }
    (PI / 2.0).sqrt() * sum / (6.0 * ((xres - 2) * (yres - 2)) as f64)
}

/// Finds the minimum of `f` on `[from, to]`.
///
/// The interval is first scanned at `steps` equidistant points to locate the best bracket, then
/// refined by golden section search until the bracket is narrower than `tolerance`. The function
/// is assumed to be unimodal only near the coarse minimum.
///
/// # Arguments
/// - `f`: Function to minimize.
/// - `from`, `to`: Search interval.
/// - `steps`: Number of coarse samples, at least 3 are used.
/// - `tolerance`: Absolute bracket width at which the refinement stops.
///
/// # Returns
/// The abscissa of the minimum found.
pub fn find_minimum_1d<F>(mut f: F, from: f64, to: f64, steps: usize, tolerance: f64) -> f64
where
    F: FnMut(f64) -> f64,
{
    let (from, to) = if from <= to { (from, to) } else { (to, from) };
    if to - from <= tolerance {
        return 0.5 * (from + to);
    }
    let steps = steps.max(3);
    let h = (to - from) / (steps - 1) as f64;
    let mut best = 0;
    let mut best_value = f64::INFINITY;
    for i in 0..steps {
        let value = f(from + i as f64 * h);
        // NaN never compares smaller, so degenerate samples are skipped
        if value < best_value {
            best_value = value;
            best = i;
        }
    }

    let mut a = from + best.saturating_sub(1) as f64 * h;
    let mut b = from + (best + 1).min(steps - 1) as f64 * h;
    let ratio = 0.5 * (5f64.sqrt() - 1.0);
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);
    while b - a > tolerance {
        if fc <= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = f(d);
        }
    }
    let x = 0.5 * (a + b);
    if f(x) <= best_value {
        x
    } else {
        from + best as f64 * h
    }
}
