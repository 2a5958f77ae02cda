//! Explicit small-kernel deconvolution in the spatial domain.
//!
//! The kernel `K` of odd size `tw` x `th` minimizes
//! `Σ_R (M(y,x) - Σ_ab I(y-a+hh, x-b+hw)·K(a,b))² + λ·Σ K²` over the fitting region `R`: all
//! pixels whose kernel footprint lies inside the field, shrunk further by `border`.
//! The normal matrix entry for a kernel pixel pair only depends on their relative lag, so it is
//! read off a summed-area table of the lagged product `I(u,v)·I(u-δy, v-δx)`, one table per lag.

use crate::data_container::Field;
use crate::deconvolution::preprocess::transfer_function_unit;
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;

/// Pixel rectangle `[x0, x1) x [y0, y1)` in which the model is fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitRegion {
    pub x0: usize,
    pub x1: usize,
    pub y0: usize,
    pub y1: usize,
}

impl FitRegion {
    /// Fitting region for a `width` x `height` kernel, `None` when nothing is left to fit.
    pub fn new(
        xres: usize,
        yres: usize,
        width: usize,
        height: usize,
        border: usize,
    ) -> Option<FitRegion> {
        let (hw, hh) = (width / 2, height / 2);
        let x0 = hw + border;
        let y0 = hh + border;
        let x1 = xres.checked_sub(width - hw - 1 + border)?;
        let y1 = yres.checked_sub(height - hh - 1 + border)?;
        (x1 > x0 && y1 > y0).then_some(FitRegion { x0, x1, y0, y1 })
    }

    pub fn pixel_count(&self) -> usize {
        (self.x1 - self.x0) * (self.y1 - self.y0)
    }

    /// Sum of squared deviations from the mean inside the region.
    pub fn energy(&self, data: &Array2<f64>) -> f64 {
        let n = self.pixel_count() as f64;
        let (mut s, mut s2) = (0.0, 0.0);
        for i in self.y0..self.y1 {
            for j in self.x0..self.x1 {
                let v = data[[i, j]];
                s += v;
                s2 += v * v;
            }
        }
        (s2 - s * s / n).max(0.0)
    }
}

/// Scratch reused between levels: the summed-area table of one lagged product.
#[derive(Default)]
pub struct LeastSquaresScratch {
    table: Array2<f64>,
}

impl LeastSquaresScratch {
    /// Fills the table with prefix sums of `I(u,v)·I(u-δy, v-δx)`, zero where the lagged sample
    /// is outside the field. `table[[u, v]]` sums all rows `< u` and columns `< v`.
    fn fill_lagged_product(&mut self, ideal: &Array2<f64>, dy: isize, dx: isize) {
        let (yres, xres) = ideal.dim();
        if self.table.dim() != (yres + 1, xres + 1) {
            self.table = Array2::zeros((yres + 1, xres + 1));
        }
        for u in 0..yres {
            let mut row_sum = 0.0;
            let su = u as isize - dy;
            for v in 0..xres {
                let sv = v as isize - dx;
                if su >= 0 && sv >= 0 && (su as usize) < yres && (sv as usize) < xres {
                    row_sum += ideal[[u, v]] * ideal[[su as usize, sv as usize]];
                }
                self.table[[u + 1, v + 1]] = self.table[[u, v + 1]] + row_sum;
            }
        }
    }

    /// Sum over rows `[u0, u1)` and columns `[v0, v1)` of the current table.
    fn rect_sum(&self, u0: usize, u1: usize, v0: usize, v1: usize) -> f64 {
        self.table[[u1, v1]] - self.table[[u0, v1]] - self.table[[u1, v0]] + self.table[[u0, v0]]
    }
}

/// Solves for a `width` x `height` kernel.
///
/// `wmeas` and `wideal` are the windowed fields. The regularization is
/// `λ = σ²·E_I·E_M` with energies taken over the fitting region. The normal equations are solved
/// by Cholesky decomposition, falling back to LU and finally to a zero kernel. The result follows
/// the integral convention and has zero lag at its centre.
pub fn deconvolve_least_squares(
    wmeas: &Field,
    wideal: &Field,
    width: usize,
    height: usize,
    sigma: f64,
    border: usize,
    scratch: &mut LeastSquaresScratch,
) -> Field {
    let mut kernel = Field::new(Array2::zeros((height, width)), wmeas.dx, wmeas.dy).with_units(
        wmeas.xy_unit.clone(),
        transfer_function_unit(&wmeas.value_unit, &wideal.value_unit, &wmeas.xy_unit),
    );
    kernel.center_on_zero_lag();

    let (yres, xres) = wmeas.data.dim();
    let Some(region) = FitRegion::new(xres, yres, width, height, border) else {
        log::warn!("no pixels left to fit a {width}x{height} kernel with border {border}");
        return kernel;
    };
    let e_m = region.energy(&wmeas.data);
    let e_i = region.energy(&wideal.data);
    if e_m == 0.0 || e_i == 0.0 {
        return kernel;
    }

    let (hw, hh) = (width / 2, height / 2);
    let n = width * height;
    let ideal = &wideal.data;
    let mut matrix = DMatrix::<f64>::zeros(n, n);
    // q >= p only: lags with dy > 0, or dy == 0 and dx >= 0
    for dy in 0..height as isize {
        for dx in -(width as isize - 1)..width as isize {
            if dy == 0 && dx < 0 {
                continue;
            }
            scratch.fill_lagged_product(ideal, dy, dx);
            for a in 0..height - dy as usize {
                let c = a + dy as usize;
                for b in 0..width {
                    let d = b as isize + dx;
                    if d < 0 || d >= width as isize {
                        continue;
                    }
                    let (p, q) = (a * width + b, c * width + d as usize);
                    let value = scratch.rect_sum(
                        region.y0 + hh - a,
                        region.y1 + hh - a,
                        region.x0 + hw - b,
                        region.x1 + hw - b,
                    );
                    matrix[(p, q)] = value;
                    matrix[(q, p)] = value;
                }
            }
        }
    }

    let mut rhs = DVector::<f64>::zeros(n);
    for a in 0..height {
        for b in 0..width {
            let mut s = 0.0;
            for y in region.y0..region.y1 {
                for x in region.x0..region.x1 {
                    s += wmeas.data[[y, x]] * ideal[[y + hh - a, x + hw - b]];
                }
            }
            rhs[a * width + b] = s;
        }
    }

    let lambda = sigma * sigma * e_i * e_m;
    for p in 0..n {
        matrix[(p, p)] += lambda;
    }

    let solution = match matrix.clone().cholesky() {
        Some(cholesky) => Some(cholesky.solve(&rhs)),
        None => {
            log::debug!("normal matrix is not positive definite, falling back to LU");
            matrix.lu().solve(&rhs)
        }
    };
    let Some(solution) = solution.filter(|s| s.iter().all(|v| v.is_finite())) else {
        log::warn!("least-squares system is singular, returning a zero kernel");
        return kernel;
    };

    let q = 1.0 / (wmeas.dx * wmeas.dy);
    for ((a, b), v) in kernel.data.indexed_iter_mut() {
        *v = solution[a * width + b] * q;
    }
    kernel
}
