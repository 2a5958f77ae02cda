//! 2D real FFT built from `realfft` row transforms and `rustfft` column transforms.
//!
//! A field of `yres` x `xres` samples maps to a half spectrum of `yres` x `(xres/2 + 1)` bins.
//! The forward transform is unnormalized; the inverse divides by the sample count, so a round
//! trip reproduces the input.

use crate::error::PsfError;
use ndarray::{Array2, Axis};
use num_complex::Complex64;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// FFT workspace caching plans and scratch buffers for one field size.
///
/// Not shared between threads; every worker owns its own instance.
pub struct Fft2dWorkspace {
    xres: usize,
    yres: usize,
    r2c: Arc<dyn RealToComplex<f64>>,
    c2r: Arc<dyn ComplexToReal<f64>>,
    fft_col: Arc<dyn Fft<f64>>,
    ifft_col: Arc<dyn Fft<f64>>,
    row_real: Vec<f64>,
    row_complex: Vec<Complex64>,
    row_scratch: Vec<Complex64>,
    column: Vec<Complex64>,
    col_scratch: Vec<Complex64>,
}

impl Fft2dWorkspace {
    /// Create a new FFT workspace for fields of `xres` x `yres` samples.
    pub fn new(xres: usize, yres: usize) -> Self {
        let mut real_planner = RealFftPlanner::<f64>::new();
        let r2c = real_planner.plan_fft_forward(xres);
        let c2r = real_planner.plan_fft_inverse(xres);
        let mut planner = FftPlanner::<f64>::new();
        let fft_col = planner.plan_fft_forward(yres);
        let ifft_col = planner.plan_fft_inverse(yres);

        let row_scratch_len = r2c.get_scratch_len().max(c2r.get_scratch_len());
        let col_scratch_len = fft_col
            .get_inplace_scratch_len()
            .max(ifft_col.get_inplace_scratch_len());
        let zero = Complex64::new(0.0, 0.0);

        Fft2dWorkspace {
            xres,
            yres,
            row_real: r2c.make_input_vec(),
            row_complex: r2c.make_output_vec(),
            row_scratch: vec![zero; row_scratch_len],
            column: vec![zero; yres],
            col_scratch: vec![zero; col_scratch_len],
            r2c,
            c2r,
            fft_col,
            ifft_col,
        }
    }

    /// Returns the workspace held in `slot`, replacing it when it was planned for another size.
    pub fn ensure(slot: &mut Option<Fft2dWorkspace>, xres: usize, yres: usize) -> &mut Self {
        let stale = slot.as_ref().is_none_or(|ws| ws.dims() != (xres, yres));
        if stale {
            *slot = Some(Fft2dWorkspace::new(xres, yres));
        }
        slot.get_or_insert_with(|| Fft2dWorkspace::new(xres, yres))
    }

    /// Field size `(xres, yres)` this workspace was planned for.
    pub fn dims(&self) -> (usize, usize) {
        (self.xres, self.yres)
    }

    /// Number of complex bins along x.
    pub fn cstride(&self) -> usize {
        self.xres / 2 + 1
    }

    /// Allocates a zeroed half spectrum of the right shape.
    pub fn make_spectrum(&self) -> Array2<Complex64> {
        Array2::zeros((self.yres, self.cstride()))
    }

    /// Forward transform of `input` (`[y, x]`) into `spectrum` (`[ky, kx]`).
    pub fn forward(
        &mut self,
        input: &Array2<f64>,
        spectrum: &mut Array2<Complex64>,
    ) -> Result<(), PsfError> {
        debug_assert_eq!(input.dim(), (self.yres, self.xres));
        debug_assert_eq!(spectrum.dim(), (self.yres, self.cstride()));

        for (row, mut out) in input.axis_iter(Axis(0)).zip(spectrum.axis_iter_mut(Axis(0))) {
            for (dst, src) in self.row_real.iter_mut().zip(row.iter()) {
                *dst = *src;
            }
            self.r2c.process_with_scratch(
                &mut self.row_real,
                &mut self.row_complex,
                &mut self.row_scratch,
            )?;
            for (dst, src) in out.iter_mut().zip(self.row_complex.iter()) {
                *dst = *src;
            }
        }

        for mut col in spectrum.axis_iter_mut(Axis(1)) {
            for (dst, src) in self.column.iter_mut().zip(col.iter()) {
                *dst = *src;
            }
            self.fft_col
                .process_with_scratch(&mut self.column, &mut self.col_scratch);
            for (dst, src) in col.iter_mut().zip(self.column.iter()) {
                *dst = *src;
            }
        }
        Ok(())
    }

    /// Inverse transform with normalization. `spectrum` is used as scratch and destroyed.
    pub fn inverse(
        &mut self,
        spectrum: &mut Array2<Complex64>,
        output: &mut Array2<f64>,
    ) -> Result<(), PsfError> {
        debug_assert_eq!(output.dim(), (self.yres, self.xres));
        debug_assert_eq!(spectrum.dim(), (self.yres, self.cstride()));

        for mut col in spectrum.axis_iter_mut(Axis(1)) {
            for (dst, src) in self.column.iter_mut().zip(col.iter()) {
                *dst = *src;
            }
            self.ifft_col
                .process_with_scratch(&mut self.column, &mut self.col_scratch);
            for (dst, src) in col.iter_mut().zip(self.column.iter()) {
                *dst = *src;
            }
        }

        let norm = 1.0 / (self.xres * self.yres) as f64;
        let last = self.cstride() - 1;
        for (row, mut out) in spectrum.axis_iter(Axis(0)).zip(output.axis_iter_mut(Axis(0))) {
            for (dst, src) in self.row_complex.iter_mut().zip(row.iter()) {
                *dst = *src;
            }
            // Rounding leaves tiny imaginary parts that c2r refuses
            self.row_complex[0].im = 0.0;
            if self.xres % 2 == 0 {
                self.row_complex[last].im = 0.0;
            }
            self.c2r.process_with_scratch(
                &mut self.row_complex,
                &mut self.row_real,
                &mut self.row_scratch,
            )?;
            for (dst, src) in out.iter_mut().zip(self.row_real.iter()) {
                *dst = src * norm;
            }
        }
        Ok(())
    }
}
