//! Full-size deconvolution in the frequency domain.
//!
//! Both variants compute `K̂ = M̂·conj(Î)·f` per bin. The flat filter uses
//! `f = 1/(|Î|² + λ)`; the pseudo-Wiener filter divides λ by `|Î|²`, which gives
//! `f = |Î|²/(|Î|⁴ + λ)` and suppresses bins where the ideal spectrum is weak.

use crate::data_container::Field;
use crate::deconvolution::preprocess::{centred_energy, transfer_function_unit};
use crate::error::PsfError;
use crate::fft::Fft2dWorkspace;
use crate::field_ops::humanize;
use crate::units::Unit;
use ndarray::{Array2, Zip};
use num_complex::Complex64;

/// Frequency weighting of the regularization term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralFilter {
    Flat,
    PseudoWiener,
}

/// Holds the spectra of a windowed measured/ideal pair so that the kernel can be recomputed for
/// many sigmas at the cost of one inverse transform each.
pub struct SpectralDeconvolver {
    measured: Array2<Complex64>,
    ideal: Array2<Complex64>,
    /// `E_I·E_M`, zero when either field is flat.
    energy_product: f64,
    dx: f64,
    dy: f64,
    xy_unit: Unit,
    unit: Unit,
}

impl SpectralDeconvolver {
    /// Transforms both fields. They must share resolution with `fft`.
    pub fn new(
        wmeas: &Field,
        wideal: &Field,
        fft: &mut Fft2dWorkspace,
    ) -> Result<SpectralDeconvolver, PsfError> {
        let mut measured = fft.make_spectrum();
        let mut ideal = fft.make_spectrum();
        let e_m = centred_energy(wmeas);
        let e_i = centred_energy(wideal);
        if e_i == 0.0 {
            log::warn!("deconvolution by a flat ideal field gives a zero kernel");
        }
        if e_m > 0.0 && e_i > 0.0 {
            fft.forward(&wmeas.data, &mut measured)?;
            fft.forward(&wideal.data, &mut ideal)?;
        }
        Ok(SpectralDeconvolver {
            measured,
            ideal,
            energy_product: e_m * e_i,
            dx: wmeas.dx,
            dy: wmeas.dy,
            xy_unit: wmeas.xy_unit.clone(),
            unit: transfer_function_unit(&wmeas.value_unit, &wideal.value_unit, &wmeas.xy_unit),
        })
    }

    /// Whether either input has zero RMS, in which case every solution is zero.
    pub fn is_degenerate(&self) -> bool {
        self.energy_product == 0.0
    }

    /// Computes the full-size kernel for regularization strength `sigma`.
    ///
    /// The kernel has zero lag at `(yres/2, xres/2)` and follows the integral convention.
    pub fn solve(
        &self,
        filter: SpectralFilter,
        sigma: f64,
        fft: &mut Fft2dWorkspace,
    ) -> Result<Field, PsfError> {
        let (xres, yres) = fft.dims();
        let mut kernel = Field::new(Array2::zeros((yres, xres)), self.dx, self.dy)
            .with_units(self.xy_unit.clone(), self.unit.clone());
        kernel.center_on_zero_lag();
        if self.is_degenerate() {
            return Ok(kernel);
        }

        let lambda = sigma * sigma * self.energy_product;
        let mut spectrum = self.measured.clone();
        Zip::from(&mut spectrum)
            .and(&self.ideal)
            .for_each(|m, i| {
                let inorm = i.norm_sqr();
                let (num, den) = match filter {
                    SpectralFilter::Flat => (1.0, inorm + lambda),
                    SpectralFilter::PseudoWiener => (inorm, inorm * inorm + lambda),
                };
                *m = if den > 0.0 {
                    *m * i.conj() * (num / den)
                } else {
                    Complex64::new(0.0, 0.0)
                };
            });
        // The mean is not recoverable
        spectrum[[0, 0]] = Complex64::new(0.0, 0.0);

        let mut raw = Array2::zeros((yres, xres));
        fft.inverse(&mut spectrum, &mut raw)?;
        let q = 1.0 / (self.dx * self.dy);
        kernel.data = humanize(&raw).mapv(|v| v * q);
        Ok(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deconvolution::preprocess::prepare_field;
    use crate::math_tools::Window;
    use crate::test_patterns::{circular_convolve, random_ideal};
    use approx::assert_relative_eq;

    #[test]
    fn test_flat_filter_recovers_shifted_delta() {
        let (xres, yres) = (32, 24);
        let ideal = random_ideal(xres, yres, 1.0, 1e-3, 11);
        let mut delta = Array2::zeros((yres, xres));
        // kernel value 1 at lag (+1 row, -2 cols), discrete convention
        delta[[1, xres - 2]] = 1.0;
        let measured = Field::new(circular_convolve(&ideal.data, &delta), 1.0, 1.0);

        let wmeas = prepare_field(&measured, Window::None);
        let wideal = prepare_field(&ideal, Window::None);
        let mut fft = Fft2dWorkspace::new(xres, yres);
        let deconv = SpectralDeconvolver::new(&wmeas, &wideal, &mut fft).unwrap();
        let kernel = deconv.solve(SpectralFilter::Flat, 1e-8, &mut fft).unwrap();
        // the kernel mean is lost together with the zero-frequency bin
        let offset = 1.0 / (xres * yres) as f64;
        let shifted = kernel.data[[yres / 2 + 1, xres / 2 - 2]];
        assert_relative_eq!(shifted, 1.0 - offset, epsilon = 1e-6);
        assert_relative_eq!(kernel.data[[yres / 2, xres / 2]], -offset, epsilon = 1e-6);
    }

    #[test]
    fn test_pixel_size_scales_to_integral_convention() {
        let (xres, yres) = (24, 24);
        let mut ideal = random_ideal(xres, yres, 1.0, 1e-3, 5);
        ideal.dx = 0.5;
        ideal.dy = 0.25;
        let mut measured = ideal.clone();
        measured.data.mapv_inplace(|v| 2.0 * v);
        let mut fft = Fft2dWorkspace::new(xres, yres);
        let deconv = SpectralDeconvolver::new(&measured, &ideal, &mut fft).unwrap();
        for filter in [SpectralFilter::Flat, SpectralFilter::PseudoWiener] {
            let kernel = deconv.solve(filter, 1e-8, &mut fft).unwrap();
            assert_relative_eq!(kernel.data[[12, 12]] * 0.125, 2.0 - 2.0 / 576.0, epsilon = 1e-6);
            assert_relative_eq!(kernel.x_offset, -12.5 * 0.5);
        }
    }

    #[test]
    fn test_flat_input_gives_zero_kernel() {
        let flat = Field::new(Array2::from_elem((24, 24), 3.0), 1.0, 1.0);
        let ideal = random_ideal(24, 24, 1.0, 1.0, 1);
        let wmeas = prepare_field(&flat, Window::Hann);
        let mut fft = Fft2dWorkspace::new(24, 24);
        for (m, i) in [(&wmeas, &ideal), (&ideal, &wmeas)] {
            let deconv = SpectralDeconvolver::new(m, i, &mut fft).unwrap();
            assert!(deconv.is_degenerate());
            let kernel = deconv.solve(SpectralFilter::PseudoWiener, 1.0, &mut fft).unwrap();
            assert!(kernel.data.iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn test_kernel_units() {
        let ideal = random_ideal(24, 24, 1.0, 1.0, 2).with_units(Unit::new("m"), Unit::new("m"));
        let measured = ideal.clone().with_units(Unit::new("m"), Unit::new("V"));
        let mut fft = Fft2dWorkspace::new(24, 24);
        let deconv = SpectralDeconvolver::new(&measured, &ideal, &mut fft).unwrap();
        let kernel = deconv.solve(SpectralFilter::Flat, 1.0, &mut fft).unwrap();
        assert_eq!(kernel.value_unit, Unit::new("V m^-3"));
        assert_eq!(kernel.xy_unit, Unit::new("m"));
    }
}
