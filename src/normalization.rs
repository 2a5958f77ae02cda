//! Conversion between the integral and the discrete kernel conventions.
//!
//! Every reported quantity scales with a power of the pixel area when the convention changes.
//! The power is expressed in half-area steps: kernel values carry `dx·dy`, L2 norms carry
//! `√(dx·dy)` and residual norms carry its inverse. Width and sigma do not depend on the
//! convention.

use crate::config::Normalization;
use crate::data_container::{Field, Volume};
use crate::units::Unit;

impl Normalization {
    /// Exponent of the pixel area applied when going from `self` to `target`.
    fn area_exponent(self, target: Normalization) -> i32 {
        match (self, target) {
            (Normalization::Integral, Normalization::Discrete) => 1,
            (Normalization::Discrete, Normalization::Integral) => -1,
            _ => 0,
        }
    }

    /// Rescales a quantity carrying `√area^half_powers` in the discrete convention.
    pub fn convert_value(
        self,
        target: Normalization,
        value: f64,
        area: f64,
        half_powers: i32,
    ) -> f64 {
        let e = self.area_exponent(target) * half_powers;
        if e == 0 {
            value
        } else {
            value * area.sqrt().powi(e)
        }
    }

    /// Unit counterpart of [`Normalization::convert_value`].
    pub fn convert_unit(
        self,
        target: Normalization,
        unit: &Unit,
        xy: &Unit,
        half_powers: i32,
    ) -> Unit {
        unit.power_multiply(1, xy, self.area_exponent(target) * half_powers)
    }
}

/// Half-area powers of a kernel value.
pub const KERNEL_POWER: i32 = 2;
/// Half-area powers of a kernel L2 norm.
pub const NORM_POWER: i32 = 1;
/// Half-area powers of a residual L2 norm.
pub const RESIDUAL_POWER: i32 = -1;

/// Converts a single kernel plane in place.
pub fn convert_kernel_field(kernel: &mut Field, from: Normalization, to: Normalization) {
    if from == to {
        return;
    }
    let area = kernel.pixel_area();
    kernel
        .data
        .mapv_inplace(|v| from.convert_value(to, v, area, KERNEL_POWER));
    kernel.value_unit = from.convert_unit(to, &kernel.value_unit, &kernel.xy_unit, KERNEL_POWER);
}

/// Converts a volume of kernels in place.
pub fn convert_kernel_volume(kernels: &mut Volume, from: Normalization, to: Normalization) {
    if from == to {
        return;
    }
    let area = kernels.dx * kernels.dy;
    kernels
        .data
        .mapv_inplace(|v| from.convert_value(to, v, area, KERNEL_POWER));
    kernels.value_unit =
        from.convert_unit(to, &kernels.value_unit, &kernels.xy_unit, KERNEL_POWER);
}
