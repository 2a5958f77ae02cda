use crate::data_container::Field;
use crate::math_tools::Window;
use crate::units::Unit;

/// Subtracts the mean and applies `window` along both axes.
pub fn prepare_field(field: &Field, window: Window) -> Field {
    let mut prepared = field.clone();
    let mean = field.mean();
    prepared.data.mapv_inplace(|v| v - mean);
    window.apply_2d(&mut prepared.data);
    prepared
}

/// Sum of squared deviations from the mean.
pub fn centred_energy(field: &Field) -> f64 {
    let rms = field.rms();
    field.data.len() as f64 * rms * rms
}

/// Value unit of an integral-convention transfer function: `measured / ideal / xy²`.
pub fn transfer_function_unit(measured: &Unit, ideal: &Unit, xy: &Unit) -> Unit {
    measured.divide(ideal).power_multiply(1, xy, -2)
}
