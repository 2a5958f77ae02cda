//! Per-level estimation of the transfer function of a volume.
//!
//! An [`Estimator`] validates the inputs once, windows the ideal field and then solves each
//! z level independently. Levels run on a Rayon pool with one [`LevelWorkspace`] per worker;
//! the results are assembled in level order afterwards, so they do not depend on how levels
//! were distributed over the workers.

use crate::config::{
    clamp_kernel_size, Method, Normalization, OutputSelection, PsfConfig, MIN_FIELD_SIZE,
};
use crate::data_container::{close, Field, Volume};
use crate::deconvolution::preprocess::{prepare_field, transfer_function_unit};
use crate::deconvolution::{support_region, KernelSolver, SolverScratch};
use crate::error::PsfError;
use crate::fft::Fft2dWorkspace;
use crate::field_ops::{convolve_extended, pad_about_zero_lag};
use crate::grains::{extract_component, grow_mask, threshold_mask, weighted_dispersion};
use crate::normalization::{
    convert_kernel_field, convert_kernel_volume, KERNEL_POWER, NORM_POWER, RESIDUAL_POWER,
};
use crate::units::Unit;
use cancellable_loops::{par_map_init_cancellable, CancelToken};
use ndarray::{Array1, Array3};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Fraction of the kernel maximum above which pixels belong to the central peak.
const WIDTH_THRESHOLD: f64 = 0.15;

/// Scalar results of one z level.
///
/// Values follow the normalization of the estimate they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSummary {
    /// Dispersion radius of the central peak.
    pub width: f64,
    /// Largest absolute kernel value.
    pub height: f64,
    /// L2 norm of the kernel.
    pub norm: f64,
    /// L2 norm of `M - ((I - Ī)★K + M̄)`, when requested.
    pub residual: Option<f64>,
    /// Regularization strength actually used.
    pub sigma: f64,
    /// Kernel size actually solved for, before padding to the requested size.
    pub kernel_width: usize,
    pub kernel_height: usize,
}

impl LevelSummary {
    fn convert(&mut self, from: Normalization, to: Normalization, area: f64) {
        self.height = from.convert_value(to, self.height, area, KERNEL_POWER);
        self.norm = from.convert_value(to, self.norm, area, NORM_POWER);
        self.residual = self
            .residual
            .map(|r| from.convert_value(to, r, area, RESIDUAL_POWER));
    }
}

/// Kernel and summary of one z level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelOutput {
    /// Kernel of the requested size, zero lag at the centre.
    pub kernel: Field,
    pub summary: LevelSummary,
}

/// Everything needed to inspect a single level.
#[derive(Debug, Clone)]
pub struct LevelPreview {
    pub kernel: Field,
    /// The ideal field convolved with the kernel, `(I - Ī)★K + M̄`.
    pub convolved: Field,
    /// Measured minus convolved.
    pub difference: Field,
    pub summary: LevelSummary,
}

/// Kernel size and border suggested from the support of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSizeGuess {
    pub width: usize,
    pub height: usize,
    pub border: usize,
}

/// Per-worker buffers and FFT plans.
#[derive(Default)]
pub struct LevelWorkspace {
    solver: SolverScratch,
    convolution: Option<Fft2dWorkspace>,
}

/// Scalar outputs that can be read as a series along z.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Width,
    Height,
    Norm,
    Residual,
    Sigma,
}

impl Metric {
    fn is_requested(&self, outputs: &OutputSelection) -> bool {
        match self {
            Metric::Width => outputs.width,
            Metric::Height => outputs.height,
            Metric::Norm => outputs.norm,
            Metric::Residual => outputs.residual,
            Metric::Sigma => outputs.sigma,
        }
    }
}

/// One metric as a function of z, for the completed levels only.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    pub levels: Vec<usize>,
    pub z: Vec<f64>,
    pub values: Vec<f64>,
    pub z_unit: Unit,
    pub value_unit: Unit,
}

/// Result of an estimation run.
///
/// # Fields
/// - `kernels`: One kernel per z level, present when kernels were requested. Levels skipped by
///   cancellation are zero.
/// - `summaries`: Scalar results per level, `None` for skipped levels.
/// - `outputs`: The requested outputs.
/// - `normalization`: Convention of `kernels` and of the metrics.
/// - `cancelled`: Whether some levels were skipped.
#[derive(Debug, Clone)]
pub struct PsfEstimate {
    pub kernels: Option<Volume>,
    pub summaries: Vec<Option<LevelSummary>>,
    pub outputs: OutputSelection,
    pub normalization: Normalization,
    pub cancelled: bool,
    z_axis: Array1<f64>,
    dx: f64,
    dy: f64,
    xy_unit: Unit,
    z_unit: Unit,
    measured_unit: Unit,
    ideal_unit: Unit,
}

impl PsfEstimate {
    /// The metric along z, `None` unless it was requested.
    pub fn series(&self, metric: Metric) -> Option<MetricSeries> {
        if !metric.is_requested(&self.outputs) {
            return None;
        }
        let mut series = MetricSeries {
            levels: Vec::new(),
            z: Vec::new(),
            values: Vec::new(),
            z_unit: self.z_unit.clone(),
            value_unit: self.metric_unit(metric),
        };
        for (level, summary) in self.summaries.iter().enumerate() {
            let Some(summary) = summary else {
                continue;
            };
            let value = match metric {
                Metric::Width => Some(summary.width),
                Metric::Height => Some(summary.height),
                Metric::Norm => Some(summary.norm),
                Metric::Residual => summary.residual,
                Metric::Sigma => Some(summary.sigma),
            };
            if let Some(value) = value {
                series.levels.push(level);
                series.z.push(self.z_axis[level]);
                series.values.push(value);
            }
        }
        Some(series)
    }

    /// Unit of a metric in the current normalization.
    pub fn metric_unit(&self, metric: Metric) -> Unit {
        let transfer = self.measured_unit.divide(&self.ideal_unit);
        let (discrete, power) = match metric {
            Metric::Width => return self.xy_unit.clone(),
            Metric::Sigma => return Unit::dimensionless(),
            Metric::Height => (transfer, KERNEL_POWER),
            Metric::Norm => (transfer, NORM_POWER),
            Metric::Residual => (self.measured_unit.clone(), RESIDUAL_POWER),
        };
        Normalization::Discrete.convert_unit(self.normalization, &discrete, &self.xy_unit, power)
    }

    /// Copy of the estimate expressed in another normalization.
    pub fn to_normalization(&self, target: Normalization) -> PsfEstimate {
        let mut converted = self.clone();
        converted.convert(target);
        converted
    }

    fn convert(&mut self, target: Normalization) {
        let from = self.normalization;
        if from == target {
            return;
        }
        if let Some(kernels) = self.kernels.as_mut() {
            convert_kernel_volume(kernels, from, target);
        }
        let area = self.dx * self.dy;
        for summary in self.summaries.iter_mut().flatten() {
            summary.convert(from, target, area);
        }
        self.normalization = target;
    }
}

/// Estimates the transfer function for every level of `volume`.
pub fn estimate(
    volume: &Volume,
    ideal: &Field,
    config: &PsfConfig,
) -> Result<PsfEstimate, PsfError> {
    estimate_with_progress(volume, ideal, config, &CancelToken::new(), |_, _| true)
}

/// Like [`estimate`], reporting `(done, total)` after each level.
///
/// Returning `false` from `progress` cancels the remaining levels, as does cancelling `token`.
/// A cancelled run still returns the levels that were completed.
pub fn estimate_with_progress<P>(
    volume: &Volume,
    ideal: &Field,
    config: &PsfConfig,
    token: &CancelToken,
    progress: P,
) -> Result<PsfEstimate, PsfError>
where
    P: Fn(usize, usize) -> bool + Sync,
{
    Estimator::new(volume, ideal, config)?.run(token, progress)
}

/// Validated inputs of an estimation run.
pub struct Estimator<'a> {
    volume: &'a Volume,
    ideal: &'a Field,
    /// Ideal field with the mean removed, convolved for residuals.
    centred_ideal: Field,
    /// Windowed ideal field.
    wideal: Field,
    config: PsfConfig,
    solver: KernelSolver,
}

impl<'a> Estimator<'a> {
    /// Validates the inputs and prepares the ideal field.
    ///
    /// The configuration is sanitized for the volume resolution first; only a kernel that still
    /// does not fit is reported as an error.
    pub fn new(volume: &'a Volume, ideal: &'a Field, config: &PsfConfig) -> Result<Self, PsfError> {
        let (xres, yres) = (volume.xres(), volume.yres());
        if volume.data.is_empty() {
            return Err(PsfError::EmptyVolume);
        }
        if xres < MIN_FIELD_SIZE || yres < MIN_FIELD_SIZE {
            return Err(PsfError::FieldTooSmall {
                xres,
                yres,
                min: MIN_FIELD_SIZE,
            });
        }
        if (ideal.xres(), ideal.yres()) != (xres, yres) {
            return Err(PsfError::ResolutionMismatch {
                ideal_xres: ideal.xres(),
                ideal_yres: ideal.yres(),
                xres,
                yres,
            });
        }
        if !close(ideal.dx, volume.dx) || !close(ideal.dy, volume.dy) {
            return Err(PsfError::PixelSizeMismatch);
        }
        if ideal.xy_unit != volume.xy_unit {
            return Err(PsfError::UnitMismatch {
                ideal: ideal.xy_unit.to_string(),
                volume: volume.xy_unit.to_string(),
            });
        }
        if !config.outputs.any() {
            return Err(PsfError::NothingRequested);
        }
        let config = config.sanitize(xres, yres);
        if config.kernel_width > xres || config.kernel_height > yres {
            return Err(PsfError::KernelTooLarge {
                width: config.kernel_width,
                height: config.kernel_height,
                xres,
                yres,
            });
        }

        let mut centred_ideal = ideal.clone();
        let mean = ideal.mean();
        centred_ideal.data.mapv_inplace(|v| v - mean);
        Ok(Estimator {
            volume,
            ideal,
            centred_ideal,
            wideal: prepare_field(ideal, config.window),
            solver: KernelSolver::from_config(&config),
            config,
        })
    }

    /// The sanitized configuration.
    pub fn config(&self) -> &PsfConfig {
        &self.config
    }

    pub fn workspace(&self) -> LevelWorkspace {
        LevelWorkspace::default()
    }

    fn measured(&self, level: usize) -> Result<Field, PsfError> {
        let zres = self.volume.zres();
        if level >= zres {
            return Err(PsfError::LevelOutOfRange { level, zres });
        }
        Ok(self.volume.extract_plane(level))
    }

    /// Solves one level, returning the measured plane, the kernel at its solved size in the
    /// integral convention and the sigma used.
    fn solve_level(
        &self,
        ws: &mut LevelWorkspace,
        level: usize,
    ) -> Result<(Field, Field, f64), PsfError> {
        let measured = self.measured(level)?;
        let wmeas = prepare_field(&measured, self.config.window);

        let mut solver = self.solver;
        if self.config.estimate_size {
            let region = support_region(&wmeas, &self.wideal, &mut ws.solver)?;
            let (width, height) = region.size_about_zero_lag();
            let (max_width, max_height) = solver.size();
            let method = self.config.method;
            solver = solver.with_size(
                clamp_kernel_size(method, width.min(max_width), measured.xres()),
                clamp_kernel_size(method, height.min(max_height), measured.yres()),
            );
        }

        let sigma = if self.config.estimate_sigma {
            solver.estimate_sigma(&wmeas, &self.wideal, &mut ws.solver)?
        } else {
            self.config.sigma()
        };
        let kernel = solver.estimate_kernel(&wmeas, &self.wideal, sigma, &mut ws.solver)?;
        Ok((measured, kernel, sigma))
    }

    /// `(I - Ī)★K + M̄` and `M` minus that.
    fn convolve_ideal(
        &self,
        ws: &mut LevelWorkspace,
        measured: &Field,
        kernel: &Field,
    ) -> Result<(Field, Field), PsfError> {
        let mut convolved = convolve_extended(&self.centred_ideal, kernel, &mut ws.convolution)?;
        let mean = measured.mean();
        convolved.data.mapv_inplace(|v| v + mean);
        convolved.x_offset = measured.x_offset;
        convolved.y_offset = measured.y_offset;
        convolved.value_unit = measured.value_unit.clone();

        let mut difference = measured.clone();
        difference.data -= &convolved.data;
        Ok((convolved, difference))
    }

    fn summarize(&self, kernel: &Field, residual: Option<&Field>, sigma: f64) -> LevelSummary {
        let l2 = |field: &Field| (field.energy() * field.pixel_area()).sqrt();
        LevelSummary {
            width: measure_width(kernel),
            height: kernel.max_abs(),
            norm: l2(kernel),
            residual: residual.map(l2),
            sigma,
            kernel_width: kernel.xres(),
            kernel_height: kernel.yres(),
        }
    }

    /// Solves one level and computes its metrics in the integral convention.
    pub fn estimate_level(
        &self,
        ws: &mut LevelWorkspace,
        level: usize,
    ) -> Result<LevelOutput, PsfError> {
        let (measured, kernel, sigma) = self.solve_level(ws, level)?;
        let difference = if self.config.outputs.residual {
            Some(self.convolve_ideal(ws, &measured, &kernel)?.1)
        } else {
            None
        };
        let summary = self.summarize(&kernel, difference.as_ref(), sigma);

        let (width, height) = self.solver.size();
        let kernel = if (kernel.xres(), kernel.yres()) == (width, height) {
            kernel
        } else {
            pad_about_zero_lag(&kernel, width, height)
        };
        Ok(LevelOutput { kernel, summary })
    }

    /// Kernel, convolved ideal and difference of one level, in the configured normalization.
    pub fn preview_level(
        &self,
        ws: &mut LevelWorkspace,
        level: usize,
    ) -> Result<LevelPreview, PsfError> {
        let (measured, mut kernel, sigma) = self.solve_level(ws, level)?;
        let (convolved, difference) = self.convolve_ideal(ws, &measured, &kernel)?;
        let mut summary = self.summarize(&kernel, Some(&difference), sigma);

        let target = self.config.normalization;
        summary.convert(Normalization::Integral, target, kernel.pixel_area());
        convert_kernel_field(&mut kernel, Normalization::Integral, target);
        Ok(LevelPreview {
            kernel,
            convolved,
            difference,
            summary,
        })
    }

    /// Suggests a kernel size covering the support of one level, and a matching border.
    pub fn guess_kernel_size(
        &self,
        ws: &mut LevelWorkspace,
        level: usize,
    ) -> Result<KernelSizeGuess, PsfError> {
        let measured = self.measured(level)?;
        let wmeas = prepare_field(&measured, self.config.window);
        let region = support_region(&wmeas, &self.wideal, &mut ws.solver)?;
        let (mut width, mut height) = region.size_about_zero_lag();
        if self.config.method == Method::LeastSquares {
            width = clamp_kernel_size(Method::LeastSquares, width, measured.xres());
            height = clamp_kernel_size(Method::LeastSquares, height, measured.yres());
        }
        let border = (0.5 * (width.max(height) as f64).ln() + 0.5).round() as usize;
        Ok(KernelSizeGuess {
            width,
            height,
            border: border.min(measured.xres().min(measured.yres()) / 8),
        })
    }

    /// Decimal logarithm of the automatically chosen sigma for one level.
    pub fn estimate_sigma(&self, ws: &mut LevelWorkspace, level: usize) -> Result<f64, PsfError> {
        let measured = self.measured(level)?;
        let wmeas = prepare_field(&measured, self.config.window);
        let sigma = self
            .solver
            .estimate_sigma(&wmeas, &self.wideal, &mut ws.solver)?;
        Ok(sigma.log10())
    }

    /// Assembles level results, given in level order, into an estimate in the configured
    /// normalization.
    pub fn assemble(&self, levels: Vec<Option<LevelOutput>>) -> PsfEstimate {
        let volume = self.volume;
        let (width, height) = self.solver.size();
        let cancelled = levels.len() < volume.zres() || levels.iter().any(Option::is_none);

        let mut kernels = self.config.outputs.kernel.then(|| {
            let mut kernels = Volume::new(
                Array3::zeros((volume.zres(), height, width)),
                volume.dx,
                volume.dy,
                volume.dz,
            )
            .with_units(
                volume.xy_unit.clone(),
                volume.z_unit.clone(),
                transfer_function_unit(&volume.value_unit, &self.ideal.value_unit, &volume.xy_unit),
            );
            kernels.x_offset = -((width / 2) as f64 + 0.5) * volume.dx;
            kernels.y_offset = -((height / 2) as f64 + 0.5) * volume.dy;
            kernels.z_offset = volume.z_offset;
            kernels.z_calibration = volume.z_calibration.clone();
            kernels
        });

        let mut summaries = Vec::with_capacity(volume.zres());
        for (level, output) in levels.into_iter().enumerate() {
            summaries.push(output.map(|output| {
                if let Some(kernels) = kernels.as_mut() {
                    kernels.set_plane(level, &output.kernel);
                }
                output.summary
            }));
        }
        summaries.resize(volume.zres(), None);

        let mut estimate = PsfEstimate {
            kernels,
            summaries,
            outputs: self.config.outputs,
            normalization: Normalization::Integral,
            cancelled,
            z_axis: volume.z_axis(),
            dx: volume.dx,
            dy: volume.dy,
            xy_unit: volume.xy_unit.clone(),
            z_unit: volume.z_unit.clone(),
            measured_unit: volume.value_unit.clone(),
            ideal_unit: self.ideal.value_unit.clone(),
        };
        estimate.convert(self.config.normalization);
        estimate
    }

    /// Estimates all levels in parallel.
    ///
    /// `progress` is called once per finished level with the number of finished levels and the
    /// total; returning `false` cancels `token`.
    pub fn run<P>(&self, token: &CancelToken, progress: P) -> Result<PsfEstimate, PsfError>
    where
        P: Fn(usize, usize) -> bool + Sync,
    {
        let start = Instant::now();
        let zres = self.volume.zres();
        let done = AtomicUsize::new(0);
        let work = || {
            par_map_init_cancellable(
                0..zres,
                token,
                || self.workspace(),
                |ws, level| {
                    let output = self.estimate_level(ws, level);
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if !progress(finished, zres) {
                        token.cancel();
                    }
                    output
                },
            )
        };
        let results = match self.config.threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()?
                .install(work),
            None => work(),
        };

        let levels = results
            .into_iter()
            .map(Option::transpose)
            .collect::<Result<Vec<_>, _>>()?;
        let estimate = self.assemble(levels);
        if estimate.cancelled {
            log::warn!(
                "transfer function estimation cancelled after {} of {zres} levels",
                done.load(Ordering::Relaxed)
            );
        }
        log::info!(
            "estimated {} transfer function for {zres} levels in {:?}",
            self.config.method,
            start.elapsed()
        );
        Ok(estimate)
    }
}

/// Dispersion radius of the kernel peak at zero lag.
///
/// Pixels above a fraction of the maximum that are connected to the centre form the peak; the
/// peak is grown by `0.5·ln(xres·yres)` and the dispersion of `|K|` is taken over the grown
/// area. Kernels whose centre is not part of a positive peak have zero width.
pub fn measure_width(kernel: &Field) -> f64 {
    let (yres, xres) = kernel.data.dim();
    let max = kernel.max();
    if !(max > 0.0) {
        return 0.0;
    }
    let mask = threshold_mask(&kernel.data, WIDTH_THRESHOLD * max);
    if !mask[[yres / 2, xres / 2]] {
        return 0.0;
    }
    let peak = extract_component(&mask, yres / 2, xres / 2);
    let area = grow_mask(&peak, 0.5 * ((xres * yres) as f64).ln());
    let magnitude = kernel.data.mapv(f64::abs);
    weighted_dispersion(&magnitude, Some(&area), kernel.dx, kernel.dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_patterns::{add_noise, gaussian_kernel, random_ideal};
    use approx::assert_relative_eq;
    use ndarray::{s, Array2};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    /// Centred `size` x `size` Gaussian of width `s` pixels in the integral convention.
    fn centred_gaussian(size: usize, s: f64, dx: f64) -> Field {
        let full = humanized_gaussian(size, s);
        let mut kernel = Field::new(full.mapv(|v| v / (dx * dx)), dx, dx);
        kernel.center_on_zero_lag();
        kernel
    }

    fn humanized_gaussian(size: usize, s: f64) -> Array2<f64> {
        crate::field_ops::humanize(&gaussian_kernel(size, size, s))
    }

    /// Volume whose levels are the ideal field blurred by Gaussians of the given widths.
    fn blurred_volume(ideal: &Field, widths: &[f64], noise: f64) -> Volume {
        let (xres, yres) = (ideal.xres(), ideal.yres());
        let data = Array3::zeros((widths.len(), yres, xres));
        let mut volume = Volume::new(data, ideal.dx, ideal.dy, 0.5).with_units(
            ideal.xy_unit.clone(),
            Unit::new("m"),
            Unit::new("V"),
        );
        let mut fft = None;
        for (level, &s) in widths.iter().enumerate() {
            let kernel = centred_gaussian(21, s, ideal.dx);
            let clean = convolve_extended(ideal, &kernel, &mut fft).unwrap();
            let measured = add_noise(&clean, noise * clean.rms(), 100 + level as u64);
            volume.set_plane(level, &measured);
        }
        volume
    }

    fn test_ideal(xres: usize, yres: usize, seed: u64) -> Field {
        random_ideal(xres, yres, 1.0, 1.0, seed).with_units(Unit::new("m"), Unit::new("A"))
    }

    #[test]
    fn test_gaussian_recovery_by_all_methods() {
        let ideal = test_ideal(128, 128, 7);
        let widths = [1.5, 2.5];
        let volume = blurred_volume(&ideal, &widths, 0.01);
        let true_widths: Vec<f64> = widths
            .iter()
            .map(|&s| measure_width(&centred_gaussian(21, s, 1.0)))
            .collect();

        for method in [Method::Regularized, Method::LeastSquares, Method::PseudoWiener] {
            let config = PsfConfig {
                method,
                estimate_sigma: true,
                kernel_width: 21,
                kernel_height: 21,
                outputs: OutputSelection::all(),
                ..PsfConfig::default()
            };
            let result = estimate(&volume, &ideal, &config).unwrap();
            assert!(!result.cancelled);

            let width = result.series(Metric::Width).unwrap();
            for (estimated, expected) in width.values.iter().zip(&true_widths) {
                assert!(
                    (estimated - expected).abs() < 0.2 * expected,
                    "{method}: width {estimated} instead of {expected}"
                );
            }
            assert!(width.values[1] > width.values[0]);

            // the kernel explains most of the measured signal
            let residual = result.series(Metric::Residual).unwrap();
            for (level, r) in residual.values.iter().enumerate() {
                let measured = volume.extract_plane(level);
                let signal = measured.rms() * (measured.data.len() as f64).sqrt();
                assert!(*r < 0.1 * signal, "{method}: residual {r} of {signal}");
            }

            let kernels = result.kernels.as_ref().unwrap();
            assert_eq!((kernels.xres(), kernels.yres(), kernels.zres()), (21, 21, 2));
            assert_eq!(kernels.value_unit, Unit::new("V A^-1 m^-2"));
        }
    }

    #[test]
    fn test_results_do_not_depend_on_partition() {
        let ideal = test_ideal(48, 48, 3);
        let widths = [1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.2, 2.4];
        let volume = blurred_volume(&ideal, &widths, 0.02);
        let config = PsfConfig {
            estimate_sigma: true,
            kernel_width: 15,
            kernel_height: 15,
            outputs: OutputSelection::all(),
            ..PsfConfig::default()
        };
        let reference = estimate(&volume, &ideal, &config).unwrap();
        let estimator = Estimator::new(&volume, &ideal, &config).unwrap();

        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..3 {
            let mut order: Vec<usize> = (0..widths.len()).collect();
            order.shuffle(&mut rng);
            let mut chunks = Vec::new();
            let mut rest = order.as_slice();
            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len());
                let (chunk, tail) = rest.split_at(n);
                chunks.push(chunk.to_vec());
                rest = tail;
            }

            let mut levels: Vec<Option<LevelOutput>> = vec![None; widths.len()];
            std::thread::scope(|scope| {
                let handles: Vec<_> = chunks
                    .iter()
                    .map(|chunk| {
                        let estimator = &estimator;
                        scope.spawn(move || {
                            let mut ws = estimator.workspace();
                            chunk
                                .iter()
                                .map(|&level| {
                                    (level, estimator.estimate_level(&mut ws, level).unwrap())
                                })
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                for handle in handles {
                    for (level, output) in handle.join().unwrap() {
                        levels[level] = Some(output);
                    }
                }
            });

            let partitioned = estimator.assemble(levels);
            assert_eq!(partitioned.summaries, reference.summaries);
            assert_eq!(partitioned.kernels, reference.kernels);
        }
    }

    #[test]
    fn test_flat_level_gives_zero_kernel() {
        let ideal = test_ideal(32, 32, 5);
        let mut volume = blurred_volume(&ideal, &[1.0, 1.0], 0.0);
        volume.data.slice_mut(s![1, .., ..]).fill(3.0);
        for method in [Method::Regularized, Method::LeastSquares, Method::PseudoWiener] {
            let config = PsfConfig {
                method,
                estimate_sigma: true,
                kernel_width: 9,
                kernel_height: 9,
                outputs: OutputSelection::all(),
                ..PsfConfig::default()
            };
            let result = estimate(&volume, &ideal, &config).unwrap();
            let kernels = result.kernels.as_ref().unwrap();
            assert!(kernels.data.iter().all(|v| v.is_finite()));
            assert!(kernels.plane_view(1).iter().all(|v| *v == 0.0), "{method}");
            let summary = result.summaries[1].as_ref().unwrap();
            assert_eq!(summary.width, 0.0);
            assert_eq!(summary.height, 0.0);
            assert_eq!(summary.norm, 0.0);
            assert_relative_eq!(summary.residual.unwrap(), 0.0, epsilon = 1e-9);
            assert!(summary.sigma.is_finite());
        }
    }

    #[test]
    fn test_size_estimation_pads_to_requested_size() {
        let ideal = random_ideal(128, 128, 1.0, 1e-3, 12);
        let volume = blurred_volume(&ideal, &[1.5], 0.0);
        let config = PsfConfig {
            method: Method::LeastSquares,
            estimate_size: true,
            kernel_width: 25,
            kernel_height: 25,
            outputs: OutputSelection::all(),
            ..PsfConfig::default()
        };
        let result = estimate(&volume, &ideal, &config).unwrap();
        let summary = result.summaries[0].as_ref().unwrap();
        assert_eq!(summary.kernel_width % 2, 1);
        assert_eq!(summary.kernel_height % 2, 1);
        assert!(summary.kernel_width < 25 && summary.kernel_width >= 9);

        let kernels = result.kernels.as_ref().unwrap();
        assert_eq!((kernels.xres(), kernels.yres()), (25, 25));
        let margin = (25 - summary.kernel_width) / 2;
        assert!(kernels.data.slice(s![0, .., ..margin]).iter().all(|v| *v == 0.0));
        assert!(kernels.data[[0, 12, 12]] > 0.0);
    }

    #[test]
    fn test_oversized_least_squares_kernel_is_clamped() {
        let ideal = test_ideal(48, 48, 2);
        let volume = blurred_volume(&ideal, &[1.0], 0.0);
        let config = PsfConfig {
            method: Method::LeastSquares,
            kernel_width: 200,
            kernel_height: 8,
            ..PsfConfig::default()
        };
        let estimator = Estimator::new(&volume, &ideal, &config).unwrap();
        assert_eq!(estimator.config().kernel_width, 17);
        assert_eq!(estimator.config().kernel_height, 9);
        let result = estimator.run(&CancelToken::new(), |_, _| true).unwrap();
        let kernels = result.kernels.unwrap();
        assert_eq!((kernels.xres(), kernels.yres()), (17, 9));
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        let ideal = test_ideal(32, 32, 1);
        let volume = blurred_volume(&ideal, &[1.0], 0.0);
        let config = PsfConfig::default();

        let empty = Volume::new(Array3::zeros((0, 32, 32)), 1.0, 1.0, 1.0);
        assert!(matches!(
            Estimator::new(&empty, &ideal, &config),
            Err(PsfError::EmptyVolume)
        ));

        let small_ideal = test_ideal(20, 32, 1);
        let small = blurred_volume(&small_ideal, &[1.0], 0.0);
        assert!(matches!(
            Estimator::new(&small, &small_ideal, &config),
            Err(PsfError::FieldTooSmall { xres: 20, .. })
        ));

        let other = test_ideal(32, 40, 1);
        assert!(matches!(
            Estimator::new(&volume, &other, &config),
            Err(PsfError::ResolutionMismatch { .. })
        ));

        let mut coarse = ideal.clone();
        coarse.dx = 2.0;
        assert!(matches!(
            Estimator::new(&volume, &coarse, &config),
            Err(PsfError::PixelSizeMismatch)
        ));

        let mut foreign = ideal.clone();
        foreign.xy_unit = Unit::new("s");
        assert!(matches!(
            Estimator::new(&volume, &foreign, &config),
            Err(PsfError::UnitMismatch { .. })
        ));

        let silent = PsfConfig {
            outputs: OutputSelection::none(),
            ..PsfConfig::default()
        };
        assert!(matches!(
            Estimator::new(&volume, &ideal, &silent),
            Err(PsfError::NothingRequested)
        ));

        let huge = PsfConfig {
            kernel_width: 64,
            ..PsfConfig::default()
        };
        assert!(matches!(
            Estimator::new(&volume, &ideal, &huge),
            Err(PsfError::KernelTooLarge { width: 64, .. })
        ));

        let estimator = Estimator::new(&volume, &ideal, &PsfConfig {
            kernel_width: 9,
            kernel_height: 9,
            ..PsfConfig::default()
        })
        .unwrap();
        let mut ws = estimator.workspace();
        assert!(matches!(
            estimator.estimate_level(&mut ws, 1),
            Err(PsfError::LevelOutOfRange { level: 1, zres: 1 })
        ));
    }

    #[test]
    fn test_cancellation_keeps_completed_levels() {
        let ideal = test_ideal(32, 32, 4);
        let volume = blurred_volume(&ideal, &[1.0; 8], 0.01);
        let config = PsfConfig {
            kernel_width: 9,
            kernel_height: 9,
            threads: Some(1),
            ..PsfConfig::default()
        };

        let token = CancelToken::new();
        token.cancel();
        let result = estimate_with_progress(&volume, &ideal, &config, &token, |_, _| true).unwrap();
        assert!(result.cancelled);
        assert!(result.summaries.iter().all(Option::is_none));
        assert!(result.kernels.unwrap().data.iter().all(|v| *v == 0.0));

        let calls = AtomicUsize::new(0);
        let stop_after_first = |done: usize, total: usize| {
            assert_eq!(total, 8);
            calls.fetch_add(1, Ordering::Relaxed);
            done < 1
        };
        let token = CancelToken::new();
        let result =
            estimate_with_progress(&volume, &ideal, &config, &token, stop_after_first).unwrap();
        let completed = result.summaries.iter().filter(|s| s.is_some()).count();
        assert!(result.cancelled);
        assert!(completed >= 1 && completed < 8);
        assert_eq!(calls.load(Ordering::Relaxed), completed);
        assert!(result.series(Metric::Width).unwrap().levels.len() == completed);
    }

    #[test]
    fn test_normalization_round_trip() {
        let mut ideal = test_ideal(40, 40, 9);
        ideal.dx = 0.5;
        ideal.dy = 0.5;
        let mut volume = blurred_volume(&ideal, &[1.0, 2.0], 0.01);
        volume.z_calibration = Some(Array1::from(vec![0.0, 0.3]));
        let integral = PsfConfig {
            kernel_width: 11,
            kernel_height: 11,
            estimate_sigma: true,
            outputs: OutputSelection::all(),
            ..PsfConfig::default()
        };
        let discrete = PsfConfig {
            normalization: Normalization::Discrete,
            ..integral.clone()
        };
        let a = estimate(&volume, &ideal, &integral).unwrap();
        let b = estimate(&volume, &ideal, &discrete).unwrap();

        let converted = a.to_normalization(Normalization::Discrete);
        let ka = converted.kernels.as_ref().unwrap();
        let kb = b.kernels.as_ref().unwrap();
        assert_eq!(ka.value_unit, kb.value_unit);
        assert_eq!(kb.value_unit, Unit::new("V A^-1"));
        for (x, y) in ka.data.iter().zip(kb.data.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12, max_relative = 1e-9);
        }
        let metrics = [
            Metric::Width,
            Metric::Height,
            Metric::Norm,
            Metric::Residual,
            Metric::Sigma,
        ];
        for metric in metrics {
            let sa = converted.series(metric).unwrap();
            let sb = b.series(metric).unwrap();
            assert_eq!(sa.value_unit, sb.value_unit);
            assert_eq!(sb.z, vec![0.0, 0.3]);
            for (x, y) in sa.values.iter().zip(&sb.values) {
                assert_relative_eq!(*x, *y, max_relative = 1e-9);
            }
        }
        assert_eq!(b.metric_unit(Metric::Residual), Unit::new("V"));
        assert_eq!(a.metric_unit(Metric::Residual), Unit::new("V m"));
        assert_eq!(a.metric_unit(Metric::Norm), Unit::new("V A^-1 m^-1"));

        let back = converted.to_normalization(Normalization::Integral);
        let again = back.to_normalization(Normalization::Integral);
        for (x, y) in again.kernels.unwrap().data.iter().zip(a.kernels.unwrap().data.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12, max_relative = 1e-9);
        }
        assert_eq!(again.normalization, Normalization::Integral);
    }

    #[test]
    fn test_preview_and_size_guess() {
        let ideal = random_ideal(96, 96, 1.0, 1e-3, 6).with_units(Unit::new("m"), Unit::new("A"));
        let volume = blurred_volume(&ideal, &[1.5], 0.0);
        let config = PsfConfig {
            kernel_width: 21,
            kernel_height: 21,
            estimate_sigma: true,
            ..PsfConfig::default()
        };
        let estimator = Estimator::new(&volume, &ideal, &config).unwrap();
        let mut ws = estimator.workspace();

        let preview = estimator.preview_level(&mut ws, 0).unwrap();
        assert_eq!(preview.kernel.data.dim(), (21, 21));
        assert_eq!(preview.convolved.value_unit, Unit::new("V"));
        let measured = volume.extract_plane(0);
        assert!(preview.difference.rms() < 0.1 * measured.rms());
        assert!(preview.summary.residual.is_some());

        let guess = estimator.guess_kernel_size(&mut ws, 0).unwrap();
        assert_eq!(guess.width % 2, 1);
        assert_eq!(guess.height % 2, 1);
        assert!(guess.width >= 9 && guess.width <= 47);
        assert_eq!(
            guess.border,
            (0.5 * (guess.width.max(guess.height) as f64).ln() + 0.5).round() as usize
        );

        let log_sigma = estimator.estimate_sigma(&mut ws, 0).unwrap();
        assert!((-8.0..=3.0).contains(&log_sigma));
    }
}
