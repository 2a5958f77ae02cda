//! This module defines the data structures holding sampled data: 2D fields (measured slices,
//! ideal patterns, transfer functions) and 3D volumes (stacks of slices along z).
//!
//! Arrays are stored row-major with the row index first, i.e. fields are `[y, x]` and volumes
//! are `[z, y, x]`, so that a single z level is a contiguous 2D view.

use crate::units::Unit;
use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Represents a 2D scalar field sampled on a regular grid.
///
/// # Fields
/// - `data`: Samples, indexed `[row, column]` (`[y, x]`).
/// - `dx`, `dy`: Physical pixel sizes.
/// - `x_offset`, `y_offset`: Physical position of the top-left pixel corner.
/// - `xy_unit`: Unit of lateral coordinates.
/// - `value_unit`: Unit of the sample values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub data: Array2<f64>,
    pub dx: f64,
    pub dy: f64,
    pub x_offset: f64,
    pub y_offset: f64,
    pub xy_unit: Unit,
    pub value_unit: Unit,
}

impl Field {
    /// Creates a field with zero offsets and dimensionless units.
    pub fn new(data: Array2<f64>, dx: f64, dy: f64) -> Field {
        Field {
            data,
            dx,
            dy,
            x_offset: 0.0,
            y_offset: 0.0,
            xy_unit: Unit::dimensionless(),
            value_unit: Unit::dimensionless(),
        }
    }

    pub fn with_units(mut self, xy_unit: Unit, value_unit: Unit) -> Field {
        self.xy_unit = xy_unit;
        self.value_unit = value_unit;
        self
    }

    /// Creates a zero-filled field with the same sampling and units as `self`.
    pub fn zeros_like(&self, xres: usize, yres: usize) -> Field {
        Field {
            data: Array2::zeros((yres, xres)),
            dx: self.dx,
            dy: self.dy,
            x_offset: 0.0,
            y_offset: 0.0,
            xy_unit: self.xy_unit.clone(),
            value_unit: self.value_unit.clone(),
        }
    }

    pub fn xres(&self) -> usize {
        self.data.ncols()
    }

    pub fn yres(&self) -> usize {
        self.data.nrows()
    }

    pub fn pixel_area(&self) -> f64 {
        self.dx * self.dy
    }

    pub fn mean(&self) -> f64 {
        self.data.mean().unwrap_or(0.0)
    }

    /// Root mean square deviation from the mean.
    pub fn rms(&self) -> f64 {
        let n = self.data.len();
        if n == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let ss: f64 = self.data.iter().map(|v| (v - mean) * (v - mean)).sum();
        (ss / n as f64).sqrt()
    }

    /// Plain sum of squared values.
    pub fn energy(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Largest absolute value.
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Sets offsets so that the pixel at `(xres/2, yres/2)` is centred on zero.
    pub fn center_on_zero_lag(&mut self) {
        self.x_offset = -((self.xres() / 2) as f64 + 0.5) * self.dx;
        self.y_offset = -((self.yres() / 2) as f64 + 0.5) * self.dy;
    }

    /// Cuts out a `width` x `height` block whose top-left corner is `(col, row)`.
    pub fn crop(&self, col: usize, row: usize, width: usize, height: usize) -> Field {
        let mut cropped = self.zeros_like(width, height);
        cropped
            .data
            .assign(&self.data.slice(s![row..row + height, col..col + width]));
        cropped.x_offset = self.x_offset + col as f64 * self.dx;
        cropped.y_offset = self.y_offset + row as f64 * self.dy;
        cropped
    }

    /// Extends the field by the given number of pixels on each side, filling with `fill`.
    pub fn extend(&self, left: usize, top: usize, right: usize, bottom: usize, fill: f64) -> Field {
        let xres = self.xres() + left + right;
        let yres = self.yres() + top + bottom;
        let mut extended = self.zeros_like(xres, yres);
        extended.data.fill(fill);
        extended
            .data
            .slice_mut(s![top..top + self.yres(), left..left + self.xres()])
            .assign(&self.data);
        extended.x_offset = self.x_offset - left as f64 * self.dx;
        extended.y_offset = self.y_offset - top as f64 * self.dy;
        extended
    }
}

/// Relative comparison of physical sizes.
pub(crate) fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-6 * a.abs().max(b.abs())
}

/// Represents a volume (brick): a stack of 2D slices along z.
///
/// # Fields
/// - `data`: Samples, indexed `[z, y, x]`.
/// - `dx`, `dy`, `dz`: Physical voxel sizes.
/// - `x_offset`, `y_offset`, `z_offset`: Physical offsets.
/// - `z_calibration`: Optional non-uniform z coordinate of each level.
/// - `xy_unit`, `z_unit`, `value_unit`: Units of lateral coordinates, depth and values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub data: Array3<f64>,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub x_offset: f64,
    pub y_offset: f64,
    pub z_offset: f64,
    pub z_calibration: Option<Array1<f64>>,
    pub xy_unit: Unit,
    pub z_unit: Unit,
    pub value_unit: Unit,
}

impl Volume {
    /// Creates a volume with zero offsets, no z calibration and dimensionless units.
    pub fn new(data: Array3<f64>, dx: f64, dy: f64, dz: f64) -> Volume {
        Volume {
            data,
            dx,
            dy,
            dz,
            x_offset: 0.0,
            y_offset: 0.0,
            z_offset: 0.0,
            z_calibration: None,
            xy_unit: Unit::dimensionless(),
            z_unit: Unit::dimensionless(),
            value_unit: Unit::dimensionless(),
        }
    }

    pub fn with_units(mut self, xy_unit: Unit, z_unit: Unit, value_unit: Unit) -> Volume {
        self.xy_unit = xy_unit;
        self.z_unit = z_unit;
        self.value_unit = value_unit;
        self
    }

    pub fn xres(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    pub fn yres(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn zres(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn plane_view(&self, level: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(Axis(0), level)
    }

    /// Extracts one xy plane as a field carrying the volume's lateral sampling and units.
    pub fn extract_plane(&self, level: usize) -> Field {
        Field {
            data: self.plane_view(level).to_owned(),
            dx: self.dx,
            dy: self.dy,
            x_offset: self.x_offset,
            y_offset: self.y_offset,
            xy_unit: self.xy_unit.clone(),
            value_unit: self.value_unit.clone(),
        }
    }

    /// Overwrites one xy plane. The field must have the volume's xy resolution.
    pub fn set_plane(&mut self, level: usize, field: &Field) {
        self.data.index_axis_mut(Axis(0), level).assign(&field.data);
    }

    /// The z coordinate of each level, from the calibration when present.
    pub fn z_axis(&self) -> Array1<f64> {
        match &self.z_calibration {
            Some(calibration) if calibration.len() == self.zres() => calibration.clone(),
            _ => Array1::from_iter((0..self.zres()).map(|k| self.z_offset + k as f64 * self.dz)),
        }
    }
}
