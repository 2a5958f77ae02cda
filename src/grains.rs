//! Binary mask operations used to locate and measure kernel support.
//!
//! Masks are `Array2<bool>` with the same `[row, col]` layout as the fields they describe.

use ndarray::Array2;

/// Inclusive bounding box of a set of pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min_row: usize,
    pub min_col: usize,
    pub max_row: usize,
    pub max_col: usize,
}

/// Marks pixels with `value >= threshold`.
pub fn threshold_mask(data: &Array2<f64>, threshold: f64) -> Array2<bool> {
    data.mapv(|v| v >= threshold)
}

/// Extracts the 8-connected component of `mask` containing `(row, col)`.
///
/// Returns an empty mask when the seed pixel itself is not set.
pub fn extract_component(mask: &Array2<bool>, row: usize, col: usize) -> Array2<bool> {
    let (yres, xres) = mask.dim();
    let mut component = Array2::from_elem((yres, xres), false);
    if !mask[[row, col]] {
        return component;
    }
    let mut stack = vec![(row, col)];
    component[[row, col]] = true;
    while let Some((i, j)) = stack.pop() {
        for ni in i.saturating_sub(1)..=(i + 1).min(yres - 1) {
            for nj in j.saturating_sub(1)..=(j + 1).min(xres - 1) {
                if mask[[ni, nj]] && !component[[ni, nj]] {
                    component[[ni, nj]] = true;
                    stack.push((ni, nj));
                }
            }
        }
    }
    component
}

/// Bounding box of all set pixels, `None` for an empty mask.
pub fn bounding_box(mask: &Array2<bool>) -> Option<BoundingBox> {
    let mut bbox: Option<BoundingBox> = None;
    for ((i, j), &set) in mask.indexed_iter() {
        if !set {
            continue;
        }
        bbox = Some(match bbox {
            None => BoundingBox {
                min_row: i,
                min_col: j,
                max_row: i,
                max_col: j,
            },
            Some(b) => BoundingBox {
                min_row: b.min_row.min(i),
                min_col: b.min_col.min(j),
                max_row: b.max_row.max(i),
                max_col: b.max_col.max(j),
            },
        });
    }
    bbox
}

/// Grows the mask by all pixels within Euclidean `distance` (in pixels) of a set pixel.
pub fn grow_mask(mask: &Array2<bool>, distance: f64) -> Array2<bool> {
    let (yres, xres) = mask.dim();
    let mut grown = mask.clone();
    if distance < 1.0 {
        return grown;
    }
    let r = distance.floor() as isize;
    let d2 = distance * distance;
    let disk: Vec<(isize, isize)> = (-r..=r)
        .flat_map(|di| (-r..=r).map(move |dj| (di, dj)))
        .filter(|&(di, dj)| ((di * di + dj * dj) as f64) <= d2)
        .collect();

    for ((i, j), &set) in mask.indexed_iter() {
        if !set {
            continue;
        }
        for &(di, dj) in &disk {
            let ni = i as isize + di;
            let nj = j as isize + dj;
            if ni >= 0 && nj >= 0 && (ni as usize) < yres && (nj as usize) < xres {
                grown[[ni as usize, nj as usize]] = true;
            }
        }
    }
    grown
}

/// Weighted mean squared distance from the weighted centroid, in physical units.
///
/// Only pixels selected by `mask` contribute; `None` selects all. Returns zero when the weights
/// sum to zero.
pub fn weighted_dispersion(
    weights: &Array2<f64>,
    mask: Option<&Array2<bool>>,
    dx: f64,
    dy: f64,
) -> f64 {
    let selected = |i: usize, j: usize| mask.is_none_or(|m| m[[i, j]]);
    let (mut sw, mut sx, mut sy) = (0.0, 0.0, 0.0);
    for ((i, j), &w) in weights.indexed_iter() {
        if selected(i, j) {
            sw += w;
            sx += w * j as f64 * dx;
            sy += w * i as f64 * dy;
        }
    }
    if sw <= 0.0 {
        return 0.0;
    }
    let (xc, yc) = (sx / sw, sy / sw);
    let mut s2 = 0.0;
    for ((i, j), &w) in weights.indexed_iter() {
        if selected(i, j) {
            let x = j as f64 * dx - xc;
            let y = i as f64 * dy - yc;
            s2 += w * (x * x + y * y);
        }
    }
    s2 / sw
}
