//! Elementary field operations shared by the solvers: zero-lag recentring, cropping and padding
//! of kernels, and convolution with border extension.

use crate::data_container::Field;
use crate::error::PsfError;
use crate::fft::Fft2dWorkspace;
use ndarray::Array2;

/// Moves the zero-lag sample from index `(0, 0)` to `(yres/2, xres/2)`.
pub fn humanize(data: &Array2<f64>) -> Array2<f64> {
    let (yres, xres) = data.dim();
    let mut out = Array2::zeros((yres, xres));
    for ((i, j), v) in data.indexed_iter() {
        out[[(i + yres / 2) % yres, (j + xres / 2) % xres]] = *v;
    }
    out
}

/// Cuts a `width` x `height` kernel out of a larger one, keeping zero lag at the centre.
///
/// Both kernels have zero lag at `(res/2)`. Offsets are reset so the zero-lag pixel is centred on
/// the origin.
pub fn crop_about_zero_lag(kernel: &Field, width: usize, height: usize) -> Field {
    let width = width.min(kernel.xres());
    let height = height.min(kernel.yres());
    let col = kernel.xres() / 2 - width / 2;
    let row = kernel.yres() / 2 - height / 2;
    let mut cropped = kernel.crop(col, row, width, height);
    cropped.center_on_zero_lag();
    cropped
}

/// Zero-pads a kernel to `width` x `height`, keeping zero lag at `(width/2, height/2)`.
pub fn pad_about_zero_lag(kernel: &Field, width: usize, height: usize) -> Field {
    let left = (width / 2).saturating_sub(kernel.xres() / 2);
    let top = (height / 2).saturating_sub(kernel.yres() / 2);
    let right = width.saturating_sub(kernel.xres() + left);
    let bottom = height.saturating_sub(kernel.yres() + top);
    let mut padded = kernel.extend(left, top, right, bottom, 0.0);
    padded.center_on_zero_lag();
    padded
}

/// Convolves `field` with an integral-convention `kernel`, extending the field by replicating
/// its border values.
///
/// The result has the size of `field` and the sum includes the pixel area, i.e.
/// `C(y, x) = Σ F(y - a, x - b)·K(a, b)·dx·dy` with lags measured from the kernel centre.
pub fn convolve_extended(
    field: &Field,
    kernel: &Field,
    fft: &mut Option<Fft2dWorkspace>,
) -> Result<Field, PsfError> {
    let (yres, xres) = field.data.dim();
    let (kh, kw) = kernel.data.dim();
    let (hh, hw) = (kh / 2, kw / 2);
    let (ext_yres, ext_xres) = (yres + 2 * hh.max(1), xres + 2 * hw.max(1));
    let (top, left) = (hh.max(1), hw.max(1));

    let extended = Array2::from_shape_fn((ext_yres, ext_xres), |(i, j)| {
        let si = i.saturating_sub(top).min(yres - 1);
        let sj = j.saturating_sub(left).min(xres - 1);
        field.data[[si, sj]]
    });
    let mut wrapped = Array2::zeros((ext_yres, ext_xres));
    for ((a, b), v) in kernel.data.indexed_iter() {
        let i = (a + ext_yres - hh) % ext_yres;
        let j = (b + ext_xres - hw) % ext_xres;
        wrapped[[i, j]] = *v;
    }

    let ws = Fft2dWorkspace::ensure(fft, ext_xres, ext_yres);
    let mut fspec = ws.make_spectrum();
    let mut kspec = ws.make_spectrum();
    ws.forward(&extended, &mut fspec)?;
    ws.forward(&wrapped, &mut kspec)?;
    fspec.zip_mut_with(&kspec, |f, k| *f *= *k);
    let mut full = Array2::zeros((ext_yres, ext_xres));
    ws.inverse(&mut fspec, &mut full)?;

    let area = kernel.pixel_area();
    let mut result = field.zeros_like(xres, yres);
    result.x_offset = field.x_offset;
    result.y_offset = field.y_offset;
    for ((i, j), v) in result.data.indexed_iter_mut() {
        *v = full[[i + top, j + left]] * area;
    }
    Ok(result)
}
