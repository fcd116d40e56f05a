//! Multi-channel SSIM with a uniform window and sample covariance (the scikit-image
//! defaults): the mean of the local SSIM map over every window that fits entirely
//! inside the image, averaged over R, G and B.

use image::RgbImage;
use rayon::prelude::*;

use crate::error::MetricUnavailable;

const K1: f64 = 0.01;
const K2: f64 = 0.03;
const DATA_RANGE: f64 = 255.0;

/// summed-area tables of x, y, x^2, y^2 and x*y for one channel
struct Integrals {
    stride: usize,
    sums: [Vec<f64>; 5],
}

impl Integrals {
    fn build(a: &RgbImage, b: &RgbImage, channel: usize) -> Self {
        let (w, h) = (a.width() as usize, a.height() as usize);
        let stride = w + 1;
        let mut sums: [Vec<f64>; 5] = std::array::from_fn(|_| vec![0.0; stride * (h + 1)]);
        for y in 0..h {
            let mut row = [0.0f64; 5];
            for x in 0..w {
                let p = a.get_pixel(x as u32, y as u32).0[channel] as f64;
                let q = b.get_pixel(x as u32, y as u32).0[channel] as f64;
                let vals = [p, q, p * p, q * q, p * q];
                for k in 0..5 {
                    row[k] += vals[k];
                    let above = sums[k][y * stride + x + 1];
                    sums[k][(y + 1) * stride + x + 1] = above + row[k];
                }
            }
        }
        Self { stride, sums }
    }

    #[inline]
    fn window(&self, k: usize, x0: usize, y0: usize, side: usize) -> f64 {
        let s = &self.sums[k];
        let (x1, y1) = (x0 + side, y0 + side);
        s[y1 * self.stride + x1] - s[y0 * self.stride + x1] - s[y1 * self.stride + x0] + s[y0 * self.stride + x0]
    }
}

fn channel_ssim(a: &RgbImage, b: &RgbImage, channel: usize, side: usize) -> f64 {
    profiling::scope!("channel_ssim");
    let (w, h) = (a.width() as usize, a.height() as usize);
    let tables = Integrals::build(a, b, channel);

    let np = (side * side) as f64;
    let cov_norm = np / (np - 1.0);
    let c1 = (K1 * DATA_RANGE).powi(2);
    let c2 = (K2 * DATA_RANGE).powi(2);

    let rows = h - side + 1;
    let cols = w - side + 1;
    let total: f64 = (0..rows)
        .into_par_iter()
        .map(|y0| {
            let mut acc = 0.0;
            for x0 in 0..cols {
                let ux = tables.window(0, x0, y0, side) / np;
                let uy = tables.window(1, x0, y0, side) / np;
                let uxx = tables.window(2, x0, y0, side) / np;
                let uyy = tables.window(3, x0, y0, side) / np;
                let uxy = tables.window(4, x0, y0, side) / np;
                let vx = cov_norm * (uxx - ux * ux);
                let vy = cov_norm * (uyy - uy * uy);
                let vxy = cov_norm * (uxy - ux * uy);
                let num = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
                let den = (ux * ux + uy * uy + c1) * (vx + vy + c2);
                acc += num / den;
            }
            acc
        })
        .sum();
    total / (rows * cols) as f64
}

/// SSIM in [-1, 1] (1 = identical). images smaller than 3px on a side have no
/// meaningful window and report the metric as unavailable.
pub fn ssim_rgb(a: &RgbImage, b: &RgbImage, window: usize) -> Result<f64, MetricUnavailable> {
    profiling::scope!("ssim_rgb");
    if a.dimensions() != b.dimensions() {
        return Err(MetricUnavailable::new("ssim", "dimension mismatch"));
    }
    let min_side = a.width().min(a.height()) as usize;
    if min_side < 3 {
        return Err(MetricUnavailable::new("ssim", format!("image side {min_side}px is below 3px")));
    }
    // shrink the window to the largest odd size that fits
    let mut side = window.min(min_side);
    if side % 2 == 0 {
        side -= 1;
    }
    let per_channel: Vec<f64> = (0..3).into_par_iter().map(|c| channel_ssim(a, b, c, side)).collect();
    Ok(per_channel.iter().sum::<f64>() / 3.0)
}
