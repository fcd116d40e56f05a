//─────────────────────────────────────────────────────────────────────────────
// pixel-error diagnostics (MAE, MSE, PSNR); reported alongside the composite
//─────────────────────────────────────────────────────────────────────────────

use image::RgbImage;
use rayon::prelude::*;

/// peak value for 8-bit channels
pub const PSNR_PEAK: f64 = 255.0;

/// PSNR (peak signal-to-noise ratio) in decibels.
/// - `mse`: mean squared error
/// - `peak`: 255.0 for 8-bit images, 1.0 for normalized [0,1] range
/// higher PSNR = better quality. typical ranges:
///   - 30 dB = acceptable
///   - 35 dB = good
///   - 40+ dB = very good
/// mse is clamped to 1e-12 so the result stays finite (and JSON-safe): identical
/// images report ~168 dB at peak 255, a ceiling rather than a measurement.
#[inline]
pub fn psnr_from_mse(mse: f64, peak: f64) -> f64 {
    let mse = mse.max(1e-12);
    10.0 * ((peak * peak) / mse).log10()
}

/// (mean absolute error per channel, PSNR in dB) over RGB.
/// identical images give (0, ~168 dB) because the MSE is clamped.
pub fn mae_psnr(a: &RgbImage, b: &RgbImage) -> (f64, f64) {
    profiling::scope!("mae_psnr");
    let n = a.as_raw().len().min(b.as_raw().len());
    if n == 0 {
        return (255.0, 0.0);
    }
    let (abs, sq) = a
        .as_raw()
        .par_chunks(4096)
        .zip(b.as_raw().par_chunks(4096))
        .map(|(ca, cb)| {
            let mut abs = 0u64;
            let mut sq = 0u64;
            for (&p, &q) in ca.iter().zip(cb) {
                let d = p.abs_diff(q) as u64;
                abs += d;
                sq += d * d;
            }
            (abs, sq)
        })
        .reduce(|| (0, 0), |x, y| (x.0 + y.0, x.1 + y.1));
    let mae = abs as f64 / n as f64;
    let mse = sq as f64 / n as f64;
    (mae, psnr_from_mse(mse, PSNR_PEAK))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psnr_clamps_zero_mse() {
        assert!(psnr_from_mse(0.0, 255.0).is_finite());
        assert!((psnr_from_mse(0.0, 255.0) - 168.1308).abs() < 1e-3);
        assert!((psnr_from_mse(255.0 * 255.0, 255.0)).abs() < 1e-12);
    }

    #[test]
    fn test_mae_psnr() {
        let a = RgbImage::new(4, 4);
        let b = RgbImage::from_pixel(4, 4, image::Rgb([10, 10, 10]));
        let (mae, psnr) = mae_psnr(&a, &b);
        assert_eq!(mae, 10.0);
        assert!((psnr - psnr_from_mse(100.0, 255.0)).abs() < 1e-12);
        let (mae, _) = mae_psnr(&a, &a);
        assert_eq!(mae, 0.0);
    }
}
