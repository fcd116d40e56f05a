use std::collections::HashMap;

use image::RgbImage;
use palette::{color_difference::Ciede2000, white_point::D65, FromColor, Lab, Srgb};
use rayon::prelude::*;

use crate::candidate::Rgb;
use crate::error::MetricUnavailable;

fn rgb_to_lab(rgb: [u8; 3]) -> Lab<D65, f32> {
    let srgb = Srgb::new(rgb[0] as f32 / 255.0, rgb[1] as f32 / 255.0, rgb[2] as f32 / 255.0);
    Lab::from_color(srgb)
}

/// CIEDE2000 between two fill colours
pub fn delta_e(a: Rgb, b: Rgb) -> f64 {
    if a == b {
        return 0.0;
    }
    rgb_to_lab(a.0).difference(rgb_to_lab(b.0)) as f64
}

/// Mean per-pixel CIEDE2000 between two images of the same size. Pixels that are
/// bit-identical contribute exactly 0.
pub fn mean_ciede2000(reference: &RgbImage, candidate: &RgbImage) -> Result<f64, MetricUnavailable> {
    profiling::scope!("mean_ciede2000");
    if reference.dimensions() != candidate.dimensions() {
        return Err(MetricUnavailable::new("color", "dimension mismatch"));
    }
    let n = reference.width() as usize * reference.height() as usize;
    if n == 0 {
        return Err(MetricUnavailable::new("color", "empty image"));
    }

    // flat-colour artwork has few distinct colours; convert each once
    let mut labs: HashMap<[u8; 3], Lab<D65, f32>> = HashMap::new();
    for (p, q) in reference.pixels().zip(candidate.pixels()) {
        if p != q {
            labs.entry(p.0).or_insert_with(|| rgb_to_lab(p.0));
            labs.entry(q.0).or_insert_with(|| rgb_to_lab(q.0));
        }
    }
    if labs.is_empty() {
        return Ok(0.0);
    }

    let a = reference.as_raw();
    let b = candidate.as_raw();
    let total: f64 = a
        .par_chunks(3 * 1024)
        .zip(b.par_chunks(3 * 1024))
        .map(|(ca, cb)| {
            let mut acc = 0.0f64;
            for (p, q) in ca.chunks_exact(3).zip(cb.chunks_exact(3)) {
                if p == q {
                    continue;
                }
                let (Some(lp), Some(lq)) = (labs.get(p), labs.get(q)) else {
                    continue;
                };
                acc += lp.difference(*lq) as f64;
            }
            acc
        })
        .sum();
    Ok(total / n as f64)
}
