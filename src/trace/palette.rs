use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use super::contour;
use crate::candidate::{FillRule, Geometry, Rgb, Shape, Subpath, VectorCandidate};
use crate::error::TraceFailure;
use crate::geom;
use crate::params::ParameterSet;
use crate::raster::RasterImage;

const TRANSPARENT: u32 = u32::MAX;

/// output tier; trades node count against edge fidelity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quality {
    Clean,
    Balanced,
    High,
    Ultra,
}

impl Quality {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(Quality::Clean),
            "balanced" => Some(Quality::Balanced),
            "high" => Some(Quality::High),
            "ultra" => Some(Quality::Ultra),
            _ => None,
        }
    }

    /// Douglas-Peucker epsilon (px) before curve_tolerance is added
    fn base_epsilon(self) -> f64 {
        match self {
            Quality::Clean => 1.0,
            Quality::Balanced => 0.5,
            Quality::High => 0.25,
            Quality::Ultra => 0.0,
        }
    }

    /// ultra keeps the pixel staircase verbatim
    fn smooths(self) -> bool {
        self != Quality::Ultra
    }
}

/// Deterministic colour-quantizing tracer: palette -> speckle filter -> boundary
/// loops -> simplification -> corner-preserving smoothing.
#[derive(Clone, Debug)]
pub struct PaletteTracer {
    /// pixels below this alpha are left uncovered
    pub alpha_cutoff: u8,
    /// cap for the automatic palette size (`colors = 0`)
    pub max_auto_colors: usize,
    pub kmeans_iterations: usize,
    pub seed: u64,
}

impl Default for PaletteTracer {
    fn default() -> Self {
        Self {
            alpha_cutoff: 128,
            max_auto_colors: 16,
            kmeans_iterations: 12,
            seed: 0x7261_7374,
        }
    }
}

struct Knobs {
    quality: Quality,
    colors: usize,
    speckle: usize,
    curve_tolerance: f64,
    corner_threshold: f64,
}

impl Knobs {
    fn read(params: &ParameterSet) -> Result<Self, TraceFailure> {
        let missing = |name: &str| TraceFailure::Rejected(format!("missing or mistyped `{name}`"));
        let quality = params.get_str("quality").ok_or_else(|| missing("quality"))?;
        let quality = Quality::parse(quality)
            .ok_or_else(|| TraceFailure::Rejected(format!("unknown quality `{quality}`")))?;
        let colors = params.get_i64("colors").ok_or_else(|| missing("colors"))?;
        let speckle = params.get_i64("speckle").ok_or_else(|| missing("speckle"))?;
        let curve_tolerance = params.get_f64("curve_tolerance").ok_or_else(|| missing("curve_tolerance"))?;
        let corner_threshold = params.get_f64("corner_threshold").ok_or_else(|| missing("corner_threshold"))?;
        if colors < 0 || speckle < 0 || curve_tolerance < 0.0 {
            return Err(TraceFailure::Rejected("negative knob".into()));
        }
        Ok(Self {
            quality,
            colors: colors as usize,
            speckle: speckle as usize,
            curve_tolerance,
            corner_threshold,
        })
    }
}

impl PaletteTracer {
    pub fn trace(&self, image: &RasterImage, params: &ParameterSet) -> Result<VectorCandidate, TraceFailure> {
        profiling::scope!("PaletteTracer::trace");
        let knobs = Knobs::read(params)?;
        if image.is_empty() {
            return Err(TraceFailure::Rejected("empty image".into()));
        }
        let (w, h) = image.dimensions();

        let px: Vec<Option<[u8; 3]>> = image
            .as_rgba()
            .pixels()
            .map(|p| (p.0[3] >= self.alpha_cutoff).then_some([p.0[0], p.0[1], p.0[2]]))
            .collect();
        let has_transparency = px.iter().any(Option::is_none);

        let mut histogram: HashMap<[u8; 3], u32> = HashMap::new();
        for c in px.iter().flatten() {
            *histogram.entry(*c).or_insert(0) += 1;
        }
        if histogram.is_empty() {
            return Err(TraceFailure::EmptyGeometry);
        }
        // most frequent first, ties by colour, so everything downstream is order-stable
        let mut colors: Vec<([u8; 3], u32)> = histogram.into_iter().collect();
        colors.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let k = if knobs.colors == 0 { self.auto_palette_size(&colors) } else { knobs.colors };
        let palette: Vec<[u8; 3]> = if colors.len() <= k {
            colors.iter().map(|(c, _)| *c).collect()
        } else {
            let mut rng = Pcg32::seed_from_u64(self.seed ^ k as u64);
            self.kmeans(&colors, k, &mut rng)
        };

        let lookup: HashMap<[u8; 3], u32> = colors.iter().map(|(c, _)| (*c, nearest(&palette, *c) as u32)).collect();
        let mut labels: Vec<u32> = px
            .iter()
            .map(|p| p.and_then(|c| lookup.get(&c).copied()).unwrap_or(TRANSPARENT))
            .collect();

        if knobs.speckle > 1 {
            merge_speckles(&mut labels, w as usize, h as usize, knobs.speckle);
        }

        let mut areas = vec![0usize; palette.len()];
        for &l in labels.iter().filter(|&&l| l != TRANSPARENT) {
            areas[l as usize] += 1;
        }
        let mut order: Vec<usize> = (0..palette.len()).filter(|&l| areas[l] > 0).collect();
        order.sort_by(|&a, &b| areas[b].cmp(&areas[a]).then(a.cmp(&b)));

        let epsilon = knobs.quality.base_epsilon() + knobs.curve_tolerance;
        let mut shapes = Vec::with_capacity(order.len());
        for (rank, &label) in order.iter().enumerate() {
            let fill = Rgb(palette[label]);
            if rank == 0 && !has_transparency {
                // the dominant colour underlays everything as one rect
                let rect = Geometry::Rect { x: 0.0, y: 0.0, width: w as f64, height: h as f64 };
                shapes.push(Shape::new(rect, fill));
                continue;
            }
            let mask: Vec<bool> = labels.iter().map(|&l| l == label as u32).collect();
            let subpaths: Vec<Subpath> = contour::mask_loops(&mask, w, h)
                .iter()
                .filter_map(|ring| {
                    let ring = geom::simplify_loop(ring, epsilon);
                    if knobs.quality.smooths() {
                        contour::smooth_loop(&ring, knobs.corner_threshold)
                    } else {
                        Subpath::polygon(&ring)
                    }
                })
                .collect();
            if !subpaths.is_empty() {
                shapes.push(Shape::new(Geometry::Path { subpaths, fill_rule: FillRule::EvenOdd }, fill));
            }
        }

        if shapes.is_empty() {
            return Err(TraceFailure::EmptyGeometry);
        }
        Ok(VectorCandidate::new(w, h, shapes))
    }

    /// number of 3-bit-per-channel colour bins holding at least 0.5% of the pixels
    fn auto_palette_size(&self, colors: &[([u8; 3], u32)]) -> usize {
        let mut bins = [[[0u64; 8]; 8]; 8];
        let mut total = 0u64;
        for &([r, g, b], n) in colors {
            bins[(r >> 5) as usize][(g >> 5) as usize][(b >> 5) as usize] += n as u64;
            total += n as u64;
        }
        let floor = (total / 200).max(1);
        let significant = bins.iter().flatten().flatten().filter(|&&n| n >= floor).count();
        significant.clamp(1, self.max_auto_colors.max(1))
    }

    /// weighted k-means over the unique colours, seeded k-means++ style
    fn kmeans(&self, colors: &[([u8; 3], u32)], k: usize, rng: &mut Pcg32) -> Vec<[u8; 3]> {
        profiling::scope!("kmeans");
        let as_f = |c: [u8; 3]| [c[0] as f64, c[1] as f64, c[2] as f64];
        let dist2 = |a: [f64; 3], b: [f64; 3]| (0..3).map(|i| (a[i] - b[i]).powi(2)).sum::<f64>();

        let mut centers = vec![as_f(colors[0].0)];
        while centers.len() < k {
            let weights: Vec<f64> = colors
                .iter()
                .map(|&(c, n)| {
                    let d = centers.iter().map(|&m| dist2(as_f(c), m)).fold(f64::INFINITY, f64::min);
                    d * n as f64
                })
                .collect();
            let total: f64 = weights.iter().sum();
            if total <= 0.0 {
                break;
            }
            let mut target = rng.random::<f64>() * total;
            let mut pick = colors.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if target < *w {
                    pick = i;
                    break;
                }
                target -= w;
            }
            centers.push(as_f(colors[pick].0));
        }

        let mut assignment = vec![usize::MAX; colors.len()];
        for _ in 0..self.kmeans_iterations {
            let mut changed = false;
            for (i, &(c, _)) in colors.iter().enumerate() {
                let best = (0..centers.len())
                    .min_by(|&a, &b| dist2(as_f(c), centers[a]).total_cmp(&dist2(as_f(c), centers[b])))
                    .unwrap_or(0);
                if assignment[i] != best {
                    assignment[i] = best;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            let mut sums = vec![([0.0f64; 3], 0.0f64); centers.len()];
            for (i, &(c, n)) in colors.iter().enumerate() {
                let (acc, weight) = &mut sums[assignment[i]];
                let cf = as_f(c);
                for ch in 0..3 {
                    acc[ch] += cf[ch] * n as f64;
                }
                *weight += n as f64;
            }
            for (center, (acc, weight)) in centers.iter_mut().zip(&sums) {
                if *weight > 0.0 {
                    *center = [acc[0] / weight, acc[1] / weight, acc[2] / weight];
                }
            }
        }

        let mut palette: Vec<[u8; 3]> = centers
            .iter()
            .map(|c| [c[0].round() as u8, c[1].round() as u8, c[2].round() as u8])
            .collect();
        let mut seen = std::collections::HashSet::new();
        palette.retain(|c| seen.insert(*c));
        palette
    }
}

fn nearest(palette: &[[u8; 3]], c: [u8; 3]) -> usize {
    let d = |p: &[u8; 3]| (0..3).map(|i| (p[i] as i32 - c[i] as i32).pow(2)).sum::<i32>();
    (0..palette.len()).min_by_key(|&i| (d(&palette[i]), i)).unwrap_or(0)
}

/// relabel 4-connected regions smaller than `min_area` to the label they share the
/// longest border with. transparent pixels are never merged into or out of.
fn merge_speckles(labels: &mut [u32], w: usize, h: usize, min_area: usize) {
    profiling::scope!("merge_speckles");
    let mut visited = vec![false; labels.len()];
    let mut region = Vec::new();
    let mut stack = Vec::new();
    for seed in 0..labels.len() {
        if visited[seed] || labels[seed] == TRANSPARENT {
            continue;
        }
        let label = labels[seed];
        region.clear();
        stack.push(seed);
        visited[seed] = true;
        while let Some(i) = stack.pop() {
            region.push(i);
            for j in neighbours4(i, w, h).into_iter().flatten() {
                if !visited[j] && labels[j] == label {
                    visited[j] = true;
                    stack.push(j);
                }
            }
        }
        if region.len() >= min_area {
            continue;
        }

        let mut border: HashMap<u32, usize> = HashMap::new();
        for &i in &region {
            for j in neighbours4(i, w, h).into_iter().flatten() {
                let l = labels[j];
                if l != label && l != TRANSPARENT {
                    *border.entry(l).or_insert(0) += 1;
                }
            }
        }
        if let Some((&to, _)) = border.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))) {
            for &i in &region {
                labels[i] = to;
            }
        }
    }
}

#[inline]
fn neighbours4(i: usize, w: usize, h: usize) -> [Option<usize>; 4] {
    let (x, y) = (i % w, i / w);
    [
        (x > 0).then(|| i - 1),
        (x + 1 < w).then(|| i + 1),
        (y > 0).then(|| i - w),
        (y + 1 < h).then(|| i + w),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamSchema;
    use crate::render::CpuRenderer;

    fn params(quality: &str, colors: i64) -> ParameterSet {
        ParamSchema::reference().defaults().with("quality", quality).with("colors", colors)
    }

    fn checker_with_dot() -> RasterImage {
        RasterImage::from_fn(16, 16, |x, y| {
            if (6..10).contains(&x) && (6..10).contains(&y) {
                [0, 0, 255, 255]
            } else if x == 1 && y == 1 {
                [255, 0, 0, 255] // single-pixel speckle
            } else {
                [255, 255, 255, 255]
            }
        })
    }

    #[test]
    fn test_solid_image_traces_to_one_rect() {
        let img = RasterImage::filled(12, 8, [200, 10, 10, 255]);
        let c = PaletteTracer::default().trace(&img, &params("balanced", 0)).unwrap();
        assert_eq!(c.shapes.len(), 1);
        assert!(matches!(c.shapes[0].geometry, Geometry::Rect { .. }));
        assert_eq!(c.shapes[0].fill, Rgb([200, 10, 10]));
    }

    #[test]
    fn test_ultra_rerenders_pixel_exact() {
        let img = checker_with_dot();
        let set = params("ultra", 0).with("speckle", 0i64);
        let c = PaletteTracer::default().trace(&img, &set).unwrap();
        let back = CpuRenderer::default().render(&c, 16, 16).unwrap();
        assert_eq!(back, img);
    }

    #[test]
    fn test_speckle_filter_absorbs_small_regions() {
        let img = checker_with_dot();
        let set = params("ultra", 0).with("speckle", 4i64);
        let c = PaletteTracer::default().trace(&img, &set).unwrap();
        // white underlay + blue square; the red dot merged into white
        assert_eq!(c.shapes.len(), 2);
        assert!(c.shapes.iter().all(|s| s.fill != Rgb([255, 0, 0])));
    }

    #[test]
    fn test_palette_size_is_capped() {
        let img = RasterImage::from_fn(32, 32, |x, y| [(x * 8) as u8, (y * 8) as u8, 128, 255]);
        let c = PaletteTracer::default().trace(&img, &params("clean", 4)).unwrap();
        assert!(c.shapes.len() <= 4);
        let again = PaletteTracer::default().trace(&img, &params("clean", 4)).unwrap();
        assert_eq!(c, again);
    }

    #[test]
    fn test_transparent_pixels_stay_uncovered() {
        let img = RasterImage::from_fn(8, 8, |x, _| if x < 4 { [0, 0, 0, 255] } else { [0, 0, 0, 0] });
        let c = PaletteTracer::default().trace(&img, &params("ultra", 0)).unwrap();
        assert_eq!(c.shapes.len(), 1);
        assert!(matches!(c.shapes[0].geometry, Geometry::Path { .. }));
        assert!((c.shapes[0].geometry.area() - 32.0).abs() < 1e-9);
    }

    #[test]
    fn test_fully_transparent_is_empty_geometry() {
        let img = RasterImage::filled(4, 4, [0, 0, 0, 0]);
        let err = PaletteTracer::default().trace(&img, &params("ultra", 0)).unwrap_err();
        assert_eq!(err, TraceFailure::EmptyGeometry);
    }

    #[test]
    fn test_missing_knob_is_rejected() {
        let set = ParameterSet::new().with("quality", "ultra");
        let err = PaletteTracer::default().trace(&RasterImage::filled(2, 2, [0; 4]), &set).unwrap_err();
        assert!(matches!(err, TraceFailure::Rejected(_)));
    }
}
