//! Lossy candidate rewrites. Each returns a new candidate; whether it is kept is the
//! optimizer's call.

use std::collections::BTreeMap;

use crate::candidate::{Geometry, Rgb, Shape, VectorCandidate};
use crate::fitness::color::delta_e;

/// Collapse fills closer than `threshold` (CIEDE2000) onto the colour covering the
/// larger area, then fuse runs of adjacent paths that now share fill, rule and opacity.
pub fn merge_colors(candidate: &VectorCandidate, threshold: f64) -> VectorCandidate {
    profiling::scope!("merge_colors");
    let mut areas: BTreeMap<Rgb, f64> = BTreeMap::new();
    if let Some(bg) = candidate.background {
        *areas.entry(bg).or_default() += candidate.width as f64 * candidate.height as f64;
    }
    for shape in &candidate.shapes {
        *areas.entry(shape.fill).or_default() += shape.geometry.area();
    }
    let mut swatches: Vec<(Rgb, f64)> = areas.into_iter().collect();
    swatches.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut keep: Vec<Rgb> = Vec::new();
    let mut remap: BTreeMap<Rgb, Rgb> = BTreeMap::new();
    for (color, _) in swatches {
        match keep.iter().find(|&&k| delta_e(k, color) < threshold) {
            Some(&k) => {
                remap.insert(color, k);
            }
            None => keep.push(color),
        }
    }
    let recolor = |c: Rgb| remap.get(&c).copied().unwrap_or(c);

    let mut shapes: Vec<Shape> = Vec::with_capacity(candidate.shapes.len());
    for shape in &candidate.shapes {
        let fill = recolor(shape.fill);
        if let Some(prev) = shapes.last_mut() {
            if let Some(merged) = fuse_paths(prev, &shape.geometry, fill, shape.opacity) {
                *prev = merged;
                continue;
            }
        }
        let mut s = Shape::new(shape.geometry.clone(), fill);
        s.opacity = shape.opacity;
        shapes.push(s);
    }

    let mut out = VectorCandidate::new(candidate.width, candidate.height, shapes)
        .with_background(candidate.background.map(recolor));
    out.precision = candidate.precision;
    out.params = candidate.params.clone();
    out
}

fn fuse_paths(prev: &Shape, next: &Geometry, fill: Rgb, opacity: f32) -> Option<Shape> {
    if prev.fill != fill || prev.opacity != opacity {
        return None;
    }
    match (&prev.geometry, next) {
        (
            Geometry::Path { subpaths: a, fill_rule: ra },
            Geometry::Path { subpaths: b, fill_rule: rb },
        ) if ra == rb => {
            let geometry = Geometry::Path {
                subpaths: a.iter().chain(b).cloned().collect(),
                fill_rule: *ra,
            };
            let mut s = Shape::new(geometry, fill);
            s.opacity = opacity;
            Some(s)
        }
        _ => None,
    }
}

/// Drop shapes that paint (almost) nothing: area below `min_area`, hidden under a later
/// opaque axis-aligned rectangle, or an exact repeat of the shape before them.
pub fn prune(candidate: &VectorCandidate, min_area: f64) -> VectorCandidate {
    profiling::scope!("prune");
    let shapes = &candidate.shapes;
    let covers: Vec<Option<_>> = shapes
        .iter()
        .map(|s| if s.is_opaque() { s.geometry.as_axis_rect() } else { None })
        .collect();

    let mut kept: Vec<Shape> = Vec::with_capacity(shapes.len());
    for (i, shape) in shapes.iter().enumerate() {
        if shape.geometry.area() < min_area {
            continue;
        }
        let bounds = shape.geometry.bounds();
        let occluded = covers[i + 1..].iter().flatten().any(|cover| cover.contains(&bounds));
        if occluded {
            continue;
        }
        if kept.last() == Some(shape) {
            continue;
        }
        kept.push(shape.clone());
    }

    let mut out = candidate.clone();
    out.shapes = kept;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{FillRule, Subpath};
    use crate::geom::Point;

    fn square(x: f64, y: f64, s: f64, fill: Rgb) -> Shape {
        let pts = [Point::new(x, y), Point::new(x + s, y), Point::new(x + s, y + s), Point::new(x, y + s)];
        Shape::new(
            Geometry::Path { subpaths: vec![Subpath::polygon(&pts).unwrap()], fill_rule: FillRule::NonZero },
            fill,
        )
    }

    #[test]
    fn test_near_colours_merge_onto_larger_area() {
        let big = Rgb([200, 30, 30]);
        let near = Rgb([201, 30, 30]);
        let far = Rgb([30, 30, 200]);
        let c = VectorCandidate::new(
            32,
            32,
            vec![square(0.0, 0.0, 2.0, near), square(4.0, 4.0, 10.0, big), square(20.0, 20.0, 4.0, far)],
        );
        let merged = merge_colors(&c, 2.3);
        let fills: Vec<Rgb> = merged.shapes.iter().map(|s| s.fill).collect();
        // the first two now share a fill and are fused into one path
        assert_eq!(fills, vec![big, far]);
        match &merged.shapes[0].geometry {
            Geometry::Path { subpaths, .. } => assert_eq!(subpaths.len(), 2),
            other => panic!("expected a path, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_keeps_distinct_colours() {
        let c = VectorCandidate::new(
            8,
            8,
            vec![square(0.0, 0.0, 2.0, Rgb::BLACK), square(4.0, 4.0, 2.0, Rgb::WHITE)],
        );
        assert_eq!(merge_colors(&c, 2.3), c);
    }

    #[test]
    fn test_prune_drops_tiny_occluded_and_duplicates() {
        let cover = Shape::new(Geometry::Rect { x: 0.0, y: 0.0, width: 16.0, height: 16.0 }, Rgb::WHITE);
        let c = VectorCandidate::new(
            32,
            32,
            vec![
                square(2.0, 2.0, 4.0, Rgb::BLACK), // hidden by the rect
                cover,
                square(20.0, 20.0, 0.5, Rgb::BLACK), // 0.25 px^2
                square(20.0, 2.0, 4.0, Rgb::BLACK),
                square(20.0, 2.0, 4.0, Rgb::BLACK),
            ],
        );
        let pruned = prune(&c, 0.5);
        assert_eq!(pruned.shape_count(), 2);
        assert!(matches!(pruned.shapes[0].geometry, Geometry::Rect { .. }));
    }

    #[test]
    fn test_translucent_cover_does_not_hide() {
        let mut veil = Shape::new(Geometry::Rect { x: 0.0, y: 0.0, width: 16.0, height: 16.0 }, Rgb::WHITE);
        veil.opacity = 0.5;
        let c = VectorCandidate::new(16, 16, vec![square(2.0, 2.0, 4.0, Rgb::BLACK), veil]);
        assert_eq!(prune(&c, 0.5).shape_count(), 2);
    }
}
