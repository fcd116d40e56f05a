use std::sync::Arc;

use tiny_skia as sk;

use crate::candidate::{FillRule, Geometry, Segment, Shape, VectorCandidate};
use crate::error::RenderFailure;
use crate::raster::RasterImage;

/// tiny-skia rasterizer for vector candidates
#[derive(Clone, Copy, Debug)]
pub struct CpuRenderer {
    /// off by default: a pixel-boundary trace then re-renders pixel-exact
    pub anti_alias: bool,
}

impl Default for CpuRenderer {
    fn default() -> Self {
        Self { anti_alias: false }
    }
}

impl CpuRenderer {
    pub fn new(anti_alias: bool) -> Self {
        Self { anti_alias }
    }

    /// Render to an unpremultiplied RGBA raster of (width, height). the candidate's
    /// view box is stretched to fit. uncovered pixels stay transparent.
    pub fn render(&self, candidate: &VectorCandidate, width: u32, height: u32) -> Result<RasterImage, RenderFailure> {
        profiling::scope!("CpuRenderer::render");
        if candidate.width == 0 || candidate.height == 0 {
            return Err(RenderFailure::Malformed("zero-sized view box".into()));
        }
        let mut pix = sk::Pixmap::new(width, height)
            .ok_or_else(|| RenderFailure::Malformed(format!("cannot allocate {width}x{height} raster")))?;

        if let Some(bg) = candidate.background {
            let [r, g, b] = bg.0;
            pix.fill(sk::Color::from_rgba8(r, g, b, 255));
        }

        let transform = if (width, height) == (candidate.width, candidate.height) {
            sk::Transform::identity()
        } else {
            sk::Transform::from_scale(
                width as f32 / candidate.width as f32,
                height as f32 / candidate.height as f32,
            )
        };

        for (i, shape) in candidate.shapes.iter().enumerate() {
            if !shape.geometry.is_finite() {
                return Err(RenderFailure::Malformed(format!("shape {i} has non-finite coordinates")));
            }
            if !(0.0..=1.0).contains(&shape.opacity) {
                return Err(RenderFailure::Malformed(format!("shape {i} opacity {} outside 0..1", shape.opacity)));
            }
            self.draw_shape(&mut pix, shape, transform);
        }

        let mut out = Vec::with_capacity(width as usize * height as usize * 4);
        for p in pix.pixels() {
            let c = p.demultiply();
            out.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
        }
        RasterImage::from_rgba(width, height, out)
            .ok_or_else(|| RenderFailure::Malformed("raster size mismatch".into()))
    }

    fn draw_shape(&self, pix: &mut sk::Pixmap, shape: &Shape, transform: sk::Transform) {
        profiling::scope!("draw_shape");
        // use cached path with lock-free reads after the first render
        let path = shape.cached_path.get_or_init(|| build_path(&shape.geometry).map(Arc::new));
        let Some(path) = path else {
            return; // degenerate: nothing to paint
        };

        let [r, g, b] = shape.fill.0;
        let a = (shape.opacity * 255.0).round() as u8;
        let mut paint = sk::Paint::default();
        paint.set_color_rgba8(r, g, b, a);
        paint.anti_alias = self.anti_alias;

        let rule = match &shape.geometry {
            Geometry::Path { fill_rule: FillRule::EvenOdd, .. } => sk::FillRule::EvenOdd,
            _ => sk::FillRule::Winding,
        };
        pix.fill_path(path, &paint, rule, transform, None);
    }
}

/// None for geometry that covers no area (tiny-skia refuses empty paths)
fn build_path(geometry: &Geometry) -> Option<sk::Path> {
    match *geometry {
        Geometry::Path { ref subpaths, .. } => {
            let mut pb = sk::PathBuilder::new();
            for sub in subpaths {
                pb.move_to(sub.start.x as f32, sub.start.y as f32);
                for seg in &sub.segments {
                    match *seg {
                        Segment::Line(p) => pb.line_to(p.x as f32, p.y as f32),
                        Segment::Cubic(c1, c2, p) => pb.cubic_to(
                            c1.x as f32,
                            c1.y as f32,
                            c2.x as f32,
                            c2.y as f32,
                            p.x as f32,
                            p.y as f32,
                        ),
                    }
                }
                pb.close();
            }
            pb.finish()
        }
        Geometry::Rect { x, y, width, height } => {
            sk::Rect::from_xywh(x as f32, y as f32, width as f32, height as f32).map(sk::PathBuilder::from_rect)
        }
        Geometry::Circle { cx, cy, r } => sk::PathBuilder::from_circle(cx as f32, cy as f32, r as f32),
        Geometry::Ellipse { cx, cy, rx, ry } => {
            sk::Rect::from_xywh((cx - rx) as f32, (cy - ry) as f32, (2.0 * rx) as f32, (2.0 * ry) as f32)
                .and_then(sk::PathBuilder::from_oval)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Rgb, Subpath};
    use crate::geom::Point;

    fn rect_candidate() -> VectorCandidate {
        VectorCandidate::new(
            4,
            4,
            vec![Shape::new(Geometry::Rect { x: 1.0, y: 1.0, width: 2.0, height: 2.0 }, Rgb([255, 0, 0]))],
        )
    }

    #[test]
    fn test_integer_rect_renders_pixel_exact() {
        let img = CpuRenderer::default().render(&rect_candidate(), 4, 4).unwrap();
        assert_eq!(img.pixel(1, 1), [255, 0, 0, 255]);
        assert_eq!(img.pixel(2, 2), [255, 0, 0, 255]);
        assert_eq!(img.pixel(0, 0), [0, 0, 0, 0]);
        assert_eq!(img.pixel(3, 3), [0, 0, 0, 0]);
    }

    #[test]
    fn test_background_fills_canvas() {
        let c = rect_candidate().with_background(Some(Rgb::WHITE));
        let img = CpuRenderer::default().render(&c, 4, 4).unwrap();
        assert_eq!(img.pixel(0, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn test_scaled_render() {
        let img = CpuRenderer::default().render(&rect_candidate(), 8, 8).unwrap();
        assert_eq!(img.dimensions(), (8, 8));
        assert_eq!(img.pixel(3, 3), [255, 0, 0, 255]);
        assert_eq!(img.pixel(1, 1)[3], 0);
    }

    #[test]
    fn test_even_odd_leaves_hole() {
        let outer = Subpath::polygon(&[Point::new(0.0, 0.0), Point::new(4.0, 0.0), Point::new(4.0, 4.0), Point::new(0.0, 4.0)]);
        let inner = Subpath::polygon(&[Point::new(1.0, 1.0), Point::new(3.0, 1.0), Point::new(3.0, 3.0), Point::new(1.0, 3.0)]);
        let c = VectorCandidate::new(
            4,
            4,
            vec![Shape::new(
                Geometry::Path { subpaths: vec![outer.unwrap(), inner.unwrap()], fill_rule: FillRule::EvenOdd },
                Rgb::BLACK,
            )],
        );
        let img = CpuRenderer::default().render(&c, 4, 4).unwrap();
        assert_eq!(img.pixel(0, 0), [0, 0, 0, 255]);
        assert_eq!(img.pixel(1, 1)[3], 0);
    }

    #[test]
    fn test_non_finite_geometry_is_malformed() {
        let c = VectorCandidate::new(
            4,
            4,
            vec![Shape::new(Geometry::Circle { cx: f64::NAN, cy: 1.0, r: 1.0 }, Rgb::BLACK)],
        );
        assert!(matches!(CpuRenderer::default().render(&c, 4, 4), Err(RenderFailure::Malformed(_))));
    }

    #[test]
    fn test_degenerate_shape_is_skipped() {
        let c = VectorCandidate::new(
            4,
            4,
            vec![Shape::new(Geometry::Rect { x: 0.0, y: 0.0, width: 0.0, height: 2.0 }, Rgb::BLACK)],
        );
        let img = CpuRenderer::default().render(&c, 4, 4).unwrap();
        assert!(img.as_raw().iter().all(|&b| b == 0));
    }
}
