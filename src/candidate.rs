use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::geom::{self, Bounds, Point};
use crate::params::ParameterSet;
use crate::raster::RasterImage;

/// opaque sRGB fill colour
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const WHITE: Rgb = Rgb([255, 255, 255]);
    pub const BLACK: Rgb = Rgb([0, 0, 0]);

    /// `#rrggbb`, or the short `#rgb` form when every channel repeats its nibble
    pub fn to_hex(self) -> String {
        let [r, g, b] = self.0;
        let short = |c: u8| c >> 4 == c & 0x0f;
        if short(r) && short(g) && short(b) {
            format!("#{:x}{:x}{:x}", r & 0x0f, g & 0x0f, b & 0x0f)
        } else {
            format!("#{r:02x}{g:02x}{b:02x}")
        }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// one drawing command; the start point is the end of the previous segment
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Segment {
    Line(Point),
    Cubic(Point, Point, Point),
}

impl Segment {
    pub fn end(&self) -> Point {
        match *self {
            Segment::Line(p) => p,
            Segment::Cubic(_, _, p) => p,
        }
    }

    fn map(&self, f: &impl Fn(f64) -> f64) -> Segment {
        let m = |p: Point| Point::new(f(p.x), f(p.y));
        match *self {
            Segment::Line(p) => Segment::Line(m(p)),
            Segment::Cubic(a, b, c) => Segment::Cubic(m(a), m(b), m(c)),
        }
    }

    fn points(&self) -> impl Iterator<Item = Point> {
        let pts: [Option<Point>; 3] = match *self {
            Segment::Line(p) => [Some(p), None, None],
            Segment::Cubic(a, b, c) => [Some(a), Some(b), Some(c)],
        };
        pts.into_iter().flatten()
    }
}

/// closed contour
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subpath {
    pub start: Point,
    pub segments: Vec<Segment>,
}

impl Subpath {
    pub fn polygon(points: &[Point]) -> Option<Subpath> {
        let (&start, rest) = points.split_first()?;
        Some(Subpath { start, segments: rest.iter().map(|&p| Segment::Line(p)).collect() })
    }

    /// on-curve vertices; control points are skipped
    pub fn vertices(&self) -> Vec<Point> {
        std::iter::once(self.start).chain(self.segments.iter().map(Segment::end)).collect()
    }

    /// every coordinate the subpath mentions, control points included
    pub fn all_points(&self) -> impl Iterator<Item = Point> + '_ {
        std::iter::once(self.start).chain(self.segments.iter().flat_map(Segment::points))
    }

    pub fn signed_area(&self) -> f64 {
        geom::signed_area(&self.vertices())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FillRule {
    #[default]
    NonZero,
    EvenOdd,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Path { subpaths: Vec<Subpath>, fill_rule: FillRule },
    Rect { x: f64, y: f64, width: f64, height: f64 },
    Circle { cx: f64, cy: f64, r: f64 },
    Ellipse { cx: f64, cy: f64, rx: f64, ry: f64 },
}

impl Geometry {
    /// covered area in square pixels. paths use the net shoelace area of their
    /// on-curve vertices, which is exact for the boundary loops the tracer emits.
    pub fn area(&self) -> f64 {
        match self {
            Geometry::Path { subpaths, .. } => subpaths.iter().map(Subpath::signed_area).sum::<f64>().abs(),
            Geometry::Rect { width, height, .. } => (width * height).abs(),
            Geometry::Circle { r, .. } => std::f64::consts::PI * r * r,
            Geometry::Ellipse { rx, ry, .. } => std::f64::consts::PI * (rx * ry).abs(),
        }
    }

    pub fn bounds(&self) -> Bounds {
        match self {
            Geometry::Path { subpaths, .. } => subpaths
                .iter()
                .flat_map(Subpath::all_points)
                .fold(Bounds::EMPTY, Bounds::include),
            Geometry::Rect { x, y, width, height } => Bounds {
                min_x: *x,
                min_y: *y,
                max_x: x + width,
                max_y: y + height,
            },
            Geometry::Circle { cx, cy, r } => Bounds { min_x: cx - r, min_y: cy - r, max_x: cx + r, max_y: cy + r },
            Geometry::Ellipse { cx, cy, rx, ry } => Bounds {
                min_x: cx - rx,
                min_y: cy - ry,
                max_x: cx + rx,
                max_y: cy + ry,
            },
        }
    }

    /// the region this geometry paints if it is exactly an axis-aligned rectangle
    pub fn as_axis_rect(&self) -> Option<Bounds> {
        match self {
            Geometry::Rect { .. } => Some(self.bounds()),
            Geometry::Path { subpaths, .. } => {
                let [sub] = subpaths.as_slice() else {
                    return None;
                };
                if sub.segments.iter().any(|s| matches!(s, Segment::Cubic(..))) {
                    return None;
                }
                let mut v = sub.vertices();
                if v.len() == 5 && v[0] == v[4] {
                    v.pop();
                }
                if v.len() != 4 {
                    return None;
                }
                let axis = (0..4).all(|i| {
                    let (a, b) = (v[i], v[(i + 1) % 4]);
                    a.x == b.x || a.y == b.y
                });
                axis.then(|| Bounds::from_points(&v))
            }
            _ => None,
        }
    }

    /// copy with every coordinate and length passed through `f`
    pub fn map_coords(&self, f: impl Fn(f64) -> f64) -> Geometry {
        match self {
            Geometry::Path { subpaths, fill_rule } => Geometry::Path {
                subpaths: subpaths
                    .iter()
                    .map(|s| Subpath {
                        start: Point::new(f(s.start.x), f(s.start.y)),
                        segments: s.segments.iter().map(|seg| seg.map(&f)).collect(),
                    })
                    .collect(),
                fill_rule: *fill_rule,
            },
            Geometry::Rect { x, y, width, height } => Geometry::Rect {
                x: f(*x),
                y: f(*y),
                width: f(*width),
                height: f(*height),
            },
            Geometry::Circle { cx, cy, r } => Geometry::Circle { cx: f(*cx), cy: f(*cy), r: f(*r) },
            Geometry::Ellipse { cx, cy, rx, ry } => Geometry::Ellipse {
                cx: f(*cx),
                cy: f(*cy),
                rx: f(*rx),
                ry: f(*ry),
            },
        }
    }

    /// number of on-curve nodes (primitives count as one)
    pub fn point_count(&self) -> usize {
        match self {
            Geometry::Path { subpaths, .. } => subpaths.iter().map(|s| 1 + s.segments.len()).sum(),
            _ => 1,
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            Geometry::Path { subpaths, .. } => subpaths.iter().flat_map(Subpath::all_points).all(Point::is_finite),
            Geometry::Rect { x, y, width, height } => [x, y, width, height].iter().all(|v| v.is_finite()),
            Geometry::Circle { cx, cy, r } => [cx, cy, r].iter().all(|v| v.is_finite()),
            Geometry::Ellipse { cx, cy, rx, ry } => [cx, cy, rx, ry].iter().all(|v| v.is_finite()),
        }
    }
}

/// a filled shape. caches its tiny-skia path (None = nothing to draw)
#[derive(Debug, Serialize, Deserialize)]
pub struct Shape {
    pub geometry: Geometry,
    pub fill: Rgb,
    /// 0..1
    pub opacity: f32,

    #[serde(skip)]
    pub cached_path: OnceLock<Option<Arc<tiny_skia::Path>>>,
}

// this way stale paths won't be copied if the shape is cloned and then edited.
impl Clone for Shape {
    fn clone(&self) -> Self {
        Self {
            geometry: self.geometry.clone(),
            fill: self.fill,
            opacity: self.opacity,
            cached_path: OnceLock::new(),
        }
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.geometry == other.geometry && self.fill == other.fill && self.opacity == other.opacity
    }
}

impl Shape {
    pub fn new(geometry: Geometry, fill: Rgb) -> Self {
        Self { geometry, fill, opacity: 1.0, cached_path: OnceLock::new() }
    }

    pub fn is_opaque(&self) -> bool {
        self.opacity >= 1.0
    }
}

/// Ordered shapes plus provenance. Never mutated once handed out: compaction passes
/// build new candidates.
#[derive(Debug, Serialize, Deserialize)]
pub struct VectorCandidate {
    pub width: u32,
    pub height: u32,
    pub shapes: Vec<Shape>,
    pub background: Option<Rgb>,
    /// decimal digits written for every coordinate
    pub precision: u8,
    /// the parameter set that produced this candidate
    pub params: Option<ParameterSet>,

    #[serde(skip)]
    preview: OnceLock<RasterImage>,
}

// a copy is usually about to be transformed, so it never inherits the preview
impl Clone for VectorCandidate {
    fn clone(&self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            shapes: self.shapes.clone(),
            background: self.background,
            precision: self.precision,
            params: self.params.clone(),
            preview: OnceLock::new(),
        }
    }
}

impl PartialEq for VectorCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.shapes == other.shapes
            && self.background == other.background
            && self.precision == other.precision
            && self.params == other.params
    }
}

impl VectorCandidate {
    pub const DEFAULT_PRECISION: u8 = 3;

    pub fn new(width: u32, height: u32, shapes: Vec<Shape>) -> Self {
        Self {
            width,
            height,
            shapes,
            background: None,
            precision: Self::DEFAULT_PRECISION,
            params: None,
            preview: OnceLock::new(),
        }
    }

    pub fn with_background(mut self, background: Option<Rgb>) -> Self {
        self.background = background;
        self
    }

    pub fn with_params(mut self, params: ParameterSet) -> Self {
        self.params = Some(params);
        self
    }

    /// copy with every coordinate rounded to `precision` digits, so what gets rendered
    /// is exactly what the svg writer prints
    pub fn with_precision(&self, precision: u8) -> Self {
        profiling::scope!("VectorCandidate::with_precision");
        let shapes = self
            .shapes
            .iter()
            .map(|s| Shape {
                geometry: s.geometry.map_coords(|v| geom::round_to(v, precision)),
                fill: s.fill,
                opacity: s.opacity,
                cached_path: OnceLock::new(),
            })
            .collect();
        Self { shapes, precision, ..self.clone() }
    }

    /// cached preview, if one has been rendered
    pub fn preview(&self) -> Option<&RasterImage> {
        self.preview.get()
    }

    /// first writer wins; returns false if a preview was already cached
    pub fn set_preview(&self, preview: RasterImage) -> bool {
        self.preview.set(preview).is_ok()
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    /// svg elements written, background rect included
    pub fn element_count(&self) -> usize {
        self.shapes.len() + usize::from(self.background.is_some())
    }

    pub fn path_count(&self) -> usize {
        self.shapes.iter().filter(|s| matches!(s.geometry, Geometry::Path { .. })).count()
    }

    pub fn point_count(&self) -> usize {
        self.shapes.iter().map(|s| s.geometry.point_count()).sum()
    }

    pub fn to_svg(&self) -> String {
        crate::svg::write_svg(self)
    }

    pub fn byte_size(&self) -> usize {
        self.to_svg().len()
    }
}
