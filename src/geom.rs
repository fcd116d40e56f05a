// geometry helpers shared by the tracer, the renderer and the compaction passes
//
// coordinates are pixel-space f64 with y pointing down, so a clockwise loop on screen
// has positive signed area.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn midpoint(self, other: Point) -> Point {
        Point::new((self.x + other.x) * 0.5, (self.y + other.y) * 0.5)
    }

    /// self + (other - self) * t
    #[inline]
    pub fn lerp(self, other: Point, t: f64) -> Point {
        Point::new(self.x + (other.x - self.x) * t, self.y + (other.y - self.y) * t)
    }

    #[inline]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// axis-aligned bounds, inclusive of every vertex and control point
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub const EMPTY: Bounds = Bounds {
        min_x: f64::INFINITY,
        min_y: f64::INFINITY,
        max_x: f64::NEG_INFINITY,
        max_y: f64::NEG_INFINITY,
    };

    pub fn from_points<'a>(pts: impl IntoIterator<Item = &'a Point>) -> Bounds {
        pts.into_iter().fold(Bounds::EMPTY, |b, p| b.include(*p))
    }

    #[inline]
    pub fn include(self, p: Point) -> Bounds {
        Bounds {
            min_x: self.min_x.min(p.x),
            min_y: self.min_y.min(p.y),
            max_x: self.max_x.max(p.x),
            max_y: self.max_y.max(p.y),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    /// true if `other` lies fully inside self (shared edges count)
    pub fn contains(&self, other: &Bounds) -> bool {
        !other.is_empty()
            && self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }
}

/// compute signed area of a polygon using the shoelace formula.
/// positive for clockwise on screen (y down), negative for counter-clockwise.
pub fn signed_area(pts: &[Point]) -> f64 {
    if pts.len() < 3 {
        return 0.0;
    }

    let mut area = 0.0;
    for i in 0..pts.len() {
        let j = (i + 1) % pts.len();
        area += pts[i].x * pts[j].y;
        area -= pts[j].x * pts[i].y;
    }
    area * 0.5
}

/// absolute area in square pixels
#[inline]
pub fn polygon_area(pts: &[Point]) -> f64 {
    signed_area(pts).abs()
}

/// round to `precision` decimal digits
#[inline]
pub fn round_to(v: f64, precision: u8) -> f64 {
    let scale = 10f64.powi(precision as i32);
    let r = (v * scale).round() / scale;
    // keep "-0" out of the svg
    if r == 0.0 { 0.0 } else { r }
}

/// turning angle at `b` in degrees: 0 = straight, 180 = full reversal
pub fn turn_angle(a: Point, b: Point, c: Point) -> f64 {
    let (ux, uy) = (b.x - a.x, b.y - a.y);
    let (vx, vy) = (c.x - b.x, c.y - b.y);
    let lu = ux.hypot(uy);
    let lv = vx.hypot(vy);
    if lu == 0.0 || lv == 0.0 {
        return 0.0;
    }
    let cos = ((ux * vx + uy * vy) / (lu * lv)).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

fn distance_to_segment(p: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len2 = dx * dx + dy * dy;
    if len2 == 0.0 {
        return (p.x - a.x).hypot(p.y - a.y);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    let proj = a.lerp(b, t);
    (p.x - proj.x).hypot(p.y - proj.y)
}

fn douglas_peucker_open(pts: &[Point], epsilon: f64, keep: &mut [bool]) {
    // explicit stack instead of recursion: boundary loops of large regions get long
    let mut stack = vec![(0usize, pts.len() - 1)];
    while let Some((first, last)) = stack.pop() {
        if last <= first + 1 {
            continue;
        }
        let (mut worst, mut worst_d) = (first, 0.0);
        for i in first + 1..last {
            let d = distance_to_segment(pts[i], pts[first], pts[last]);
            if d > worst_d {
                worst = i;
                worst_d = d;
            }
        }
        if worst_d > epsilon {
            keep[worst] = true;
            stack.push((first, worst));
            stack.push((worst, last));
        }
    }
}

/// Douglas-Peucker on a closed loop. the loop is split at vertex 0 and at the vertex
/// farthest from it; returns the input when fewer than 3 vertices would survive.
pub fn simplify_loop(pts: &[Point], epsilon: f64) -> Vec<Point> {
    profiling::scope!("simplify_loop");
    if epsilon <= 0.0 || pts.len() <= 3 {
        return pts.to_vec();
    }

    let far = (1..pts.len())
        .max_by(|&a, &b| {
            let da = (pts[a].x - pts[0].x).hypot(pts[a].y - pts[0].y);
            let db = (pts[b].x - pts[0].x).hypot(pts[b].y - pts[0].y);
            da.total_cmp(&db).then(b.cmp(&a))
        })
        .unwrap_or(1);

    // closed ring as an open polyline: 0..=far and far..=n (n wraps to 0)
    let mut ring = pts.to_vec();
    ring.push(pts[0]);
    let mut keep = vec![false; ring.len()];
    keep[0] = true;
    keep[far] = true;
    keep[ring.len() - 1] = true;
    douglas_peucker_open(&ring[..=far], epsilon, &mut keep[..=far]);
    douglas_peucker_open(&ring[far..], epsilon, &mut keep[far..]);

    let out: Vec<Point> = ring[..ring.len() - 1]
        .iter()
        .zip(&keep)
        .filter(|&(_, &k)| k)
        .map(|(p, _)| *p)
        .collect();
    if out.len() < 3 {
        pts.to_vec()
    } else {
        out
    }
}

/// drop vertices that sit on a straight line between their neighbours
pub fn remove_collinear(pts: &[Point]) -> Vec<Point> {
    let n = pts.len();
    if n < 4 {
        return pts.to_vec();
    }
    let out: Vec<Point> = (0..n)
        .filter(|&i| {
            let a = pts[(i + n - 1) % n];
            let b = pts[i];
            let c = pts[(i + 1) % n];
            let cross = (b.x - a.x) * (c.y - b.y) - (b.y - a.y) * (c.x - b.x);
            cross.abs() > 1e-9
        })
        .map(|i| pts[i])
        .collect();
    if out.len() < 3 {
        pts.to_vec()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Point> {
        vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(1.0, 1.0), Point::new(0.0, 1.0)]
    }

    #[test]
    fn test_signed_area_clockwise_on_screen() {
        // (0,0) -> (1,0) -> (1,1) runs clockwise with y pointing down
        assert!(signed_area(&square()) > 0.0);
        let mut rev = square();
        rev.reverse();
        assert!(signed_area(&rev) < 0.0);
        assert_eq!(polygon_area(&rev), 1.0);
    }

    #[test]
    fn test_collinear_vertices_removed() {
        let pts = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(2.0, 2.0),
            Point::new(0.0, 2.0),
            Point::new(0.0, 1.0),
        ];
        assert_eq!(remove_collinear(&pts).len(), 4);
    }

    #[test]
    fn test_simplify_flattens_staircase() {
        // a 1px staircase along the diagonal of a 4x4 triangle
        let pts = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(2.0, 1.0),
            Point::new(2.0, 2.0),
            Point::new(3.0, 2.0),
            Point::new(3.0, 3.0),
            Point::new(4.0, 3.0),
            Point::new(4.0, 4.0),
            Point::new(0.0, 4.0),
        ];
        let simple = simplify_loop(&pts, 1.0);
        assert!(simple.len() < pts.len());
        assert!(simple.len() >= 3);
        assert_eq!(simplify_loop(&pts, 0.0), pts);
    }

    #[test]
    fn test_round_to_clears_negative_zero() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(-0.0001, 2).to_bits(), 0.0f64.to_bits());
    }

    #[test]
    fn test_turn_angle() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(1.0, 0.0);
        assert!(turn_angle(a, b, Point::new(2.0, 0.0)).abs() < 1e-9);
        assert!((turn_angle(a, b, Point::new(1.0, 1.0)) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_bounds_contains() {
        let outer = Bounds::from_points(&square());
        let inner = Bounds { min_x: 0.25, min_y: 0.25, max_x: 0.75, max_y: 1.0 };
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(!outer.contains(&Bounds::EMPTY));
    }
}
