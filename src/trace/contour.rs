// pixel-boundary contour extraction + corner-preserving smoothing

use crate::candidate::{Segment, Subpath};
use crate::geom::{self, Point};

/// Boundary loops of a binary mask, in pixel-corner coordinates. Every loop keeps the
/// mask on its right-hand side, so outer boundaries run clockwise on screen and holes
/// counter-clockwise; any fill rule reproduces the mask exactly.
pub(crate) fn mask_loops(mask: &[bool], width: u32, height: u32) -> Vec<Vec<Point>> {
    profiling::scope!("mask_loops");
    let (w, h) = (width as usize, height as usize);
    let stride = w + 1;
    let vid = |x: usize, y: usize| (y * stride + x) as u32;
    let inside = |x: isize, y: isize| {
        x >= 0 && y >= 0 && (x as usize) < w && (y as usize) < h && mask[y as usize * w + x as usize]
    };

    // a lattice vertex has at most two outgoing boundary edges (diagonal contact)
    let mut outs: Vec<[u32; 2]> = vec![[u32::MAX; 2]; stride * (h + 1)];
    let mut out_len: Vec<u8> = vec![0; stride * (h + 1)];
    let mut push = |from: u32, to: u32| {
        let f = from as usize;
        outs[f][out_len[f] as usize] = to;
        out_len[f] += 1;
    };

    for y in 0..h {
        for x in 0..w {
            if !mask[y * w + x] {
                continue;
            }
            let (xi, yi) = (x as isize, y as isize);
            if !inside(xi, yi - 1) {
                push(vid(x, y), vid(x + 1, y));
            }
            if !inside(xi + 1, yi) {
                push(vid(x + 1, y), vid(x + 1, y + 1));
            }
            if !inside(xi, yi + 1) {
                push(vid(x + 1, y + 1), vid(x, y + 1));
            }
            if !inside(xi - 1, yi) {
                push(vid(x, y + 1), vid(x, y));
            }
        }
    }

    let to_point = |v: u32| Point::new((v as usize % stride) as f64, (v as usize / stride) as f64);
    let mut loops = Vec::new();
    for start in 0..outs.len() {
        while out_len[start] > 0 {
            let mut ring = Vec::new();
            let mut at = start;
            loop {
                ring.push(to_point(at as u32));
                out_len[at] -= 1;
                at = outs[at][out_len[at] as usize] as usize;
                if at == start {
                    break;
                }
                if out_len[at] == 0 {
                    // unbalanced lattice; cannot happen for a mask
                    break;
                }
            }
            loops.push(geom::remove_collinear(&ring));
        }
    }
    loops
}

/// Turn a polygonal loop into a subpath. vertices whose turning angle is below
/// `corner_threshold` degrees are rounded with a cubic through the midpoints of their
/// two edges; sharper corners stay as line joins.
pub(crate) fn smooth_loop(pts: &[Point], corner_threshold: f64) -> Option<Subpath> {
    let n = pts.len();
    if n < 3 {
        return None;
    }
    let smooth: Vec<bool> = (0..n)
        .map(|i| geom::turn_angle(pts[(i + n - 1) % n], pts[i], pts[(i + 1) % n]) < corner_threshold)
        .collect();
    if !smooth.iter().any(|&s| s) {
        return Subpath::polygon(pts);
    }

    // start on the middle of the closing edge so every vertex is handled the same way
    let start = pts[n - 1].midpoint(pts[0]);
    let mut segments = Vec::with_capacity(n * 2);
    let mut current = start;
    for i in 0..n {
        let v = pts[i];
        if smooth[i] {
            let m_in = pts[(i + n - 1) % n].midpoint(v);
            let m_out = v.midpoint(pts[(i + 1) % n]);
            if current != m_in {
                segments.push(Segment::Line(m_in));
            }
            // quadratic (m_in, v, m_out) raised to a cubic
            let c1 = m_in.lerp(v, 2.0 / 3.0);
            let c2 = m_out.lerp(v, 2.0 / 3.0);
            segments.push(Segment::Cubic(c1, c2, m_out));
            current = m_out;
        } else {
            segments.push(Segment::Line(v));
            current = v;
        }
    }
    Some(Subpath { start, segments })
}
