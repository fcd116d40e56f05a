use std::fmt::Write;

use crate::candidate::{FillRule, Geometry, Segment, Shape, Subpath, VectorCandidate};
use crate::geom::Point;

/// format with at most `precision` decimals, trailing zeros trimmed
pub fn fmt_num(v: f64, precision: u8) -> String {
    let mut s = format!("{:.*}", precision as usize, v);
    if s.contains('.') {
        let trimmed = s.trim_end_matches('0').trim_end_matches('.').len();
        s.truncate(trimmed);
    }
    if s == "-0" {
        s = "0".to_owned();
    }
    s
}

fn push_point(d: &mut String, p: Point, precision: u8) {
    // y can reuse a leading '-' as the separator, everything else needs a space
    let y = fmt_num(p.y, precision);
    let _ = write!(d, "{}", fmt_num(p.x, precision));
    if !y.starts_with('-') {
        d.push(' ');
    }
    d.push_str(&y);
}

pub fn path_data(subpaths: &[Subpath], precision: u8) -> String {
    let mut d = String::new();
    for sub in subpaths {
        d.push('M');
        push_point(&mut d, sub.start, precision);
        for seg in &sub.segments {
            match *seg {
                Segment::Line(p) => {
                    d.push('L');
                    push_point(&mut d, p, precision);
                }
                Segment::Cubic(c1, c2, p) => {
                    d.push('C');
                    push_point(&mut d, c1, precision);
                    d.push(' ');
                    push_point(&mut d, c2, precision);
                    d.push(' ');
                    push_point(&mut d, p, precision);
                }
            }
        }
        d.push('Z');
    }
    d
}

fn write_shape(out: &mut String, shape: &Shape, precision: u8) {
    let n = |v: f64| fmt_num(v, precision);
    let _ = match &shape.geometry {
        Geometry::Path { subpaths, fill_rule } => {
            let rule = match fill_rule {
                FillRule::EvenOdd => " fill-rule=\"evenodd\"",
                FillRule::NonZero => "",
            };
            write!(out, "<path d=\"{}\" fill=\"{}\"{rule}", path_data(subpaths, precision), shape.fill)
        }
        Geometry::Rect { x, y, width, height } => {
            out.push_str("<rect");
            if *x != 0.0 {
                let _ = write!(out, " x=\"{}\"", n(*x));
            }
            if *y != 0.0 {
                let _ = write!(out, " y=\"{}\"", n(*y));
            }
            write!(out, " width=\"{}\" height=\"{}\" fill=\"{}\"", n(*width), n(*height), shape.fill)
        }
        Geometry::Circle { cx, cy, r } => {
            write!(out, "<circle cx=\"{}\" cy=\"{}\" r=\"{}\" fill=\"{}\"", n(*cx), n(*cy), n(*r), shape.fill)
        }
        Geometry::Ellipse { cx, cy, rx, ry } => write!(
            out,
            "<ellipse cx=\"{}\" cy=\"{}\" rx=\"{}\" ry=\"{}\" fill=\"{}\"",
            n(*cx),
            n(*cy),
            n(*rx),
            n(*ry),
            shape.fill
        ),
    };
    if !shape.is_opaque() {
        let _ = write!(out, " opacity=\"{}\"", fmt_num(shape.opacity as f64, 3));
    }
    out.push_str("/>");
}

/// Serialize a candidate as a standalone SVG document. Output is a pure function of
/// the candidate, so byte sizes are comparable across compaction steps.
pub fn write_svg(candidate: &VectorCandidate) -> String {
    profiling::scope!("write_svg");
    let (w, h) = (candidate.width, candidate.height);
    let mut out = String::with_capacity(128 + candidate.point_count() * 12);
    let _ = write!(
        out,
        "<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 {w} {h}\" width=\"{w}\" height=\"{h}\">"
    );
    if let Some(bg) = candidate.background {
        let _ = write!(out, "<rect width=\"{w}\" height=\"{h}\" fill=\"{bg}\"/>");
    }
    for shape in &candidate.shapes {
        write_shape(&mut out, shape, candidate.precision);
    }
    out.push_str("</svg>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Rgb;

    #[test]
    fn test_fmt_num_trims() {
        assert_eq!(fmt_num(1.5, 3), "1.5");
        assert_eq!(fmt_num(2.0, 3), "2");
        assert_eq!(fmt_num(-0.0001, 2), "0");
        assert_eq!(fmt_num(12.3456, 0), "12");
        assert_eq!(fmt_num(-3.5, 1), "-3.5");
    }

    #[test]
    fn test_document_layout() {
        let tri = Subpath::polygon(&[Point::new(0.0, 0.0), Point::new(4.0, 0.0), Point::new(0.0, 4.5)]).unwrap();
        let mut c = VectorCandidate::new(
            8,
            6,
            vec![
                Shape::new(Geometry::Rect { x: 0.0, y: 0.0, width: 8.0, height: 6.0 }, Rgb::WHITE),
                Shape::new(Geometry::Path { subpaths: vec![tri], fill_rule: FillRule::EvenOdd }, Rgb([255, 0, 0])),
            ],
        )
        .with_background(Some(Rgb::BLACK));
        c.shapes[1].opacity = 0.5;
        let svg = c.to_svg();
        assert!(svg.starts_with("<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 8 6\" width=\"8\" height=\"6\">"));
        assert!(svg.contains("<rect width=\"8\" height=\"6\" fill=\"#000\"/>"));
        assert!(svg.contains("<rect width=\"8\" height=\"6\" fill=\"#fff\"/>"));
        assert!(svg.contains("<path d=\"M0 0L4 0L0 4.5Z\" fill=\"#f00\" fill-rule=\"evenodd\" opacity=\"0.5\"/>"));
        assert!(svg.ends_with("</svg>"));
        assert_eq!(c.byte_size(), svg.len());
    }

    #[test]
    fn test_negative_y_shares_separator() {
        let mut d = String::new();
        push_point(&mut d, Point::new(1.0, -2.0), 2);
        assert_eq!(d, "1-2");
    }
}
