use std::sync::Arc;

use image::{imageops, GrayImage, ImageBuffer, Luma, Rgb, RgbImage, Rgba, RgbaImage};

/// Immutable RGBA8 raster. Cloning shares the pixel buffer; every transformation
/// returns a new instance.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterImage {
    pixels: Arc<RgbaImage>,
}

/// the matte used whenever alpha has to be flattened away (metrics, luminance)
pub const MATTE: [u8; 3] = [255, 255, 255];

impl RasterImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self { pixels: Arc::new(pixels) }
    }

    /// wrap a raw unpremultiplied RGBA buffer; None if the length doesn't match.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        ImageBuffer::from_raw(width, height, data).map(Self::new)
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [u8; 4]) -> Self {
        Self::new(RgbaImage::from_fn(width, height, |x, y| Rgba(f(x, y))))
    }

    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::new(RgbaImage::from_pixel(width, height, Rgba(rgba)))
    }

    /// decode PNG/JPEG bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        profiling::scope!("RasterImage::decode");
        Ok(Self::new(image::load_from_memory(bytes)?.to_rgba8()))
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    #[inline]
    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.pixels.get_pixel(x, y).0
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn as_raw(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    pub fn has_transparency(&self) -> bool {
        self.pixels.pixels().any(|p| p.0[3] < 255)
    }

    /// resample to (width, height) with the fixed bilinear policy.
    /// returns a cheap clone when the size already matches.
    pub fn resized(&self, width: u32, height: u32) -> Self {
        profiling::scope!("RasterImage::resized");
        if self.dimensions() == (width, height) {
            return self.clone();
        }
        Self::new(imageops::resize(
            &*self.pixels,
            width,
            height,
            imageops::FilterType::Triangle,
        ))
    }

    /// flatten alpha over the white matte
    pub fn to_rgb(&self) -> RgbImage {
        profiling::scope!("RasterImage::to_rgb");
        let mut out = RgbImage::new(self.width(), self.height());
        for (dst, src) in out.pixels_mut().zip(self.pixels.pixels()) {
            *dst = Rgb(composite_over(src.0, MATTE));
        }
        out
    }

    /// BT.601 luminance of the flattened image (same weights as PIL / OpenCV gray)
    pub fn to_luma(&self) -> GrayImage {
        luma_of(&self.to_rgb())
    }
}

impl From<RgbaImage> for RasterImage {
    fn from(pixels: RgbaImage) -> Self {
        Self::new(pixels)
    }
}

/// alpha-composite one unpremultiplied pixel over an opaque matte colour.
#[inline]
pub fn composite_over(px: [u8; 4], matte: [u8; 3]) -> [u8; 3] {
    let a = px[3] as u32;
    if a == 255 {
        return [px[0], px[1], px[2]];
    }
    let inv = 255 - a;
    // (x * a + m * (255 - a) + 127) / 255 is a rounded divide-by-255
    let mix = |c: u8, m: u8| ((c as u32 * a + m as u32 * inv + 127) / 255) as u8;
    [mix(px[0], matte[0]), mix(px[1], matte[1]), mix(px[2], matte[2])]
}

#[inline]
pub fn luma_601(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114 + 500) / 1000) as u8
}

pub fn luma_of(rgb: &RgbImage) -> GrayImage {
    let mut out = GrayImage::new(rgb.width(), rgb.height());
    for (dst, src) in out.pixels_mut().zip(rgb.pixels()) {
        *dst = Luma([luma_601(src.0[0], src.0[1], src.0[2])]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transparent_pixels_flatten_to_white() {
        let img = RasterImage::filled(2, 2, [0, 0, 0, 0]);
        assert!(img.to_rgb().pixels().all(|p| p.0 == [255, 255, 255]));
        assert!(img.has_transparency());
    }

    #[test]
    fn test_half_alpha_blends_with_matte() {
        let [r, g, b] = composite_over([0, 0, 0, 128], MATTE);
        assert_eq!((r, g, b), (127, 127, 127));
    }

    #[test]
    fn test_luma_matches_601_weights() {
        assert_eq!(luma_601(255, 255, 255), 255);
        assert_eq!(luma_601(0, 0, 0), 0);
        assert_eq!(luma_601(255, 0, 0), 76);
    }

    #[test]
    fn test_resize_is_identity_for_same_size() {
        let img = RasterImage::filled(8, 4, [10, 20, 30, 255]);
        assert_eq!(img.resized(8, 4), img);
        let small = img.resized(4, 2);
        assert_eq!(small.dimensions(), (4, 2));
        assert_eq!(small.pixel(1, 1), [10, 20, 30, 255]);
    }

    #[test]
    fn test_from_rgba_rejects_short_buffer() {
        assert!(RasterImage::from_rgba(2, 2, vec![0; 15]).is_none());
        assert!(RasterImage::from_rgba(2, 2, vec![0; 16]).is_some());
    }
}
