use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::imageops::FilterType;

use super::{CodecError, Rgb};

/// Row-major RGB pixel grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: u32,
    height: u32,
    pixels: Vec<Rgb>,
}

impl RasterImage {
    pub fn new(width: u32, height: u32, pixels: Vec<Rgb>) -> Result<Self, CodecError> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(CodecError::Dimensions {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self::from_parts(width, height, pixels))
    }

    pub(super) fn from_parts(width: u32, height: u32, pixels: Vec<Rgb>) -> Self {
        debug_assert_eq!(pixels.len(), width as usize * height as usize);
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> Rgb) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self::from_parts(width, height, pixels)
    }

    /// Decode a PNG produced by a worker, optionally shrinking it so neither
    /// side exceeds `max_side` (aspect ratio kept).
    pub fn from_png(bytes: &[u8], max_side: Option<u32>) -> Result<Self, CodecError> {
        let mut decoded = image::load_from_memory(bytes)?;
        if let Some(max_side) = max_side
            && (decoded.width() > max_side || decoded.height() > max_side)
        {
            decoded = decoded.resize(max_side, max_side, FilterType::Triangle);
        }
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        let pixels = rgb.pixels().map(|p| p.0).collect();
        Ok(Self::from_parts(width, height, pixels))
    }

    /// Same as [`RasterImage::from_png`] for a base64 payload. A leading
    /// `data:image/png;base64,` prefix is accepted.
    pub fn from_base64_png(data: &str, max_side: Option<u32>) -> Result<Self, CodecError> {
        let data = data.trim();
        let payload = match data.split_once(',') {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => data,
        };
        let bytes = BASE64.decode(payload)?;
        Self::from_png(&bytes, max_side)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[Rgb] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Rgb]> {
        // chunks_exact panics on zero
        self.pixels.chunks_exact(self.width.max(1) as usize)
    }

    /// Pixels of column `x`, top to bottom.
    pub fn column(&self, x: u32) -> impl Iterator<Item = Rgb> + '_ {
        let stride = self.width as usize;
        (0..self.height as usize).map(move |y| self.pixels[y * stride + x as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, f: impl Fn(u32, u32) -> [u8; 3]) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| image::Rgb(f(x, y)));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn new_validates_pixel_count() {
        assert!(RasterImage::new(2, 2, vec![[0; 3]; 4]).is_ok());
        let err = RasterImage::new(2, 2, vec![[0; 3]; 3]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Dimensions {
                expected: 4,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn accessors_are_row_major() {
        let image = RasterImage::from_fn(3, 2, |x, y| [x as u8, y as u8, 0]);
        assert_eq!(image.pixel(2, 1), Some([2, 1, 0]));
        assert_eq!(image.pixel(3, 0), None);
        assert_eq!(image.rows().count(), 2);
        assert_eq!(
            image.column(1).collect::<Vec<_>>(),
            vec![[1, 0, 0], [1, 1, 0]]
        );
    }

    #[test]
    fn decodes_png() {
        let bytes = png_bytes(4, 3, |x, _| if x < 2 { [255, 0, 0] } else { [0, 0, 255] });
        let image = RasterImage::from_png(&bytes, None).unwrap();
        assert_eq!((image.width(), image.height()), (4, 3));
        assert_eq!(image.pixel(0, 0), Some([255, 0, 0]));
        assert_eq!(image.pixel(3, 2), Some([0, 0, 255]));
    }

    #[test]
    fn downscales_to_max_side() {
        let bytes = png_bytes(64, 32, |_, _| [10, 20, 30]);
        let image = RasterImage::from_png(&bytes, Some(16)).unwrap();
        assert_eq!((image.width(), image.height()), (16, 8));
        for [r, g, b] in image.pixels() {
            assert!(r.abs_diff(10) <= 1 && g.abs_diff(20) <= 1 && b.abs_diff(30) <= 1);
        }
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let bytes = png_bytes(8, 8, |_, _| [0, 0, 0]);
        let image = RasterImage::from_png(&bytes, Some(16)).unwrap();
        assert_eq!((image.width(), image.height()), (8, 8));
    }

    #[test]
    fn decodes_base64_with_and_without_data_url() {
        let bytes = png_bytes(2, 2, |_, _| [1, 2, 3]);
        let plain = BASE64.encode(&bytes);
        let data_url = format!("data:image/png;base64,{plain}");

        let a = RasterImage::from_base64_png(&plain, None).unwrap();
        let b = RasterImage::from_base64_png(&data_url, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.pixel(1, 1), Some([1, 2, 3]));
    }

    #[test]
    fn rejects_bad_payloads() {
        assert!(matches!(
            RasterImage::from_base64_png("%%%", None),
            Err(CodecError::Base64(_))
        ));
        let not_png = BASE64.encode(b"definitely not a png");
        assert!(matches!(
            RasterImage::from_base64_png(&not_png, None),
            Err(CodecError::Image(_))
        ));
    }
}
