//! Decoded images and the codecs around them.
//!
//! [`decode_sampled`] bounds peak memory by working out a power-of-two sample
//! factor from the header before any pixel data is decoded:
//!
//! - JPEG is scaled in the DCT domain by the decoder itself.
//! - Non-interlaced PNG is subsampled row by row while streaming.
//! - Everything else (GIF, BMP, WebP and interlaced PNG) has no decoder that
//!   can sample while decoding. These formats are the one exception to
//!   never holding a full-resolution bitmap: they are decoded at full size
//!   and then subsampled, and only when their header pixel count fits
//!   `max_decoded_pixels`. Larger images are refused with a codec error
//!   before any pixel data is read.

use crate::Error;
use crate::cache::CompressFormat;
use image::codecs::jpeg::{JpegDecoder, JpegEncoder};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, DynamicImage, ImageDecoder, ImageEncoder, ImageFormat};
use std::io::Cursor;

/// Decoded RGBA8 bitmap.
#[derive(Clone, PartialEq, Eq)]
pub struct CachedImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl std::fmt::Debug for CachedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("byte_size", &self.byte_size())
            .finish()
    }
}

impl CachedImage {
    /// Wrap raw RGBA8 pixels.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if `pixels` is not exactly `width * height * 4` bytes.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, Error> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(Error::Codec(format!(
                "{}x{} RGBA needs {expected} bytes, got {}",
                width,
                height,
                pixels.len()
            )));
        }
        Ok(Self { width, height, pixels })
    }

    fn from_dynamic(img: DynamicImage) -> Self {
        let rgba = img.into_rgba8();
        let (width, height) = rgba.dimensions();
        Self { width, height, pixels: rgba.into_raw() }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    /// Memory footprint of the pixel data; the memory tier's weight.
    pub fn byte_size(&self) -> usize {
        self.stride() * self.height as usize
    }

    /// Serialize for the disk tier.
    ///
    /// PNG ignores `quality`; JPEG drops the alpha channel.
    pub fn encode(&self, format: CompressFormat, quality: u8) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        match format {
            CompressFormat::Png => {
                PngEncoder::new_with_quality(&mut out, CompressionType::Default, FilterType::Adaptive).write_image(
                    &self.pixels,
                    self.width,
                    self.height,
                    ColorType::Rgba8,
                )?;
            }
            CompressFormat::Jpeg => {
                let rgb: Vec<u8> = self.pixels.chunks_exact(4).flat_map(|px| [px[0], px[1], px[2]]).collect();
                JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
                    &rgb,
                    self.width,
                    self.height,
                    ColorType::Rgb8,
                )?;
            }
        }
        Ok(out)
    }

    /// Decode bytes this crate encoded itself, at their stored size.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_dynamic(image::load_from_memory(bytes)?))
    }
}

/// Requested output size of [`decode_sampled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeBounds {
    pub target_width: u32,
    pub target_height: u32,
    /// Full-resolution pixel budget for formats without a bounded decoder.
    pub max_decoded_pixels: u64,
}

impl DecodeBounds {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self { target_width, target_height, max_decoded_pixels: 16 * 1024 * 1024 }
    }
}

/// Largest power of two that keeps both sides at or above the request.
pub fn sample_factor(width: u32, height: u32, req_width: u32, req_height: u32) -> u32 {
    let (req_width, req_height) = (req_width.max(1), req_height.max(1));
    let mut factor: u32 = 1;

    if height > req_height || width > req_width {
        let half_height = height / 2;
        let half_width = width / 2;
        while half_height / factor > req_height && half_width / factor > req_width {
            factor *= 2;
        }
    }

    factor
}

/// Decode `bytes`, sampled down towards `bounds` without ever holding the
/// full-resolution bitmap of a JPEG or non-interlaced PNG.
pub fn decode_sampled(bytes: &[u8], bounds: DecodeBounds) -> Result<CachedImage, Error> {
    let format = image::guess_format(bytes)?;
    match format {
        ImageFormat::Jpeg => decode_jpeg(bytes, bounds),
        ImageFormat::Png => decode_png(bytes, bounds),
        other => decode_generic(bytes, other, bounds),
    }
}

fn decode_jpeg(bytes: &[u8], bounds: DecodeBounds) -> Result<CachedImage, Error> {
    let mut decoder = JpegDecoder::new(Cursor::new(bytes))?;
    let (width, height) = decoder.dimensions();
    let factor = sample_factor(width, height, bounds.target_width, bounds.target_height);

    if factor > 1 {
        let scaled_width = u16::try_from((width / factor).max(1)).unwrap_or(u16::MAX);
        let scaled_height = u16::try_from((height / factor).max(1)).unwrap_or(u16::MAX);
        let (w, h) = decoder.scale(scaled_width, scaled_height)?;
        tracing::trace!(width, height, factor, scaled_width = w, scaled_height = h, "Scaled JPEG decode");
    }

    Ok(CachedImage::from_dynamic(DynamicImage::from_decoder(decoder)?))
}

fn decode_png(bytes: &[u8], bounds: DecodeBounds) -> Result<CachedImage, Error> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder.read_info()?;

    let (width, height, interlaced) = {
        let info = reader.info();
        (info.width, info.height, info.interlaced)
    };
    if interlaced {
        // Adam7 rows arrive per pass; no row-order subsampling possible.
        return decode_generic(bytes, ImageFormat::Png, bounds);
    }

    let factor = sample_factor(width, height, bounds.target_width, bounds.target_height);
    let out_width = width.div_ceil(factor);
    let out_height = height.div_ceil(factor);
    let (color, _) = reader.output_color_type();
    let channels = color.samples();
    let step = factor as usize;

    let mut pixels = Vec::with_capacity(out_width as usize * out_height as usize * 4);
    let mut y: u32 = 0;
    while let Some(row) = reader.next_row()? {
        if y % factor == 0 {
            let data = row.data();
            for px in data.chunks_exact(channels).step_by(step) {
                pixels.extend_from_slice(&to_rgba(px, color));
            }
        }
        y += 1;
    }

    if y < height {
        return Err(Error::Codec(format!("truncated PNG: {y} of {height} rows")));
    }

    CachedImage::from_rgba(out_width, out_height, pixels)
}

fn to_rgba(px: &[u8], color: png::ColorType) -> [u8; 4] {
    match color {
        png::ColorType::Grayscale => [px[0], px[0], px[0], 255],
        png::ColorType::GrayscaleAlpha => [px[0], px[0], px[0], px[1]],
        png::ColorType::Rgb => [px[0], px[1], px[2], 255],
        png::ColorType::Rgba => [px[0], px[1], px[2], px[3]],
        // EXPAND turns palettes into Rgb/Rgba
        png::ColorType::Indexed => [px[0], px[0], px[0], 255],
    }
}

/// Full decode followed by subsampling, gated on the header pixel count.
fn decode_generic(bytes: &[u8], format: ImageFormat, bounds: DecodeBounds) -> Result<CachedImage, Error> {
    let (width, height) = image::io::Reader::with_format(Cursor::new(bytes), format).into_dimensions()?;
    let pixels = u64::from(width) * u64::from(height);
    if pixels > bounds.max_decoded_pixels {
        return Err(Error::Codec(format!(
            "{width}x{height} {format:?} exceeds the full-decode budget of {} pixels",
            bounds.max_decoded_pixels
        )));
    }

    let img = image::load_from_memory_with_format(bytes, format)?;
    let factor = sample_factor(width, height, bounds.target_width, bounds.target_height);
    let img = if factor > 1 {
        img.resize_exact(
            width.div_ceil(factor),
            height.div_ceil(factor),
            image::imageops::FilterType::Nearest,
        )
    } else {
        img
    };

    Ok(CachedImage::from_dynamic(img))
}

/// Solid-colour test images encoded in the formats the decoders support.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use image::{Rgba, RgbaImage};

    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> CachedImage {
        CachedImage::from_dynamic(DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba(rgba))))
    }

    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        solid(width, height, [200, 10, 10, 255]).encode(CompressFormat::Png, 100).unwrap()
    }

    pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        solid(width, height, [10, 200, 10, 255]).encode(CompressFormat::Jpeg, 90).unwrap()
    }

    pub fn gif_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([1, 2, 3, 255])));
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Gif).unwrap();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_byte_size_is_stride_times_height() {
        let img = solid(10, 4, [0, 0, 0, 0]);
        assert_eq!(img.stride(), 40);
        assert_eq!(img.byte_size(), 160);
    }

    #[test]
    fn test_from_rgba_rejects_wrong_length() {
        assert!(CachedImage::from_rgba(2, 2, vec![0; 15]).is_err());
        assert!(CachedImage::from_rgba(2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_sample_factor() {
        assert_eq!(sample_factor(100, 100, 100, 100), 1);
        assert_eq!(sample_factor(50, 50, 100, 100), 1);
        assert_eq!(sample_factor(400, 400, 100, 100), 2);
        assert_eq!(sample_factor(1000, 1000, 100, 100), 8);
        // the short side already matches the request
        assert_eq!(sample_factor(4000, 100, 100, 100), 1);
    }

    #[test]
    fn test_png_round_trip_is_lossless() {
        let img = solid(7, 5, [1, 2, 3, 4]);
        let bytes = img.encode(CompressFormat::Png, 0).unwrap();
        assert_eq!(CachedImage::decode(&bytes).unwrap(), img);
    }

    #[test]
    fn test_jpeg_encode_drops_alpha() {
        let bytes = solid(8, 8, [50, 60, 70, 0]).encode(CompressFormat::Jpeg, 80).unwrap();
        let decoded = CachedImage::decode(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
        assert!(decoded.pixels().chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn test_decode_png_streams_sampled() {
        let bytes = png_bytes(400, 300);
        let img = decode_sampled(&bytes, DecodeBounds::new(100, 100)).unwrap();
        assert_eq!((img.width(), img.height()), (200, 150));
        assert_eq!(&img.pixels()[..4], &[200, 10, 10, 255]);
    }

    #[test]
    fn test_decode_png_small_is_untouched() {
        let bytes = png_bytes(20, 10);
        let img = decode_sampled(&bytes, DecodeBounds::new(100, 100)).unwrap();
        assert_eq!((img.width(), img.height()), (20, 10));
    }

    #[test]
    fn test_decode_jpeg_scaled() {
        let bytes = jpeg_bytes(800, 800);
        let img = decode_sampled(&bytes, DecodeBounds::new(100, 100)).unwrap();
        assert!(img.width() < 800 && img.width() >= 100);
        assert!(img.height() < 800 && img.height() >= 100);
    }

    #[test]
    fn test_decode_generic_respects_pixel_budget() {
        let bytes = gif_bytes(64, 64);
        let bounds = DecodeBounds { target_width: 16, target_height: 16, max_decoded_pixels: 1000 };
        assert!(matches!(decode_sampled(&bytes, bounds), Err(Error::Codec(_))));

        let img = decode_sampled(&bytes, DecodeBounds::new(16, 16)).unwrap();
        assert_eq!((img.width(), img.height()), (32, 32));
    }

    #[test]
    fn test_decode_truncated_fails() {
        let bytes = png_bytes(64, 64);
        let truncated = &bytes[..bytes.len() / 2];
        assert!(decode_sampled(truncated, DecodeBounds::new(16, 16)).is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_sampled(b"definitely not an image", DecodeBounds::new(16, 16)).is_err());
    }
}
