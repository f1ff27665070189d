//! RGBA pixel buffers and the off-screen drawing surface.
//!
//! [`ImageData`] is the unit that crosses every boundary in the pipeline: it
//! is what gets moved into a worker, what the fallback processor copies onto
//! its own surface, and what the orchestrator commits as the preview frame.
//! Its layout matches a canvas `ImageData`: `width * height` pixels, four
//! bytes each, row-major, straight (non-premultiplied) alpha.
//!
//! [`Surface`] wraps an `ImageData` with the drawing primitives the pipeline
//! needs: drawing a base image at target dimensions, applying a
//! [`Transform`](super::params::Transform), and compositing overlays.

use super::params::{Rotation, Transform};
use image::RgbaImage;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("buffer length {actual} does not match {width}x{height} RGBA ({expected} bytes)")]
    LengthMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("image has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

/// A flat RGBA8 pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ImageData {
    /// A fully transparent image.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0; width as usize * height as usize * 4],
            width,
            height,
        }
    }

    /// An image filled with a single RGBA color.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 4);
        for _ in 0..pixels {
            data.extend_from_slice(&rgba);
        }
        Self {
            data,
            width,
            height,
        }
    }

    /// Wrap an existing buffer, checking that its length matches the dimensions.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, SurfaceError> {
        let image = Self {
            data,
            width,
            height,
        };
        image.validate()?;
        Ok(image)
    }

    pub fn from_rgba_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
        }
    }

    /// Convert into an `image` buffer. Fails if the buffer is malformed.
    pub fn into_rgba_image(self) -> Result<RgbaImage, SurfaceError> {
        self.validate()?;
        let (width, height) = (self.width, self.height);
        let expected = self.expected_len();
        let actual = self.data.len();
        RgbaImage::from_raw(width, height, self.data).ok_or(SurfaceError::LengthMismatch {
            width,
            height,
            expected,
            actual,
        })
    }

    pub fn validate(&self) -> Result<(), SurfaceError> {
        if self.width == 0 || self.height == 0 {
            return Err(SurfaceError::Empty {
                width: self.width,
                height: self.height,
            });
        }
        let expected = self.expected_len();
        if self.data.len() != expected {
            return Err(SurfaceError::LengthMismatch {
                width: self.width,
                height: self.height,
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// RGBA value at `(x, y)`. Panics when out of bounds, like slice indexing.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }

    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Off-screen drawing surface owned by whoever is processing pixels.
#[derive(Debug, Clone)]
pub struct Surface {
    image: ImageData,
}

impl Surface {
    pub fn new(image: ImageData) -> Result<Self, SurfaceError> {
        image.validate()?;
        Ok(Self { image })
    }

    /// Draw `source` onto a fresh surface of `width` x `height`, scaling when
    /// the dimensions differ.
    pub fn from_source(source: &ImageData, width: u32, height: u32) -> Result<Self, SurfaceError> {
        source.validate()?;
        if source.dimensions() == (width, height) {
            return Self::new(source.clone());
        }
        if width == 0 || height == 0 {
            return Err(SurfaceError::Empty { width, height });
        }
        let buffer = source.clone().into_rgba_image()?;
        let scaled = imageops::resize(&buffer, width, height, FilterType::Lanczos3);
        Ok(Self {
            image: ImageData::from_rgba_image(scaled),
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn image(&self) -> &ImageData {
        &self.image
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.image.data
    }

    pub fn into_image_data(self) -> ImageData {
        self.image
    }

    /// Replace the surface contents with a new buffer (e.g. after a blur).
    pub fn replace(&mut self, image: ImageData) -> Result<(), SurfaceError> {
        image.validate()?;
        self.image = image;
        Ok(())
    }

    /// Alpha-composite `overlay` with its top-left corner at `(x, y)`.
    ///
    /// `opacity` scales the overlay's own alpha. Pixels falling outside the
    /// surface are clipped. An opacity of zero leaves the surface untouched.
    pub fn composite(&mut self, overlay: &ImageData, x: i64, y: i64, opacity: f32) {
        let opacity = opacity.clamp(0.0, 1.0);
        if opacity == 0.0 {
            return;
        }
        let (sw, sh) = (self.image.width as i64, self.image.height as i64);
        for oy in 0..overlay.height as i64 {
            let ty = y + oy;
            if ty < 0 || ty >= sh {
                continue;
            }
            for ox in 0..overlay.width as i64 {
                let tx = x + ox;
                if tx < 0 || tx >= sw {
                    continue;
                }
                let src = overlay.pixel(ox as u32, oy as u32);
                let alpha = src[3] as f32 / 255.0 * opacity;
                if alpha <= 0.0 {
                    continue;
                }
                let i = ((ty * sw + tx) * 4) as usize;
                blend_pixel(&mut self.image.data[i..i + 4], [src[0], src[1], src[2]], alpha);
            }
        }
    }

    /// Blend a single color through a coverage mask placed at `(x, y)`.
    ///
    /// `mask` holds `mask_width * mask_height` coverage values in 0..=1.
    pub fn fill_mask(
        &mut self,
        mask: &[f32],
        mask_width: u32,
        x: i64,
        y: i64,
        color: [u8; 3],
        opacity: f32,
    ) {
        let opacity = opacity.clamp(0.0, 1.0);
        if opacity == 0.0 || mask_width == 0 {
            return;
        }
        let (sw, sh) = (self.image.width as i64, self.image.height as i64);
        for (row, line) in mask.chunks(mask_width as usize).enumerate() {
            let ty = y + row as i64;
            if ty < 0 || ty >= sh {
                continue;
            }
            for (col, &coverage) in line.iter().enumerate() {
                let tx = x + col as i64;
                if tx < 0 || tx >= sw || coverage <= 0.0 {
                    continue;
                }
                let i = ((ty * sw + tx) * 4) as usize;
                blend_pixel(
                    &mut self.image.data[i..i + 4],
                    color,
                    coverage.min(1.0) * opacity,
                );
            }
        }
    }
}

/// Source-over blend of an opaque color at `alpha` onto `dst`.
fn blend_pixel(dst: &mut [u8], color: [u8; 3], alpha: f32) {
    for c in 0..3 {
        let blended = dst[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha;
        dst[c] = blended.round().clamp(0.0, 255.0) as u8;
    }
    let out_alpha = dst[3] as f32 + (255.0 - dst[3] as f32) * alpha;
    dst[3] = out_alpha.round().clamp(0.0, 255.0) as u8;
}

/// Draw the source image into a working buffer with the document transform
/// applied: resize first, then rotation, then flips.
pub fn draw_base_image(source: &ImageData, transform: &Transform) -> Result<ImageData, SurfaceError> {
    let (width, height) = transform
        .resize
        .map(|r| (r.width, r.height))
        .unwrap_or(source.dimensions());
    let surface = Surface::from_source(source, width, height)?;
    if transform.is_identity_geometry() {
        return Ok(surface.into_image_data());
    }

    let mut buffer = surface.into_image_data().into_rgba_image()?;
    buffer = match transform.rotation {
        Rotation::None => buffer,
        Rotation::Quarter => imageops::rotate90(&buffer),
        Rotation::Half => imageops::rotate180(&buffer),
        Rotation::ThreeQuarter => imageops::rotate270(&buffer),
    };
    if transform.flip_horizontal {
        imageops::flip_horizontal_in_place(&mut buffer);
    }
    if transform.flip_vertical {
        imageops::flip_vertical_in_place(&mut buffer);
    }
    Ok(ImageData::from_rgba_image(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::params::ResizeTarget;

    // =========================================================================
    // ImageData
    // =========================================================================

    #[test]
    fn from_raw_rejects_wrong_length() {
        let err = ImageData::from_raw(2, 2, vec![0; 15]).unwrap_err();
        assert_eq!(
            err,
            SurfaceError::LengthMismatch {
                width: 2,
                height: 2,
                expected: 16,
                actual: 15
            }
        );
    }

    #[test]
    fn validate_rejects_zero_area() {
        let img = ImageData::new(0, 10);
        assert!(matches!(img.validate(), Err(SurfaceError::Empty { .. })));
    }

    #[test]
    fn solid_fills_every_pixel() {
        let img = ImageData::solid(3, 2, [10, 20, 30, 255]);
        assert_eq!(img.data.len(), 24);
        assert_eq!(img.pixel(2, 1), [10, 20, 30, 255]);
    }

    // =========================================================================
    // Compositing
    // =========================================================================

    #[test]
    fn composite_with_zero_opacity_is_noop() {
        let base = ImageData::solid(4, 4, [100, 100, 100, 255]);
        let mut surface = Surface::new(base.clone()).unwrap();
        surface.composite(&ImageData::solid(2, 2, [255, 0, 0, 255]), 1, 1, 0.0);
        assert_eq!(surface.image(), &base);
    }

    #[test]
    fn composite_opaque_overlay_replaces_pixels() {
        let mut surface = Surface::new(ImageData::solid(4, 4, [0, 0, 0, 255])).unwrap();
        surface.composite(&ImageData::solid(2, 2, [255, 0, 0, 255]), 1, 1, 1.0);
        assert_eq!(surface.image().pixel(1, 1), [255, 0, 0, 255]);
        assert_eq!(surface.image().pixel(0, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn composite_clips_outside_surface() {
        let mut surface = Surface::new(ImageData::solid(2, 2, [0, 0, 0, 255])).unwrap();
        surface.composite(&ImageData::solid(3, 3, [255, 255, 255, 255]), -2, -2, 1.0);
        assert_eq!(surface.image().pixel(0, 0), [255, 255, 255, 255]);
        assert_eq!(surface.image().pixel(1, 1), [0, 0, 0, 255]);
    }

    #[test]
    fn composite_half_opacity_blends() {
        let mut surface = Surface::new(ImageData::solid(1, 1, [0, 0, 0, 255])).unwrap();
        surface.composite(&ImageData::solid(1, 1, [200, 100, 50, 255]), 0, 0, 0.5);
        assert_eq!(surface.image().pixel(0, 0), [100, 50, 25, 255]);
    }

    // =========================================================================
    // Base image drawing
    // =========================================================================

    #[test]
    fn draw_base_image_identity_copies() {
        let src = ImageData::solid(5, 3, [1, 2, 3, 255]);
        let out = draw_base_image(&src, &Transform::default()).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn draw_base_image_quarter_rotation_swaps_dimensions() {
        let src = ImageData::solid(5, 3, [1, 2, 3, 255]);
        let t = Transform {
            rotation: Rotation::Quarter,
            ..Transform::default()
        };
        let out = draw_base_image(&src, &t).unwrap();
        assert_eq!(out.dimensions(), (3, 5));
    }

    #[test]
    fn draw_base_image_flip_moves_pixels() {
        let mut src = ImageData::solid(2, 1, [0, 0, 0, 255]);
        src.data[0] = 255;
        let t = Transform {
            flip_horizontal: true,
            ..Transform::default()
        };
        let out = draw_base_image(&src, &t).unwrap();
        assert_eq!(out.pixel(0, 0), [0, 0, 0, 255]);
        assert_eq!(out.pixel(1, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn draw_base_image_resizes() {
        let src = ImageData::solid(8, 8, [9, 9, 9, 255]);
        let t = Transform {
            resize: Some(ResizeTarget {
                width: 4,
                height: 2,
            }),
            ..Transform::default()
        };
        let out = draw_base_image(&src, &t).unwrap();
        assert_eq!(out.dimensions(), (4, 2));
        assert_eq!(out.pixel(3, 1), [9, 9, 9, 255]);
    }
}
