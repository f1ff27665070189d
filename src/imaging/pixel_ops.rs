//! Per-pixel color math on flat RGBA buffers.
//!
//! Every function takes a `&mut [u8]` whose length is a multiple of four,
//! rewrites the R, G and B channels in place, and never touches alpha. Results
//! are rounded and clamped to `0..=255`; nothing here returns an error, out of
//! range inputs are clamped instead. Pixels are processed in parallel with
//! rayon.
//!
//! ## Saturation convention
//!
//! Saturation takes the UI value `s` in `-100..=100` and maps it to the
//! multiplier `(s + 100) / 100`: `0` is the identity, `-100` collapses to
//! luma, `100` doubles the distance from luma. Every execution path (worker,
//! fallback, direct) goes through [`saturation`], so there is exactly one
//! convention.

use image::RgbaImage;
use image::imageops;
use rayon::prelude::*;

/// Rec. 601 luma weights.
const LUMA: [f32; 3] = [0.299, 0.587, 0.114];

#[inline]
fn clamp_channel(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[inline]
fn luma(px: &[u8]) -> f32 {
    LUMA[0] * px[0] as f32 + LUMA[1] * px[1] as f32 + LUMA[2] * px[2] as f32
}

/// Apply a 3x3 color matrix to RGB, blended toward the result by `mix`.
fn apply_matrix(data: &mut [u8], m: [[f32; 3]; 3], mix: f32) {
    let mix = mix.clamp(0.0, 1.0);
    data.par_chunks_exact_mut(4).for_each(|px| {
        let (r, g, b) = (px[0] as f32, px[1] as f32, px[2] as f32);
        let out = [
            m[0][0] * r + m[0][1] * g + m[0][2] * b,
            m[1][0] * r + m[1][1] * g + m[1][2] * b,
            m[2][0] * r + m[2][1] * g + m[2][2] * b,
        ];
        for c in 0..3 {
            let orig = px[c] as f32;
            px[c] = clamp_channel(orig + (out[c] - orig) * mix);
        }
    });
}

/// Add `amount` to every channel.
pub fn brightness(data: &mut [u8], amount: f32) {
    data.par_chunks_exact_mut(4).for_each(|px| {
        for c in px.iter_mut().take(3) {
            *c = clamp_channel(*c as f32 + amount);
        }
    });
}

/// Contrast factor for a UI value. `c` must not be 259.
pub fn contrast_factor(c: f32) -> f32 {
    (259.0 * (c + 255.0)) / (255.0 * (259.0 - c))
}

/// Stretch channels around mid-gray. Callers keep `c` inside `-255..255`.
pub fn contrast(data: &mut [u8], c: f32) {
    let factor = contrast_factor(c);
    data.par_chunks_exact_mut(4).for_each(|px| {
        for ch in px.iter_mut().take(3) {
            *ch = clamp_channel(factor * (*ch as f32 - 128.0) + 128.0);
        }
    });
}

/// Scale each channel's distance from luma by `(s + 100) / 100`.
pub fn saturation(data: &mut [u8], s: f32) {
    let factor = ((s + 100.0) / 100.0).max(0.0);
    data.par_chunks_exact_mut(4).for_each(|px| {
        let gray = luma(px);
        for ch in px.iter_mut().take(3) {
            *ch = clamp_channel(gray + factor * (*ch as f32 - gray));
        }
    });
}

/// Blend toward the standard sepia transform by `amount / 100`.
pub fn sepia(data: &mut [u8], amount: f32) {
    let m = [
        [0.393, 0.769, 0.189],
        [0.349, 0.686, 0.168],
        [0.272, 0.534, 0.131],
    ];
    apply_matrix(data, m, amount / 100.0);
}

/// Rotate hue by `degrees` using the canonical luminance-preserving matrix.
pub fn hue_rotate(data: &mut [u8], degrees: f32) {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let m = [
        [
            0.213 + cos * 0.787 - sin * 0.213,
            0.715 - cos * 0.715 - sin * 0.715,
            0.072 - cos * 0.072 + sin * 0.928,
        ],
        [
            0.213 - cos * 0.213 + sin * 0.143,
            0.715 + cos * 0.285 + sin * 0.140,
            0.072 - cos * 0.072 - sin * 0.283,
        ],
        [
            0.213 - cos * 0.213 - sin * 0.787,
            0.715 - cos * 0.715 + sin * 0.715,
            0.072 + cos * 0.928 + sin * 0.072,
        ],
    ];
    apply_matrix(data, m, 1.0);
}

/// Replace R, G and B with luma.
pub fn grayscale(data: &mut [u8]) {
    data.par_chunks_exact_mut(4).for_each(|px| {
        let y = clamp_channel(luma(px));
        px[0] = y;
        px[1] = y;
        px[2] = y;
    });
}

/// Blend toward luma by `amount / 100`. `100` is exactly [`grayscale`].
pub fn grayscale_amount(data: &mut [u8], amount: f32) {
    let mix = (amount / 100.0).clamp(0.0, 1.0);
    if mix >= 1.0 {
        grayscale(data);
        return;
    }
    data.par_chunks_exact_mut(4).for_each(|px| {
        let y = luma(px);
        for ch in px.iter_mut().take(3) {
            let orig = *ch as f32;
            *ch = clamp_channel(orig + (y - orig) * mix);
        }
    });
}

/// Blend toward the negative by `amount / 100`.
pub fn invert(data: &mut [u8], amount: f32) {
    let mix = (amount / 100.0).clamp(0.0, 1.0);
    data.par_chunks_exact_mut(4).for_each(|px| {
        for ch in px.iter_mut().take(3) {
            let orig = *ch as f32;
            *ch = clamp_channel(orig + ((255.0 - orig) - orig) * mix);
        }
    });
}

/// Gaussian blur with sigma `radius`. Returns `None` when `data` does not
/// match `width * height` RGBA.
///
/// Unlike the channel functions this one blurs alpha as well, the way a
/// canvas blur filter does.
pub fn blur(data: &[u8], width: u32, height: u32, radius: f32) -> Option<Vec<u8>> {
    let buffer = RgbaImage::from_raw(width, height, data.to_vec())?;
    if radius <= 0.0 {
        return Some(buffer.into_raw());
    }
    Some(imageops::blur(&buffer, radius).into_raw())
}
