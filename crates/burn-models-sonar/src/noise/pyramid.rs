//! Highres pyramid noise
//!
//! Gaussian noise at twice the target resolution plus progressively coarser
//! levels upsampled back onto it, then average-pooled down to the latent
//! size.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::{standardize, white};

/// Bilinear resize of one plane (half-pixel centers, edge clamped)
pub(super) fn resize_bilinear(src: &[f32], src_h: usize, src_w: usize, dst_h: usize, dst_w: usize) -> Vec<f32> {
    let coord = |dst: usize, src_len: usize, dst_len: usize| -> (usize, usize, f32) {
        let pos = ((dst as f32 + 0.5) * src_len as f32 / dst_len as f32 - 0.5)
            .clamp(0.0, (src_len - 1) as f32);
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(src_len - 1);
        (lo, hi, pos - lo as f32)
    };

    let mut out = Vec::with_capacity(dst_h * dst_w);
    for y in 0..dst_h {
        let (y0, y1, ty) = coord(y, src_h, dst_h);
        for x in 0..dst_w {
            let (x0, x1, tx) = coord(x, src_w, dst_w);
            let top = src[y0 * src_w + x0] * (1.0 - tx) + src[y0 * src_w + x1] * tx;
            let bottom = src[y1 * src_w + x0] * (1.0 - tx) + src[y1 * src_w + x1] * tx;
            out.push(top * (1.0 - ty) + bottom * ty);
        }
    }
    out
}

/// 2x2 average pooling
fn downsample_half(src: &[f32], src_h: usize, src_w: usize) -> Vec<f32> {
    let (dst_h, dst_w) = (src_h / 2, src_w / 2);
    let mut out = Vec::with_capacity(dst_h * dst_w);
    for y in 0..dst_h {
        for x in 0..dst_w {
            let sum = src[2 * y * src_w + 2 * x]
                + src[2 * y * src_w + 2 * x + 1]
                + src[(2 * y + 1) * src_w + 2 * x]
                + src[(2 * y + 1) * src_w + 2 * x + 1];
            out.push(sum * 0.25);
        }
    }
    out
}

pub(crate) fn highres_pyramid(shape: [usize; 4], seed: u64, discount: f32, levels: u32) -> Vec<f32> {
    let [batch, channels, height, width] = shape;
    let (hi_h, hi_w) = (height * 2, width * 2);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(batch * channels * height * width);

    for _ in 0..batch * channels {
        let mut plane = white::gaussian(hi_h * hi_w, rng.next_u64());

        for level in 1..=levels {
            let factor = 1usize << level;
            let (lh, lw) = ((hi_h / factor).max(1), (hi_w / factor).max(1));
            let coarse = white::gaussian(lh * lw, rng.next_u64());
            let weight = discount.powi(level as i32);

            let upsampled = resize_bilinear(&coarse, lh, lw, hi_h, hi_w);
            for (v, u) in plane.iter_mut().zip(&upsampled) {
                *v += weight * u;
            }

            if lh == 1 && lw == 1 {
                break;
            }
        }

        let mut pooled = downsample_half(&plane, hi_h, hi_w);
        standardize(&mut pooled);
        out.extend(pooled);
    }
    out
}
