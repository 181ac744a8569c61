//! Brownian motion along the sigma axis
//!
//! One Wiener process per element with `W(0) = 0`. The path is rebuilt on
//! demand from its seed: coarse values come from a random walk over the
//! dyadic points `1, 2, 4, ...`, finer ones from Brownian-bridge bisection.
//! Querying the same `t` twice yields the same value, so increments over
//! consecutive sigma steps come from one continuous path.

use super::white;

/// Highest dyadic segment; sigmas above `2^MAX_SEGMENT` are clamped
const MAX_SEGMENT: u32 = 24;

/// Bridge bisection depth inside a segment
const MAX_DEPTH: u32 = 24;

/// Depth key reserved for segment endpoints
const ENDPOINT: u64 = 0xff;

pub(crate) struct BrownianPath {
    len: usize,
    seed: u64,
}

impl BrownianPath {
    pub(crate) fn new(len: usize, seed: u64) -> Self {
        Self { len, seed }
    }

    fn node_noise(&self, segment: u32, depth: u64, index: u64) -> Vec<f32> {
        let key = ((segment as u64) << 56) | (depth << 48) | index;
        white::gaussian(self.len, self.seed ^ key.wrapping_mul(0x9e37_79b9_7f4a_7c15))
    }

    /// `W(t)` for every element
    pub(crate) fn value(&self, t: f32) -> Vec<f32> {
        let t = f64::from(t.max(0.0));
        let mut lo = 0.0f64;
        let mut w_lo = vec![0.0f32; self.len];

        for segment in 0..=MAX_SEGMENT {
            let hi = 2f64.powi(segment as i32);
            let scale = (hi - lo).sqrt() as f32;
            let z = self.node_noise(segment, ENDPOINT, 0);
            let w_hi: Vec<f32> = w_lo.iter().zip(&z).map(|(w, z)| w + scale * z).collect();

            if t <= hi || segment == MAX_SEGMENT {
                return self.bridge(segment, lo, hi, w_lo, w_hi, t.min(hi));
            }
            lo = hi;
            w_lo = w_hi;
        }
        w_lo
    }

    fn bridge(
        &self,
        segment: u32,
        mut lo: f64,
        mut hi: f64,
        mut w_lo: Vec<f32>,
        mut w_hi: Vec<f32>,
        t: f64,
    ) -> Vec<f32> {
        let mut index = 0u64;
        for depth in 1..=MAX_DEPTH {
            let mid = 0.5 * (lo + hi);
            // Bridge midpoint: mean of the ends, variance (hi - lo) / 4
            let scale = (0.25 * (hi - lo)).sqrt() as f32;
            let z = self.node_noise(segment, u64::from(depth), index);
            let w_mid: Vec<f32> = w_lo
                .iter()
                .zip(&w_hi)
                .zip(&z)
                .map(|((a, b), z)| 0.5 * (a + b) + scale * z)
                .collect();

            if t == mid {
                return w_mid;
            }
            if t < mid {
                hi = mid;
                w_hi = w_mid;
                index *= 2;
            } else {
                lo = mid;
                w_lo = w_mid;
                index = 2 * index + 1;
            }
        }

        let frac = ((t - lo) / (hi - lo)) as f32;
        w_lo.iter().zip(&w_hi).map(|(a, b)| a + (b - a) * frac).collect()
    }

    /// `W(to) - W(from)`, with variance `|to - from|`
    pub(crate) fn increment(&self, from: f32, to: f32) -> Vec<f32> {
        let start = self.value(from);
        let end = self.value(to);
        end.iter().zip(&start).map(|(e, s)| e - s).collect()
    }

    /// Increment over a sigma step divided by `sqrt(|sigma - sigma_next|)`
    ///
    /// Unit variance for every step. A zero-length step falls back to the
    /// unit interval `[0, 1]`.
    pub(crate) fn step_noise(&self, sigma: f32, sigma_next: f32) -> Vec<f32> {
        let dt = (sigma - sigma_next).abs();
        if dt <= f32::EPSILON {
            return self.increment(0.0, 1.0);
        }
        let scale = dt.sqrt().recip();
        self.increment(sigma, sigma_next)
            .into_iter()
            .map(|v| v * scale)
            .collect()
    }
}
