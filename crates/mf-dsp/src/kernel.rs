//! Windowed-sinc resampling kernels.
//!
//! A kernel is a Lanczos lookup table plus a packed representation where
//! each subsample offset gets `length` contiguous values, making fractional
//! sampling a dot product over one cache-friendly row. The hot sampler has
//! scalar, SSE, and AVX+FMA variants chosen once at runtime.

use std::sync::{LazyLock, OnceLock};

use mf_core::math::{lanczos, lerp, wrap_i32};

use crate::simd::cpu_features;

/// Number of default Lanczos kernels (radii `1..=DEFAULT_LANCZOS_COUNT`).
pub const DEFAULT_LANCZOS_COUNT: usize = 32;

/// Subsample resolution of the default kernels. 128 is 2^7, giving the
/// lookup a signal-to-noise ratio of 12 + 12*7 = 96dB.
pub const DEFAULT_LANCZOS_RESOLUTION: usize = 128;

/// A windowed-sinc kernel sampled at `1/scale` intervals, with a packed
/// form for per-subsample contiguous access.
#[derive(Debug, Clone)]
pub struct Kernel {
    /// Tap count, `2*radius + 1`.
    length: usize,
    /// Index of the kernel's t=0 sample, `radius + 1`.
    sample_zero: usize,
    /// Subsample resolution.
    scale: usize,
    /// `length*scale + 1` samples, symmetric around `sample_zero*scale`,
    /// exactly zero at both ends.
    table: Vec<f32>,
    /// `(scale + 1)` rows of `length` contiguous taps, one row per
    /// subsample offset.
    packed: Vec<f32>,
}

impl Kernel {
    /// Builds a Lanczos kernel, `sinc(x) * sinc(x/radius)`, sampled at
    /// `1/resolution` intervals with symmetric reflection around the
    /// center.
    pub fn lanczos(resolution: usize, radius: usize) -> Kernel {
        debug_assert!(radius >= 1);
        debug_assert!(resolution >= 1);
        let length = 2 * radius + 1;
        let sample_zero = radius + 1;
        let mut kernel = Kernel {
            length,
            sample_zero,
            scale: resolution,
            table: vec![0.0; length * resolution + 1],
            packed: vec![0.0; (resolution + 1) * length],
        };
        let center = sample_zero * resolution;
        for i in 0..radius * resolution {
            let value = lanczos(i as f32 / resolution as f32, radius as f32);
            kernel.table[center - i] = value;
            kernel.table[center + i] = value;
        }
        kernel.pack();
        kernel
    }

    fn pack(&mut self) {
        for subsample in 0..=self.scale {
            for i in 0..self.length {
                self.packed[subsample * self.length + i] = self.table[i * self.scale + subsample];
            }
        }
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn sample_zero(&self) -> usize {
        self.sample_zero
    }

    #[inline]
    pub fn radius(&self) -> usize {
        self.sample_zero - 1
    }

    #[inline]
    pub fn scale(&self) -> usize {
        self.scale
    }

    /// Kernel value at table position `x` (t=0 sits at `sample_zero`).
    /// Interpolates between adjacent packed rows; a position exactly on a
    /// subsample boundary uses the lower-index row with the second row
    /// weighted zero.
    #[inline]
    pub fn evaluate_at(&self, x: f32) -> f32 {
        if x < 0.0 {
            return 0.0;
        }
        let index = x as usize;
        if index >= self.length - 1 {
            return 0.0;
        }
        let sub_pos = (x - index as f32) * self.scale as f32;
        let sub = sub_pos as usize;
        let t = sub_pos - sub as f32;
        let row0 = self.packed[sub * self.length + index];
        let row1 = self.packed[(sub + 1) * self.length + index];
        lerp(row0, row1, t)
    }
}

/// Picks the default-bank radius whose rate-stretched support matches the
/// desired radius, keeping the tap count bounded as the rate drops.
pub fn radius_for_rate(rate: f32, desired: usize) -> usize {
    ((desired as f32 * rate).round() as usize).clamp(1, DEFAULT_LANCZOS_COUNT)
}

static DEFAULT_LANCZOS: LazyLock<Vec<Kernel>> = LazyLock::new(|| {
    (1..=DEFAULT_LANCZOS_COUNT)
        .map(|radius| Kernel::lanczos(DEFAULT_LANCZOS_RESOLUTION, radius))
        .collect()
});

/// The default Lanczos kernel of the given radius (clamped to the bank).
pub fn default_lanczos(radius: usize) -> &'static Kernel {
    &DEFAULT_LANCZOS[radius.clamp(1, DEFAULT_LANCZOS_COUNT) - 1]
}

// ---- packed-row dot product, the SIMD-specialized hot loop ----

type DotFn = fn(&[f32], &[f32], f32, &[f32]) -> f32;

fn dot_lerped_scalar(row0: &[f32], row1: &[f32], t: f32, src: &[f32]) -> f32 {
    let mut sum = 0.0;
    for ((&k0, &k1), &s) in row0.iter().zip(row1).zip(src) {
        sum += (k0 + (k1 - k0) * t) * s;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse")]
unsafe fn dot_lerped_sse_impl(row0: &[f32], row1: &[f32], t: f32, src: &[f32]) -> f32 {
    unsafe {
        use std::arch::x86_64::*;
        let n = row0.len();
        let tv = _mm_set1_ps(t);
        let mut acc = _mm_setzero_ps();
        let mut i = 0;
        while i + 4 <= n {
            let k0 = _mm_loadu_ps(row0.as_ptr().add(i));
            let k1 = _mm_loadu_ps(row1.as_ptr().add(i));
            let k = _mm_add_ps(k0, _mm_mul_ps(_mm_sub_ps(k1, k0), tv));
            let s = _mm_loadu_ps(src.as_ptr().add(i));
            acc = _mm_add_ps(acc, _mm_mul_ps(k, s));
            i += 4;
        }
        let mut lanes = [0.0f32; 4];
        _mm_storeu_ps(lanes.as_mut_ptr(), acc);
        let mut sum = (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]);
        while i < n {
            sum += (row0[i] + (row1[i] - row0[i]) * t) * src[i];
            i += 1;
        }
        sum
    }
}

#[cfg(target_arch = "x86_64")]
fn dot_lerped_sse(row0: &[f32], row1: &[f32], t: f32, src: &[f32]) -> f32 {
    // Selected only after runtime detection confirmed SSE.
    unsafe { dot_lerped_sse_impl(row0, row1, t, src) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx,fma")]
unsafe fn dot_lerped_avx_fma_impl(row0: &[f32], row1: &[f32], t: f32, src: &[f32]) -> f32 {
    unsafe {
        use std::arch::x86_64::*;
        let n = row0.len();
        let tv = _mm256_set1_ps(t);
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i + 8 <= n {
            let k0 = _mm256_loadu_ps(row0.as_ptr().add(i));
            let k1 = _mm256_loadu_ps(row1.as_ptr().add(i));
            let k = _mm256_fmadd_ps(_mm256_sub_ps(k1, k0), tv, k0);
            let s = _mm256_loadu_ps(src.as_ptr().add(i));
            acc = _mm256_fmadd_ps(k, s, acc);
            i += 8;
        }
        let mut lanes = [0.0f32; 8];
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
        let mut sum = ((lanes[0] + lanes[1]) + (lanes[2] + lanes[3]))
            + ((lanes[4] + lanes[5]) + (lanes[6] + lanes[7]));
        while i < n {
            sum += (row0[i] + (row1[i] - row0[i]) * t) * src[i];
            i += 1;
        }
        sum
    }
}

#[cfg(target_arch = "x86_64")]
fn dot_lerped_avx_fma(row0: &[f32], row1: &[f32], t: f32, src: &[f32]) -> f32 {
    // Selected only after runtime detection confirmed AVX and FMA.
    unsafe { dot_lerped_avx_fma_impl(row0, row1, t, src) }
}

static DOT_LERPED: OnceLock<DotFn> = OnceLock::new();

fn dot_lerped() -> DotFn {
    *DOT_LERPED.get_or_init(|| {
        let features = cpu_features();
        #[cfg(target_arch = "x86_64")]
        {
            if features.avx && features.fma {
                log::trace!("kernel sampler: choosing avx+fma");
                return dot_lerped_avx_fma;
            }
            if features.sse {
                log::trace!("kernel sampler: choosing sse");
                return dot_lerped_sse;
            }
        }
        let _ = features;
        log::trace!("kernel sampler: choosing scalar");
        dot_lerped_scalar
    })
}

// ---- kernel sampling ----

#[inline]
fn normalize_position(frame: &mut i64, fraction: &mut f32) {
    let shift = fraction.floor();
    *frame += shift as i64;
    *fraction -= shift;
}

#[inline]
fn resolve_index(index: i64, min_frame: i64, max_frame: i64, wrap: bool) -> usize {
    if wrap {
        let len = (max_frame - min_frame).max(1) as i32;
        (min_frame + wrap_i32((index - min_frame) as i32, len) as i64) as usize
    } else {
        index.clamp(min_frame, max_frame - 1) as usize
    }
}

/// Evaluates the kernel at `frame + fraction`, accumulating one output
/// sample per channel into `dst`.
///
/// `src` holds frames `0..` at `stride` floats apart; reads clamp into
/// `[min_frame, max_frame)` when `wrap` is false and wrap modulo that range
/// otherwise, so `frame` may point outside the range. `rate <= 1` stretches
/// the kernel's support by `1/rate` (and compensates the amplitude),
/// low-pass prefiltering for downsampling.
pub fn sample_with_kernel(
    dst: &mut [f32],
    channels: usize,
    kernel: &Kernel,
    src: &[f32],
    stride: usize,
    min_frame: i64,
    max_frame: i64,
    wrap: bool,
    mut frame: i64,
    mut fraction: f32,
    rate: f32,
) {
    normalize_position(&mut frame, &mut fraction);
    dst[..channels].fill(0.0);
    let rate = rate.clamp(1e-6, 1.0);
    let extent = (kernel.radius() as f32 / rate).ceil() as i64;
    let sample_zero = kernel.sample_zero() as f32;
    for j in -extent..=extent {
        let x = (j as f32 - fraction) * rate + sample_zero;
        let weight = kernel.evaluate_at(x);
        if weight == 0.0 {
            continue;
        }
        let index = resolve_index(frame + j, min_frame, max_frame, wrap);
        let base = index * stride;
        for (c, out) in dst[..channels].iter_mut().enumerate() {
            *out += src[base + c] * weight;
        }
    }
    if rate < 1.0 {
        for out in dst[..channels].iter_mut() {
            *out *= rate;
        }
    }
}

/// Single-channel kernel sampling. At unity rate with contiguous samples
/// and the whole tap window in range, this runs the SIMD-dispatched packed
/// row dot product; everything else falls back to the generic path.
pub fn sample_with_kernel_1ch(
    kernel: &Kernel,
    src: &[f32],
    stride: usize,
    min_frame: i64,
    max_frame: i64,
    wrap: bool,
    mut frame: i64,
    mut fraction: f32,
    rate: f32,
) -> f32 {
    normalize_position(&mut frame, &mut fraction);
    if rate >= 1.0 && stride == 1 && !wrap {
        // x for the first conceptual tap; its integer part is the first
        // packed-row index, its fractional part picks the subsample rows.
        let x0 = 1.0 - fraction;
        let index0 = x0 as usize;
        let sub_pos = (x0 - index0 as f32) * kernel.scale() as f32;
        let sub = sub_pos as usize;
        let t = sub_pos - sub as f32;
        let taps = kernel.length() - 1 - index0;
        let start = frame - kernel.sample_zero() as i64 + 1;
        if start >= min_frame && start + taps as i64 <= max_frame && start >= 0 {
            let row_base = sub * kernel.length() + index0;
            let row0 = &kernel.packed[row_base..row_base + taps];
            let row1 = &kernel.packed[row_base + kernel.length()..row_base + kernel.length() + taps];
            let window = &src[start as usize..start as usize + taps];
            return dot_lerped()(row0, row1, t, window);
        }
    }
    let mut out = [0.0f32; 1];
    sample_with_kernel(&mut out, 1, kernel, src, stride, min_frame, max_frame, wrap, frame, fraction, rate);
    out[0]
}

/// Resamples `dst_frames` output samples from `src` at the given rate
/// `factor` (source frames consumed per output frame).
pub fn resample(
    kernel: &Kernel,
    factor: f32,
    dst: &mut [f32],
    dst_stride: usize,
    dst_frames: usize,
    src: &[f32],
    src_stride: usize,
    src_min: i64,
    src_max: i64,
    src_offset: f32,
) {
    let rate = (1.0 / factor).min(1.0);
    for i in 0..dst_frames {
        let pos = i as f64 * factor as f64;
        let frame = pos.trunc() as i64;
        let fraction = (pos - frame as f64) as f32 + src_offset;
        dst[i * dst_stride] = sample_with_kernel_1ch(
            kernel, src, src_stride, src_min, src_max, false, frame, fraction, rate,
        );
    }
}

/// Like `resample` but accumulates into `dst` at amplitude `amp`.
pub fn resample_add(
    kernel: &Kernel,
    factor: f32,
    amp: f32,
    dst: &mut [f32],
    dst_stride: usize,
    dst_frames: usize,
    src: &[f32],
    src_stride: usize,
    src_min: i64,
    src_max: i64,
    src_offset: f32,
) {
    let rate = (1.0 / factor).min(1.0);
    for i in 0..dst_frames {
        let pos = i as f64 * factor as f64;
        let frame = pos.trunc() as i64;
        let fraction = (pos - frame as f64) as f32 + src_offset;
        dst[i * dst_stride] += amp
            * sample_with_kernel_1ch(
                kernel, src, src_stride, src_min, src_max, false, frame, fraction, rate,
            );
    }
}
