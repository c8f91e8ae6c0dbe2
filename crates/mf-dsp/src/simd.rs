//! Runtime SIMD feature detection and denormal control.
//!
//! Detection happens once and is cached; hot paths pick their
//! specialization through function pointers rebound on first use.

use std::sync::OnceLock;

/// CPU features relevant to our kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuFeatures {
    pub sse: bool,
    pub avx: bool,
    pub fma: bool,
}

static FEATURES: OnceLock<CpuFeatures> = OnceLock::new();

/// Detects once, cheap forever after.
pub fn cpu_features() -> CpuFeatures {
    *FEATURES.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            CpuFeatures {
                sse: is_x86_feature_detected!("sse"),
                avx: is_x86_feature_detected!("avx"),
                fma: is_x86_feature_detected!("fma"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            CpuFeatures::default()
        }
    })
}

/// Sets DAZ + FTZ so denormals flush to zero. Call once at audio thread
/// startup; processing very quiet tails without this can cost an order of
/// magnitude in CPU.
///
/// Affects only the calling thread's MXCSR on x86_64 and is a no-op
/// elsewhere.
#[inline]
pub fn set_denormals_zero() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};
        // DAZ = bit 6 (0x0040), FTZ = bit 15 (0x8000)
        _mm_setcsr(_mm_getcsr() | 0x8040);
    }
}

/// Restores default denormal handling (for tests).
#[inline]
pub fn restore_denormals() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};
        _mm_setcsr(_mm_getcsr() & !0x8040);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_is_stable() {
        let first = cpu_features();
        let second = cpu_features();
        assert_eq!(first.sse, second.sse);
        assert_eq!(first.avx, second.avx);
        assert_eq!(first.fma, second.fma);
    }
}
