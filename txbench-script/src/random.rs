//! Seedable pseudo-random generation for scripts and the benchmark driver.
//!
//! Every client, and each of a thread's scheduling streams, owns its own [`BenchRng`]; no
//! generator is ever shared between threads. Snapshots are taken by cloning.

use rand::{Rng, RngCore, SeedableRng};
use rand_distr::StandardNormal;
use rand_xoshiro::Xoroshiro128StarStar;

/// Smallest accepted parameter of `random_gaussian`
pub const MIN_GAUSSIAN_PARAM: f64 = 2.0;
/// Bounds of the `random_zipfian` parameter
pub const MIN_ZIPFIAN_PARAM: f64 = 1.001;
pub const MAX_ZIPFIAN_PARAM: f64 = 1000.0;

const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const MM2_MUL: u64 = 0xc6a4_a793_5bd1_e995;
const MM2_MUL_TIMES_8: u64 = 0x3525_3c9a_de8f_4ca8;
const MM2_ROT: u32 = 47;

/// xoroshiro128** seeded through SplitMix64.
#[derive(Debug, Clone)]
pub struct BenchRng(Xoroshiro128StarStar);

impl BenchRng {
    pub fn seed(seed: u64) -> Self {
        Self(Xoroshiro128StarStar::seed_from_u64(seed))
    }

    /// Derives an independent generator by drawing a seed from this one.
    pub fn fork(&mut self) -> Self {
        Self::seed(self.uniform64())
    }

    pub fn uniform64(&mut self) -> u64 {
        self.0.next_u64()
    }

    /// Uniform double in `[0, 1)` with 52 bits of randomness.
    pub fn double(&mut self) -> f64 {
        (self.uniform64() >> 12) as f64 * f64::powi(2.0, -52)
    }

    pub fn normal(&mut self) -> f64 {
        self.0.sample(StandardNormal)
    }

    /// Uniform integer in `[lo, hi]`, by rejection of values outside a bit mask covering the
    /// range so that no modulo bias is introduced.
    pub fn range_u64(&mut self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        let extent = hi - lo;
        let shift = extent.leading_zeros();
        loop {
            let v = self.uniform64() >> shift;
            if v <= extent {
                return lo + v;
            }
        }
    }

    /// Uniform integer in `[min, max]`; the caller guarantees the width fits in an `i64`.
    pub fn uniform(&mut self, min: i64, max: i64) -> i64 {
        let width = max.wrapping_sub(min) as u64;
        min.wrapping_add(self.range_u64(0, width) as i64)
    }

    /// Exponentially distributed integer in `[min, max]`, truncated so that the density at
    /// `max` is `e^-param` times the density at `min`. `param` must be positive.
    pub fn exponential(&mut self, min: i64, max: i64, param: f64) -> i64 {
        let cut = (-param).exp();
        // in (0, 1]
        let uniform = 1.0 - self.double();
        let r = -(cut + (1.0 - cut) * uniform).ln() / param;
        min + ((max - min + 1) as f64 * r) as i64
    }

    /// Normally distributed integer in `[min, max]`, centred in the range, with samples beyond
    /// `param` standard deviations rejected.
    pub fn gaussian(&mut self, min: i64, max: i64, param: f64) -> i64 {
        let stdev = loop {
            let z = self.normal();
            if z >= -param && z < param {
                break z;
            }
        };
        let r = (stdev + param) / (param * 2.0);
        min + ((max - min + 1) as f64 * r) as i64
    }

    /// Zipfian integer in `[min, max]` with skew `s`, by the rejection method.
    pub fn zipfian(&mut self, min: i64, max: i64, s: f64) -> i64 {
        let n = (max - min + 1) as f64;
        if n <= 1.0 {
            return min;
        }
        let b = 2f64.powf(s - 1.0);
        let x = loop {
            let u = self.double();
            let v = self.double();
            let x = u.powf(-1.0 / (s - 1.0)).floor();
            let t = (1.0 + 1.0 / x).powf(s - 1.0);
            if v * x * (t - 1.0) / (b - 1.0) <= t / b && x <= n {
                break x;
            }
        };
        min - 1 + x as i64
    }

    /// Poisson-process delay with mean `center`.
    pub fn poisson(&mut self, center: f64) -> i64 {
        let uniform = 1.0 - self.double();
        (-uniform.ln() * center + 0.5) as i64
    }
}

/// Maps `val` to its image under a pseudo-random permutation of `[0, size)` determined by
/// `seed`. Values outside the range are first reduced modulo `size`.
pub fn permute(val: i64, size: i64, seed: i64) -> i64 {
    if size < 2 {
        return 0;
    }
    let mut rng = BenchRng::seed(seed as u64);
    let size = size as u64;
    let mut v = (val as u64) % size;

    // largest power of two not exceeding size
    let masklen = 63 - size.leading_zeros();
    let mask = (1u64 << masklen) - 1;

    let rotate = |x: u64| ((x << 1) & mask) | (x >> (masklen - 1));

    for _ in 0..6 {
        let m = (rng.uniform64() & mask) | 1;
        let r = rng.uniform64() & mask;
        if v <= mask {
            v = (v.wrapping_mul(m) ^ r) & mask;
            v = rotate(v);
        }

        let m = (rng.uniform64() & mask) | 1;
        let r = rng.uniform64() & mask;
        let mut t = size - 1 - v;
        if t <= mask {
            t = (t.wrapping_mul(m) ^ r) & mask;
            t = rotate(t);
            v = size - 1 - t;
        }

        v = (v + rng.range_u64(0, size - 1)) % size;
    }
    v as i64
}

/// 64-bit FNV-1a over the eight bytes of `val`, least significant first.
pub fn hash_fnv1a(val: i64, seed: i64) -> i64 {
    let mut result = FNV_OFFSET_BASIS ^ seed as u64;
    for byte in val.to_le_bytes() {
        result ^= byte as u64;
        result = result.wrapping_mul(FNV_PRIME);
    }
    result as i64
}

/// 64-bit MurmurHash2 (MurmurHash64A) of a single eight byte block.
pub fn hash_murmur2(val: i64, seed: i64) -> i64 {
    let mut result = seed as u64 ^ MM2_MUL_TIMES_8;
    let mut k = val as u64;

    k = k.wrapping_mul(MM2_MUL);
    k ^= k >> MM2_ROT;
    k = k.wrapping_mul(MM2_MUL);

    result ^= k;
    result = result.wrapping_mul(MM2_MUL);

    result ^= result >> MM2_ROT;
    result = result.wrapping_mul(MM2_MUL);
    result ^= result >> MM2_ROT;

    result as i64
}
