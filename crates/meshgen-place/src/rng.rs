use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Deterministic generator for one cell's placement pass.
///
/// Reseeding with the same value reproduces the same sequence, which is what keeps a cell's
/// detail stable when its block is evicted and regenerated later.
#[derive(Clone, Debug)]
pub struct CellRng {
    inner: Xoshiro256PlusPlus,
}

impl CellRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    #[inline]
    pub fn for_cell(cell: usize) -> Self {
        Self::new(cell as u64)
    }

    pub fn reseed(&mut self, seed: u64) {
        self.inner = Xoshiro256PlusPlus::seed_from_u64(seed);
    }

    /// Uniform in `[0, 1)`.
    #[inline]
    pub fn get(&mut self) -> f32 {
        self.inner.random::<f32>()
    }

    /// Uniform between `lo` and `hi`; returns `lo` for an empty range.
    #[inline]
    pub fn range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + (hi - lo) * self.get()
    }

    /// Uniform integer in `0..n`; `0` when `n == 0`.
    #[inline]
    pub fn below(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        self.inner.random_range(0..n)
    }
}
