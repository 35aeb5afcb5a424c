use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::node::HEIGHT;

/// Source of tower heights for newly inserted entries.
///
/// Injected at construction time so tests can script exact heights and
/// verify splicing deterministically.
pub trait LevelGenerator: Send {
    /// Number of levels the next entry occupies, in `1..=HEIGHT`.
    fn next_height(&mut self) -> usize;
}

/// Fair-coin geometric heights: P(height >= n) = 2^-(n-1), capped at
/// [`HEIGHT`](crate::HEIGHT). Expected height is 2, which yields the usual
/// O(log n) search cost without any rebalancing.
pub struct GeometricLevels {
    rng: StdRng,
}

impl GeometricLevels {
    pub fn new() -> Self {
        GeometricLevels {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded variant for reproducible layouts.
    pub fn with_seed(seed: u64) -> Self {
        GeometricLevels {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for GeometricLevels {
    fn default() -> Self {
        Self::new()
    }
}

impl LevelGenerator for GeometricLevels {
    fn next_height(&mut self) -> usize {
        let bits: u64 = self.rng.gen();

        (bits.trailing_ones() as usize + 1).min(HEIGHT)
    }
}

#[cfg(test)]
mod level_test {
    use super::*;

    #[test]
    fn test_heights_in_range() {
        let mut levels = GeometricLevels::new();

        for _ in 0..10_000 {
            let height = levels.next_height();
            assert!(height >= 1 && height <= HEIGHT);
        }
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let mut a = GeometricLevels::with_seed(42);
        let mut b = GeometricLevels::with_seed(42);

        for _ in 0..1_000 {
            assert_eq!(a.next_height(), b.next_height());
        }
    }

    #[test]
    fn test_distribution_is_roughly_geometric() {
        let mut levels = GeometricLevels::with_seed(7);
        let draws = 100_000;

        let ones = (0..draws)
            .filter(|_| levels.next_height() == 1)
            .count();

        // Half the draws should land on height 1, give or take.
        assert!(ones > draws * 45 / 100);
        assert!(ones < draws * 55 / 100);
    }
}
