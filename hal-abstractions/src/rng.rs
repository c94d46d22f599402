//! Platform entropy source
//!
//! Boards expose their hardware RNG (e.g. the STM32 RNG peripheral) through
//! this trait. Anything implementing the `rand_core` crypto RNG traits
//! qualifies, so HAL RNG drivers and `OsRng` work unchanged.

use rand_core::{CryptoRng, RngCore};

/// A source of cryptographically secure random bytes used to seed DRBGs.
pub trait EntropySource: RngCore + CryptoRng {}

impl<T: RngCore + CryptoRng + ?Sized> EntropySource for T {}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingRng(u8);

    impl RngCore for CountingRng {
        fn next_u32(&mut self) -> u32 {
            rand_core::impls::next_u32_via_fill(self)
        }

        fn next_u64(&mut self) -> u64 {
            rand_core::impls::next_u64_via_fill(self)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                self.0 = self.0.wrapping_add(1);
                *byte = self.0;
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for CountingRng {}

    fn draw(source: &mut dyn EntropySource) -> [u8; 4] {
        let mut seed = [0u8; 4];
        source.fill_bytes(&mut seed);
        seed
    }

    #[test]
    fn test_entropy_source_is_object_safe() {
        let mut rng = CountingRng(0);
        assert_eq!(draw(&mut rng), [1, 2, 3, 4]);
        assert_eq!(draw(&mut rng), [5, 6, 7, 8]);
    }
}
