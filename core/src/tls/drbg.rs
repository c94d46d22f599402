//! Process-wide session DRBG and crypto provider
//!
//! rustls draws randomness through a `&'static` [`SecureRandom`]. Every
//! session uses one ChaCha20 DRBG, reseeded from the configuration's
//! entropy source each time a configuration is first locked.

use alloc::sync::Arc;
use core::cell::RefCell;
use std::sync::OnceLock;

use critical_section::Mutex;
use hal_abstractions::rng::EntropySource;
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use rustls::crypto::{CryptoProvider, GetRandomFailed, SecureRandom};

use crate::debug;

const SEED_LEN: usize = 32;

static SESSION_DRBG: Mutex<RefCell<Option<ChaCha20Rng>>> = Mutex::new(RefCell::new(None));
static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();

#[derive(Debug)]
struct SessionRandom;

impl SecureRandom for SessionRandom {
    fn fill(&self, buf: &mut [u8]) -> Result<(), GetRandomFailed> {
        critical_section::with(|cs| match SESSION_DRBG.borrow_ref_mut(cs).as_mut() {
            Some(drbg) => {
                drbg.fill_bytes(buf);
                Ok(())
            }
            None => Err(GetRandomFailed),
        })
    }
}

static SESSION_RANDOM: SessionRandom = SessionRandom;

/// The crypto provider shared by all client configurations. Initialised
/// on first use.
pub(crate) fn provider() -> Arc<CryptoProvider> {
    PROVIDER
        .get_or_init(|| {
            debug!("initialising TLS crypto provider");
            Arc::new(CryptoProvider {
                secure_random: &SESSION_RANDOM,
                ..rustls::crypto::ring::default_provider()
            })
        })
        .clone()
}

/// Reseeds the session DRBG. Fresh entropy is mixed with output of the
/// current generator, so reseeding never lowers its state entropy.
pub(crate) fn reseed(entropy: &mut dyn EntropySource) -> Result<(), rand_core::Error> {
    let mut seed = [0u8; SEED_LEN];
    entropy.try_fill_bytes(&mut seed)?;

    critical_section::with(|cs| {
        let mut slot = SESSION_DRBG.borrow_ref_mut(cs);
        if let Some(current) = slot.as_mut() {
            let mut mix = [0u8; SEED_LEN];
            current.fill_bytes(&mut mix);
            for (byte, other) in seed.iter_mut().zip(mix) {
                *byte ^= other;
            }
        }
        *slot = Some(ChaCha20Rng::from_seed(seed));
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reseed_enables_secure_random() {
        reseed(&mut rand_core::OsRng).unwrap();
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        SESSION_RANDOM.fill(&mut first).unwrap();
        SESSION_RANDOM.fill(&mut second).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_provider_is_shared() {
        assert!(Arc::ptr_eq(&provider(), &provider()));
    }
}
