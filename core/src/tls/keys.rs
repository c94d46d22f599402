//! Device key pairs
//!
//! A [`KeyStore`] holds private keys in numbered slots and hands out
//! [`EcdsaKey`] signing handles. On a board the store fronts a secure
//! element or PSA key storage; [`MemoryKeyStore`] keeps keys in RAM.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hal_abstractions::rng::EntropySource;
use p256::ecdsa::signature::{RandomizedSigner, Signer as _};
use p256::ecdsa::{Signature, SigningKey as EcdsaSigningKey};
use rand_chacha::ChaCha20Rng;
use rand_core::{CryptoRngCore, SeedableRng};
use rustls::sign::{Signer, SigningKey};
use rustls::{SignatureAlgorithm, SignatureScheme};

use super::certs::CertError;

/// Key slot identifier.
pub type KeyId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyAlgorithm {
    /// NIST P-256, ECDSA with SHA-256
    Secp256r1,
    /// NIST P-384, ECDSA with SHA-384
    Secp384r1,
}

impl KeyAlgorithm {
    pub const fn bits(self) -> usize {
        match self {
            Self::Secp256r1 => 256,
            Self::Secp384r1 => 384,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyLifetime {
    Volatile,
    Persistent,
}

/// Generation parameters for a key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAttributes {
    pub algorithm: KeyAlgorithm,
    pub lifetime: KeyLifetime,
    /// Key may sign message digests.
    pub sign_hash: bool,
}

impl KeyAttributes {
    /// Persistent signing key.
    pub const fn signing(algorithm: KeyAlgorithm) -> Self {
        Self {
            algorithm,
            lifetime: KeyLifetime::Persistent,
            sign_hash: true,
        }
    }
}

/// P-256 ECDSA signing handle.
#[derive(Clone)]
pub struct EcdsaKey {
    key: EcdsaSigningKey,
}

impl EcdsaKey {
    pub fn generate(rng: &mut impl CryptoRngCore) -> Self {
        Self {
            key: EcdsaSigningKey::random(rng),
        }
    }

    pub fn bits(&self) -> usize {
        KeyAlgorithm::Secp256r1.bits()
    }

    /// Uncompressed SEC1 public point.
    pub fn public_key(&self) -> Vec<u8> {
        self.key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// ASN.1 DER signature over `message` with a random nonce.
    pub fn sign_with_rng(&self, rng: &mut impl CryptoRngCore, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.key.sign_with_rng(rng, message);
        signature.to_der().as_bytes().to_vec()
    }

    /// The key as a rustls client authentication key.
    pub fn tls_signing_key(&self) -> Arc<dyn SigningKey> {
        Arc::new(self.clone())
    }
}

impl core::fmt::Debug for EcdsaKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EcdsaKey").field("bits", &self.bits()).finish()
    }
}

impl SigningKey for EcdsaKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        offered
            .contains(&SignatureScheme::ECDSA_NISTP256_SHA256)
            .then(|| Box::new(self.clone()) as Box<dyn Signer>)
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::ECDSA
    }
}

impl Signer for EcdsaKey {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        let signature: Signature = self.key.sign(message);
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::ECDSA_NISTP256_SHA256
    }
}

/// Slot-addressed private key storage.
pub trait KeyStore {
    /// Generates a key in slot `id`, returning the slot actually assigned.
    fn generate(&mut self, id: KeyId, attributes: &KeyAttributes) -> Result<KeyId, CertError>;

    fn destroy(&mut self, id: KeyId) -> Result<(), CertError>;

    /// Writes the public key encoding to `out`, returning its length.
    fn export_public_key(&self, id: KeyId, out: &mut [u8]) -> Result<usize, CertError>;

    fn signing_key(&self, id: KeyId) -> Result<EcdsaKey, CertError>;
}

/// RAM-backed key store seeded from platform entropy.
pub struct MemoryKeyStore {
    entropy: Box<dyn EntropySource>,
    keys: BTreeMap<KeyId, EcdsaKey>,
}

impl MemoryKeyStore {
    pub fn new(entropy: impl EntropySource + 'static) -> Self {
        Self {
            entropy: Box::new(entropy),
            keys: BTreeMap::new(),
        }
    }

    pub fn contains(&self, id: KeyId) -> bool {
        self.keys.contains_key(&id)
    }
}

impl KeyStore for MemoryKeyStore {
    fn generate(&mut self, id: KeyId, attributes: &KeyAttributes) -> Result<KeyId, CertError> {
        if attributes.algorithm != KeyAlgorithm::Secp256r1 {
            return Err(CertError::NotSupported);
        }
        if !attributes.sign_hash {
            return Err(CertError::NotPermitted);
        }
        if self.keys.contains_key(&id) {
            return Err(CertError::AlreadyExists);
        }

        let mut drbg =
            ChaCha20Rng::from_rng(&mut *self.entropy).map_err(|_| CertError::EntropyFailure)?;
        self.keys.insert(id, EcdsaKey::generate(&mut drbg));
        Ok(id)
    }

    fn destroy(&mut self, id: KeyId) -> Result<(), CertError> {
        self.keys
            .remove(&id)
            .map(|_| ())
            .ok_or(CertError::InvalidHandle)
    }

    fn export_public_key(&self, id: KeyId, out: &mut [u8]) -> Result<usize, CertError> {
        let public = self.keys.get(&id).ok_or(CertError::InvalidHandle)?.public_key();
        let target = out
            .get_mut(..public.len())
            .ok_or(CertError::BufferTooSmall)?;
        target.copy_from_slice(&public);
        Ok(public.len())
    }

    fn signing_key(&self, id: KeyId) -> Result<EcdsaKey, CertError> {
        self.keys.get(&id).cloned().ok_or(CertError::InvalidHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{DerSignature, VerifyingKey};

    fn store() -> MemoryKeyStore {
        MemoryKeyStore::new(rand_core::OsRng)
    }

    #[test]
    fn test_generate_and_export() {
        let mut keys = store();
        let attributes = KeyAttributes::signing(KeyAlgorithm::Secp256r1);
        assert_eq!(keys.generate(1, &attributes), Ok(1));
        assert_eq!(keys.generate(1, &attributes), Err(CertError::AlreadyExists));

        let mut public = [0u8; 80];
        assert_eq!(keys.export_public_key(1, &mut public), Ok(65));
        assert_eq!(public[0], 0x04);

        let mut short = [0u8; 64];
        assert_eq!(
            keys.export_public_key(1, &mut short),
            Err(CertError::BufferTooSmall)
        );
    }

    #[test]
    fn test_unsupported_and_missing_keys() {
        let mut keys = store();
        assert_eq!(
            keys.generate(2, &KeyAttributes::signing(KeyAlgorithm::Secp384r1)),
            Err(CertError::NotSupported)
        );
        assert_eq!(keys.destroy(2), Err(CertError::InvalidHandle));
        assert!(keys.signing_key(2).is_err());
    }

    #[test]
    fn test_signatures_verify() {
        let mut keys = store();
        keys.generate(3, &KeyAttributes::signing(KeyAlgorithm::Secp256r1))
            .unwrap();
        let key = keys.signing_key(3).unwrap();
        let verifier = VerifyingKey::from_sec1_bytes(&key.public_key()).unwrap();

        let tls_signature = Signer::sign(&key, b"handshake").unwrap();
        let der = DerSignature::try_from(tls_signature.as_slice()).unwrap();
        assert!(verifier.verify(b"handshake", &der).is_ok());

        let csr_signature = key.sign_with_rng(&mut rand_core::OsRng, b"request");
        let der = DerSignature::try_from(csr_signature.as_slice()).unwrap();
        assert!(verifier.verify(b"request", &der).is_ok());
    }

    #[test]
    fn test_scheme_selection() {
        let key = EcdsaKey::generate(&mut rand_core::OsRng);
        assert!(key
            .choose_scheme(&[SignatureScheme::RSA_PSS_SHA256])
            .is_none());
        let signer = key
            .choose_scheme(&[
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
            ])
            .unwrap();
        assert_eq!(signer.scheme(), SignatureScheme::ECDSA_NISTP256_SHA256);
    }
}
