//! Certificate provisioning
//!
//! Commissioning-time operations that give a device its identity: create a
//! persistent key pair, build a certificate signing request for it, and
//! store the signed certificate returned by the CA in tagged nonvolatile
//! storage, where [`TlsConfig`](super::TlsConfig) picks it up.

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::vec;
use alloc::vec::Vec;
use std::sync::Mutex;

use hal_abstractions::rng::EntropySource;
use hal_abstractions::storage::{RecordStore, RecordTag, StorageError};
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, RemoteKeyPair};
use rustls_pemfile::Item;

use crate::buffers::Buffer;
use crate::options::{MAX_DER_CERT_SIZE, MAX_PEM_CERT_SIZE};
use crate::{debug, warn};

use super::keys::{EcdsaKey, KeyAlgorithm, KeyAttributes, KeyId, KeyStore};

/// Certificate and key operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CertError {
    InvalidArgument,
    BufferTooSmall,
    NotSupported,
    NotPermitted,
    AlreadyExists,
    InvalidHandle,
    HsmCommsError,
    HsmStorageError,
    EntropyFailure,
    OutOfMemory,
    HsmCorruption,
    InvalidData,
    EepromAccessError,
    GenericError,
}

impl core::fmt::Display for CertError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::BufferTooSmall => write!(f, "Buffer too small"),
            Self::NotSupported => write!(f, "Not supported"),
            Self::NotPermitted => write!(f, "Not permitted"),
            Self::AlreadyExists => write!(f, "Key already exists"),
            Self::InvalidHandle => write!(f, "Invalid key handle"),
            Self::HsmCommsError => write!(f, "Key store communication error"),
            Self::HsmStorageError => write!(f, "Key store storage error"),
            Self::EntropyFailure => write!(f, "Entropy source failure"),
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::HsmCorruption => write!(f, "Key store corrupted"),
            Self::InvalidData => write!(f, "Invalid data"),
            Self::EepromAccessError => write!(f, "Record storage access error"),
            Self::GenericError => write!(f, "Certificate operation failed"),
        }
    }
}

impl core::error::Error for CertError {}

impl From<StorageError> for CertError {
    fn from(_: StorageError) -> Self {
        Self::EepromAccessError
    }
}

impl From<rcgen::Error> for CertError {
    fn from(error: rcgen::Error) -> Self {
        match error {
            rcgen::Error::RemoteKeyError => Self::HsmCommsError,
            rcgen::Error::KeyGenerationUnavailable
            | rcgen::Error::UnsupportedSignatureAlgorithm => Self::NotSupported,
            _ => Self::GenericError,
        }
    }
}

/// Digest used to sign a CSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CsrDigest {
    Sha256,
    Sha384,
    Sha512,
}

/// Picks the CSR digest matching the strength of a key.
pub fn digest_for_key_bits(bits: usize) -> CsrDigest {
    if bits <= 256 {
        CsrDigest::Sha256
    } else if bits <= 384 {
        CsrDigest::Sha384
    } else {
        CsrDigest::Sha512
    }
}

/// Generates a persistent signing key pair in slot `id`.
pub fn create_key_pair<K: KeyStore + ?Sized>(
    keys: &mut K,
    id: KeyId,
    algorithm: KeyAlgorithm,
) -> Result<(), CertError> {
    if algorithm != KeyAlgorithm::Secp256r1 {
        return Err(CertError::NotSupported);
    }
    let assigned = keys.generate(id, &KeyAttributes::signing(algorithm))?;
    if assigned != id {
        warn!("key generated in slot {} instead of {}", assigned, id);
        return Err(CertError::InvalidHandle);
    }
    debug!("generated key pair in slot {}", id);
    Ok(())
}

pub fn destroy_key_pair<K: KeyStore + ?Sized>(keys: &mut K, id: KeyId) -> Result<(), CertError> {
    keys.destroy(id)
}

/// Writes the public key of slot `id` to `out`, returning its size.
pub fn export_public_key<K: KeyStore + ?Sized>(
    keys: &K,
    id: KeyId,
    out: &mut [u8],
) -> Result<usize, CertError> {
    keys.export_public_key(id, out)
}

struct CsrSigner {
    key: EcdsaKey,
    public: Vec<u8>,
    drbg: Mutex<ChaCha20Rng>,
}

impl RemoteKeyPair for CsrSigner {
    fn public_key(&self) -> &[u8] {
        &self.public
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        let mut drbg = self.drbg.lock().map_err(|_| rcgen::Error::RemoteKeyError)?;
        Ok(self.key.sign_with_rng(&mut *drbg, msg))
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

fn parse_subject(subject: &str) -> Result<DistinguishedName, CertError> {
    let mut name = DistinguishedName::new();
    for component in subject.split(',').map(str::trim) {
        let (key, value) = component
            .split_once('=')
            .ok_or(CertError::InvalidArgument)?;
        let kind = match key.trim() {
            "CN" => DnType::CommonName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "C" => DnType::CountryName,
            "ST" => DnType::StateOrProvinceName,
            "L" => DnType::LocalityName,
            _ => return Err(CertError::InvalidData),
        };
        name.push(kind, DnValue::Utf8String(value.trim().to_string()));
    }
    Ok(name)
}

/// Builds a PEM certificate signing request for the key in slot `id` and
/// appends it to `out`. The signing nonce comes from a DRBG seeded from
/// `entropy`.
pub fn build_csr_pem<K: KeyStore + ?Sized>(
    keys: &K,
    id: KeyId,
    subject: &str,
    entropy: &mut dyn EntropySource,
    out: &mut Buffer,
) -> Result<(), CertError> {
    if subject.is_empty() {
        return Err(CertError::InvalidArgument);
    }
    let key = keys.signing_key(id)?;
    let digest = digest_for_key_bits(key.bits());
    if digest != CsrDigest::Sha256 {
        warn!("no CSR signature scheme for {:?}", digest);
        return Err(CertError::NotSupported);
    }
    let drbg = ChaCha20Rng::from_rng(entropy).map_err(|_| CertError::EntropyFailure)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = parse_subject(subject)?;
    let signer = CsrSigner {
        public: key.public_key(),
        key,
        drbg: Mutex::new(drbg),
    };
    let key_pair = KeyPair::from_remote(Box::new(signer))?;
    let pem = params.serialize_request(&key_pair)?.pem()?;

    if pem.len() >= MAX_PEM_CERT_SIZE {
        return Err(CertError::BufferTooSmall);
    }
    if !out.append(pem.as_bytes()) {
        return Err(CertError::OutOfMemory);
    }
    debug!("built {} byte CSR for slot {}", pem.len(), id);
    Ok(())
}

/// Length of the DER certificate at the start of `bytes`, from its outer
/// SEQUENCE header. Trailing bytes (record padding) are not counted.
pub fn der_certificate_len(bytes: &[u8]) -> Option<usize> {
    let (&tag, rest) = bytes.split_first()?;
    if tag != 0x30 {
        return None;
    }
    let (&first, rest) = rest.split_first()?;
    let (content_len, header_len) = if first & 0x80 == 0 {
        (first as usize, 2)
    } else {
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 2 || rest.len() < count {
            return None;
        }
        let length = rest[..count]
            .iter()
            .fold(0usize, |acc, &byte| (acc << 8) | byte as usize);
        (length, 2 + count)
    };
    let total = header_len + content_len;
    (total <= bytes.len()).then_some(total)
}

/// Converts the PEM certificate found at `offset` in `input` to DER and
/// writes it to record `tag`, creating the record if needed. With `pad`
/// the record is sized for the largest supported certificate. Returns the
/// number of PEM bytes parsed.
pub fn store_certificate_pem<S: RecordStore + ?Sized>(
    store: &mut S,
    tag: RecordTag,
    input: &Buffer,
    offset: usize,
    pad: bool,
) -> Result<usize, CertError> {
    let available = input
        .len()
        .checked_sub(offset)
        .ok_or(CertError::InvalidArgument)?;
    let mut pem = [0u8; MAX_PEM_CERT_SIZE];
    let copied = input.read(offset, &mut pem[..available.min(MAX_PEM_CERT_SIZE - 1)]);

    let (der, parsed) = match rustls_pemfile::read_one_from_slice(&pem[..copied]) {
        Ok(Some((Item::X509Certificate(der), rest))) => (der, copied - rest.len()),
        _ => return Err(CertError::InvalidData),
    };
    if der.len() > MAX_DER_CERT_SIZE {
        return Err(CertError::OutOfMemory);
    }

    let mut record = vec![0u8; if pad { MAX_DER_CERT_SIZE } else { der.len() }];
    record[..der.len()].copy_from_slice(&der);
    match store.create(tag, record.len(), None) {
        Ok(()) | Err(StorageError::TagExists) => {}
        Err(error) => return Err(error.into()),
    }
    store.write(tag, &record)?;
    debug!("stored {} byte certificate in record {}", der.len(), tag);
    Ok(parsed)
}

/// Logs PEM text line by line at debug level.
pub fn log_pem(pem: &Buffer) {
    for line in pem.as_slice().split(|&byte| byte == b'\n') {
        if let Ok(text) = core::str::from_utf8(line) {
            debug!("{}", text.trim_end());
        }
    }
}
