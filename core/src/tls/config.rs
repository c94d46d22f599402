//! Shared TLS client configuration
//!
//! A [`TlsConfig`] is built up while `Allocated` (CA certificates, client
//! identity, server name) and frozen by the first [`TlsConfig::lock`],
//! which runs the one-time setup. Each client holds one lock for as long as
//! it is configured; the configuration can only be freed once no client
//! holds it.
//!
//! ```text
//! Unallocated --create--> Allocated --lock--> Locked(1) --lock--> Locked(2) ...
//!      ^                      |                    |
//!      +--------free----------+<--free-- Locked(0) <--unlock--+
//! ```

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;

use hal_abstractions::rng::EntropySource;
use hal_abstractions::storage::{RecordStore, RecordTag, StorageError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ResolvesClientCert, Resumption};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::options::MAX_DER_CERT_SIZE;
use crate::{debug, warn};

use super::certs::{der_certificate_len, CertError};
use super::drbg;
use super::keys::{EcdsaKey, KeyId, KeyStore};

/// Highest lock count a configuration supports.
pub const LOCK_COUNT_MAX: u8 = 0xFD;

const DEFAULT_SERVER_NAME: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LockState {
    /// No support structure exists.
    Unallocated,
    /// Allocated and open for mutation.
    Allocated,
    /// Set up and frozen; the count is the number of clients holding it.
    Locked(u8),
}

/// Server authentication mode chosen at first lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerifyMode {
    Required,
    None,
}

/// TLS configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Operation not valid in the current lock state
    InvalidState(LockState),
    /// Configuration is still held by a client
    InUse,
    /// Lock count is at its maximum
    LockLimit,
    /// Certificate record could not be read
    Storage(StorageError),
    /// Certificate record exceeds the maximum DER size
    CertificateTooLarge,
    /// Certificate could not be parsed
    InvalidCertificate,
    /// PEM input contained no certificate
    NoCertificate,
    /// Server name is not a valid DNS name or IP address
    InvalidServerName,
    /// Client key could not be bound
    Key(CertError),
    /// Entropy source failed while seeding the DRBG
    Entropy,
    /// TLS library rejected the configuration
    Setup,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidState(state) => write!(f, "Invalid in configuration state {:?}", state),
            Self::InUse => write!(f, "Configuration in use"),
            Self::LockLimit => write!(f, "Configuration lock limit reached"),
            Self::Storage(error) => write!(f, "Certificate storage error: {}", error),
            Self::CertificateTooLarge => write!(f, "Certificate too large"),
            Self::InvalidCertificate => write!(f, "Invalid certificate"),
            Self::NoCertificate => write!(f, "No certificate found"),
            Self::InvalidServerName => write!(f, "Invalid server name"),
            Self::Key(error) => write!(f, "Client key error: {}", error),
            Self::Entropy => write!(f, "Entropy source failure"),
            Self::Setup => write!(f, "TLS configuration setup failed"),
        }
    }
}

impl core::error::Error for ConfigError {}

impl From<StorageError> for ConfigError {
    fn from(error: StorageError) -> Self {
        Self::Storage(error)
    }
}

/// Accepts any server certificate but still checks handshake signatures,
/// so the peer must hold the key for the certificate it presents.
#[derive(Debug)]
struct UnverifiedServer {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for UnverifiedServer {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct ClientIdentity(Arc<CertifiedKey>);

impl ResolvesClientCert for ClientIdentity {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

struct ConfigSupport {
    entropy: Box<dyn EntropySource>,
    server_name: ServerName<'static>,
    ca_roots: RootCertStore,
    own_chain: Vec<CertificateDer<'static>>,
    own_key: Option<EcdsaKey>,
    client_config: Option<Arc<ClientConfig>>,
    verify_mode: Option<VerifyMode>,
}

impl ConfigSupport {
    fn new(entropy: Box<dyn EntropySource>) -> Result<Self, ConfigError> {
        Ok(Self {
            entropy,
            server_name: ServerName::try_from(DEFAULT_SERVER_NAME)
                .map_err(|_| ConfigError::InvalidServerName)?,
            ca_roots: RootCertStore::empty(),
            own_chain: Vec::new(),
            own_key: None,
            client_config: None,
            verify_mode: None,
        })
    }

    /// One-time setup run on the first lock.
    fn setup(&mut self) -> Result<(), ConfigError> {
        drbg::reseed(self.entropy.as_mut()).map_err(|_| ConfigError::Entropy)?;

        let provider = drbg::provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|_| ConfigError::Setup)?;

        let (builder, mode) = if self.ca_roots.is_empty() {
            warn!("no CA certificates configured; server verification is disabled");
            let verifier = UnverifiedServer {
                algorithms: provider.signature_verification_algorithms,
            };
            (
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verifier)),
                VerifyMode::None,
            )
        } else {
            (
                builder.with_root_certificates(self.ca_roots.clone()),
                VerifyMode::Required,
            )
        };

        let mut config = match &self.own_key {
            Some(key) if !self.own_chain.is_empty() => {
                let identity = CertifiedKey::new(self.own_chain.clone(), key.tls_signing_key());
                builder.with_client_cert_resolver(Arc::new(ClientIdentity(Arc::new(identity))))
            }
            _ => builder.with_no_client_auth(),
        };
        config.resumption = Resumption::disabled();

        debug!(
            "TLS configuration locked: {} CA certificates, {} own certificates",
            self.ca_roots.len(),
            self.own_chain.len()
        );
        self.client_config = Some(Arc::new(config));
        self.verify_mode = Some(mode);
        Ok(())
    }
}

struct ConfigState {
    lock: LockState,
    support: Option<ConfigSupport>,
}

/// Reference-counted TLS client configuration.
///
/// Cloning yields another handle to the same configuration.
#[derive(Clone)]
pub struct TlsConfig {
    state: Rc<RefCell<ConfigState>>,
}

impl core::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("lock", &self.lock_state())
            .finish()
    }
}

impl TlsConfig {
    /// Creates an unallocated configuration, initialising the process-wide
    /// TLS library state on first use.
    pub fn init() -> Self {
        drbg::provider();
        Self {
            state: Rc::new(RefCell::new(ConfigState {
                lock: LockState::Unallocated,
                support: None,
            })),
        }
    }

    pub fn lock_state(&self) -> LockState {
        self.state.borrow().lock
    }

    /// Allocates the support structure. `entropy` seeds the session DRBG
    /// when the configuration is first locked.
    pub fn create(&self, entropy: impl EntropySource + 'static) -> Result<(), ConfigError> {
        let mut state = self.state.borrow_mut();
        if state.lock != LockState::Unallocated {
            return Err(ConfigError::InvalidState(state.lock));
        }
        state.support = Some(ConfigSupport::new(Box::new(entropy))?);
        state.lock = LockState::Allocated;
        Ok(())
    }

    /// Releases the support structure. Fails while any client holds a lock.
    pub fn free(&self) -> Result<(), ConfigError> {
        let mut state = self.state.borrow_mut();
        match state.lock {
            LockState::Allocated | LockState::Locked(0) => {
                state.support = None;
                state.lock = LockState::Unallocated;
                Ok(())
            }
            LockState::Locked(_) => Err(ConfigError::InUse),
            LockState::Unallocated => Err(ConfigError::InvalidState(LockState::Unallocated)),
        }
    }

    /// Takes a lock. The first lock runs the one-time setup.
    pub fn lock(&self) -> Result<(), ConfigError> {
        let mut state = self.state.borrow_mut();
        match state.lock {
            LockState::Allocated => {
                let support = state
                    .support
                    .as_mut()
                    .ok_or(ConfigError::InvalidState(LockState::Allocated))?;
                support.setup()?;
                state.lock = LockState::Locked(1);
            }
            LockState::Locked(count) if count < LOCK_COUNT_MAX => {
                state.lock = LockState::Locked(count + 1);
            }
            LockState::Locked(_) => return Err(ConfigError::LockLimit),
            LockState::Unallocated => {
                return Err(ConfigError::InvalidState(LockState::Unallocated))
            }
        }
        Ok(())
    }

    pub fn unlock(&self) -> Result<(), ConfigError> {
        let mut state = self.state.borrow_mut();
        match state.lock {
            LockState::Locked(count) if count > 0 => {
                state.lock = LockState::Locked(count - 1);
                Ok(())
            }
            other => Err(ConfigError::InvalidState(other)),
        }
    }

    /// Server authentication mode, known once the configuration is locked.
    pub fn verify_mode(&self) -> Option<VerifyMode> {
        self.state
            .borrow()
            .support
            .as_ref()
            .and_then(|support| support.verify_mode)
    }

    fn with_allocated<R>(
        &self,
        f: impl FnOnce(&mut ConfigSupport) -> Result<R, ConfigError>,
    ) -> Result<R, ConfigError> {
        let mut state = self.state.borrow_mut();
        let lock = state.lock;
        match state.support.as_mut() {
            Some(support) if lock == LockState::Allocated => f(support),
            _ => Err(ConfigError::InvalidState(lock)),
        }
    }

    /// Sets the name used for SNI and server certificate hostname checks.
    pub fn set_server_name(&self, name: &str) -> Result<(), ConfigError> {
        let server_name =
            ServerName::try_from(name.to_string()).map_err(|_| ConfigError::InvalidServerName)?;
        self.with_allocated(|support| {
            support.server_name = server_name;
            Ok(())
        })
    }

    /// Adds a trusted CA certificate stored as DER in record `tag`.
    pub fn add_ca_cert_from_record<S: RecordStore + ?Sized>(
        &self,
        store: &S,
        tag: RecordTag,
    ) -> Result<(), ConfigError> {
        self.with_allocated(|support| {
            let der = read_der_record(store, tag)?;
            support.ca_roots.add(der).map_err(|_| {
                warn!("CA certificate in record {} rejected", tag);
                ConfigError::InvalidCertificate
            })
        })
    }

    /// Adds every CA certificate found in a PEM string.
    pub fn add_ca_cert_from_pem(&self, pem: &str) -> Result<(), ConfigError> {
        self.with_allocated(|support| {
            let mut added = 0;
            for item in rustls_pemfile::certs(&mut pem.as_bytes()) {
                let der = item.map_err(|_| ConfigError::InvalidCertificate)?;
                support
                    .ca_roots
                    .add(der)
                    .map_err(|_| ConfigError::InvalidCertificate)?;
                added += 1;
            }
            if added == 0 {
                return Err(ConfigError::NoCertificate);
            }
            Ok(())
        })
    }

    /// Appends the DER certificate in record `tag` to the client identity
    /// chain. The first call also binds the private key in slot `key_id`.
    pub fn add_own_cert_from_record<S, K>(
        &self,
        store: &S,
        tag: RecordTag,
        keys: &K,
        key_id: KeyId,
    ) -> Result<(), ConfigError>
    where
        S: RecordStore + ?Sized,
        K: KeyStore + ?Sized,
    {
        self.with_allocated(|support| {
            let der = read_der_record(store, tag)?;
            if support.own_chain.is_empty() {
                support.own_key = Some(keys.signing_key(key_id).map_err(ConfigError::Key)?);
            }
            support.own_chain.push(der);
            Ok(())
        })
    }

    /// Session parameters for a client holding a lock.
    pub(crate) fn session_parameters(
        &self,
    ) -> Result<(Arc<ClientConfig>, ServerName<'static>), ConfigError> {
        let state = self.state.borrow();
        let lock = state.lock;
        match (lock, state.support.as_ref()) {
            (LockState::Locked(count), Some(support)) if count > 0 => support
                .client_config
                .clone()
                .map(|config| (config, support.server_name.clone()))
                .ok_or(ConfigError::Setup),
            _ => Err(ConfigError::InvalidState(lock)),
        }
    }
}

fn read_der_record<S: RecordStore + ?Sized>(
    store: &S,
    tag: RecordTag,
) -> Result<CertificateDer<'static>, ConfigError> {
    if store.record_len(tag)? > MAX_DER_CERT_SIZE {
        return Err(ConfigError::CertificateTooLarge);
    }
    let mut record = [0u8; MAX_DER_CERT_SIZE];
    let length = store.read_all(tag, &mut record)?;
    let der_len = der_certificate_len(&record[..length]).ok_or(ConfigError::InvalidCertificate)?;
    Ok(CertificateDer::from(record[..der_len].to_vec()))
}
