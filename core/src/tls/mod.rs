//! TLS client network link
//!
//! [`TlsClient`] layers a rustls client session over any transport
//! [`NetworkLink`](crate::network::NetworkLink) and is itself a network
//! link carrying cleartext. The session is driven by a single cooperative
//! worker task; nothing here blocks.
//!
//! Clients share a reference-counted [`TlsConfig`]. The configuration is
//! mutable only until the first client locks it.
//!
//! The [`certs`] operations provision device identity: key pair
//! generation, CSR creation and certificate storage.

mod client;
mod config;
mod drbg;
mod keys;
mod support;

pub mod certs;

pub use client::{ClientError, ClientOptions, ClientState, TlsClient};
pub use config::{ConfigError, LockState, TlsConfig, VerifyMode, LOCK_COUNT_MAX};
pub use keys::{
    EcdsaKey, KeyAlgorithm, KeyAttributes, KeyId, KeyLifetime, KeyStore, MemoryKeyStore,
};
pub use support::{adapter_receive, adapter_send, LinkIo, Session, SessionError, TlsFault};
