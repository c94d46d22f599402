//! Test PKI and an in-process TLS server peer for driving a `TlsClient`
//! over the loopback transport.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::sync::Arc;

use iot_net_core::buffers::{Buffer, MemPool};
use iot_net_core::network::loopback::{self, LoopbackLink};
use iot_net_core::network::{NetworkLink, NetworkStatus};
use iot_net_core::scheduler::Scheduler;
use iot_net_core::tls::{ClientState, TlsClient, TlsConfig};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, IsCa,
    KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection};

/// Upper bound on scheduler ticks for any one phase of a test.
pub const MAX_TICKS: u64 = 40_000;

const LINK_WINDOW: usize = 16 * 1024;
const SERVER_SEND_CHUNK: usize = 1024;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A private CA with one server certificate for "localhost".
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
    server_cert: Certificate,
    server_key: KeyPair,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server_cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();

        Self {
            ca_cert,
            ca_key,
            server_cert,
            server_key,
        }
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Signs a PEM certificate signing request, returning the PEM certificate.
    pub fn sign_csr(&self, csr_pem: &str) -> String {
        CertificateSigningRequestParams::from_pem(csr_pem)
            .unwrap()
            .signed_by(&self.ca_cert, &self.ca_key)
            .unwrap()
            .pem()
    }

    /// Server configuration. With `require_client_auth` the server demands a
    /// client certificate issued by this CA.
    pub fn server_config(&self, require_client_auth: bool) -> Arc<ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap();
        let builder = if require_client_auth {
            let mut roots = RootCertStore::empty();
            roots.add(self.ca_der()).unwrap();
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .unwrap();
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key.serialize_der()));
        Arc::new(
            builder
                .with_single_cert(vec![self.server_cert.der().clone()], key)
                .unwrap(),
        )
    }
}

/// Client configuration trusting `ca_pem`, or nothing at all.
pub fn client_config(ca_pem: Option<&str>) -> TlsConfig {
    let config = TlsConfig::init();
    config.create(rand_core::OsRng).unwrap();
    if let Some(pem) = ca_pem {
        config.add_ca_cert_from_pem(pem).unwrap();
    }
    config
}

/// A rustls server on the far end of a loopback link, pumped once per tick.
pub struct ServerPeer {
    config: Arc<ServerConfig>,
    conn: ServerConnection,
    link: LoopbackLink,
    pool: MemPool,
    pending_out: Vec<u8>,
    /// Cleartext received from the client.
    pub inbox: Vec<u8>,
    /// Inbox length at the moment close_notify arrived.
    pub close_notify_at: Option<usize>,
    pub error: Option<rustls::Error>,
}

impl ServerPeer {
    pub fn new(config: Arc<ServerConfig>, link: LoopbackLink) -> Self {
        let conn = ServerConnection::new(config.clone()).unwrap();
        Self {
            config,
            conn,
            link,
            pool: MemPool::new(64, 1024),
            pending_out: Vec::new(),
            inbox: Vec::new(),
            close_notify_at: None,
            error: None,
        }
    }

    /// Starts a fresh server session for the next connection.
    pub fn restart(&mut self) {
        self.conn = ServerConnection::new(self.config.clone()).unwrap();
        self.pending_out.clear();
        self.inbox.clear();
        self.close_notify_at = None;
        self.error = None;
    }

    pub fn is_handshake_complete(&self) -> bool {
        !self.conn.is_handshaking()
    }

    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.conn
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
    }

    /// Queues cleartext for the client.
    pub fn send(&mut self, data: &[u8]) {
        self.conn.writer().write_all(data).unwrap();
    }

    /// Starts an orderly close from the server side.
    pub fn close(&mut self) {
        self.conn.send_close_notify();
    }

    pub fn link(&self) -> &LoopbackLink {
        &self.link
    }

    pub fn pump(&mut self) {
        self.receive();
        self.transmit();
    }

    fn receive(&mut self) {
        if self.error.is_some() {
            return;
        }
        loop {
            let mut payload = Buffer::new(&self.pool);
            if self.link.receive(&mut payload) != NetworkStatus::Success {
                return;
            }
            let mut data = payload.as_slice();
            while !data.is_empty() {
                match self.conn.read_tls(&mut data) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                if let Err(error) = self.conn.process_new_packets() {
                    self.error = Some(error);
                    return;
                }
                self.drain_plaintext();
            }
        }
    }

    fn drain_plaintext(&mut self) {
        let mut chunk = [0u8; 1024];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    if self.close_notify_at.is_none() {
                        self.close_notify_at = Some(self.inbox.len());
                        self.conn.send_close_notify();
                    }
                    return;
                }
                Ok(count) => self.inbox.extend_from_slice(&chunk[..count]),
                Err(_) => return,
            }
        }
    }

    fn transmit(&mut self) {
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut self.pending_out).is_err() {
                break;
            }
        }
        while !self.pending_out.is_empty() {
            let size = self.pending_out.len().min(SERVER_SEND_CHUNK);
            let Some(mut payload) = Buffer::from_slice(&self.pool, &self.pending_out[..size])
            else {
                return;
            };
            if self.link.send(&mut payload) != NetworkStatus::Success {
                return;
            }
            self.pending_out.drain(..size);
        }
    }
}

/// A TLS client and server peer joined by a loopback pair, with the
/// scheduler that drives them.
pub struct Harness {
    pub sched: Scheduler,
    pub client: TlsClient<LoopbackLink>,
    pub server: ServerPeer,
    pub pool: MemPool,
    /// Distinct client states in the order they were observed.
    pub states: Vec<ClientState>,
}

impl Harness {
    pub fn new(server_config: Arc<ServerConfig>, pool: MemPool) -> Self {
        let (transport, server_link) = loopback::pair(LINK_WINDOW);
        Self {
            sched: Scheduler::new(),
            client: TlsClient::init(transport, &pool),
            server: ServerPeer::new(server_config, server_link),
            pool,
            states: Vec::new(),
        }
    }

    /// Runs client and server one tick at a time until `done` holds.
    pub fn run_until(&mut self, max_ticks: u64, mut done: impl FnMut(&mut Self) -> bool) -> bool {
        for _ in 0..max_ticks {
            self.sched.visit(&mut self.client);
            self.record_state();
            self.server.pump();
            let finished = done(self);
            // `done` may drive the client itself, e.g. through `disconnect`.
            self.record_state();
            if finished {
                return true;
            }
            self.sched.tick();
        }
        false
    }

    fn record_state(&mut self) {
        let state = self.client.state();
        if self.states.last() != Some(&state) {
            self.states.push(state);
        }
    }

    /// Connects and runs until the client is connected or has failed.
    pub fn connect(&mut self) -> ClientState {
        assert_eq!(self.client.connect(), NetworkStatus::Success);
        self.run_until(MAX_TICKS, |h| {
            matches!(h.client.state(), ClientState::Connected | ClientState::Failure)
        });
        self.client.state()
    }

    /// Polls `disconnect` until it reports the close complete.
    pub fn close(&mut self) -> bool {
        self.run_until(MAX_TICKS, |h| {
            h.client.disconnect() == NetworkStatus::Success
        })
    }

    /// Queues `data` on the client as one buffer.
    pub fn client_send(&mut self, data: &[u8]) -> NetworkStatus {
        let mut payload = Buffer::from_slice(&self.pool, data).unwrap();
        self.client.send(&mut payload)
    }

    /// Moves everything the client has received into `out`, returning the
    /// size of each buffer taken.
    pub fn client_drain(&mut self, out: &mut Vec<u8>) -> Vec<usize> {
        let mut sizes = Vec::new();
        loop {
            let mut payload = Buffer::new(&self.pool);
            if self.client.receive(&mut payload) != NetworkStatus::Success {
                return sizes;
            }
            sizes.push(payload.len());
            out.extend_from_slice(payload.as_slice());
        }
    }
}

/// Deterministic test pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
