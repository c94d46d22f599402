//! Session adapter between rustls and a transport link
//!
//! rustls consumes and produces ciphertext through `std::io` traits. A
//! [`LinkIo`] borrows the client's transport, its intermediate RX buffer and
//! its memory pool for the duration of one session call and presents them
//! as a non-blocking byte stream: "not now" surfaces as `WouldBlock`, which
//! the [`Session`] turns back into [`SessionError::WantRead`] or
//! [`SessionError::WantWrite`].

use alloc::sync::Arc;
use std::io::{self, Read, Write};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};

use crate::buffers::{Buffer, MemPool};
use crate::network::{NetworkLink, NetworkStatus};
use crate::{trace, warn};

/// Classified fatal TLS error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TlsFault {
    /// Peer certificate missing or rejected
    BadCertificate,
    /// Peer sent a fatal alert
    AlertReceived,
    /// Peer violated the protocol
    PeerMisbehaved,
    /// Record failed to decrypt
    Decrypt,
    /// Any other TLS library error
    General,
}

impl From<&rustls::Error> for TlsFault {
    fn from(error: &rustls::Error) -> Self {
        use rustls::Error;
        match error {
            Error::InvalidCertificate(_) | Error::NoCertificatesPresented => Self::BadCertificate,
            Error::AlertReceived(_) => Self::AlertReceived,
            Error::PeerMisbehaved(_)
            | Error::InvalidMessage(_)
            | Error::InappropriateMessage { .. }
            | Error::InappropriateHandshakeMessage { .. } => Self::PeerMisbehaved,
            Error::DecryptError => Self::Decrypt,
            _ => Self::General,
        }
    }
}

impl core::fmt::Display for TlsFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadCertificate => write!(f, "Bad certificate"),
            Self::AlertReceived => write!(f, "Fatal alert received"),
            Self::PeerMisbehaved => write!(f, "Peer misbehaved"),
            Self::Decrypt => write!(f, "Decryption failed"),
            Self::General => write!(f, "TLS error"),
        }
    }
}

/// Session operation outcome other than progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionError {
    /// More ciphertext must arrive before progress is possible
    WantRead,
    /// The transport cannot take ciphertext right now
    WantWrite,
    /// An asynchronous operation is in progress
    AsyncInProgress,
    /// A cryptographic operation is in progress
    CryptoInProgress,
    /// The transport failed or closed underneath the session
    ConnectionReset,
    /// The peer closed the session with close_notify
    PeerClosed,
    /// Fatal protocol error
    Fatal(TlsFault),
}

impl SessionError {
    /// True for the codes that only ask to be called again later.
    pub fn is_wait(self) -> bool {
        matches!(
            self,
            Self::WantRead | Self::WantWrite | Self::AsyncInProgress | Self::CryptoInProgress
        )
    }
}

impl core::fmt::Display for SessionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::WantRead => write!(f, "Want read"),
            Self::WantWrite => write!(f, "Want write"),
            Self::AsyncInProgress => write!(f, "Asynchronous operation in progress"),
            Self::CryptoInProgress => write!(f, "Cryptographic operation in progress"),
            Self::ConnectionReset => write!(f, "Connection reset"),
            Self::PeerClosed => write!(f, "Peer closed session"),
            Self::Fatal(fault) => write!(f, "Fatal TLS error: {}", fault),
        }
    }
}

impl core::error::Error for SessionError {}

/// Sends ciphertext over `transport`, returning the number of bytes taken.
///
/// At most half of the pool's free capacity is used, so one large record
/// cannot starve other users of the pool. The transient buffer is released
/// before returning whatever the outcome.
pub fn adapter_send<T: NetworkLink + ?Sized>(
    transport: &mut T,
    pool: &MemPool,
    data: &[u8],
) -> Result<usize, SessionError> {
    if data.is_empty() {
        return Ok(0);
    }
    let capacity = (pool.segments_available() / 2) * pool.segment_size();
    let size = data.len().min(capacity);
    if size == 0 {
        trace!("adapter send: pool exhausted");
        return Err(SessionError::WantWrite);
    }

    let mut buffer = Buffer::new(pool);
    if !buffer.append(&data[..size]) {
        return Err(SessionError::WantWrite);
    }
    match transport.send(&mut buffer) {
        NetworkStatus::Success => Ok(size),
        NetworkStatus::Retry => Err(SessionError::WantWrite),
        status => {
            warn!("transport send failed: {:?}", status);
            Err(SessionError::ConnectionReset)
        }
    }
}

/// Copies received ciphertext into `out`, refilling `rx_buffer` from
/// `transport` once it has been drained.
pub fn adapter_receive<T: NetworkLink + ?Sized>(
    transport: &mut T,
    rx_buffer: &mut Buffer,
    out: &mut [u8],
) -> Result<usize, SessionError> {
    if rx_buffer.is_empty() {
        match transport.receive(rx_buffer) {
            NetworkStatus::Success => {}
            NetworkStatus::Retry => return Err(SessionError::WantRead),
            status => {
                trace!("transport receive: {:?}", status);
                return Err(SessionError::ConnectionReset);
            }
        }
        if rx_buffer.is_empty() {
            return Err(SessionError::WantRead);
        }
    }
    let count = rx_buffer.read(0, out);
    rx_buffer.advance(count);
    Ok(count)
}

fn to_io(error: SessionError) -> io::Error {
    match error {
        SessionError::WantRead | SessionError::WantWrite => io::ErrorKind::WouldBlock.into(),
        _ => io::ErrorKind::ConnectionReset.into(),
    }
}

/// Non-blocking ciphertext stream over a borrowed transport.
pub struct LinkIo<'a> {
    transport: &'a mut dyn NetworkLink,
    rx_buffer: &'a mut Buffer,
    pool: &'a MemPool,
}

impl<'a> LinkIo<'a> {
    pub fn new(
        transport: &'a mut dyn NetworkLink,
        rx_buffer: &'a mut Buffer,
        pool: &'a MemPool,
    ) -> Self {
        Self {
            transport,
            rx_buffer,
            pool,
        }
    }
}

impl Read for LinkIo<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        adapter_receive(&mut *self.transport, &mut *self.rx_buffer, out).map_err(to_io)
    }
}

impl Write for LinkIo<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        adapter_send(&mut *self.transport, self.pool, data).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A client-side TLS session.
pub struct Session {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    conn: ClientConnection,
    close_sent: bool,
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("server_name", &self.server_name)
            .field("handshaking", &self.conn.is_handshaking())
            .field("close_sent", &self.close_sent)
            .finish()
    }
}

impl Session {
    pub fn new(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, TlsFault> {
        let conn = ClientConnection::new(config.clone(), server_name.clone())
            .map_err(|error| TlsFault::from(&error))?;
        Ok(Self {
            config,
            server_name,
            conn,
            close_sent: false,
        })
    }

    /// Restarts with a fresh connection on the same configuration.
    pub fn reset(&mut self) -> Result<(), TlsFault> {
        self.conn = ClientConnection::new(self.config.clone(), self.server_name.clone())
            .map_err(|error| TlsFault::from(&error))?;
        self.close_sent = false;
        Ok(())
    }

    pub fn is_handshake_over(&self) -> bool {
        !self.conn.is_handshaking()
    }

    /// True while ciphertext is waiting to be written to the transport.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Advances the handshake as far as the transport allows.
    pub fn handshake(&mut self, io: &mut LinkIo<'_>) -> Result<(), SessionError> {
        loop {
            self.flush(io)?;
            if !self.conn.is_handshaking() {
                return Ok(());
            }
            self.receive_records(io)?;
        }
    }

    /// Writes all pending ciphertext.
    pub fn flush(&mut self, io: &mut LinkIo<'_>) -> Result<(), SessionError> {
        while self.conn.wants_write() {
            match self.conn.write_tls(io) {
                Ok(0) => return Err(SessionError::WantWrite),
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Err(SessionError::WantWrite)
                }
                Err(_) => return Err(SessionError::ConnectionReset),
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self, io: &mut LinkIo<'_>) -> Result<(), SessionError> {
        match self.flush(io) {
            Err(SessionError::WantWrite) => Ok(()),
            other => other,
        }
    }

    fn receive_records(&mut self, io: &mut LinkIo<'_>) -> Result<(), SessionError> {
        match self.conn.read_tls(io) {
            Ok(0) => return Err(SessionError::ConnectionReset),
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                return Err(SessionError::WantRead)
            }
            Err(_) => return Err(SessionError::ConnectionReset),
        }
        if let Err(error) = self.conn.process_new_packets() {
            let fault = TlsFault::from(&error);
            warn!("TLS session fault: {:?}", fault);
            // Best effort delivery of the alert rustls queued.
            let _ = self.flush(io);
            return Err(SessionError::Fatal(fault));
        }
        Ok(())
    }

    /// Reads cleartext into `out`. Never returns `Ok(0)` for a non-empty
    /// `out`; a closed session is [`SessionError::PeerClosed`].
    pub fn read(&mut self, io: &mut LinkIo<'_>, out: &mut [u8]) -> Result<usize, SessionError> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            match self.conn.reader().read(out) {
                Ok(0) => return Err(SessionError::PeerClosed),
                Ok(count) => return Ok(count),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => return Err(SessionError::ConnectionReset),
            }
            self.flush_pending(io)?;
            self.receive_records(io)?;
        }
    }

    /// Encrypts as much of `data` as the session accepts and returns the
    /// count. Accepted bytes are owned by the session even if the transport
    /// cannot take the resulting records yet.
    pub fn write(&mut self, io: &mut LinkIo<'_>, data: &[u8]) -> Result<usize, SessionError> {
        self.flush(io)?;
        let count = self
            .conn
            .writer()
            .write(data)
            .map_err(|_| SessionError::ConnectionReset)?;
        self.flush_pending(io)?;
        Ok(count)
    }

    /// Sends close_notify once and flushes it.
    pub fn close_notify(&mut self, io: &mut LinkIo<'_>) -> Result<(), SessionError> {
        if !self.close_sent {
            self.conn.send_close_notify();
            self.close_sent = true;
        }
        self.flush(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::loopback;
    use rustls::RootCertStore;

    fn connected_pair(window: usize) -> (loopback::LoopbackLink, loopback::LoopbackLink) {
        let (mut a, b) = loopback::pair(window);
        assert_eq!(a.connect(), NetworkStatus::Success);
        (a, b)
    }

    fn client_config() -> Arc<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        Arc::new(
            ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth(),
        )
    }

    #[test]
    fn test_adapter_send_exhausted_pool_wants_write() {
        let pool = MemPool::new(64, 4);
        let (mut link, _peer) = connected_pair(4096);
        let hog = Buffer::from_slice(&pool, &[0u8; 256]).unwrap();
        assert_eq!(pool.segments_available(), 0);

        assert_eq!(
            adapter_send(&mut link, &pool, b"record"),
            Err(SessionError::WantWrite)
        );
        assert_eq!(link.in_flight(), 0);

        drop(hog);
        assert_eq!(adapter_send(&mut link, &pool, b"record"), Ok(6));
        assert_eq!(link.in_flight(), 6);
        // The delivered payload still holds its segment.
        assert_eq!(pool.segments_available(), 3);
    }

    #[test]
    fn test_adapter_send_caps_at_half_of_free_pool() {
        let pool = MemPool::new(64, 8);
        let (mut link, _peer) = connected_pair(4096);
        assert_eq!(adapter_send(&mut link, &pool, &[7u8; 1000]), Ok(256));
        assert_eq!(adapter_send(&mut link, &pool, &[]), Ok(0));
    }

    #[test]
    fn test_adapter_send_maps_transport_status() {
        let pool = MemPool::new(64, 16);
        let (mut link, _peer) = connected_pair(4096);
        link.set_send_blocked(true);
        assert_eq!(
            adapter_send(&mut link, &pool, b"abc"),
            Err(SessionError::WantWrite)
        );
        assert_eq!(pool.segments_available(), 16);

        link.set_send_blocked(false);
        link.disconnect();
        assert_eq!(
            adapter_send(&mut link, &pool, b"abc"),
            Err(SessionError::ConnectionReset)
        );
    }

    #[test]
    fn test_adapter_receive_drains_intermediate_buffer() {
        let pool = MemPool::new(64, 16);
        let (mut link, mut peer) = connected_pair(4096);
        let mut rx_buffer = Buffer::new(&pool);
        let mut out = [0u8; 4];

        assert_eq!(
            adapter_receive(&mut link, &mut rx_buffer, &mut out),
            Err(SessionError::WantRead)
        );

        let mut payload = Buffer::from_slice(&pool, b"abcdef").unwrap();
        assert_eq!(peer.send(&mut payload), NetworkStatus::Success);
        assert_eq!(adapter_receive(&mut link, &mut rx_buffer, &mut out), Ok(4));
        assert_eq!(&out, b"abcd");
        assert_eq!(adapter_receive(&mut link, &mut rx_buffer, &mut out), Ok(2));
        assert_eq!(&out[..2], b"ef");
        assert!(rx_buffer.is_empty());

        peer.disconnect();
        assert_eq!(
            adapter_receive(&mut link, &mut rx_buffer, &mut out),
            Err(SessionError::ConnectionReset)
        );
    }

    #[test]
    fn test_link_io_error_kinds() {
        let pool = MemPool::new(64, 16);
        let (mut link, _peer) = connected_pair(4096);
        let mut rx_buffer = Buffer::new(&pool);
        let mut io = LinkIo::new(&mut link, &mut rx_buffer, &pool);
        let mut out = [0u8; 8];
        assert_eq!(
            io.read(&mut out).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        assert_eq!(io.write(b"x").unwrap(), 1);
        assert_eq!(
            to_io(SessionError::PeerClosed).kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn test_handshake_waits_for_server() {
        let pool = MemPool::new(64, 128);
        let (mut link, _peer) = connected_pair(8192);
        let mut rx_buffer = Buffer::new(&pool);
        let name = ServerName::try_from("localhost").unwrap();
        let mut session = Session::new(client_config(), name).unwrap();

        let mut io = LinkIo::new(&mut link, &mut rx_buffer, &pool);
        assert_eq!(session.handshake(&mut io), Err(SessionError::WantRead));
        assert!(!session.is_handshake_over());
        assert!(!session.wants_write());
        drop(io);
        assert!(link.in_flight() > 0);

        session.reset().unwrap();
        assert!(session.wants_write());
    }

    #[test]
    fn test_fault_classification() {
        let bad_cert =
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        assert_eq!(TlsFault::from(&bad_cert), TlsFault::BadCertificate);
        assert_eq!(
            TlsFault::from(&rustls::Error::DecryptError),
            TlsFault::Decrypt
        );
        assert_eq!(
            TlsFault::from(&rustls::Error::AlertReceived(
                rustls::AlertDescription::HandshakeFailure
            )),
            TlsFault::AlertReceived
        );
        assert_eq!(
            TlsFault::from(&rustls::Error::General("x".into())),
            TlsFault::General
        );
        assert!(SessionError::WantRead.is_wait());
        assert!(!SessionError::PeerClosed.is_wait());
    }
}
