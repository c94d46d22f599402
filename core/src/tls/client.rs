//! TLS client link and its worker task

use alloc::vec;
use alloc::vec::Vec;

use crate::buffers::{Buffer, MemPool};
use crate::network::{LinkExtensions, NetworkLink, NetworkNotification, NetworkStatus};
use crate::options::{MAX_TX_RECORD_SIZE, RX_BUFFER_SOFT_LIMIT, RX_CHUNK_SIZE};
use crate::scheduler::{prioritise, Task, TaskHandle, TaskState, TaskStatus};
use crate::streams::BufferQueue;
use crate::{debug, error, info, trace, warn};

use super::config::{ConfigError, TlsConfig};
use super::support::{LinkIo, Session, SessionError, TlsFault};

const TRANSPORT_CONNECT_BACKOFF_MS: u32 = 50;
const RETRY_BACKOFF_MS: u32 = 10;
const HANDSHAKE_POLL_INTERVAL_MS: u32 = 1000;
const RX_IDLE_BACKOFF_MS: u32 = 1000;

/// Worker state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientState {
    Initialised,
    Configured,
    TransportConnect,
    HandshakeStep,
    HandshakePoll,
    Connected,
    CloseRequest,
    ClosePoll,
    TransportDisconnect,
    SessionReset,
    Disconnected,
    /// Terminal until `reset` and `configure`.
    Failure,
}

/// TLS client lifecycle errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClientError {
    /// Operation not valid in the current client state
    InvalidState(ClientState),
    /// The configuration could not be locked or set up
    Config(ConfigError),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidState(state) => write!(f, "Invalid in client state {:?}", state),
            Self::Config(error) => write!(f, "Configuration error: {}", error),
        }
    }
}

impl core::error::Error for ClientError {}

impl From<ConfigError> for ClientError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

/// Per-client data pump policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Largest cleartext slice written to the session at once
    pub max_tx_record_size: usize,
    /// Growth step of the cleartext RX buffer
    pub rx_chunk_size: usize,
    /// Cleartext collected per wakeup before handing it on
    pub rx_buffer_limit: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_tx_record_size: MAX_TX_RECORD_SIZE,
            rx_chunk_size: RX_CHUNK_SIZE,
            rx_buffer_limit: RX_BUFFER_SOFT_LIMIT,
        }
    }
}

/// A TLS client session over a transport link, exposed as a cleartext
/// network link.
///
/// The client owns its transport. Its worker runs as a [`Task`]: visit the
/// client from the scheduler loop and it makes progress whenever it is due
/// or has been woken by the transport, the application or a timer.
///
/// ```ignore
/// let mut client = TlsClient::init(transport, &pool);
/// client.configure(&config)?;
/// client.set_notify_handler(Some(Box::new(|_| info!("secure link up"))));
/// client.connect();
/// loop {
///     scheduler.visit(&mut client);
///     scheduler.tick();
/// }
/// ```
pub struct TlsClient<T: NetworkLink> {
    link: LinkExtensions,
    transport: T,
    pool: MemPool,
    config: Option<TlsConfig>,
    session: Option<Session>,
    tx_queue: BufferQueue,
    rx_queue: BufferQueue,
    rx_buffer: Buffer,
    rx_scratch: Vec<u8>,
    task: TaskState,
    state: ClientState,
    options: ClientOptions,
}

impl<T: NetworkLink> core::fmt::Debug for TlsClient<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlsClient")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("tx_queued", &self.tx_queue.len())
            .field("rx_queued", &self.rx_queue.len())
            .finish()
    }
}

impl<T: NetworkLink> TlsClient<T> {
    /// Creates a client over `transport` and registers its worker as the
    /// transport's consumer task.
    pub fn init(transport: T, pool: &MemPool) -> Self {
        Self::with_options(transport, pool, ClientOptions::default())
    }

    pub fn with_options(mut transport: T, pool: &MemPool, options: ClientOptions) -> Self {
        let task = TaskState::new("tls-client");
        let worker = task.handle();
        transport.set_consumer_task(Some(worker.clone()));
        Self {
            link: LinkExtensions::default(),
            transport,
            pool: pool.clone(),
            config: None,
            session: None,
            tx_queue: BufferQueue::new(Some(worker)),
            rx_queue: BufferQueue::new(None),
            rx_buffer: Buffer::new(pool),
            rx_scratch: vec![0; options.rx_chunk_size.max(1)],
            task,
            state: ClientState::Initialised,
            options,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Handle that wakes the worker task.
    pub fn worker(&self) -> TaskHandle {
        self.task.handle()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Binds the client to `config`, taking a lock on it.
    pub fn configure(&mut self, config: &TlsConfig) -> Result<(), ClientError> {
        if self.state != ClientState::Initialised {
            return Err(ClientError::InvalidState(self.state));
        }
        config.lock()?;
        let session = config.session_parameters().and_then(|(client_config, name)| {
            Session::new(client_config, name).map_err(|_| ConfigError::Setup)
        });
        match session {
            Ok(session) => {
                self.session = Some(session);
                self.config = Some(config.clone());
                self.set_state(ClientState::Configured);
                Ok(())
            }
            Err(error) => {
                if config.unlock().is_err() {
                    error!("TLS client: configuration lost its lock");
                }
                Err(error.into())
            }
        }
    }

    /// Releases the configuration and discards all queued data. This is also
    /// the way out of `Failure`, which first drops the transport; while the
    /// transport is still closing the client stays in `Failure` and `reset`
    /// must be called again.
    pub fn reset(&mut self) -> Result<(), ClientError> {
        match self.state {
            ClientState::Configured => {}
            ClientState::Failure => match self.transport.disconnect() {
                NetworkStatus::Retry => {
                    debug!("TLS client: transport still closing");
                    return Err(ClientError::InvalidState(ClientState::Failure));
                }
                NetworkStatus::Success => {}
                status => debug!("TLS client: transport disconnect: {:?}", status),
            },
            state => return Err(ClientError::InvalidState(state)),
        }
        if let Some(config) = self.config.as_ref() {
            config.unlock()?;
        }
        self.config = None;
        self.session = None;
        self.discard_queued();
        self.set_state(ClientState::Initialised);
        Ok(())
    }

    fn set_state(&mut self, next: ClientState) {
        if self.state != next {
            debug!("TLS client: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn discard_queued(&mut self) {
        let discarded = self.tx_queue.clear() + self.rx_queue.clear() + self.rx_buffer.len();
        self.rx_buffer.reset();
        if discarded > 0 {
            debug!("TLS client: discarded {} queued bytes", discarded);
        }
    }

    fn with_session<R>(
        &mut self,
        f: impl FnOnce(&mut Session, &mut LinkIo<'_>) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let Self {
            transport,
            rx_buffer,
            pool,
            session,
            ..
        } = self;
        let session = session.as_mut().ok_or(SessionError::ConnectionReset)?;
        let mut io = LinkIo::new(transport, rx_buffer, pool);
        f(session, &mut io)
    }

    fn worker_step(&mut self) -> TaskStatus {
        match self.state {
            ClientState::Initialised
            | ClientState::Configured
            | ClientState::Disconnected
            | ClientState::Failure => TaskStatus::Suspend,

            ClientState::TransportConnect => match self.transport.monitor() {
                NetworkStatus::Retry => TaskStatus::run_later_ms(TRANSPORT_CONNECT_BACKOFF_MS),
                NetworkStatus::Connected => {
                    self.set_state(ClientState::HandshakeStep);
                    TaskStatus::RunImmediate
                }
                status => {
                    warn!("TLS client: transport connect failed: {:?}", status);
                    self.set_state(ClientState::Failure);
                    TaskStatus::Suspend
                }
            },

            ClientState::HandshakeStep => match self.with_session(|s, io| s.handshake(io)) {
                Ok(()) => {
                    self.set_state(ClientState::HandshakePoll);
                    TaskStatus::RunImmediate
                }
                Err(error) if error.is_wait() => {
                    self.set_state(ClientState::HandshakePoll);
                    TaskStatus::run_later_ms(RETRY_BACKOFF_MS)
                }
                Err(error) => {
                    warn!("TLS client: handshake failed: {:?}", error);
                    self.set_state(ClientState::Failure);
                    TaskStatus::Suspend
                }
            },

            ClientState::HandshakePoll => {
                let over = self
                    .session
                    .as_ref()
                    .is_some_and(Session::is_handshake_over);
                if over {
                    self.set_state(ClientState::Connected);
                    info!("TLS client: session established");
                    self.link.notify(NetworkNotification::Connected);
                    TaskStatus::RunImmediate
                } else {
                    self.set_state(ClientState::HandshakeStep);
                    TaskStatus::run_later_ms(HANDSHAKE_POLL_INTERVAL_MS)
                }
            }

            ClientState::Connected => {
                let pumped = self
                    .tx_pump()
                    .and_then(|tx| self.rx_pump().map(|rx| prioritise(tx, rx)));
                match pumped {
                    Ok(status) => status,
                    Err(error) => {
                        warn!("TLS client: session fault: {:?}", error);
                        self.set_state(ClientState::TransportDisconnect);
                        TaskStatus::RunImmediate
                    }
                }
            }

            ClientState::CloseRequest => match self.with_session(|s, io| s.close_notify(io)) {
                Ok(()) => {
                    self.set_state(ClientState::ClosePoll);
                    TaskStatus::RunImmediate
                }
                Err(SessionError::WantRead | SessionError::WantWrite) => {
                    TaskStatus::run_later_ms(RETRY_BACKOFF_MS)
                }
                Err(error) => {
                    warn!("TLS client: close_notify failed: {:?}", error);
                    self.set_state(ClientState::Failure);
                    TaskStatus::Suspend
                }
            },

            ClientState::ClosePoll => match self.rx_pump() {
                Ok(status) => status,
                Err(error) => {
                    trace!("TLS client: close poll ended: {:?}", error);
                    self.set_state(ClientState::TransportDisconnect);
                    TaskStatus::RunImmediate
                }
            },

            ClientState::TransportDisconnect => match self.transport.disconnect() {
                NetworkStatus::Retry => TaskStatus::run_later_ms(RETRY_BACKOFF_MS),
                _ => {
                    self.set_state(ClientState::SessionReset);
                    TaskStatus::RunImmediate
                }
            },

            ClientState::SessionReset => {
                self.discard_queued();
                let reset = match self.session.as_mut() {
                    Some(session) => session.reset(),
                    None => Err(TlsFault::General),
                };
                match reset {
                    Ok(()) => {
                        info!("TLS client: session closed");
                        self.set_state(ClientState::Disconnected);
                    }
                    Err(fault) => {
                        warn!("TLS client: session reset failed: {:?}", fault);
                        self.set_state(ClientState::Failure);
                    }
                }
                TaskStatus::Suspend
            }
        }
    }

    /// Writes queued cleartext into the session.
    fn tx_pump(&mut self) -> Result<TaskStatus, SessionError> {
        let Self {
            transport,
            rx_buffer,
            pool,
            session,
            tx_queue,
            options,
            ..
        } = self;
        let session = session.as_mut().ok_or(SessionError::ConnectionReset)?;
        let mut io = LinkIo::new(transport, rx_buffer, pool);

        let Some(mut buffer) = tx_queue.accept() else {
            // Records the transport refused earlier are still pending.
            if session.wants_write() {
                return match session.flush(&mut io) {
                    Ok(()) => Ok(TaskStatus::Suspend),
                    Err(error) if error.is_wait() => {
                        Ok(TaskStatus::run_later_ms(RETRY_BACKOFF_MS))
                    }
                    Err(error) => Err(error),
                };
            }
            return Ok(TaskStatus::Suspend);
        };

        while !buffer.is_empty() {
            let size = buffer.len().min(options.max_tx_record_size);
            match session.write(&mut io, &buffer.as_slice()[..size]) {
                Ok(0)
                | Err(
                    SessionError::WantWrite
                    | SessionError::AsyncInProgress
                    | SessionError::CryptoInProgress,
                ) => {
                    requeue(tx_queue, buffer);
                    return Ok(TaskStatus::run_later_ms(RETRY_BACKOFF_MS));
                }
                Ok(count) => {
                    trace!("TLS client: wrote {} cleartext bytes", count);
                    buffer.advance(count);
                }
                Err(SessionError::WantRead) => {
                    requeue(tx_queue, buffer);
                    return Ok(TaskStatus::Suspend);
                }
                Err(error) => return Err(error),
            }
        }

        Ok(if !tx_queue.is_empty() {
            TaskStatus::RunImmediate
        } else if session.wants_write() {
            TaskStatus::run_later_ms(RETRY_BACKOFF_MS)
        } else {
            TaskStatus::Suspend
        })
    }

    /// Reads cleartext from the session and hands it to the RX queue.
    fn rx_pump(&mut self) -> Result<TaskStatus, SessionError> {
        let Self {
            link,
            transport,
            rx_buffer,
            pool,
            session,
            rx_queue,
            rx_scratch,
            options,
            ..
        } = self;
        if !rx_queue.has_room() {
            return Ok(TaskStatus::run_later_ms(RETRY_BACKOFF_MS));
        }
        let session = session.as_mut().ok_or(SessionError::ConnectionReset)?;
        let mut io = LinkIo::new(transport, rx_buffer, pool);

        let mut received = Buffer::new(pool);
        let mut outcome = Ok(TaskStatus::RunImmediate);
        while received.len() < options.rx_buffer_limit {
            if !received.reserve(rx_scratch.len()) {
                outcome = Ok(TaskStatus::run_later_ms(RETRY_BACKOFF_MS));
                break;
            }
            match session.read(&mut io, rx_scratch) {
                Ok(count) => {
                    // Covered by the reservation above.
                    let _ = received.append(&rx_scratch[..count]);
                }
                Err(
                    SessionError::WantWrite
                    | SessionError::AsyncInProgress
                    | SessionError::CryptoInProgress,
                ) => {
                    outcome = Ok(TaskStatus::run_later_ms(RETRY_BACKOFF_MS));
                    break;
                }
                Err(SessionError::WantRead) => {
                    outcome = Ok(TaskStatus::run_later_ms(RX_IDLE_BACKOFF_MS));
                    break;
                }
                Err(error) => {
                    outcome = Err(error);
                    break;
                }
            }
        }

        received.trim();
        if !received.is_empty() {
            trace!("TLS client: received {} cleartext bytes", received.len());
            if rx_queue.send(&mut received) {
                link.wake_consumer();
            } else {
                error!("TLS client: RX queue full, dropped {} bytes", received.len());
            }
        }
        outcome
    }
}

fn requeue(queue: &mut BufferQueue, buffer: Buffer) {
    if let Err(buffer) = queue.push_front(buffer) {
        error!("TLS client: TX queue full, dropped {} bytes", buffer.len());
    }
}

impl<T: NetworkLink> NetworkLink for TlsClient<T> {
    fn connect(&mut self) -> NetworkStatus {
        if self.state != ClientState::Configured {
            return NetworkStatus::NotValid;
        }
        let status = self.transport.connect();
        if status == NetworkStatus::Success {
            self.set_state(ClientState::TransportConnect);
            self.task.handle().resume();
        }
        status
    }

    /// Starts an orderly close once all queued cleartext has been written.
    /// Returns `Success` only when the close has completed.
    fn disconnect(&mut self) -> NetworkStatus {
        if !self.tx_queue.is_empty() {
            return NetworkStatus::Retry;
        }
        match self.state {
            ClientState::Connected => {
                self.set_state(ClientState::CloseRequest);
                self.task.handle().resume();
                NetworkStatus::Retry
            }
            ClientState::Disconnected => {
                self.set_state(ClientState::Configured);
                NetworkStatus::Success
            }
            ClientState::CloseRequest
            | ClientState::ClosePoll
            | ClientState::TransportDisconnect
            | ClientState::SessionReset => NetworkStatus::Retry,
            _ => NetworkStatus::NotConnected,
        }
    }

    fn send(&mut self, payload: &mut Buffer) -> NetworkStatus {
        if self.state != ClientState::Connected {
            return NetworkStatus::NotConnected;
        }
        if self.tx_queue.send(payload) {
            NetworkStatus::Success
        } else {
            NetworkStatus::Retry
        }
    }

    fn receive(&mut self, payload: &mut Buffer) -> NetworkStatus {
        if self.state != ClientState::Connected {
            return NetworkStatus::NotConnected;
        }
        match self.rx_queue.accept() {
            Some(buffer) => {
                *payload = buffer;
                NetworkStatus::Success
            }
            None => NetworkStatus::Retry,
        }
    }

    fn monitor(&mut self) -> NetworkStatus {
        match self.state {
            ClientState::Connected => NetworkStatus::Connected,
            ClientState::Configured => NetworkStatus::NotConnected,
            ClientState::Initialised => NetworkStatus::NotValid,
            ClientState::Failure => NetworkStatus::DriverFailure,
            _ => NetworkStatus::Retry,
        }
    }

    fn extensions(&mut self) -> &mut LinkExtensions {
        &mut self.link
    }
}

impl<T: NetworkLink> Task for TlsClient<T> {
    fn task_state(&mut self) -> &mut TaskState {
        &mut self.task
    }

    fn run_step(&mut self) -> TaskStatus {
        self.worker_step()
    }
}

impl<T: NetworkLink> Drop for TlsClient<T> {
    fn drop(&mut self) {
        if let Some(config) = self.config.take() {
            let _ = config.unlock();
        }
    }
}
