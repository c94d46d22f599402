//! In-memory loopback transport
//!
//! [`pair`] returns two connected endpoints. Whatever one side sends, the
//! other receives, in order. The pair models the parts of a real transport
//! that protocol layers above it must cope with:
//!
//! - a bounded in-flight window per direction (`send` returns `Retry` when
//!   the peer has not drained enough),
//! - connection setup latency (`monitor` reports `Retry` for a number of
//!   polls after `connect`),
//! - orderly close (the peer drains what was already sent, then sees
//!   `NotConnected`),
//! - injected faults.
//!
//! Either endpoint may call `connect`; the other side is up as soon as the
//! pair is established.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use core::cell::RefCell;

use crate::buffers::Buffer;
use crate::scheduler::TaskHandle;

use super::{LinkExtensions, NetworkLink, NetworkStatus};

#[derive(Debug, Default)]
struct Direction {
    buffers: VecDeque<Buffer>,
    bytes: usize,
}

#[derive(Debug)]
struct Shared {
    established: bool,
    closed: [bool; 2],
    // Indexed by receiving side.
    inbound: [Direction; 2],
    consumers: [Option<TaskHandle>; 2],
    window: usize,
}

impl Shared {
    fn is_up(&self) -> bool {
        self.established && !self.closed[0] && !self.closed[1]
    }
}

/// One endpoint of a loopback pair.
#[derive(Debug)]
pub struct LoopbackLink {
    shared: Rc<RefCell<Shared>>,
    side: usize,
    ext: LinkExtensions,
    connect_latency: u32,
    pending_polls: u32,
    send_blocked: bool,
    failed: bool,
}

/// Creates a pair of endpoints allowing at most `window` bytes in flight in
/// each direction.
pub fn pair(window: usize) -> (LoopbackLink, LoopbackLink) {
    let shared = Rc::new(RefCell::new(Shared {
        established: false,
        closed: [false; 2],
        inbound: Default::default(),
        consumers: Default::default(),
        window,
    }));
    (
        LoopbackLink::endpoint(shared.clone(), 0),
        LoopbackLink::endpoint(shared, 1),
    )
}

impl LoopbackLink {
    fn endpoint(shared: Rc<RefCell<Shared>>, side: usize) -> Self {
        Self {
            shared,
            side,
            ext: LinkExtensions::default(),
            connect_latency: 0,
            pending_polls: 0,
            send_blocked: false,
            failed: false,
        }
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    /// Number of `monitor` polls that report `Retry` after each `connect`.
    pub fn set_connect_latency(&mut self, polls: u32) {
        self.connect_latency = polls;
    }

    /// While blocked, `send` returns `Retry` as if the window were full.
    pub fn set_send_blocked(&mut self, blocked: bool) {
        self.send_blocked = blocked;
    }

    /// Puts this endpoint into a permanent driver failure.
    pub fn inject_failure(&mut self) {
        self.failed = true;
    }

    /// Bytes sent by this endpoint that the peer has not yet received.
    pub fn in_flight(&self) -> usize {
        self.shared.borrow().inbound[self.peer()].bytes
    }

    /// True once the peer has disconnected its end.
    pub fn peer_closed(&self) -> bool {
        self.shared.borrow().closed[self.peer()]
    }
}

impl NetworkLink for LoopbackLink {
    fn connect(&mut self) -> NetworkStatus {
        if self.failed {
            return NetworkStatus::DriverFailure;
        }
        let mut shared = self.shared.borrow_mut();
        if shared.is_up() {
            return NetworkStatus::Success;
        }
        shared.established = true;
        shared.closed = [false; 2];
        shared.inbound = Default::default();
        self.pending_polls = self.connect_latency;
        NetworkStatus::Success
    }

    fn disconnect(&mut self) -> NetworkStatus {
        let peer = self.peer();
        let mut shared = self.shared.borrow_mut();
        shared.closed[self.side] = true;
        // Discard what we have not read; what we sent stays for the peer.
        shared.inbound[self.side] = Direction::default();
        if let Some(task) = &shared.consumers[peer] {
            task.resume();
        }
        NetworkStatus::Success
    }

    fn send(&mut self, payload: &mut Buffer) -> NetworkStatus {
        if self.failed {
            return NetworkStatus::DriverFailure;
        }
        let peer = self.peer();
        let mut shared = self.shared.borrow_mut();
        if !shared.is_up() {
            return NetworkStatus::NotConnected;
        }
        if self.send_blocked {
            return NetworkStatus::Retry;
        }
        let window = shared.window;
        let direction = &mut shared.inbound[peer];
        if direction.bytes > 0 && direction.bytes + payload.len() > window {
            return NetworkStatus::Retry;
        }

        direction.bytes += payload.len();
        direction.buffers.push_back(payload.take());
        if let Some(task) = &shared.consumers[peer] {
            task.resume();
        }
        NetworkStatus::Success
    }

    fn receive(&mut self, payload: &mut Buffer) -> NetworkStatus {
        if self.failed {
            return NetworkStatus::DriverFailure;
        }
        let mut shared = self.shared.borrow_mut();
        let up = shared.is_up();
        let direction = &mut shared.inbound[self.side];
        match direction.buffers.pop_front() {
            Some(buffer) => {
                direction.bytes -= buffer.len();
                *payload = buffer;
                NetworkStatus::Success
            }
            None if up => NetworkStatus::Retry,
            None => NetworkStatus::NotConnected,
        }
    }

    fn monitor(&mut self) -> NetworkStatus {
        if self.failed {
            return NetworkStatus::DriverFailure;
        }
        if self.pending_polls > 0 {
            self.pending_polls -= 1;
            return NetworkStatus::Retry;
        }
        if self.shared.borrow().is_up() {
            NetworkStatus::Connected
        } else {
            NetworkStatus::NotConnected
        }
    }

    fn extensions(&mut self) -> &mut LinkExtensions {
        &mut self.ext
    }

    fn set_consumer_task(&mut self, task: Option<TaskHandle>) {
        self.shared.borrow_mut().consumers[self.side] = task.clone();
        self.ext.set_consumer_task(task);
    }
}
