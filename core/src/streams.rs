//! Single-producer, single-consumer buffer queues
//!
//! Queues transfer buffer ownership between a producer and a consumer task.
//! A queue with a consumer wakes it whenever a buffer is sent.

use heapless::Deque;

use crate::buffers::Buffer;
use crate::options::BUFFER_QUEUE_DEPTH;
use crate::scheduler::TaskHandle;

#[derive(Debug, Default)]
pub struct BufferQueue {
    entries: Deque<Buffer, BUFFER_QUEUE_DEPTH>,
    consumer: Option<TaskHandle>,
}

impl BufferQueue {
    pub fn new(consumer: Option<TaskHandle>) -> Self {
        Self {
            entries: Deque::new(),
            consumer,
        }
    }

    pub fn set_consumer(&mut self, consumer: Option<TaskHandle>) {
        self.consumer = consumer;
    }

    pub fn has_room(&self) -> bool {
        !self.entries.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total bytes held by queued buffers.
    pub fn pending_bytes(&self) -> usize {
        self.entries.iter().map(Buffer::len).sum()
    }

    /// Moves the contents of `payload` onto the tail and wakes the
    /// consumer. Returns false, leaving `payload` untouched, if full.
    /// Empty payloads are accepted and dropped.
    pub fn send(&mut self, payload: &mut Buffer) -> bool {
        if payload.is_empty() {
            return true;
        }
        if self.entries.is_full() {
            return false;
        }
        if self.entries.push_back(payload.take()).is_err() {
            return false;
        }
        if let Some(consumer) = &self.consumer {
            consumer.resume();
        }
        true
    }

    /// Returns a partially consumed buffer to the head of the queue.
    pub fn push_front(&mut self, buffer: Buffer) -> Result<(), Buffer> {
        self.entries.push_front(buffer)
    }

    pub fn accept(&mut self) -> Option<Buffer> {
        self.entries.pop_front()
    }

    /// Drops every queued buffer, returning the number of bytes discarded.
    pub fn clear(&mut self) -> usize {
        let mut discarded = 0;
        while let Some(buffer) = self.entries.pop_front() {
            discarded += buffer.len();
        }
        discarded
    }
}
