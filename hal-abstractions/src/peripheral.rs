//! Peripheral transaction status and completion signalling
//!
//! Interrupt-driven peripheral drivers (I2C is the representative one)
//! report completion by posting a packed event word that the client task
//! polls. The word layout is:
//!
//! | Bits  | Meaning                      |
//! |-------|------------------------------|
//! | 0-7   | [`TransactionStatus`] code   |
//! | 8-23  | transferred byte count       |
//! | 31    | completion flag              |
//!
//! The layout is internal to the firmware; no external ABI depends on it.

use core::sync::atomic::{AtomicU32, Ordering};

/// Outcome of a bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionStatus {
    Idle,
    Success,
    Active,
    NotReady,
    Nack,
    Timeout,
    DriverError,
}

impl TransactionStatus {
    const fn code(self) -> u32 {
        match self {
            Self::Idle => 0,
            Self::Success => 1,
            Self::Active => 2,
            Self::NotReady => 3,
            Self::Nack => 4,
            Self::Timeout => 5,
            Self::DriverError => 6,
        }
    }

    const fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::Success,
            2 => Self::Active,
            3 => Self::NotReady,
            4 => Self::Nack,
            5 => Self::Timeout,
            _ => Self::DriverError,
        }
    }
}

impl From<embedded_hal::i2c::ErrorKind> for TransactionStatus {
    fn from(kind: embedded_hal::i2c::ErrorKind) -> Self {
        match kind {
            embedded_hal::i2c::ErrorKind::NoAcknowledge(_) => Self::Nack,
            _ => Self::DriverError,
        }
    }
}

const STATUS_MASK: u32 = 0x0000_00FF;
const SIZE_OFFSET: u32 = 8;
const SIZE_MASK: u32 = 0x00FF_FF00;
const COMPLETION_FLAG: u32 = 0x8000_0000;

/// Packed completion event word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CompletionEvent(u32);

impl CompletionEvent {
    /// Builds a completed event for `status` with `transferred` bytes.
    pub const fn new(status: TransactionStatus, transferred: u16) -> Self {
        Self(COMPLETION_FLAG | ((transferred as u32) << SIZE_OFFSET) | status.code())
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn status(self) -> TransactionStatus {
        TransactionStatus::from_code(self.0 & STATUS_MASK)
    }

    pub const fn transferred(self) -> u16 {
        ((self.0 & SIZE_MASK) >> SIZE_OFFSET) as u16
    }

    pub const fn is_complete(self) -> bool {
        self.0 & COMPLETION_FLAG != 0
    }

    /// Posts the event from interrupt context.
    pub fn post(self, slot: &AtomicU32) {
        slot.store(self.0, Ordering::Release);
    }
}

/// Deadline for an in-flight transaction.
///
/// Both the polled and the interrupt-driven paths compare elapsed ticks
/// against the limit; the interrupt path additionally consumes the event
/// word so the slot is clear for the next transaction.
#[derive(Debug, Clone, Copy)]
pub struct TransactionWatchdog {
    started: u64,
    limit: u64,
}

impl TransactionWatchdog {
    pub const fn new(started: u64, limit: u64) -> Self {
        Self { started, limit }
    }

    pub fn expired(&self, now: u64) -> bool {
        now.saturating_sub(self.started) >= self.limit
    }

    /// Polls an event slot. Returns the completion if one was posted, a
    /// synthesised [`TransactionStatus::Timeout`] completion once the
    /// deadline has passed, or `None` while the transaction is in flight.
    pub fn poll(&self, slot: &AtomicU32, now: u64) -> Option<CompletionEvent> {
        let event = CompletionEvent::from_bits(slot.load(Ordering::Acquire));
        if event.is_complete() {
            slot.store(0, Ordering::Release);
            return Some(event);
        }
        if self.expired(now) {
            slot.store(0, Ordering::Release);
            return Some(CompletionEvent::new(TransactionStatus::Timeout, 0));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};

    #[test]
    fn test_event_word_layout() {
        let event = CompletionEvent::new(TransactionStatus::Nack, 0x1234);
        assert_eq!(event.bits(), 0x8012_3404);
        assert_eq!(event.status(), TransactionStatus::Nack);
        assert_eq!(event.transferred(), 0x1234);
        assert!(event.is_complete());
        assert!(!CompletionEvent::from_bits(0x0000_0101).is_complete());
    }

    #[test]
    fn test_i2c_error_mapping() {
        assert_eq!(
            TransactionStatus::from(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address)),
            TransactionStatus::Nack
        );
        assert_eq!(
            TransactionStatus::from(ErrorKind::ArbitrationLoss),
            TransactionStatus::DriverError
        );
    }

    #[test]
    fn test_watchdog_returns_posted_event() {
        let slot = AtomicU32::new(0);
        let watchdog = TransactionWatchdog::new(100, 10);
        assert_eq!(watchdog.poll(&slot, 105), None);

        CompletionEvent::new(TransactionStatus::Success, 3).post(&slot);
        let event = watchdog.poll(&slot, 106).unwrap();
        assert_eq!(event.status(), TransactionStatus::Success);
        assert_eq!(event.transferred(), 3);
        assert_eq!(slot.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_watchdog_times_out() {
        let slot = AtomicU32::new(0);
        let watchdog = TransactionWatchdog::new(100, 10);
        assert!(!watchdog.expired(109));
        let event = watchdog.poll(&slot, 110).unwrap();
        assert_eq!(event.status(), TransactionStatus::Timeout);
        assert_eq!(event.transferred(), 0);
    }
}
