//! Network link status codes

/// Outcome of a network link operation
///
/// `Retry` and the state queries (`Connected`, `NotConnected`) are not
/// faults; callers poll again or act on the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetworkStatus {
    /// Operation completed
    Success,
    /// Link is up
    Connected,
    /// Link is down
    NotConnected,
    /// Underlying interface is not open
    NotOpen,
    /// Operation is not valid in the current state
    NotValid,
    /// Transient condition; try again later
    Retry,
    /// Payload exceeds what the link can carry
    Oversized,
    /// Network interface is down
    NetworkDown,
    /// Operation timed out
    Timeout,
    /// Operation not supported by this link
    Unsupported,
    /// Driver or lower layer has failed
    DriverFailure,
}

impl NetworkStatus {
    pub fn is_retry(self) -> bool {
        self == Self::Retry
    }

    /// True for outcomes that indicate a fault rather than progress, a
    /// transient condition or a state report.
    pub fn is_fault(self) -> bool {
        !matches!(
            self,
            Self::Success | Self::Connected | Self::NotConnected | Self::Retry
        )
    }
}

impl core::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Connected => write!(f, "Connected"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::NotOpen => write!(f, "Not open"),
            Self::NotValid => write!(f, "Not valid in current state"),
            Self::Retry => write!(f, "Retry"),
            Self::Oversized => write!(f, "Payload oversized"),
            Self::NetworkDown => write!(f, "Network down"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::DriverFailure => write!(f, "Driver failure"),
        }
    }
}
