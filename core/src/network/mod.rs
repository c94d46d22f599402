//! Network link composition
//!
//! Every protocol layer in the stack is a [`NetworkLink`]: it can be
//! connected, disconnected, polled for state and used to exchange buffers.
//! Layers compose by owning the link underneath them.

mod link;
pub mod loopback;
mod status;

pub use link::{LinkExtensions, NetworkLink, NetworkNotification, NotifyHandler};
pub use status::NetworkStatus;
