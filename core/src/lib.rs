//! Platform-agnostic network core for IoT firmware
//!
//! This crate composes protocol layers out of a uniform network-link
//! capability and provides a TLS client that both consumes a transport link
//! and exposes itself as one. Everything is driven from cooperative tasks;
//! there are NO hardware dependencies.

#![no_std]
#![deny(unsafe_code)]
#![deny(warnings)]

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

#[cfg(all(feature = "tls", not(feature = "heap")))]
compile_error!("the TLS client requires heap support; enable the `heap` feature");

mod log_wrapper;

pub mod buffers;
pub mod network;
pub mod options;
pub mod scheduler;
pub mod streams;
#[cfg(feature = "tls")]
pub mod tls;

pub use hal_abstractions;
